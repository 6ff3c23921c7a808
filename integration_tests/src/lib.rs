//! Test support for driving ecconet nodes over a simulated CAN bus

pub mod sim_bus;
pub mod utils;

pub mod prelude {
    pub use crate::sim_bus::{SimBus, SimHost};
    pub use crate::utils::{frame_token_key, run_ms, single_frame_token, TestClock, TEST_GUID};
    pub use ecconet_common::{
        files, ftp, patterns::PatternTableBuilder, token::keys, FrameId, FrameType, KeyPrefix,
        Token, TokenKey,
    };
    pub use ecconet_node::{storage, Callbacks, Node, RxMbox, TransferInfo};
}
