//! Common functionality shared among the ecconet crates.
//!
//! This crate holds the wire-level building blocks of the ECCONet protocol:
//! the token and key-region model, the 29-bit frame identifier codec, the
//! message CRC, the event index, the token compression codec, FTP message
//! bodies, and the host capability trait that embedding applications
//! implement. It is `no_std` compatible and performs no heap allocation.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod addresses;
pub mod codec;
pub mod crc;
mod event_index;
pub mod files;
pub mod frame;
pub mod ftp;
pub mod patterns;
pub mod token;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::open_socketcan;

pub use event_index::EventIndex;
pub use frame::{CanFrame, FrameId, FrameType};
pub use token::{KeyPrefix, Token, TokenFlags, TokenKey};
pub use traits::{FlashError, Host, ReadHandling, SendStatus};
