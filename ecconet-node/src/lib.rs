//! A library to implement an ECCONet vehicle-bus node in Rust
//!
//! Ecconet-node moves structured tokens between a CAN bus and the
//! subsystems inside a node: a rule engine's exposed-token table, six
//! token-pattern sequencers, a file transfer service, and the local
//! application. It is intended to run on microcontrollers, so it is
//! `no_std` compatible and performs no heap allocation, and it also runs
//! on std hosts, for example against socketcan on Linux. It provides:
//!
//! * Framing of arbitrary-length token messages over 8-byte CAN frames,
//!   with event ordering and duplicate suppression.
//! * The token compression codec with binary and analog run prefixes.
//! * The distributed self-assigning address protocol.
//! * A half-duplex FTP client and server sharing the node.
//! * Token-pattern sequencers driven by a compiled pattern table file.
//!
//! # Operation
//!
//! The node is clocked cooperatively: call [`Node::tick`] periodically
//! with the platform millisecond clock. The CAN receive interrupt stores
//! frames into a shared [`RxMbox`]; everything else happens inside
//! `tick`, synchronously.
//!
//! ```ignore
//! static MBOX: RxMbox = RxMbox::new();
//!
//! // in the CAN receive interrupt
//! MBOX.receive_can_frame(id, &data, now_ms);
//!
//! // in the main loop
//! let mut node = Node::new(host, Callbacks::new(), &MBOX, now_ms);
//! loop {
//!     node.tick(now_ms());
//! }
//! ```
//!
//! The `host` argument implements [`Host`](common::Host), the capability
//! set through which the node reaches the CAN driver, the flash
//! primitives, the device GUID, and the application's token callback.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod address;
mod ftp_client;
mod ftp_server;
mod node;
mod receiver;
mod rx_mbox;
mod sequencer;
pub mod storage;
mod time;
mod token_table;
mod transmitter;

pub use ecconet_common as common;

pub use ftp_client::{TransferInfo, FTP_CLIENT_BUFFER_SIZE};
pub use node::{Callbacks, FtpCompleteFn, Node, StartTransferError};
pub use rx_mbox::RxMbox;
pub use sequencer::NUM_SEQUENCERS;
pub use token_table::TOKEN_TABLE_SIZE;
