//! The host capability interface
//!
//! The core reaches its surroundings only through [`Host`]: the CAN driver,
//! the flash primitives, the device GUID, and the application's token
//! callback. Embedders implement it once; tests provide a fake.

use snafu::Snafu;

use crate::{files::FileMetadata, token::Token};

/// Outcome of handing a frame to the CAN driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendStatus {
    /// The driver accepted the frame
    Accepted,
    /// The driver is busy; retry on a later tick
    Busy,
}

/// A flash primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("flash access failed"))]
pub struct FlashError;

/// How the application answered an FTP file read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandling {
    /// The application filled in the file metadata; serve its data
    Override,
    /// Look the file up in the flash file directory
    Default,
}

/// Capabilities the embedding application provides to the core.
///
/// Flash addresses are volume-relative; the host maps `(volume, offset)`
/// onto its physical layout. A volume reported with zero size is treated
/// as absent.
pub trait Host {
    /// Queue one CAN frame for transmission.
    ///
    /// Must not block: return [`SendStatus::Busy`] when the controller has
    /// no room and the core will retry next tick.
    fn send_can(&mut self, id: u32, data: &[u8]) -> SendStatus;

    /// Read from a flash volume
    fn flash_read(&mut self, volume: u16, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Write to a flash volume
    fn flash_write(&mut self, volume: u16, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase a flash region
    fn flash_erase(&mut self, volume: u16, offset: u32, len: u32) -> Result<(), FlashError>;

    /// The size of a flash volume in bytes, zero if absent
    fn volume_size(&self, volume: u16) -> u32;

    /// The device's 128-bit GUID
    fn guid(&self) -> [u32; 4];

    /// Deliver a token to the application
    fn token_callback(&mut self, token: &Token);

    /// Give the application a chance to serve an FTP read itself.
    ///
    /// Returning [`ReadHandling::Override`] with `info` filled in makes
    /// the server stream that data; the server computes the checksum.
    fn ftp_read_handler(&mut self, requester: u8, info: &mut FileMetadata) -> ReadHandling {
        let _ = (requester, info);
        ReadHandling::Default
    }

    /// Map a file name to the flash volume holding it
    fn file_to_volume(&self, name: &str) -> u16 {
        let _ = name;
        0
    }
}
