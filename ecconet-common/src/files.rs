//! File names, metadata, and the records persisted in volume 0

use heapless::String;

/// Maximum 8.3 file name length
pub const MAX_FILE_NAME_LEN: usize = 12;

/// An owned, bounded file name
pub type FileName = String<MAX_FILE_NAME_LEN>;

/// The persisted CAN address record
pub const ADDRESS_FILE: &str = "address.can";
/// The product information record
pub const PRODUCT_INFO_FILE: &str = "product.inf";
/// The rule engine bytecode
pub const EQUATION_FILE: &str = "equation.btc";
/// The sequencer pattern table
pub const PATTERN_TABLE_FILE: &str = "patterns.tbl";

/// Validate an 8.3 file name and return its length.
///
/// A valid name is 1..=12 characters with exactly one '.' at position two
/// or later, followed by a one-to-three-character extension.
pub fn validate_file_name(name: &str) -> Option<usize> {
    let mut dot = 0usize;
    let mut len = 0usize;
    for ch in name.chars() {
        len += 1;
        if len > MAX_FILE_NAME_LEN {
            return None;
        }
        if ch == '.' {
            dot = len;
        }
    }
    if dot >= 2 && (1..=3).contains(&(len - dot)) {
        Some(len)
    } else {
        None
    }
}

/// Metadata describing a stored file.
///
/// The data location is a `(volume, offset)` pair interpreted through the
/// host flash capability; the core never holds pointers into flash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    /// The 8.3 file name
    pub name: FileName,
    /// The flash drive volume holding the file
    pub volume: u16,
    /// The data offset within the volume
    pub location: u32,
    /// The file data size in bytes
    pub size: u32,
    /// CRC of the file data
    pub checksum: u16,
    /// Seconds since 00:00:00 Jan 1, 2017
    pub timestamp: u32,
}

/// The 2-byte `address.can` record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressFile {
    /// The device CAN address
    pub address: u8,
    /// Whether the address is static
    pub is_static: bool,
}

impl AddressFile {
    /// Record size in bytes
    pub const SIZE: usize = 2;

    /// Encode the record
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        [self.address, self.is_static as u8]
    }

    /// Decode the record
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        AddressFile {
            address: bytes[0],
            is_static: bytes[1] != 0,
        }
    }
}

/// The fixed 92-byte `product.inf` record.
///
/// All fields are NUL-padded ASCII strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfoFile {
    /// The product model name
    pub model_name: [u8; 31],
    /// The product manufacturer name
    pub manufacturer_name: [u8; 31],
    /// The hardware revision string
    pub hardware_revision: [u8; 6],
    /// The app firmware revision string
    pub app_firmware_revision: [u8; 6],
    /// The bootloader firmware revision string
    pub bootloader_firmware_revision: [u8; 6],
    /// The first indexed output enumeration
    pub base_lighthead_enumeration: [u8; 6],
    /// The maximum indexed output enumeration
    pub max_lighthead_enumeration: [u8; 6],
}

impl ProductInfoFile {
    /// Record size in bytes
    pub const SIZE: usize = 92;

    /// Encode the record
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut pos = 0;
        for field in [
            &self.model_name[..],
            &self.manufacturer_name[..],
            &self.hardware_revision[..],
            &self.app_firmware_revision[..],
            &self.bootloader_firmware_revision[..],
            &self.base_lighthead_enumeration[..],
            &self.max_lighthead_enumeration[..],
        ] {
            bytes[pos..pos + field.len()].copy_from_slice(field);
            pos += field.len();
        }
        bytes
    }

    /// Decode the record
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut record = ProductInfoFile {
            model_name: [0; 31],
            manufacturer_name: [0; 31],
            hardware_revision: [0; 6],
            app_firmware_revision: [0; 6],
            bootloader_firmware_revision: [0; 6],
            base_lighthead_enumeration: [0; 6],
            max_lighthead_enumeration: [0; 6],
        };
        record.model_name.copy_from_slice(&bytes[0..31]);
        record.manufacturer_name.copy_from_slice(&bytes[31..62]);
        record.hardware_revision.copy_from_slice(&bytes[62..68]);
        record.app_firmware_revision.copy_from_slice(&bytes[68..74]);
        record
            .bootloader_firmware_revision
            .copy_from_slice(&bytes[74..80]);
        record
            .base_lighthead_enumeration
            .copy_from_slice(&bytes[80..86]);
        record
            .max_lighthead_enumeration
            .copy_from_slice(&bytes[86..92]);
        record
    }
}
