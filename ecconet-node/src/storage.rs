//! The flash file directory
//!
//! Files live in flash volumes as a run of 32-byte headers growing up from
//! the volume base, with file data allocated downward from the volume end.
//! A header's key marks it active, deleted, or (still erased) unused; the
//! first unused key ends the directory walk. Compaction of deleted space
//! is left to the platform's maintenance tooling; this module is only the
//! directory contract the protocol core consumes.
//!
//! All access goes through the host flash capability as `(volume, offset)`
//! pairs; nothing here holds pointers into flash.

use ecconet_common::{
    crc,
    files::{validate_file_name, FileMetadata, FileName, MAX_FILE_NAME_LEN},
    FlashError, Host,
};
use snafu::Snafu;

/// Size of a file header in flash.
///
/// Headers are padded to 32 bytes to keep rewrites clear of flash write
/// disturbance.
pub const HEADER_SIZE: u32 = 32;

const KEY_UNUSED: u16 = 0xFFFF;
const KEY_ACTIVE: u16 = 0x3FAC;
const KEY_DELETED: u16 = 0x0000;

/// A file directory operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum StorageError {
    /// No active file of that name exists in the volume
    #[snafu(display("file not found"))]
    NotFound,
    /// The volume cannot hold the file
    #[snafu(display("not enough room in volume"))]
    NoRoom,
    /// A header failed its checksum
    #[snafu(display("file header corrupted"))]
    Corrupt,
    /// The file name is not a valid 8.3 name
    #[snafu(display("invalid file name"))]
    InvalidName,
    /// The volume is absent or too small
    #[snafu(display("invalid volume"))]
    InvalidVolume,
    /// A flash primitive failed
    #[snafu(display("flash access failed"))]
    Flash {
        /// The underlying flash failure
        source: FlashError,
    },
}

impl From<FlashError> for StorageError {
    fn from(source: FlashError) -> Self {
        StorageError::Flash { source }
    }
}

/// The 32-byte file header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    key: u16,
    /// CRC of the header fields after the key and this checksum
    checksum: u16,
    name: [u8; MAX_FILE_NAME_LEN],
    location: u32,
    timestamp: u32,
    size: u32,
    data_checksum: u16,
    location_offset: u16,
}

impl FileHeader {
    const SIZE: usize = HEADER_SIZE as usize;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.key.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[4..16].copy_from_slice(&self.name);
        bytes[16..20].copy_from_slice(&self.location.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.size.to_le_bytes());
        bytes[28..30].copy_from_slice(&self.data_checksum.to_le_bytes());
        bytes[30..32].copy_from_slice(&self.location_offset.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        FileHeader {
            key: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            checksum: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            name: bytes[4..16].try_into().unwrap(),
            location: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            timestamp: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            data_checksum: u16::from_le_bytes(bytes[28..30].try_into().unwrap()),
            location_offset: u16::from_le_bytes(bytes[30..32].try_into().unwrap()),
        }
    }

    fn compute_checksum(&self) -> u16 {
        crc::crc16(&self.to_bytes()[4..])
    }

    fn matches_name(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FILE_NAME_LEN || self.name[..bytes.len()] != *bytes {
            return false;
        }
        bytes.len() == MAX_FILE_NAME_LEN || self.name[bytes.len()] == 0
    }

    fn to_metadata(self, volume: u16) -> FileMetadata {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAX_FILE_NAME_LEN);
        let mut name = FileName::new();
        if let Ok(s) = core::str::from_utf8(&self.name[..len]) {
            name.push_str(s).ok();
        }
        FileMetadata {
            name,
            volume,
            location: self.location,
            size: self.size,
            checksum: self.data_checksum,
            timestamp: self.timestamp,
        }
    }
}

fn read_header<H: Host>(
    host: &mut H,
    volume: u16,
    offset: u32,
) -> Result<FileHeader, StorageError> {
    let mut bytes = [0u8; FileHeader::SIZE];
    host.flash_read(volume, offset, &mut bytes)?;
    Ok(FileHeader::from_bytes(&bytes))
}

/// Directory shape gathered in one walk: the next free header slot and
/// the lowest allocated data offset.
struct VolumeShape {
    next_header: u32,
    lowest_data: u32,
}

fn walk_volume<H: Host>(host: &mut H, volume: u16) -> Result<VolumeShape, StorageError> {
    let size = host.volume_size(volume);
    if size < HEADER_SIZE {
        return Err(StorageError::InvalidVolume);
    }
    let mut offset = 0;
    let mut lowest_data = size;
    while offset + HEADER_SIZE <= size {
        let header = read_header(host, volume, offset)?;
        if header.key == KEY_UNUSED {
            break;
        }
        lowest_data = lowest_data.min(header.location);
        offset += HEADER_SIZE;
    }
    Ok(VolumeShape {
        next_header: offset,
        lowest_data,
    })
}

/// Find an active file's header by name, returning it with its header
/// offset.
fn find_header<H: Host>(
    host: &mut H,
    volume: u16,
    name: &str,
) -> Result<(FileHeader, u32), StorageError> {
    if validate_file_name(name).is_none() {
        return Err(StorageError::InvalidName);
    }
    let size = host.volume_size(volume);
    let mut offset = 0;
    while offset + HEADER_SIZE <= size {
        let header = read_header(host, volume, offset)?;
        if header.key == KEY_UNUSED {
            break;
        }
        if header.key == KEY_ACTIVE && header.matches_name(name) {
            if header.checksum != header.compute_checksum() {
                return Err(StorageError::Corrupt);
            }
            return Ok((header, offset));
        }
        offset += HEADER_SIZE;
    }
    Err(StorageError::NotFound)
}

/// Look up an active file's metadata by name.
pub fn find_file<H: Host>(
    host: &mut H,
    volume: u16,
    name: &str,
) -> Result<FileMetadata, StorageError> {
    let (header, _) = find_header(host, volume, name)?;
    Ok(header.to_metadata(volume))
}

/// Look up the `index`-th active file in a volume.
pub fn file_by_index<H: Host>(
    host: &mut H,
    volume: u16,
    index: u32,
) -> Result<FileMetadata, StorageError> {
    let size = host.volume_size(volume);
    let mut offset = 0;
    let mut remaining = index;
    while offset + HEADER_SIZE <= size {
        let header = read_header(host, volume, offset)?;
        if header.key == KEY_UNUSED {
            break;
        }
        if header.key == KEY_ACTIVE {
            if remaining == 0 {
                if header.checksum != header.compute_checksum() {
                    return Err(StorageError::Corrupt);
                }
                return Ok(header.to_metadata(volume));
            }
            remaining -= 1;
        }
        offset += HEADER_SIZE;
    }
    Err(StorageError::NotFound)
}

/// Create a file: append a header and reserve its data region.
///
/// `meta` supplies the name, size, data checksum, and timestamp; its
/// location is filled in on success. An existing file of the same name is
/// deleted first.
pub fn create_file<H: Host>(host: &mut H, meta: &mut FileMetadata) -> Result<(), StorageError> {
    if validate_file_name(&meta.name).is_none() {
        return Err(StorageError::InvalidName);
    }

    match delete_file(host, meta.volume, &meta.name) {
        Ok(()) | Err(StorageError::NotFound) => {}
        Err(e) => return Err(e),
    }

    let shape = walk_volume(host, meta.volume)?;
    let location = shape
        .lowest_data
        .checked_sub(meta.size)
        .ok_or(StorageError::NoRoom)?;
    if shape.next_header + HEADER_SIZE > location {
        return Err(StorageError::NoRoom);
    }

    let mut name = [0u8; MAX_FILE_NAME_LEN];
    name[..meta.name.len()].copy_from_slice(meta.name.as_bytes());
    let mut header = FileHeader {
        key: KEY_ACTIVE,
        checksum: 0,
        name,
        location,
        timestamp: meta.timestamp,
        size: meta.size,
        data_checksum: meta.checksum,
        location_offset: 0,
    };
    header.checksum = header.compute_checksum();

    host.flash_write(meta.volume, shape.next_header, &header.to_bytes())?;
    meta.location = location;
    Ok(())
}

/// Write a slice of an existing file's data at the given offset.
pub fn write_data<H: Host>(
    host: &mut H,
    volume: u16,
    name: &str,
    offset: u32,
    data: &[u8],
) -> Result<(), StorageError> {
    let (header, _) = find_header(host, volume, name)?;
    if offset + data.len() as u32 > header.size {
        return Err(StorageError::NoRoom);
    }
    host.flash_write(volume, header.location + offset, data)?;
    Ok(())
}

/// Read a slice of a file's data; short reads stop at the file end.
pub fn read_data<H: Host>(
    host: &mut H,
    meta: &FileMetadata,
    offset: u32,
    buf: &mut [u8],
) -> Result<usize, StorageError> {
    if offset >= meta.size {
        return Ok(0);
    }
    let len = buf.len().min((meta.size - offset) as usize);
    host.flash_read(meta.volume, meta.location + offset, &mut buf[..len])?;
    Ok(len)
}

/// Mark a file deleted.
pub fn delete_file<H: Host>(host: &mut H, volume: u16, name: &str) -> Result<(), StorageError> {
    let (_, offset) = find_header(host, volume, name)?;
    host.flash_write(volume, offset, &KEY_DELETED.to_le_bytes())?;
    Ok(())
}

/// Read a whole file into `buf`, returning its metadata.
///
/// Files longer than `buf` are truncated to fit.
pub fn read_file<H: Host>(
    host: &mut H,
    volume: u16,
    name: &str,
    buf: &mut [u8],
) -> Result<FileMetadata, StorageError> {
    let meta = find_file(host, volume, name)?;
    read_data(host, &meta, 0, buf)?;
    Ok(meta)
}

/// Create a file and write its data in one step.
///
/// The stored checksum is computed from `data`; applications use this to
/// provision the well-known volume 0 files.
pub fn write_file<H: Host>(
    host: &mut H,
    volume: u16,
    name: &str,
    data: &[u8],
    timestamp: u32,
) -> Result<(), StorageError> {
    let mut meta = FileMetadata {
        name: FileName::try_from(name).map_err(|()| StorageError::InvalidName)?,
        volume,
        location: 0,
        size: data.len() as u32,
        checksum: crc::crc16(data),
        timestamp,
    };
    create_file(host, &mut meta)?;
    host.flash_write(volume, meta.location, data)?;
    Ok(())
}

/// Verify a file's data against its stored checksum.
pub fn check_integrity<H: Host>(host: &mut H, meta: &FileMetadata) -> bool {
    let mut crc = 0u16;
    let mut offset = 0u32;
    let mut buf = [0u8; 16];
    while offset < meta.size {
        let len = buf.len().min((meta.size - offset) as usize);
        if host
            .flash_read(meta.volume, meta.location + offset, &mut buf[..len])
            .is_err()
        {
            return false;
        }
        for byte in &buf[..len] {
            crc::add_byte(&mut crc, *byte);
        }
        offset += len as u32;
    }
    crc == meta.checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecconet_common::{SendStatus, Token};

    struct MemHost {
        volumes: Vec<Vec<u8>>,
    }

    impl MemHost {
        fn new(sizes: &[usize]) -> Self {
            MemHost {
                volumes: sizes.iter().map(|s| vec![0xFF; *s]).collect(),
            }
        }
    }

    impl Host for MemHost {
        fn send_can(&mut self, _: u32, _: &[u8]) -> SendStatus {
            SendStatus::Accepted
        }

        fn flash_read(&mut self, volume: u16, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            let volume = self.volumes.get(volume as usize).ok_or(FlashError)?;
            let start = offset as usize;
            let end = start + buf.len();
            if end > volume.len() {
                return Err(FlashError);
            }
            buf.copy_from_slice(&volume[start..end]);
            Ok(())
        }

        fn flash_write(&mut self, volume: u16, offset: u32, data: &[u8]) -> Result<(), FlashError> {
            let volume = self.volumes.get_mut(volume as usize).ok_or(FlashError)?;
            let start = offset as usize;
            let end = start + data.len();
            if end > volume.len() {
                return Err(FlashError);
            }
            volume[start..end].copy_from_slice(data);
            Ok(())
        }

        fn flash_erase(&mut self, volume: u16, offset: u32, len: u32) -> Result<(), FlashError> {
            let volume = self.volumes.get_mut(volume as usize).ok_or(FlashError)?;
            let start = offset as usize;
            let end = start + len as usize;
            if end > volume.len() {
                return Err(FlashError);
            }
            volume[start..end].fill(0xFF);
            Ok(())
        }

        fn volume_size(&self, volume: u16) -> u32 {
            self.volumes
                .get(volume as usize)
                .map(|v| v.len() as u32)
                .unwrap_or(0)
        }

        fn guid(&self) -> [u32; 4] {
            [0; 4]
        }

        fn token_callback(&mut self, _: &Token) {}
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut host = MemHost::new(&[1024]);
        let data: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        write_file(&mut host, 0, "abc.txt", &data, 1234).unwrap();

        let meta = find_file(&mut host, 0, "abc.txt").unwrap();
        assert_eq!(300, meta.size);
        assert_eq!(1234, meta.timestamp);
        assert_eq!(crc::crc16(&data), meta.checksum);
        assert!(check_integrity(&mut host, &meta));

        let mut buf = vec![0u8; 300];
        read_file(&mut host, 0, "abc.txt", &mut buf).unwrap();
        assert_eq!(data, buf);
    }

    #[test]
    fn rewrite_replaces_previous_version() {
        let mut host = MemHost::new(&[1024]);
        write_file(&mut host, 0, "abc.txt", b"first", 1).unwrap();
        write_file(&mut host, 0, "abc.txt", b"second version", 2).unwrap();

        let meta = find_file(&mut host, 0, "abc.txt").unwrap();
        assert_eq!(14, meta.size);
        let mut buf = vec![0u8; 14];
        read_file(&mut host, 0, "abc.txt", &mut buf).unwrap();
        assert_eq!(b"second version", &buf[..]);
    }

    #[test]
    fn delete_hides_the_file() {
        let mut host = MemHost::new(&[1024]);
        write_file(&mut host, 0, "abc.txt", b"data", 0).unwrap();
        delete_file(&mut host, 0, "abc.txt").unwrap();
        assert_eq!(Err(StorageError::NotFound), find_file(&mut host, 0, "abc.txt"));
        assert_eq!(
            Err(StorageError::NotFound),
            delete_file(&mut host, 0, "abc.txt")
        );
    }

    #[test]
    fn volume_fills_up() {
        let mut host = MemHost::new(&[256]);
        // headers grow up, data grows down; this fits
        write_file(&mut host, 0, "aa.bin", &[1; 100], 0).unwrap();
        // 100 + 64 bytes of headers + 100 more does not
        let result = write_file(&mut host, 0, "bb.bin", &[2; 100], 0);
        assert_eq!(Err(StorageError::NoRoom), result);
    }

    #[test]
    fn indexed_lookup_skips_deleted_files() {
        let mut host = MemHost::new(&[2048]);
        write_file(&mut host, 0, "one.bin", &[1; 4], 0).unwrap();
        write_file(&mut host, 0, "two.bin", &[2; 4], 0).unwrap();
        write_file(&mut host, 0, "three.bin", &[3; 4], 0).unwrap();
        delete_file(&mut host, 0, "two.bin").unwrap();

        assert_eq!("one.bin", file_by_index(&mut host, 0, 0).unwrap().name.as_str());
        assert_eq!(
            "three.bin",
            file_by_index(&mut host, 0, 1).unwrap().name.as_str()
        );
        assert_eq!(
            Err(StorageError::NotFound),
            file_by_index(&mut host, 0, 2)
        );
    }

    #[test]
    fn segment_reads_stop_at_file_end() {
        let mut host = MemHost::new(&[1024]);
        let data: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        write_file(&mut host, 0, "abc.txt", &data, 0).unwrap();
        let meta = find_file(&mut host, 0, "abc.txt").unwrap();

        let mut buf = [0u8; 256];
        assert_eq!(256, read_data(&mut host, &meta, 0, &mut buf).unwrap());
        assert_eq!(data[..256], buf[..]);
        assert_eq!(44, read_data(&mut host, &meta, 256, &mut buf).unwrap());
        assert_eq!(data[256..], buf[..44]);
        assert_eq!(0, read_data(&mut host, &meta, 512, &mut buf).unwrap());
    }

    #[test]
    fn corrupt_data_fails_integrity() {
        let mut host = MemHost::new(&[1024]);
        write_file(&mut host, 0, "abc.txt", b"payload bytes", 0).unwrap();
        let meta = find_file(&mut host, 0, "abc.txt").unwrap();
        host.volumes[0][meta.location as usize] ^= 0xFF;
        assert!(!check_integrity(&mut host, &meta));
    }
}
