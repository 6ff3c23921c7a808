//! CAN frame identifier layout and the frame value type
//!
//! ECCONet messages ride in 29-bit extended CAN identifiers. The field
//! layout is bit-exact on the wire and is encoded and decoded here with
//! explicit shifts and masks:
//!
//! ```text
//! bits  [ 0.. 4] frame index  (5)
//! bits  [ 5..11] destination  (7)
//! bits  [12..12] is event     (1)
//! bits  [13..16] reserved     (4)
//! bits  [17..23] source       (7)
//! bits  [24..28] frame type   (5)
//! ```

/// The industry-standard CAN frame maximum number of data bytes
pub const MAX_FRAME_DATA: usize = 8;

/// Mask of the 5-bit cyclic frame index
pub const FRAME_INDEX_MASK: u8 = 0x1F;

const FRAME_INDEX_SHIFT: u32 = 0;
const DEST_ADDRESS_SHIFT: u32 = 5;
const IS_EVENT_SHIFT: u32 = 12;
const SOURCE_ADDRESS_SHIFT: u32 = 17;
const FRAME_TYPE_SHIFT: u32 = 24;
const ADDRESS_MASK: u32 = 0x7F;

/// The position of a frame within a message.
///
/// The three values are chosen to coexist with other traffic on a shared
/// bus; any other value in the frame-type field marks a foreign frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameType {
    /// A complete single-frame message
    Single = 0x1C,
    /// A frame in the body of a multi-frame message
    Body = 0x1D,
    /// The final frame of a multi-frame message
    Last = 0x1E,
}

/// Error for [`FrameType::try_from`]
#[derive(Debug, Clone, Copy)]
pub struct InvalidFrameTypeError(pub u8);

impl TryFrom<u8> for FrameType {
    type Error = InvalidFrameTypeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == FrameType::Single as u8 => Ok(FrameType::Single),
            x if x == FrameType::Body as u8 => Ok(FrameType::Body),
            x if x == FrameType::Last as u8 => Ok(FrameType::Last),
            other => Err(InvalidFrameTypeError(other)),
        }
    }
}

/// The decoded fields of an ECCONet frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameId {
    /// 5-bit cyclic packet order index
    pub frame_index: u8,
    /// Destination address, 0 for broadcast
    pub destination: u8,
    /// Set on input-event messages
    pub is_event: bool,
    /// Sender address
    pub source: u8,
    /// Position of the frame within its message
    pub frame_type: FrameType,
}

impl FrameId {
    /// Pack the fields into a 29-bit identifier
    pub fn encode(&self) -> u32 {
        ((self.frame_index as u32 & FRAME_INDEX_MASK as u32) << FRAME_INDEX_SHIFT)
            | ((self.destination as u32 & ADDRESS_MASK) << DEST_ADDRESS_SHIFT)
            | ((self.is_event as u32) << IS_EVENT_SHIFT)
            | ((self.source as u32 & ADDRESS_MASK) << SOURCE_ADDRESS_SHIFT)
            | ((self.frame_type as u32 & 0x1F) << FRAME_TYPE_SHIFT)
    }

    /// Unpack a 29-bit identifier
    ///
    /// Fails on identifiers whose frame-type field is not one of the
    /// ECCONet frame types; such frames belong to other protocols and are
    /// dropped by the receive path.
    pub fn decode(id: u32) -> Result<Self, InvalidFrameTypeError> {
        let frame_type = FrameType::try_from(((id >> FRAME_TYPE_SHIFT) & 0x1F) as u8)?;
        Ok(FrameId {
            frame_index: ((id >> FRAME_INDEX_SHIFT) as u8) & FRAME_INDEX_MASK,
            destination: ((id >> DEST_ADDRESS_SHIFT) & ADDRESS_MASK) as u8,
            is_event: (id >> IS_EVENT_SHIFT) & 1 != 0,
            source: ((id >> SOURCE_ADDRESS_SHIFT) & ADDRESS_MASK) as u8,
            frame_type,
        })
    }
}

/// A CAN frame as exchanged with the driver: a 29-bit identifier and up to
/// eight data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    id: u32,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
}

impl CanFrame {
    /// Create a frame, truncating data to eight bytes
    pub fn new(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_FRAME_DATA);
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..len].copy_from_slice(&data[..len]);
        CanFrame {
            id,
            len: len as u8,
            data: buf,
        }
    }

    /// The frame identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The frame data bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}
