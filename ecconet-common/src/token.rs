//! Token types and key region definitions
//!
//! A token is the protocol's unit of information: a 16-bit key paired with a
//! value of up to four bytes. The top three bits of the key carry a message
//! class prefix; the remaining 13 bits identify the item within a fixed
//! region map which also determines how many value bytes the token carries
//! on the wire and in pattern tables.

/// Top-three-bit message class of a token key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum KeyPrefix {
    /// A command to an output device
    Command = 0x00,
    /// An output status report
    OutputStatus = 0x20,
    /// An input status event
    InputStatus = 0x40,
    /// Compressed run of same-or-zero values
    BinaryRepeat = 0x60,
    /// Compressed run of arbitrary values
    AnalogRepeat = 0x80,
    /// A sequencer pattern sync
    PatternSync = 0xA0,
}

impl KeyPrefix {
    /// Mask selecting the prefix bits within the key's high byte
    pub const MASK: u8 = 0xE0;

    /// Decode a raw prefix byte, if it names a defined prefix
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw & Self::MASK {
            0x00 => Some(KeyPrefix::Command),
            0x20 => Some(KeyPrefix::OutputStatus),
            0x40 => Some(KeyPrefix::InputStatus),
            0x60 => Some(KeyPrefix::BinaryRepeat),
            0x80 => Some(KeyPrefix::AnalogRepeat),
            0xA0 => Some(KeyPrefix::PatternSync),
            _ => None,
        }
    }
}

/// A 16-bit token key: a 3-bit class prefix over a 13-bit region-mapped
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TokenKey(u16);

/// Key region boundaries. The region a key falls in determines the number
/// of value bytes its tokens carry.
mod regions {
    pub const LOCAL_BASE: u16 = 1;
    pub const LOCAL_END: u16 = 200;
    pub const LOCAL_TWO_BYTE: u16 = 120;
    pub const LOCAL_FOUR_BYTE: u16 = 170;
    pub const LOCAL_ZERO_BYTE: u16 = 190;
    pub const INDEXED_INPUTS: u16 = 200;
    pub const INDEXED_OUTPUTS: u16 = 500;
    pub const NAMED_ONE_BYTE: u16 = 1000;
    pub const NAMED_TWO_BYTE: u16 = 5000;
    pub const NAMED_FOUR_BYTE: u16 = 7000;
    pub const NAMED_ZERO_BYTE: u16 = 8000;
    pub const NAMED_ZERO_BYTE_END: u16 = 8150;
    pub const INDEXED_SEQUENCER: u16 = 8150;
    pub const FTP_REQUESTS: u16 = 8160;
    pub const FTP_RESPONSES: u16 = 8170;
    pub const FTP_RESPONSES_END: u16 = 8192;
}

impl TokenKey {
    /// The reserved null key
    pub const NULL: TokenKey = TokenKey(0);

    /// Create a key from its raw 16-bit representation
    pub const fn new(raw: u16) -> Self {
        TokenKey(raw)
    }

    /// The raw 16-bit key, prefix included
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// The raw prefix bits (the masked high byte)
    pub const fn prefix(self) -> u8 {
        ((self.0 >> 8) as u8) & KeyPrefix::MASK
    }

    /// The 13-bit identifier with the prefix stripped
    pub const fn body(self) -> u16 {
        self.0 & 0x1FFF
    }

    /// The key re-tagged with the given prefix
    pub const fn with_prefix(self, prefix: KeyPrefix) -> Self {
        TokenKey(self.body() | ((prefix as u16) << 8))
    }

    /// Whether the key is a command (prefix 0x00)
    pub const fn is_command(self) -> bool {
        self.prefix() == KeyPrefix::Command as u8
    }

    /// Whether the key is an input status
    pub const fn is_input_status(self) -> bool {
        self.prefix() == KeyPrefix::InputStatus as u8
    }

    /// Whether the key is an output status
    pub const fn is_output_status(self) -> bool {
        self.prefix() == KeyPrefix::OutputStatus as u8
    }

    /// Whether the key addresses a private local variable
    pub const fn is_local_variable(self) -> bool {
        let key = self.body();
        key >= regions::LOCAL_BASE && key < regions::LOCAL_END
    }

    /// Whether the key is in the FTP request region
    pub const fn is_ftp_request(self) -> bool {
        let key = self.body();
        key >= regions::FTP_REQUESTS && key < regions::FTP_RESPONSES
    }

    /// Whether the key is in the FTP response region
    pub const fn is_ftp_response(self) -> bool {
        let key = self.body();
        key >= regions::FTP_RESPONSES && key < regions::FTP_RESPONSES_END
    }

    /// Whether the key addresses one of the indexed sequencers
    pub const fn is_indexed_sequencer(self) -> bool {
        let key = self.body();
        key >= regions::INDEXED_SEQUENCER && key < regions::FTP_REQUESTS
    }

    /// The number of value bytes tokens with this key carry on the wire
    ///
    /// This is a pure function of the prefix-stripped key, defined by the
    /// region map.
    pub const fn value_size(self) -> usize {
        let key = self.body();
        if key == 0 {
            0
        } else if key < regions::INDEXED_INPUTS {
            // local variable sub-regions
            if key < regions::LOCAL_TWO_BYTE {
                1
            } else if key < regions::LOCAL_FOUR_BYTE {
                2
            } else if key < regions::LOCAL_ZERO_BYTE {
                4
            } else {
                0
            }
        } else if key < regions::NAMED_TWO_BYTE {
            // indexed inputs, indexed outputs, and named one-byte items
            1
        } else if key < regions::NAMED_FOUR_BYTE {
            2
        } else if key < regions::NAMED_ZERO_BYTE {
            4
        } else if key < regions::INDEXED_SEQUENCER {
            0
        } else if key < regions::FTP_REQUESTS {
            3
        } else {
            0
        }
    }
}

impl From<u16> for TokenKey {
    fn from(raw: u16) -> Self {
        TokenKey(raw)
    }
}

impl From<TokenKey> for u16 {
    fn from(key: TokenKey) -> Self {
        key.0
    }
}

/// Named token keys used by the protocol core.
pub mod keys {
    use super::TokenKey;

    /// The reserved null key
    pub const NULL: TokenKey = TokenKey::new(0);

    // named lights (one-byte region)
    /// Stop light, boolean
    pub const LIGHT_STOP: TokenKey = TokenKey::new(1000);
    /// Tail light, boolean
    pub const LIGHT_TAIL: TokenKey = TokenKey::new(1001);
    /// Left turn light, boolean
    pub const LIGHT_LEFT_TURN: TokenKey = TokenKey::new(1002);
    /// Right turn light, boolean
    pub const LIGHT_RIGHT_TURN: TokenKey = TokenKey::new(1003);
    /// Takedown light, boolean
    pub const LIGHT_TAKEDOWN: TokenKey = TokenKey::new(1004);
    /// Work light, boolean
    pub const LIGHT_WORKLIGHT: TokenKey = TokenKey::new(1005);

    // named one-byte miscellaneous
    /// Address proposed during bus enumeration, value 1..=120
    pub const REQUEST_ADDRESS: TokenKey = TokenKey::new(3000);
    /// Address defended during bus enumeration, value 1..=120
    pub const RESPONSE_ADDRESS_IN_USE: TokenKey = TokenKey::new(3001);
    /// System power state
    pub const SYSTEM_POWER_STATE: TokenKey = TokenKey::new(3002);
    /// Sequencer output intensity 0..=100, sent to a sequencer address
    pub const SEQUENCER_INTENSITY: TokenKey = TokenKey::new(3003);

    // named two-byte
    /// Pattern enumeration to run, sent to a sequencer address (0 stops)
    pub const SEQUENCER_PATTERN: TokenKey = TokenKey::new(5000);
    /// Pattern sync enumeration from a peer sequencer
    pub const SEQUENCER_SYNC: TokenKey = TokenKey::new(5001);
    /// Light engine step dictionary key
    pub const STEP_DICTIONARY_KEY: TokenKey = TokenKey::new(5007);

    // named four-byte
    /// `(pattern << 16) | (intensity << 8) | sequencer_index`, 0 stops
    pub const INDEXED_SEQUENCER_WITH_PATTERN: TokenKey = TokenKey::new(7000);
    /// Sync range as two packed 16-bit enumerations, bottom | (top << 16)
    pub const SEQUENCER_SYNC_RANGE: TokenKey = TokenKey::new(7007);
    /// LED matrix display message
    pub const LED_MATRIX_MESSAGE: TokenKey = TokenKey::new(7009);

    // indexed sequencers, value is (intensity << 16) | pattern
    /// First indexed sequencer key; sequencers are 8150..=8155
    pub const INDEXED_SEQUENCER: TokenKey = TokenKey::new(8150);

    // ftp requests
    /// Request file info by directory index
    pub const REQUEST_FILE_INDEXED_INFO: TokenKey = TokenKey::new(8160);
    /// Request file info by name
    pub const REQUEST_FILE_INFO: TokenKey = TokenKey::new(8161);
    /// Request the start of a file read
    pub const REQUEST_FILE_READ_START: TokenKey = TokenKey::new(8162);
    /// Request a file read segment
    pub const REQUEST_FILE_READ_SEGMENT: TokenKey = TokenKey::new(8163);
    /// Request the start of a file write
    pub const REQUEST_FILE_WRITE_START: TokenKey = TokenKey::new(8164);
    /// Request a file write segment
    pub const REQUEST_FILE_WRITE_SEGMENT: TokenKey = TokenKey::new(8165);
    /// Request a file delete
    pub const REQUEST_FILE_DELETE: TokenKey = TokenKey::new(8166);
    /// Notify the server that the transaction is over
    pub const REQUEST_FILE_TRANSFER_COMPLETE: TokenKey = TokenKey::new(8167);

    // ftp responses
    /// Indexed file info response
    pub const RESPONSE_FILE_INDEXED_INFO: TokenKey = TokenKey::new(8170);
    /// File info response
    pub const RESPONSE_FILE_INFO: TokenKey = TokenKey::new(8171);
    /// File info transaction completed
    pub const RESPONSE_FILE_INFO_COMPLETE: TokenKey = TokenKey::new(8172);
    /// File read start response
    pub const RESPONSE_FILE_READ_START: TokenKey = TokenKey::new(8173);
    /// File read segment response
    pub const RESPONSE_FILE_READ_SEGMENT: TokenKey = TokenKey::new(8174);
    /// File read completed with matching checksum
    pub const RESPONSE_FILE_READ_COMPLETE: TokenKey = TokenKey::new(8175);
    /// File write start response
    pub const RESPONSE_FILE_WRITE_START: TokenKey = TokenKey::new(8176);
    /// File write segment response
    pub const RESPONSE_FILE_WRITE_SEGMENT: TokenKey = TokenKey::new(8177);
    /// File write completed
    pub const RESPONSE_FILE_WRITE_COMPLETE: TokenKey = TokenKey::new(8178);
    /// File delete response
    pub const RESPONSE_FILE_DELETE: TokenKey = TokenKey::new(8179);
    /// File delete completed
    pub const RESPONSE_FILE_DELETE_COMPLETE: TokenKey = TokenKey::new(8180);
    /// The named file does not exist on the server
    pub const RESPONSE_FILE_NOT_FOUND: TokenKey = TokenKey::new(8181);
    /// Received file data did not match the stored checksum
    pub const RESPONSE_FILE_CHECKSUM_ERROR: TokenKey = TokenKey::new(8182);
    /// The server volume has no room for the file
    pub const RESPONSE_FTP_DISK_FULL: TokenKey = TokenKey::new(8183);
    /// The client request was malformed or not authorized
    pub const RESPONSE_FTP_CLIENT_ERROR: TokenKey = TokenKey::new(8184);
    /// The server is in a transfer with another client
    pub const RESPONSE_FTP_SERVER_BUSY: TokenKey = TokenKey::new(8185);
    /// The server response was malformed
    pub const RESPONSE_FTP_SERVER_ERROR: TokenKey = TokenKey::new(8186);
    /// The transaction completed
    pub const RESPONSE_FTP_TRANSACTION_COMPLETE: TokenKey = TokenKey::new(8187);
    /// The transaction timed out awaiting a response
    pub const RESPONSE_FTP_TRANSACTION_TIMED_OUT: TokenKey = TokenKey::new(8188);
}

/// Per-token flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TokenFlags(u8);

impl TokenFlags {
    /// No flags set
    pub const NONE: TokenFlags = TokenFlags(0);
    /// The token is part of the rule engine's broadcast set
    pub const SHOULD_BROADCAST: TokenFlags = TokenFlags(0x08);
    /// The token restores an output's quiescent default state
    pub const DEFAULT_STATE: TokenFlags = TokenFlags(0x80);

    /// Whether all bits of `other` are set in `self`
    pub const fn contains(self, other: TokenFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TokenFlags {
    type Output = TokenFlags;

    fn bitor(self, rhs: TokenFlags) -> TokenFlags {
        TokenFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TokenFlags {
    fn bitor_assign(&mut self, rhs: TokenFlags) {
        self.0 |= rhs.0;
    }
}

/// The protocol's unit of information.
///
/// For incoming tokens `address` is the CAN address of the sender; for
/// outgoing tokens it is the recipient. The value holds up to four bytes;
/// the number of bytes actually moved on the wire is [`TokenKey::value_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Token {
    /// Sender for incoming tokens, recipient for outgoing tokens
    pub address: u8,
    /// The token key
    pub key: TokenKey,
    /// The value associated with the key
    pub value: i32,
    /// Flag bits
    pub flags: TokenFlags,
}

impl Token {
    /// Create a token with no flags set
    pub const fn new(address: u8, key: TokenKey, value: i32) -> Self {
        Token {
            address,
            key,
            value,
            flags: TokenFlags::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_accessors() {
        let key = TokenKey::new(0x1234);
        assert_eq!(0x00, key.prefix());
        let tagged = key.with_prefix(KeyPrefix::InputStatus);
        assert_eq!(0x40, tagged.prefix());
        assert_eq!(key.body(), tagged.body());
        assert!(tagged.is_input_status());
        assert!(!tagged.is_command());
    }

    #[test]
    fn value_sizes_follow_region_map() {
        let cases = [
            (0u16, 0usize),
            (1, 1),
            (119, 1),
            (120, 2),
            (169, 2),
            (170, 4),
            (189, 4),
            (190, 0),
            (199, 0),
            (200, 1),
            (499, 1),
            (500, 1),
            (999, 1),
            (1000, 1),
            (4999, 1),
            (5000, 2),
            (6999, 2),
            (7000, 4),
            (7999, 4),
            (8000, 0),
            (8149, 0),
            (8150, 3),
            (8159, 3),
            (8160, 0),
            (8191, 0),
        ];
        for (raw, size) in cases {
            assert_eq!(size, TokenKey::new(raw).value_size(), "key {raw}");
        }
    }

    #[test]
    fn value_size_ignores_prefix() {
        let key = keys::LIGHT_STOP.with_prefix(KeyPrefix::OutputStatus);
        assert_eq!(1, key.value_size());
    }

    #[test]
    fn region_predicates() {
        assert!(TokenKey::new(50).is_local_variable());
        assert!(!TokenKey::new(250).is_local_variable());
        assert!(keys::REQUEST_FILE_INFO.is_ftp_request());
        assert!(!keys::REQUEST_FILE_INFO.is_ftp_response());
        assert!(keys::RESPONSE_FILE_READ_SEGMENT.is_ftp_response());
        assert!(keys::INDEXED_SEQUENCER.is_indexed_sequencer());
    }

    #[test]
    fn flags() {
        let mut flags = TokenFlags::NONE;
        assert!(!flags.contains(TokenFlags::SHOULD_BROADCAST));
        flags |= TokenFlags::SHOULD_BROADCAST;
        assert!(flags.contains(TokenFlags::SHOULD_BROADCAST));
        assert!(!flags.contains(TokenFlags::DEFAULT_STATE));
    }
}
