//! Sequencer pattern table definitions
//!
//! The pattern table file starts with a 32-bit magic key and a big-endian
//! pattern count, followed by entries tagged in their top four bits. A
//! pattern header carries its 13-bit enumeration (high byte masked by
//! [`ENUM_PREFIX_MASK`], whose bits double as the common-key mode) and a
//! repeat count in the header's low nibble, zero meaning run forever.

/// Magic key at the front of `patterns.tbl`, stored little-endian
pub const PATTERN_FILE_KEY: u32 = 0x4865_433B;

/// Offset of the first table entry, past the key and pattern count
pub const PATTERN_TABLE_HEADER_LEN: u32 = 6;

/// Pattern enumeration zero stops a sequencer
pub const PATTERN_STOP: u16 = 0;

/// Sync range value: ignore all network sync tokens
pub const SYNC_NONE: u16 = 0;

/// Sync range value: sync only to the exact running pattern
pub const SYNC_EXACT: u16 = 8192;

/// Mask of the mode bits shared with the enumeration's high byte
pub const ENUM_PREFIX_MASK: u8 = 0xE0;

/// Tag in the top four bits of each table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EntryPrefix {
    /// A pattern header; low nibble is the repeat count
    PatternWithRepeats = 0xA0,
    /// A step; a 12-bit big-endian period follows, then the payload
    StepWithPeriod = 0xB0,
    /// A step running a nested pattern; low nibble is its repeat count
    NestedPattern = 0xC0,
    /// The pattern's default-state payload
    StepWithAllOff = 0xD0,
    /// Start of a repeated section; low nibble is the repeat count
    SectionStart = 0xE0,
    /// End of a repeated section
    SectionEnd = 0xF0,
}

impl EntryPrefix {
    /// Mask selecting the entry tag
    pub const MASK: u8 = 0xF0;

    /// Decode an entry tag, if the byte carries a defined one
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw & Self::MASK {
            0xA0 => Some(EntryPrefix::PatternWithRepeats),
            0xB0 => Some(EntryPrefix::StepWithPeriod),
            0xC0 => Some(EntryPrefix::NestedPattern),
            0xD0 => Some(EntryPrefix::StepWithAllOff),
            0xE0 => Some(EntryPrefix::SectionStart),
            0xF0 => Some(EntryPrefix::SectionEnd),
            _ => None,
        }
    }
}

/// Common-key modes carried in a pattern header's second byte.
pub mod mode {
    /// Step payloads are compressed token streams
    pub const MULTI_KEY: u8 = 0x00;
    /// Step payloads are raw values of the step dictionary key
    pub const STEP_DICTIONARY_KEY: u8 = 0x20;
    /// Step payloads are raw values of the LED matrix key
    pub const LED_MATRIX_KEY: u8 = 0x40;
}

/// Assembles well-formed pattern tables, mainly for tests and tooling.
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
#[derive(Debug, Default)]
pub struct PatternTableBuilder {
    entries: Vec<u8>,
    num_patterns: u16,
}

#[cfg(feature = "std")]
impl PatternTableBuilder {
    /// Start an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a pattern with the given enumeration, repeat count (0 runs
    /// forever), and common-key mode bits
    pub fn begin_pattern(&mut self, pattern: u16, repeats: u8, mode: u8) -> &mut Self {
        self.num_patterns += 1;
        self.entries
            .push(EntryPrefix::PatternWithRepeats as u8 | (repeats & 0x0F));
        self.entries
            .push(((pattern >> 8) as u8 & !ENUM_PREFIX_MASK) | mode);
        self.entries.push(pattern as u8);
        self
    }

    /// Add the pattern's default-state payload as a token stream
    pub fn all_off_step(&mut self, tokens: &[(u16, i32)]) -> &mut Self {
        self.entries.push(EntryPrefix::StepWithAllOff as u8);
        self.push_tokens(tokens);
        self
    }

    /// Add the pattern's default-state payload as raw common-key bytes
    pub fn all_off_step_common(&mut self, value: &[u8]) -> &mut Self {
        self.entries.push(EntryPrefix::StepWithAllOff as u8);
        self.entries.extend_from_slice(value);
        self
    }

    /// Add a step with a 12-bit period and a token-stream payload
    pub fn step(&mut self, period_ms: u16, tokens: &[(u16, i32)]) -> &mut Self {
        self.push_step_header(period_ms);
        self.push_tokens(tokens);
        self
    }

    /// Add a step with a 12-bit period and raw common-key value bytes
    pub fn step_common(&mut self, period_ms: u16, value: &[u8]) -> &mut Self {
        self.push_step_header(period_ms);
        self.entries.extend_from_slice(value);
        self
    }

    /// Add a step that runs a nested pattern the given number of times
    pub fn nested(&mut self, pattern: u16, repeats: u8) -> &mut Self {
        self.entries
            .push(EntryPrefix::NestedPattern as u8 | (repeats & 0x0F));
        self.entries.push((pattern >> 8) as u8);
        self.entries.push(pattern as u8);
        self
    }

    /// Start a repeated section
    pub fn section_start(&mut self, repeats: u8) -> &mut Self {
        self.entries
            .push(EntryPrefix::SectionStart as u8 | (repeats & 0x0F));
        self
    }

    /// End a repeated section
    pub fn section_end(&mut self) -> &mut Self {
        self.entries.push(EntryPrefix::SectionEnd as u8);
        self
    }

    /// Finish the table: magic key, pattern count, entries, and the null
    /// terminator pattern the compiler always appends
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.entries.len() + 9);
        bytes.extend_from_slice(&PATTERN_FILE_KEY.to_le_bytes());
        bytes.extend_from_slice(&self.num_patterns.to_be_bytes());
        bytes.extend_from_slice(&self.entries);
        bytes.push(EntryPrefix::PatternWithRepeats as u8);
        bytes.push(0);
        bytes.push(0);
        bytes
    }

    fn push_step_header(&mut self, period_ms: u16) {
        self.entries
            .push(EntryPrefix::StepWithPeriod as u8 | ((period_ms >> 8) as u8 & 0x0F));
        self.entries.push(period_ms as u8);
    }

    fn push_tokens(&mut self, tokens: &[(u16, i32)]) {
        use crate::token::TokenKey;
        for (key, value) in tokens {
            let key = TokenKey::new(*key);
            self.entries.push((key.raw() >> 8) as u8);
            self.entries.push(key.raw() as u8);
            for shift in (0..key.value_size()).rev() {
                self.entries.push((*value >> (8 * shift)) as u8);
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn built_table_layout() {
        let mut builder = PatternTableBuilder::new();
        builder
            .begin_pattern(25, 0, mode::MULTI_KEY)
            .step(500, &[(1000, 100)])
            .step(500, &[(1000, 0)]);
        let table = builder.build();

        assert_eq!(
            PATTERN_FILE_KEY,
            u32::from_le_bytes(table[0..4].try_into().unwrap())
        );
        // big-endian pattern count
        assert_eq!(1, u16::from_be_bytes(table[4..6].try_into().unwrap()));
        // pattern header with infinite repeats
        assert_eq!(0xA0, table[6]);
        assert_eq!(25, u16::from_be_bytes([table[7] & 0x1F, table[8]]));
        // first step: period 500 = 0x1F4
        assert_eq!(0xB1, table[9]);
        assert_eq!(0xF4, table[10]);
        // terminator pattern with enumeration zero
        let tail = &table[table.len() - 3..];
        assert_eq!([0xA0, 0, 0], *tail);
    }
}
