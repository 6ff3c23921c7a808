//! The token-pattern sequencers
//!
//! Six independent sequencers run step programs out of the compiled
//! pattern table file. A sequencer owns a three-deep stack of pattern
//! frames so patterns can nest, a step clock, an output intensity, and a
//! sync range that lets sequencers across the bus restart their root
//! patterns in phase.
//!
//! Pattern bytes are fetched through the host flash capability by
//! `(volume, offset)`; no pointers into the table are retained.

use defmt_or_log::{debug, warn};
use ecconet_common::{
    addresses, codec,
    files::PATTERN_TABLE_FILE,
    patterns::{
        mode, EntryPrefix, ENUM_PREFIX_MASK, PATTERN_FILE_KEY, PATTERN_STOP,
        PATTERN_TABLE_HEADER_LEN, SYNC_EXACT, SYNC_NONE,
    },
    token::keys,
    Host, KeyPrefix, Token, TokenFlags, TokenKey,
};
use heapless::Vec;

use crate::storage;
use crate::time::timer_expired;

/// The number of instanced token sequencers
pub const NUM_SEQUENCERS: usize = 6;

/// How deep patterns may nest
const PATTERN_STACK_SIZE: usize = 3;

/// Flash window for one step's token payload
const STEP_WINDOW: usize = 128;

/// A token produced by the sequencers, tagged with where it goes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Emission {
    /// Deliver to the application callback
    App(Token),
    /// A pattern sync: feed the rule engine table and broadcast it
    Sync(Token),
}

/// Emission buffer filled by one clock or token-in call
pub(crate) type Emissions = Vec<Emission, 96>;

/// Where the pattern table file sits in flash.
#[derive(Debug, Clone, Copy)]
struct PatternFile {
    volume: u16,
    location: u32,
    size: u32,
}

/// One nesting level of a running pattern.
#[derive(Debug, Clone, Copy, Default)]
struct PatternFrame {
    /// The pattern header position
    pattern_pos: u32,
    /// The first step, past the header and any default-state block
    first_step_pos: u32,
    /// The step cursor
    current_pos: u32,
    /// Rewind target of the open repeated section
    repeated_section_pos: u32,
    /// Remaining pattern repeats, zero meaning forever
    pattern_counter: u8,
    /// Remaining repeats of the open section
    repeated_section_counter: u8,
}

#[derive(Debug)]
struct Sequencer {
    intensity: i32,
    /// Stack depth; zero when stopped
    stack_len: usize,
    step_time: u32,
    stack: [PatternFrame; PATTERN_STACK_SIZE],
    sync_bottom: u16,
    sync_top: u16,
    common_key: TokenKey,
    sync_enable: bool,
}

impl Sequencer {
    const fn stopped() -> Self {
        Sequencer {
            intensity: 100,
            stack_len: 0,
            step_time: 0,
            stack: [PatternFrame {
                pattern_pos: 0,
                first_step_pos: 0,
                current_pos: 0,
                repeated_section_pos: 0,
                pattern_counter: 0,
                repeated_section_counter: 0,
            }; PATTERN_STACK_SIZE],
            sync_bottom: SYNC_EXACT,
            sync_top: SYNC_EXACT,
            common_key: keys::NULL,
            sync_enable: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SequencerController {
    sequencers: [Sequencer; NUM_SEQUENCERS],
    file: Option<PatternFile>,
}

fn common_key_for_mode(header_byte: u8) -> TokenKey {
    if header_byte & mode::STEP_DICTIONARY_KEY != 0 {
        keys::STEP_DICTIONARY_KEY
    } else if header_byte & mode::LED_MATRIX_KEY != 0 {
        keys::LED_MATRIX_MESSAGE
    } else {
        keys::NULL
    }
}

fn pattern_byte<H: Host>(file: PatternFile, host: &mut H, pos: u32) -> Option<u8> {
    if pos >= file.size {
        return None;
    }
    let mut byte = [0u8; 1];
    host.flash_read(file.volume, file.location + pos, &mut byte).ok()?;
    Some(byte[0])
}

/// Read up to a window of pattern bytes, clamped at the file end.
fn pattern_read<H: Host>(file: PatternFile, host: &mut H, pos: u32, buf: &mut [u8]) -> usize {
    if pos >= file.size {
        return 0;
    }
    let len = buf.len().min((file.size - pos) as usize);
    match host.flash_read(file.volume, file.location + pos, &mut buf[..len]) {
        Ok(()) => len,
        Err(_) => 0,
    }
}

/// Advance past one step payload, common-key or compressed-token form.
fn skip_payload<H: Host>(
    file: PatternFile,
    host: &mut H,
    pos: u32,
    common_key: TokenKey,
) -> Option<u32> {
    if common_key != keys::NULL {
        return Some(pos + common_key.value_size() as u32);
    }
    let mut window = [0u8; STEP_WINDOW];
    let len = pattern_read(file, host, pos, &mut window);
    match codec::decompress(&window[..len], 0, |_| {}) {
        Ok(consumed) => Some(pos + consumed as u32),
        Err(_) => None,
    }
}

/// Read a common key's raw big-endian value at `pos`.
fn read_common_value<H: Host>(
    file: PatternFile,
    host: &mut H,
    pos: u32,
    common_key: TokenKey,
) -> Option<(i32, u32)> {
    let mut value = 0i32;
    let mut pos = pos;
    for _ in 0..common_key.value_size() {
        value = (value << 8) | pattern_byte(file, host, pos)? as i32;
        pos += 1;
    }
    Some((value, pos))
}

impl SequencerController {
    pub fn new() -> Self {
        SequencerController {
            sequencers: [const { Sequencer::stopped() }; NUM_SEQUENCERS],
            file: None,
        }
    }

    /// Locate and validate the pattern table, and stop every sequencer.
    pub fn reset<H: Host>(&mut self, host: &mut H) {
        self.file = None;
        if let Ok(meta) = storage::find_file(host, 0, PATTERN_TABLE_FILE) {
            if storage::check_integrity(host, &meta) {
                let file = PatternFile {
                    volume: meta.volume,
                    location: meta.location,
                    size: meta.size,
                };
                let mut key = [0u8; 4];
                if host.flash_read(file.volume, file.location, &mut key).is_ok()
                    && u32::from_le_bytes(key) == PATTERN_FILE_KEY
                {
                    self.file = Some(file);
                }
            }
        }

        for sequencer in &mut self.sequencers {
            *sequencer = Sequencer::stopped();
        }
    }

    /// Whether the indexed sequencer is running a pattern
    pub fn is_running(&self, index: usize) -> bool {
        index < NUM_SEQUENCERS && self.sequencers[index].stack_len > 0
    }

    /// The number of patterns the table declares
    pub fn num_patterns<H: Host>(&self, host: &mut H) -> u16 {
        let Some(file) = self.file else {
            return 0;
        };
        match (
            pattern_byte(file, host, 4),
            pattern_byte(file, host, 5),
        ) {
            (Some(hi), Some(lo)) => ((hi as u16) << 8) | lo as u16,
            _ => 0,
        }
    }

    fn file_valid<H: Host>(&self, host: &mut H) -> bool {
        let Some(file) = self.file else {
            return false;
        };
        let mut key = [0u8; 4];
        host.flash_read(file.volume, file.location, &mut key).is_ok()
            && u32::from_le_bytes(key) == PATTERN_FILE_KEY
    }

    /// Step every running sequencer that has reached its step time.
    pub fn clock<H: Host>(
        &mut self,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        if self.file.is_none() {
            return;
        }

        // the table may have been rewritten over FTP since last tick
        if !self.file_valid(host) {
            self.reset(host);
            return;
        }

        for index in 0..NUM_SEQUENCERS {
            if self.sequencers[index].stack_len > 0
                && timer_expired(now, self.sequencers[index].step_time)
            {
                self.next_step(index, now, can_address, host, out);
            }
        }
    }

    /// Handle a sequencer-directed token.
    pub fn token_in<H: Host>(
        &mut self,
        token: &Token,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        let key = TokenKey::new(token.key.body());

        if key.is_indexed_sequencer() {
            let index = (key.raw() - keys::INDEXED_SEQUENCER.raw()) as usize;
            if index >= NUM_SEQUENCERS {
                return;
            }
            self.sequencers[index].intensity = (token.value >> 16) & 0xFF;
            let pattern = (token.value & 0xFFFF) as u16;
            self.start_or_stop(index, pattern, now, can_address, host, out);
            return;
        }

        match key {
            keys::SEQUENCER_SYNC_RANGE => {
                let Some(index) = sequencer_index(token.address) else {
                    return;
                };
                self.sequencers[index].sync_bottom = (token.value & 0xFFFF) as u16;
                self.sequencers[index].sync_top = ((token.value as u32) >> 16) as u16;
            }
            keys::SEQUENCER_SYNC => {
                self.sync_in(token.address, token.value, now, can_address, host, out);
            }
            keys::INDEXED_SEQUENCER_WITH_PATTERN => {
                // unpack into an intensity set and a pattern start
                let address =
                    addresses::SEQUENCER_0.wrapping_add((token.value & 0xFF) as u8);
                let mut intensity = Token::new(
                    address,
                    keys::SEQUENCER_INTENSITY,
                    (token.value >> 8) & 0xFF,
                );
                self.token_in(&intensity, now, can_address, host, out);
                intensity.key = keys::SEQUENCER_PATTERN;
                intensity.value = ((token.value as u32) >> 16) as i32;
                self.token_in(&intensity, now, can_address, host, out);
            }
            keys::SEQUENCER_PATTERN => {
                let Some(index) = sequencer_index(token.address) else {
                    return;
                };
                let pattern = (token.value & 0xFFFF) as u16;
                self.start_or_stop(index, pattern, now, can_address, host, out);
            }
            keys::SEQUENCER_INTENSITY => {
                let Some(index) = sequencer_index(token.address) else {
                    return;
                };
                self.sequencers[index].intensity = token.value;
            }
            _ => {}
        }
    }

    /// Start a root pattern, ignoring a request for the one already
    /// running, or stop the sequencer for the null enumeration.
    fn start_or_stop<H: Host>(
        &mut self,
        index: usize,
        pattern: u16,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        if pattern == PATTERN_STOP {
            self.stop(index, host, out);
            return;
        }
        if !self.file_valid(host) {
            return;
        }
        if self.root_pattern_enum(index, host) != pattern {
            debug!("sequencer {} starting pattern {}", index, pattern);
            self.stop(index, host, out);
            self.start(index, pattern, 0, true, now, can_address, host, out);
        }
    }

    /// Restart in-range sequencers on a peer's pattern sync.
    fn sync_in<H: Host>(
        &mut self,
        sender: u8,
        value: i32,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        // only peers above our own address drive our phase
        if sender <= can_address {
            return;
        }
        let value = (value as u32 & !((ENUM_PREFIX_MASK as u32) << 8)) as u16;

        for index in 0..NUM_SEQUENCERS {
            let running = self.sequencers[index].stack_len > 0;
            if !running || addresses::SEQUENCER_0 + index as u8 <= sender {
                continue;
            }
            let bottom = self.sequencers[index].sync_bottom;
            let top = self.sequencers[index].sync_top;
            if top == SYNC_NONE {
                continue;
            }
            let in_range = value >= bottom && value <= top;
            let exact_match =
                bottom == SYNC_EXACT && value == self.root_pattern_enum(index, host);
            if in_range || exact_match {
                let sequencer = &mut self.sequencers[index];
                sequencer.stack_len = 1;
                sequencer.stack[0].current_pos = sequencer.stack[0].first_step_pos;
                sequencer.step_time = now;
                self.next_step(index, now, can_address, host, out);
            }
        }
    }

    /// The enumeration of the running root pattern, or the stop value.
    fn root_pattern_enum<H: Host>(&self, index: usize, host: &mut H) -> u16 {
        let Some(file) = self.file else {
            return PATTERN_STOP;
        };
        if self.sequencers[index].stack_len == 0 {
            return PATTERN_STOP;
        }
        let pos = self.sequencers[index].stack[0].pattern_pos;
        match (
            pattern_byte(file, host, pos + 1),
            pattern_byte(file, host, pos + 2),
        ) {
            (Some(hi), Some(lo)) => (((hi & !ENUM_PREFIX_MASK) as u16) << 8) | lo as u16,
            _ => PATTERN_STOP,
        }
    }

    /// Find a pattern's header position and count its steps.
    fn get_pattern<H: Host>(&self, host: &mut H, wanted: u16) -> Option<(u32, u16)> {
        let file = self.file?;
        let mut pos = PATTERN_TABLE_HEADER_LEN;
        let mut match_pos = None;
        let mut step_count = 0u16;
        let mut common_key = keys::NULL;

        while pos < file.size {
            let tag = pattern_byte(file, host, pos)?;
            match EntryPrefix::from_raw(tag) {
                Some(EntryPrefix::PatternWithRepeats) => {
                    // the header after the match ends the step count
                    if let Some(found) = match_pos {
                        return Some((found, step_count));
                    }
                    let hi = pattern_byte(file, host, pos + 1)?;
                    let lo = pattern_byte(file, host, pos + 2)?;
                    let pattern = (((hi & !ENUM_PREFIX_MASK) as u16) << 8) | lo as u16;
                    step_count = 0;
                    // the compiler terminates the table with a null pattern
                    if pattern == PATTERN_STOP {
                        return None;
                    }
                    if pattern == wanted {
                        match_pos = Some(pos);
                    }
                    common_key = common_key_for_mode(hi);
                    pos += 3;
                }
                Some(EntryPrefix::StepWithAllOff) => {
                    pos = skip_payload(file, host, pos + 1, common_key)?;
                }
                Some(EntryPrefix::SectionStart) | Some(EntryPrefix::SectionEnd) => {
                    pos += 1;
                }
                Some(EntryPrefix::StepWithPeriod) => {
                    step_count += 1;
                    pos = skip_payload(file, host, pos + 2, common_key)?;
                }
                Some(EntryPrefix::NestedPattern) => {
                    pos += 3;
                }
                None => {
                    warn!("pattern table corrupt at offset {}", pos);
                    return None;
                }
            }
        }
        None
    }

    /// Push and begin a pattern, running its first step immediately.
    #[allow(clippy::too_many_arguments)]
    fn start<H: Host>(
        &mut self,
        index: usize,
        pattern: u16,
        repeats: u8,
        is_root: bool,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        let Some(file) = self.file else {
            return;
        };
        let Some((pattern_pos, step_count)) = self.get_pattern(host, pattern) else {
            return;
        };
        if self.sequencers[index].stack_len >= PATTERN_STACK_SIZE {
            return;
        }

        let Some(header) = pattern_byte(file, host, pattern_pos) else {
            return;
        };
        let Some(mode_byte) = pattern_byte(file, host, pattern_pos + 1) else {
            return;
        };

        // a root pattern takes its repeats from its own header; a nested
        // pattern's repeats come from the step that invoked it
        let repeats = if is_root { header & 0x0F } else { repeats };
        let common_key = common_key_for_mode(mode_byte);

        if is_root {
            let sequencer = &mut self.sequencers[index];
            sequencer.sync_enable = step_count > 1 && sequencer.sync_top != SYNC_NONE;
        }
        self.sequencers[index].common_key = common_key;

        // skip the header, and the default-state block if present
        let mut first_step = pattern_pos + 3;
        if pattern_byte(file, host, first_step).map(|b| b & EntryPrefix::MASK)
            == Some(EntryPrefix::StepWithAllOff as u8)
        {
            match skip_payload(file, host, first_step + 1, common_key) {
                Some(pos) => first_step = pos,
                None => return,
            }
        }

        let sequencer = &mut self.sequencers[index];
        sequencer.stack[sequencer.stack_len] = PatternFrame {
            pattern_pos,
            first_step_pos: first_step,
            current_pos: first_step,
            repeated_section_pos: 0,
            pattern_counter: repeats,
            repeated_section_counter: 0,
        };
        sequencer.stack_len += 1;
        sequencer.step_time = now;
        self.next_step(index, now, can_address, host, out);
    }

    /// Pop the current pattern, emitting its default-state tokens.
    fn end_current_pattern<H: Host>(&mut self, index: usize, host: &mut H, out: &mut Emissions) {
        let sequencer = &self.sequencers[index];
        if sequencer.stack_len == 0 {
            return;
        }
        let top = sequencer.stack_len - 1;
        let pattern_pos = sequencer.stack[top].pattern_pos;
        let common_key = sequencer.common_key;
        let intensity = sequencer.intensity;
        let address = addresses::SEQUENCER_0 + index as u8;

        if let Some(file) = self.file {
            // the default-state payload: an explicit all-off block, or
            // failing that the first step's tokens
            let payload = pattern_byte(file, host, pattern_pos + 3)
                .map(|b| b & EntryPrefix::MASK)
                .and_then(|tag| {
                    if tag == EntryPrefix::StepWithAllOff as u8 {
                        Some(pattern_pos + 4)
                    } else if tag == EntryPrefix::StepWithPeriod as u8 {
                        Some(pattern_pos + 5)
                    } else {
                        None
                    }
                });

            if let Some(pos) = payload {
                if common_key != keys::NULL {
                    if let Some((value, _)) = read_common_value(file, host, pos, common_key) {
                        out.push(Emission::App(common_key_token(
                            address, common_key, value, intensity,
                        )))
                        .ok();
                    }
                } else {
                    let mut window = [0u8; STEP_WINDOW];
                    let len = pattern_read(file, host, pos, &mut window);
                    codec::decompress(&window[..len], address, |token| {
                        let mut token = *token;
                        token.value = token.value * intensity / 100;
                        token.flags = TokenFlags::DEFAULT_STATE;
                        out.push(Emission::App(token)).ok();
                    })
                    .ok();
                }
            }
        }

        self.sequencers[index].stack_len -= 1;
    }

    /// Pop the whole stack with default-state emissions.
    fn stop<H: Host>(&mut self, index: usize, host: &mut H, out: &mut Emissions) {
        while self.sequencers[index].stack_len > 0 {
            self.end_current_pattern(index, host, out);
        }
    }

    /// Execute one step of the sequencer's current pattern.
    fn next_step<H: Host>(
        &mut self,
        index: usize,
        now: u32,
        can_address: u8,
        host: &mut H,
        out: &mut Emissions,
    ) {
        let Some(file) = self.file else {
            return;
        };
        if self.sequencers[index].stack_len == 0 {
            return;
        }

        // end of pattern: bytes exhausted or the next header reached
        {
            let top = self.sequencers[index].stack_len - 1;
            let current = self.sequencers[index].stack[top].current_pos;
            let at_end = current >= file.size
                || pattern_byte(file, host, current).map(|b| b & EntryPrefix::MASK)
                    == Some(EntryPrefix::PatternWithRepeats as u8);
            if at_end {
                let frame = &mut self.sequencers[index].stack[top];
                let rewind = if frame.pattern_counter == 0 {
                    true
                } else {
                    frame.pattern_counter -= 1;
                    frame.pattern_counter != 0
                };
                if rewind {
                    frame.current_pos = frame.first_step_pos;
                } else {
                    self.end_current_pattern(index, host, out);
                    if self.sequencers[index].stack_len == 0 {
                        return;
                    }
                }
            }
        }

        // a root pattern announces its phase from its first step
        let top = self.sequencers[index].stack_len - 1;
        if top == 0
            && self.sequencers[index].stack[0].current_pos
                == self.sequencers[index].stack[0].first_step_pos
            && self.sequencers[index].sync_enable
        {
            let sync = Token::new(
                addresses::SEQUENCER_0 + index as u8,
                keys::SEQUENCER_SYNC.with_prefix(KeyPrefix::OutputStatus),
                self.root_pattern_enum(index, host) as i32,
            );
            self.sync_in(sync.address, sync.value, now, can_address, host, out);
            out.push(Emission::Sync(sync)).ok();
        }

        // section markers
        let top = self.sequencers[index].stack_len - 1;
        let current = self.sequencers[index].stack[top].current_pos;
        let Some(tag) = pattern_byte(file, host, current) else {
            return;
        };
        match tag & EntryPrefix::MASK {
            tag_bits if tag_bits == EntryPrefix::SectionStart as u8 => {
                let frame = &mut self.sequencers[index].stack[top];
                frame.repeated_section_counter = tag & 0x0F;
                frame.current_pos = current + 1;
                frame.repeated_section_pos = frame.current_pos;
            }
            tag_bits if tag_bits == EntryPrefix::SectionEnd as u8 => {
                let frame = &mut self.sequencers[index].stack[top];
                let repeat = if frame.repeated_section_counter == 0 {
                    false
                } else {
                    frame.repeated_section_counter -= 1;
                    frame.repeated_section_counter != 0
                };
                if repeat {
                    frame.current_pos = frame.repeated_section_pos;
                } else {
                    frame.current_pos = current + 1;
                }
            }
            _ => {}
        }

        // the step itself
        let current = self.sequencers[index].stack[top].current_pos;
        let Some(tag) = pattern_byte(file, host, current) else {
            return;
        };
        if tag & EntryPrefix::MASK == (EntryPrefix::StepWithPeriod as u8) {
            let Some(period_lo) = pattern_byte(file, host, current + 1) else {
                return;
            };
            let period = (((tag & !EntryPrefix::MASK) as u32) << 8) | period_lo as u32;
            self.sequencers[index].step_time =
                self.sequencers[index].step_time.wrapping_add(period);
            let payload = current + 2;

            let common_key = self.sequencers[index].common_key;
            let intensity = self.sequencers[index].intensity;
            let address = addresses::SEQUENCER_0 + index as u8;
            if common_key != keys::NULL {
                let Some((value, end)) = read_common_value(file, host, payload, common_key)
                else {
                    return;
                };
                self.sequencers[index].stack[top].current_pos = end;
                out.push(Emission::App(common_key_token(
                    address, common_key, value, intensity,
                )))
                .ok();
            } else {
                let mut window = [0u8; STEP_WINDOW];
                let len = pattern_read(file, host, payload, &mut window);
                match codec::decompress(&window[..len], address, |token| {
                    let mut token = *token;
                    token.value = token.value * intensity / 100;
                    token.flags = TokenFlags::NONE;
                    out.push(Emission::App(token)).ok();
                }) {
                    Ok(consumed) => {
                        self.sequencers[index].stack[top].current_pos =
                            payload + consumed as u32;
                    }
                    Err(_) => {
                        warn!("pattern step payload corrupt, stopping sequencer {}", index);
                        self.sequencers[index].stack_len = 0;
                    }
                }
            }
        } else if tag & EntryPrefix::MASK == (EntryPrefix::NestedPattern as u8) {
            let repeats = tag & 0x0F;
            let Some(hi) = pattern_byte(file, host, current + 1) else {
                return;
            };
            let Some(lo) = pattern_byte(file, host, current + 2) else {
                return;
            };
            let nested = ((hi as u16) << 8) | lo as u16;
            self.sequencers[index].stack[top].current_pos = current + 3;
            self.start(index, nested, repeats, false, now, can_address, host, out);
        }
    }
}

/// The sequencer reached by an internal network address, if any.
fn sequencer_index(address: u8) -> Option<usize> {
    if addresses::is_sequencer(address) {
        Some((address - addresses::SEQUENCER_0) as usize)
    } else {
        None
    }
}

/// A common-key token with the output intensity packed into value bits
/// 16..23.
fn common_key_token(address: u8, key: TokenKey, value: i32, intensity: i32) -> Token {
    let mut value = value & !0x007F_0000;
    value |= 0x007F_0000 & (intensity << 16);
    Token::new(address, key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;
    use ecconet_common::{FlashError, SendStatus};
    use std::vec::Vec;

    struct MemHost {
        volume: Vec<u8>,
    }

    impl MemHost {
        fn new(size: usize) -> Self {
            MemHost {
                volume: vec![0xFF; size],
            }
        }
    }

    impl Host for MemHost {
        fn send_can(&mut self, _: u32, _: &[u8]) -> SendStatus {
            SendStatus::Accepted
        }

        fn flash_read(&mut self, _: u16, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            let start = offset as usize;
            let end = start + buf.len();
            if end > self.volume.len() {
                return Err(FlashError);
            }
            buf.copy_from_slice(&self.volume[start..end]);
            Ok(())
        }

        fn flash_write(&mut self, _: u16, offset: u32, data: &[u8]) -> Result<(), FlashError> {
            let start = offset as usize;
            let end = start + data.len();
            if end > self.volume.len() {
                return Err(FlashError);
            }
            self.volume[start..end].copy_from_slice(data);
            Ok(())
        }

        fn flash_erase(&mut self, _: u16, offset: u32, len: u32) -> Result<(), FlashError> {
            let start = offset as usize;
            let end = start + len as usize;
            if end > self.volume.len() {
                return Err(FlashError);
            }
            self.volume[start..end].fill(0xFF);
            Ok(())
        }

        fn volume_size(&self, _: u16) -> u32 {
            self.volume.len() as u32
        }

        fn guid(&self) -> [u32; 4] {
            [0; 4]
        }

        fn token_callback(&mut self, _: &Token) {}
    }

    fn header(pattern: u16, repeats: u8) -> [u8; 3] {
        [
            EntryPrefix::PatternWithRepeats as u8 | repeats,
            (pattern >> 8) as u8 & !ENUM_PREFIX_MASK,
            pattern as u8,
        ]
    }

    /// One step entry with a single one-byte token payload
    fn step(period: u16, key: u16, value: u8) -> [u8; 5] {
        [
            EntryPrefix::StepWithPeriod as u8 | ((period >> 8) as u8 & 0x0F),
            period as u8,
            (key >> 8) as u8,
            key as u8,
            value,
        ]
    }

    fn host_with_table(entries: &[u8], num_patterns: u16) -> MemHost {
        let mut bytes = PATTERN_FILE_KEY.to_le_bytes().to_vec();
        bytes.extend_from_slice(&num_patterns.to_be_bytes());
        bytes.extend_from_slice(entries);
        // the compiler's null terminator pattern
        bytes.extend_from_slice(&[EntryPrefix::PatternWithRepeats as u8, 0, 0]);
        let mut host = MemHost::new(4096);
        storage::write_file(&mut host, 0, PATTERN_TABLE_FILE, &bytes, 0).unwrap();
        host
    }

    fn app_tokens(out: &Emissions) -> Vec<(u16, i32, bool)> {
        out.iter()
            .filter_map(|e| match e {
                Emission::App(t) => Some((
                    t.key.raw(),
                    t.value,
                    t.flags.contains(TokenFlags::DEFAULT_STATE),
                )),
                Emission::Sync(_) => None,
            })
            .collect()
    }

    fn start_pattern(
        ctrl: &mut SequencerController,
        host: &mut MemHost,
        pattern: u16,
        now: u32,
    ) -> Emissions {
        let mut out = Emissions::new();
        let token = Token::new(addresses::SEQUENCER_0, keys::SEQUENCER_PATTERN, pattern as i32);
        ctrl.token_in(&token, now, 5, host, &mut out);
        out
    }

    fn tick(ctrl: &mut SequencerController, host: &mut MemHost, now: u32) -> Emissions {
        let mut out = Emissions::new();
        ctrl.clock(now, 5, host, &mut out);
        out
    }

    #[test]
    fn finds_patterns_and_counts_steps() {
        let mut entries = Vec::new();
        entries.extend_from_slice(&header(30, 0));
        entries.extend_from_slice(&step(100, 1000, 1));
        entries.extend_from_slice(&step(100, 1000, 0));
        entries.extend_from_slice(&header(31, 0));
        entries.extend_from_slice(&step(50, 1001, 9));
        let mut host = host_with_table(&entries, 2);

        let mut ctrl = SequencerController::new();
        ctrl.reset(&mut host);
        assert_eq!(2, ctrl.num_patterns(&mut host));

        let (pos, steps) = ctrl.get_pattern(&mut host, 30).unwrap();
        assert_eq!(PATTERN_TABLE_HEADER_LEN, pos);
        assert_eq!(2, steps);

        let (_, steps) = ctrl.get_pattern(&mut host, 31).unwrap();
        assert_eq!(1, steps);

        assert!(ctrl.get_pattern(&mut host, 99).is_none());
    }

    #[test]
    fn section_repeats_rewind_steps() {
        let mut entries = Vec::new();
        entries.extend_from_slice(&header(30, 1));
        entries.push(EntryPrefix::SectionStart as u8 | 3);
        entries.extend_from_slice(&step(10, 1000, 1));
        entries.push(EntryPrefix::SectionEnd as u8);
        entries.extend_from_slice(&step(10, 1000, 0));
        let mut host = host_with_table(&entries, 1);

        let mut ctrl = SequencerController::new();
        ctrl.reset(&mut host);

        let mut values = Vec::new();
        let out = start_pattern(&mut ctrl, &mut host, 30, 0);
        values.extend(app_tokens(&out).iter().map(|(_, v, _)| *v));
        for now in [10, 20, 30] {
            let out = tick(&mut ctrl, &mut host, now);
            values.extend(app_tokens(&out).iter().map(|(_, v, _)| *v));
        }

        // the section body runs three times before the final step
        assert_eq!(vec![1, 1, 1, 0], values);
    }

    #[test]
    fn nested_pattern_runs_then_returns_to_parent() {
        let mut entries = Vec::new();
        entries.extend_from_slice(&header(40, 1));
        entries.extend_from_slice(&step(10, 1000, 5));
        entries.push(EntryPrefix::NestedPattern as u8 | 2);
        entries.extend_from_slice(&41u16.to_be_bytes());
        entries.extend_from_slice(&header(41, 0));
        entries.extend_from_slice(&step(10, 1001, 7));
        let mut host = host_with_table(&entries, 2);

        let mut ctrl = SequencerController::new();
        ctrl.reset(&mut host);

        let mut seen = Vec::new();
        let out = start_pattern(&mut ctrl, &mut host, 40, 0);
        seen.extend(app_tokens(&out));
        let mut now = 0;
        while ctrl.is_running(0) && now < 200 {
            now += 10;
            let out = tick(&mut ctrl, &mut host, now);
            seen.extend(app_tokens(&out));
        }

        // parent step, child step twice, then the teardown emissions
        assert!(!ctrl.is_running(0));
        assert_eq!((1000, 5, false), seen[0]);
        assert_eq!((1001, 7, false), seen[1]);
        assert_eq!((1001, 7, false), seen[2]);
        // default states carry the flag
        assert!(seen.iter().any(|(key, _, default)| *key == 1001 && *default));
        assert!(seen.iter().any(|(key, _, default)| *key == 1000 && *default));
    }

    #[test]
    fn nesting_stops_at_the_stack_limit() {
        // four patterns, each nesting the next forever
        let mut entries = Vec::new();
        for pattern in 50u16..54 {
            entries.extend_from_slice(&header(pattern, 0));
            entries.extend_from_slice(&step(10, 1000 + (pattern - 50), 1));
            if pattern < 53 {
                entries.push(EntryPrefix::NestedPattern as u8 | 1);
                entries.extend_from_slice(&(pattern + 1).to_be_bytes());
            }
        }
        let mut host = host_with_table(&entries, 4);

        let mut ctrl = SequencerController::new();
        ctrl.reset(&mut host);

        let mut seen = Vec::new();
        let out = start_pattern(&mut ctrl, &mut host, 50, 0);
        seen.extend(app_tokens(&out));
        for i in 1..20 {
            let out = tick(&mut ctrl, &mut host, i * 10);
            seen.extend(app_tokens(&out));
        }

        // the fourth level never fits on the stack
        assert!(seen.iter().any(|(key, _, _)| *key == 1002));
        assert!(!seen.iter().any(|(key, _, _)| *key == 1003));
    }

    #[test]
    fn missing_table_keeps_sequencers_stopped() {
        let mut host = MemHost::new(1024);
        let mut ctrl = SequencerController::new();
        ctrl.reset(&mut host);

        let out = start_pattern(&mut ctrl, &mut host, 30, 0);
        assert!(out.is_empty());
        assert!(!ctrl.is_running(0));
        assert_eq!(0, ctrl.num_patterns(&mut host));
    }
}
