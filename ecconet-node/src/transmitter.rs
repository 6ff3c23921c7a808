//! The message transmitter
//!
//! Outgoing messages accumulate in a small byte FIFO with a running CRC.
//! Buffering the compressed bytes rather than tokens or whole frames
//! allows the look-ahead that distinguishes a single-frame message from
//! the final frame of a multi-frame one. Completed frames queue in an
//! outbound ring handed to the CAN driver one frame per tick, with
//! back-pressure when the driver is busy.

use ecconet_common::{
    crc,
    frame::{FrameId, FrameType, FRAME_INDEX_MASK, MAX_FRAME_DATA},
    token::keys,
    EventIndex, Host, SendStatus, Token, TokenKey,
};

/// Look-ahead FIFO depth
const TX_FIFO_SIZE: usize = 16;

/// Outbound frame ring depth
const TX_STREAM_BUFFER_SIZE: usize = 40;

/// Longest string a message may carry, terminator included
const MAX_STRING_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
struct TxFrame {
    id: u32,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
}

impl TxFrame {
    const EMPTY: TxFrame = TxFrame {
        id: 0,
        len: 0,
        data: [0; MAX_FRAME_DATA],
    };
}

#[derive(Debug)]
pub(crate) struct Transmitter {
    fifo: [u8; TX_FIFO_SIZE],
    fifo_len: usize,
    crc: u16,
    bytes_sent: usize,
    /// 5-bit cyclic frame index, running across messages
    frame_index: u8,
    id: FrameId,
    ring: [TxFrame; TX_STREAM_BUFFER_SIZE],
    write_index: usize,
    read_index: usize,
}

impl Transmitter {
    pub fn new() -> Self {
        Transmitter {
            fifo: [0; TX_FIFO_SIZE],
            fifo_len: 0,
            crc: 0,
            bytes_sent: 0,
            frame_index: 0,
            id: FrameId {
                frame_index: 0,
                destination: 0,
                is_event: false,
                source: 0,
                frame_type: FrameType::Body,
            },
            ring: [TxFrame::EMPTY; TX_STREAM_BUFFER_SIZE],
            write_index: 0,
            read_index: 0,
        }
    }

    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.write_index = 0;
        self.read_index = 0;
    }

    /// Start a plain message
    pub fn start_message(&mut self, source: u8, destination: u8, event_index: &mut EventIndex) {
        self.start_message_with_key(source, destination, keys::NULL, event_index);
    }

    /// Start a message whose leading key determines its event stamping.
    ///
    /// Address negotiation messages carry event index zero so they take
    /// no part in event ordering. Input and output status messages set
    /// the event flag in the frame identifier.
    pub fn start_message_with_key(
        &mut self,
        source: u8,
        destination: u8,
        key: TokenKey,
        event_index: &mut EventIndex,
    ) {
        self.fifo_len = 0;
        self.crc = 0;
        self.bytes_sent = 0;
        self.id = FrameId {
            frame_index: 0,
            destination,
            is_event: false,
            source,
            frame_type: FrameType::Body,
        };

        if key == keys::REQUEST_ADDRESS || key == keys::RESPONSE_ADDRESS_IN_USE {
            self.add_byte(0);
        } else if key.is_input_status() || key.is_output_status() {
            self.id.is_event = true;
            self.add_byte(event_index.current());
        } else {
            self.add_byte(event_index.current());
        }
    }

    /// Add a byte, accumulating the CRC; a full FIFO emits a frame
    pub fn add_byte(&mut self, byte: u8) {
        crc::add_byte(&mut self.crc, byte);
        self.fifo[self.fifo_len] = byte;
        self.fifo_len += 1;
        if self.fifo_len >= TX_FIFO_SIZE {
            self.emit_frame();
        }
    }

    /// Add a 16-bit value, MSB first
    pub fn add_u16(&mut self, value: u16) {
        self.add_byte((value >> 8) as u8);
        self.add_byte(value as u8);
    }

    /// Add a 32-bit value, MSB first
    pub fn add_u32(&mut self, value: u32) {
        self.add_byte((value >> 24) as u8);
        self.add_byte((value >> 16) as u8);
        self.add_byte((value >> 8) as u8);
        self.add_byte(value as u8);
    }

    /// Add a token as key plus value bytes.
    ///
    /// Pattern sync keys always carry a single value byte, whatever the
    /// region map says.
    pub fn add_token(&mut self, token: &Token) {
        self.add_u16(token.key.raw());
        let value_size = if token.key.prefix() == ecconet_common::KeyPrefix::PatternSync as u8 {
            1
        } else {
            token.key.value_size()
        };
        for shift in (0..value_size).rev() {
            self.add_byte((token.value >> (8 * shift)) as u8);
        }
    }

    /// Add a string and its NUL terminator
    pub fn add_str(&mut self, s: &str) {
        for byte in s.bytes().take(MAX_STRING_LEN - 1) {
            self.add_byte(byte);
        }
        self.add_byte(0);
    }

    /// Close the message and queue its remaining frames.
    ///
    /// A message that fits one frame goes out as SINGLE with no checksum;
    /// anything longer gets the CRC appended and its final frame marked
    /// LAST.
    pub fn finish_message(&mut self) {
        let single_frame = self.bytes_sent + self.fifo_len <= MAX_FRAME_DATA;

        if !single_frame {
            // capture first: add_byte keeps accumulating
            let crc = self.crc;
            self.add_byte((crc >> 8) as u8);
            self.add_byte(crc as u8);
        }

        while self.fifo_len != 0 {
            if self.fifo_len <= MAX_FRAME_DATA {
                self.id.frame_type = if single_frame {
                    FrameType::Single
                } else {
                    FrameType::Last
                };
            }
            self.emit_frame();
        }
    }

    /// Hand the oldest queued frame to the driver.
    ///
    /// A busy driver leaves the frame in place for the next tick.
    pub fn pump<H: Host>(&mut self, host: &mut H) {
        if self.read_index == self.write_index {
            return;
        }
        let frame = &self.ring[self.read_index % TX_STREAM_BUFFER_SIZE];
        if host.send_can(frame.id, &frame.data[..frame.len as usize]) == SendStatus::Accepted {
            self.read_index = (self.read_index + 1) % TX_STREAM_BUFFER_SIZE;
        }
    }

    /// Take up to eight FIFO bytes and queue them as the next frame.
    ///
    /// The ring deliberately lets the writer overtake the reader under
    /// sustained congestion; the newest frames win.
    fn emit_frame(&mut self) {
        let data_size = self.fifo_len.min(MAX_FRAME_DATA);
        if data_size == 0 {
            return;
        }

        self.id.frame_index = self.frame_index;
        let mut frame = TxFrame {
            id: self.id.encode(),
            len: data_size as u8,
            data: [0; MAX_FRAME_DATA],
        };
        frame.data[..data_size].copy_from_slice(&self.fifo[..data_size]);
        self.ring[self.write_index % TX_STREAM_BUFFER_SIZE] = frame;
        self.write_index = (self.write_index + 1) % TX_STREAM_BUFFER_SIZE;

        self.bytes_sent += data_size;
        self.frame_index = (self.frame_index + 1) & FRAME_INDEX_MASK;

        self.fifo_len -= data_size;
        if self.fifo_len != 0 {
            self.fifo.copy_within(data_size..data_size + self.fifo_len, 0);
        }
    }
}
