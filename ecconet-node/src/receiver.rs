//! The receive stream buffer
//!
//! Frames drained from the mailbox land at the tail of a larger stream
//! buffer, where they are sorted per sender into frame-index order and
//! assembled into messages. Slot zero holds the oldest frame; free slots
//! accumulate at the front as messages are consumed or evicted.

use ecconet_common::{crc, frame::FRAME_INDEX_MASK, frame::MAX_FRAME_DATA};

use crate::rx_mbox::{FrameFlag, RxFrame, RxMbox, RX_BACK_BUFFER_SIZE};
use crate::time::timer_expired;

/// Frames the stream buffer holds
pub(crate) const FRONT_BUFFER_SIZE: usize = 72;

/// Largest reassembled message, checksum included
pub(crate) const MAX_MESSAGE_LEN: usize = FRONT_BUFFER_SIZE * MAX_FRAME_DATA;

/// How far back the sorter searches for a frame's place within one
/// sender's run
const SORT_WINDOW: i32 = 15;

/// The shelf life of an unconsumed frame
const FRAME_TIMEOUT_MS: u32 = 750;

/// The sender filter releases itself after this long
const SENDER_FILTER_TIMEOUT_MS: u32 = 1000;

/// A complete message lifted out of the stream buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RxMessage {
    pub sender: u8,
    pub is_event: bool,
    /// Message bytes in the caller's buffer, checksum stripped
    pub len: usize,
}

#[derive(Debug)]
pub(crate) struct Receiver {
    stream: [RxFrame; FRONT_BUFFER_SIZE],
    filter_deadline: u32,
}

impl Receiver {
    pub fn new() -> Self {
        Receiver {
            stream: [RxFrame::EMPTY; FRONT_BUFFER_SIZE],
            filter_deadline: 0,
        }
    }

    pub fn reset(&mut self, mbox: &RxMbox, now: u32) {
        self.stream = [RxFrame::EMPTY; FRONT_BUFFER_SIZE];
        mbox.set_sender_filter(0);
        self.filter_deadline = now.wrapping_add(SENDER_FILTER_TIMEOUT_MS);
    }

    /// Point the sender filter at one peer, or 0 to accept everyone.
    ///
    /// The filter re-arms its own release timer; an abandoned transfer
    /// cannot wedge the receiver.
    pub fn set_sender_filter(&mut self, mbox: &RxMbox, address: u8, now: u32) {
        mbox.set_sender_filter(address);
        self.filter_deadline = now.wrapping_add(SENDER_FILTER_TIMEOUT_MS);
    }

    /// Run per-tick housekeeping: filter release, mailbox drain, shelf
    /// life eviction, and the per-sender sort.
    pub fn run(&mut self, mbox: &RxMbox, now: u32) {
        if timer_expired(now, self.filter_deadline) {
            self.filter_deadline = now.wrapping_add(SENDER_FILTER_TIMEOUT_MS);
            mbox.set_sender_filter(0);
        }

        let mut drained = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        let num_new = mbox.drain(&mut drained);
        if num_new == 0 {
            return;
        }

        // make room at the tail, discarding the oldest frames
        self.stream.copy_within(num_new.., 0);
        self.stream[FRONT_BUFFER_SIZE - num_new..].copy_from_slice(&drained[..num_new]);

        self.evict_stale_frames(now);
        self.sort_new_frames(num_new);
    }

    /// Lift the oldest complete message into `out`.
    ///
    /// Consumed frames are freed whether or not the message survives its
    /// checksum; a corrupt message is dropped silently and the scan
    /// continues. Returns `None` once only free slots and incomplete
    /// messages remain.
    pub fn next_message(&mut self, out: &mut [u8; MAX_MESSAGE_LEN]) -> Option<RxMessage> {
        loop {
            let (start, end, num_frames, mut num_bytes) = self.find_complete_message()?;

            let sender = self.stream[start].sender;
            let is_event = self.stream[start].is_event;

            // concatenate the frame payloads; only the final frame of a
            // message may be short
            for (n, frame) in self.stream[start..end].iter().enumerate() {
                out[n * MAX_FRAME_DATA..(n + 1) * MAX_FRAME_DATA].copy_from_slice(&frame.data);
            }

            // free the consumed frames, preserving the rest of the stream
            self.stream.copy_within(..start, num_frames);
            for slot in &mut self.stream[..num_frames] {
                *slot = RxFrame::EMPTY;
            }

            // single-frame messages carry no checksum
            if num_frames > 1 {
                if !crc::is_message_checksum_valid(&out[..num_bytes]) {
                    continue;
                }
                num_bytes -= crc::CRC_SIZE;
            }

            return Some(RxMessage {
                sender,
                is_event,
                len: num_bytes,
            });
        }
    }

    /// Find the oldest complete message: `(start, end, frames, bytes)`.
    fn find_complete_message(&self) -> Option<(usize, usize, usize, usize)> {
        let mut i = 0;
        while i < FRONT_BUFFER_SIZE {
            if self.stream[i].flag == FrameFlag::None {
                i += 1;
                continue;
            }

            let sender = self.stream[i].sender;
            let mut frame_index = self.stream[i].frame_index;
            let mut num_frames = 0usize;
            let mut num_bytes = 0usize;
            let mut complete = false;
            let mut j = i;
            while j < FRONT_BUFFER_SIZE {
                let frame = &self.stream[j];
                if frame.frame_index != frame_index || frame.sender != sender {
                    break;
                }
                if frame.flag == FrameFlag::Single {
                    num_frames = 1;
                    num_bytes = frame.data_size as usize;
                    j += 1;
                    complete = true;
                    break;
                }
                num_frames += 1;
                num_bytes += frame.data_size as usize;
                if frame.flag == FrameFlag::Last {
                    j += 1;
                    // a LAST with no preceding frames is an orphan
                    complete = num_frames > 1;
                    break;
                }
                j += 1;
                frame_index = (frame_index + 1) & FRAME_INDEX_MASK;
            }

            if complete {
                return Some((i, j, num_frames, num_bytes));
            }
            i = j.max(i + 1);
        }
        None
    }

    /// Drop frames that have sat unconsumed past their shelf life.
    fn evict_stale_frames(&mut self, now: u32) {
        let mut i = FRONT_BUFFER_SIZE;
        while i > 0 {
            i -= 1;
            let frame = &self.stream[i];
            if frame.flag != FrameFlag::None
                && (now.wrapping_sub(frame.timestamp) & 0x0FFF) > FRAME_TIMEOUT_MS
            {
                self.stream.copy_within(..i, 1);
                self.stream[0] = RxFrame::EMPTY;
            }
        }
    }

    /// Sort the newly arrived tail frames into place.
    ///
    /// Each new frame is moved next to the youngest older frame from the
    /// same sender, where order on the 5-bit frame index is the mod-32
    /// half-space comparison. A frame matching an existing index is a
    /// retransmission and replaces the original.
    fn sort_new_frames(&mut self, num_new: usize) {
        let mut new_idx = FRONT_BUFFER_SIZE - num_new;
        while new_idx < FRONT_BUFFER_SIZE {
            let sender = self.stream[new_idx].sender;
            let new_frame_index = self.stream[new_idx].frame_index;

            let mut cmp = new_idx as i32;
            loop {
                cmp -= 1;
                if cmp < 0 || self.stream[cmp as usize].flag == FrameFlag::None {
                    break;
                }
                if self.stream[cmp as usize].sender != sender {
                    continue;
                }

                // found the sender's run; search back for this frame's place
                let mut window = SORT_WINDOW;
                let mut match_found = false;
                cmp += 1;
                loop {
                    cmp -= 1;
                    if cmp < 0 {
                        break;
                    }
                    let frame = &self.stream[cmp as usize];
                    if frame.flag == FrameFlag::None || frame.sender != sender {
                        break;
                    }
                    window -= 1;
                    if window < 0 {
                        break;
                    }
                    if frame.frame_index == new_frame_index {
                        match_found = true;
                        break;
                    }
                    // stop at the youngest frame older than the new one
                    if (new_frame_index.wrapping_sub(frame.frame_index) & FRAME_INDEX_MASK) < 16 {
                        break;
                    }
                }

                if match_found {
                    // retransmission: replace the original and close the
                    // tail hole
                    self.stream[cmp as usize] = self.stream[new_idx];
                    self.stream.copy_within(..new_idx, 1);
                    self.stream[0] = RxFrame::EMPTY;
                } else {
                    // insert just after the older frame the search stopped on
                    let dest = (cmp + 1) as usize;
                    if dest < new_idx {
                        let frame = self.stream[new_idx];
                        self.stream.copy_within(dest..new_idx, dest + 1);
                        self.stream[dest] = frame;
                    }
                }
                break;
            }

            new_idx += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn frames(&self) -> &[RxFrame] {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecconet_common::{FrameId, FrameType};

    fn ingest(mbox: &RxMbox, source: u8, index: u8, frame_type: FrameType, data: &[u8], now: u32) {
        let id = FrameId {
            frame_index: index,
            destination: 0,
            is_event: false,
            source,
            frame_type,
        }
        .encode();
        mbox.receive_can_frame(id, data, now);
    }

    fn used_frames(receiver: &Receiver) -> Vec<(u8, u8)> {
        receiver
            .frames()
            .iter()
            .filter(|f| f.flag != FrameFlag::None)
            .map(|f| (f.sender, f.frame_index))
            .collect()
    }

    #[test]
    fn single_frame_message_round_trip() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        ingest(&mbox, 4, 0, FrameType::Single, &[1, 0x0B, 0xB8, 60], 0);
        receiver.run(&mbox, 0);

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let msg = receiver.next_message(&mut buf).unwrap();
        assert_eq!(4, msg.sender);
        assert_eq!(4, msg.len);
        assert_eq!([1, 0x0B, 0xB8, 60], buf[..4]);
        assert!(receiver.next_message(&mut buf).is_none());
    }

    #[test]
    fn multi_frame_reassembly_with_checksum() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        // 12 payload bytes followed by the message CRC
        let payload: Vec<u8> = (1..=12).collect();
        let crc = crc::crc16(&payload);
        let mut wire = payload.clone();
        wire.push((crc >> 8) as u8);
        wire.push(crc as u8);

        ingest(&mbox, 9, 0, FrameType::Body, &wire[0..8], 0);
        ingest(&mbox, 9, 1, FrameType::Last, &wire[8..14], 0);
        receiver.run(&mbox, 0);

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let msg = receiver.next_message(&mut buf).unwrap();
        assert_eq!(9, msg.sender);
        assert_eq!(12, msg.len);
        assert_eq!(payload[..], buf[..12]);
    }

    #[test]
    fn corrupt_message_is_dropped_silently() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        let mut wire: Vec<u8> = (1..=12).collect();
        let crc = crc::crc16(&wire);
        wire.push((crc >> 8) as u8);
        wire.push((crc as u8) ^ 0x01);

        ingest(&mbox, 9, 0, FrameType::Body, &wire[0..8], 0);
        ingest(&mbox, 9, 1, FrameType::Last, &wire[8..14], 0);
        receiver.run(&mbox, 0);

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        assert!(receiver.next_message(&mut buf).is_none());
        // the frames were consumed, not left to rot
        assert!(used_frames(&receiver).is_empty());
    }

    #[test]
    fn interleaved_senders_sort_into_runs() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        ingest(&mbox, 2, 0, FrameType::Body, &[0; 8], 0);
        ingest(&mbox, 7, 0, FrameType::Body, &[0; 8], 0);
        ingest(&mbox, 2, 1, FrameType::Body, &[0; 8], 0);
        ingest(&mbox, 7, 1, FrameType::Body, &[0; 8], 0);
        ingest(&mbox, 2, 2, FrameType::Body, &[0; 8], 0);
        receiver.run(&mbox, 0);

        let frames = used_frames(&receiver);
        // each sender's frames are contiguous and ascending
        for sender in [2u8, 7] {
            let indices: Vec<u8> = frames
                .iter()
                .filter(|(s, _)| *s == sender)
                .map(|(_, i)| *i)
                .collect();
            let run: Vec<usize> = frames
                .iter()
                .enumerate()
                .filter(|(_, (s, _))| *s == sender)
                .map(|(n, _)| n)
                .collect();
            assert!(run.windows(2).all(|w| w[1] == w[0] + 1), "sender {sender} not contiguous");
            assert!(indices.windows(2).all(|w| w[1] == w[0] + 1), "sender {sender} out of order");
        }
    }

    #[test]
    fn out_of_order_frames_are_reordered() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        let payload: Vec<u8> = (0..14).collect();
        let crc = crc::crc16(&payload);
        let mut wire = payload.clone();
        wire.push((crc >> 8) as u8);
        wire.push(crc as u8);

        // second frame arrives before the first
        ingest(&mbox, 3, 1, FrameType::Last, &wire[8..16], 0);
        ingest(&mbox, 3, 0, FrameType::Body, &wire[0..8], 0);
        receiver.run(&mbox, 0);

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let msg = receiver.next_message(&mut buf).unwrap();
        assert_eq!(14, msg.len);
        assert_eq!(payload[..], buf[..14]);
    }

    #[test]
    fn retransmitted_frame_replaces_original() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        let payload: Vec<u8> = (10..22).collect();
        let crc = crc::crc16(&payload);
        let mut wire = payload.clone();
        wire.push((crc >> 8) as u8);
        wire.push(crc as u8);

        // first copy of frame 0 is garbled, the retransmission is good
        ingest(&mbox, 3, 0, FrameType::Body, &[0xEE; 8], 0);
        ingest(&mbox, 3, 0, FrameType::Body, &wire[0..8], 0);
        ingest(&mbox, 3, 1, FrameType::Last, &wire[8..14], 0);
        receiver.run(&mbox, 0);

        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let msg = receiver.next_message(&mut buf).unwrap();
        assert_eq!(12, msg.len);
        assert_eq!(payload[..], buf[..12]);
    }

    #[test]
    fn frame_index_order_tolerates_wrap() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        // indices 30, 31, 0, 1 arrive shuffled
        for index in [0u8, 30, 1, 31] {
            ingest(&mbox, 6, index, FrameType::Body, &[index; 8], 0);
        }
        receiver.run(&mbox, 0);

        let frames = used_frames(&receiver);
        let indices: Vec<u8> = frames.iter().map(|(_, i)| *i).collect();
        assert_eq!(vec![30, 31, 0, 1], indices);
    }

    #[test]
    fn stale_frames_are_evicted() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        // a lone BODY frame never completes a message
        ingest(&mbox, 3, 0, FrameType::Body, &[0; 8], 0);
        receiver.run(&mbox, 0);
        assert_eq!(1, used_frames(&receiver).len());

        receiver.run(&mbox, 500);
        assert_eq!(1, used_frames(&receiver).len());

        // ticks with no new frames do not evict; the next arrival does
        ingest(&mbox, 4, 0, FrameType::Single, &[1, 2, 3], 800);
        receiver.run(&mbox, 800);
        assert_eq!(1, used_frames(&receiver).len());
        assert_eq!(4, used_frames(&receiver)[0].0);
    }

    #[test]
    fn sender_filter_auto_releases() {
        let mbox = RxMbox::new();
        let mut receiver = Receiver::new();
        receiver.reset(&mbox, 0);

        receiver.set_sender_filter(&mbox, 5, 0);
        assert_eq!(5, mbox.sender_filter());
        receiver.run(&mbox, 500);
        assert_eq!(5, mbox.sender_filter());
        receiver.run(&mbox, 1001);
        assert_eq!(0, mbox.sender_filter());
    }
}
