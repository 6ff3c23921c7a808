//! The receive mailbox shared with the CAN interrupt
//!
//! Incoming CAN frames arrive asynchronously via the driver callback,
//! which stores them in a small ring here. The node drains the ring into
//! its stream buffer on each tick. Only the callback advances the write
//! index and only the drain advances the read index; the slots themselves
//! are guarded by a critical section so the pair is safe on single-core
//! targets and std hosts alike.

use core::cell::RefCell;
use core::sync::atomic::Ordering;

use critical_section::Mutex;
use ecconet_common::{addresses, frame::MAX_FRAME_DATA, AtomicCell, FrameId, FrameType};
use portable_atomic::AtomicU8;

/// Frames the interrupt can buffer between two ticks
pub(crate) const RX_BACK_BUFFER_SIZE: usize = 20;

/// The position of a buffered frame within its message.
///
/// A slot holding `None` is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FrameFlag {
    /// The slot is free
    #[default]
    None,
    /// A complete single-frame message
    Single,
    /// A frame in the body of a multi-frame message
    Body,
    /// The final frame of a multi-frame message
    Last,
}

/// A received CAN frame with its decoded identifier fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RxFrame {
    pub sender: u8,
    pub frame_index: u8,
    pub flag: FrameFlag,
    pub is_event: bool,
    pub data_size: u8,
    pub timestamp: u32,
    pub data: [u8; MAX_FRAME_DATA],
}

impl RxFrame {
    pub const EMPTY: RxFrame = RxFrame {
        sender: 0,
        frame_index: 0,
        flag: FrameFlag::None,
        is_event: false,
        data_size: 0,
        timestamp: 0,
        data: [0; MAX_FRAME_DATA],
    };
}

/// The data structure shared between the CAN receive interrupt and the
/// [`Node`](crate::Node).
///
/// Pass received frames to [`RxMbox::receive_can_frame`], from interrupt
/// context or anywhere else. Frames are filtered on ingestion: foreign
/// frame types, traffic for other destinations, and multi-frame traffic
/// blocked by an active sender filter never occupy a slot.
#[derive(Debug)]
pub struct RxMbox {
    slots: Mutex<RefCell<[RxFrame; RX_BACK_BUFFER_SIZE]>>,
    write_index: AtomicU8,
    read_index: AtomicU8,
    /// Our working CAN address, mirrored here for the destination filter
    working_address: AtomicCell<u8>,
    /// Nonzero to accept multi-frame traffic from one sender only
    sender_filter: AtomicCell<u8>,
}

impl RxMbox {
    /// Create a new mailbox
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new([RxFrame::EMPTY; RX_BACK_BUFFER_SIZE])),
            write_index: AtomicU8::new(0),
            read_index: AtomicU8::new(0),
            working_address: AtomicCell::new(0),
            sender_filter: AtomicCell::new(0),
        }
    }

    /// Store a received CAN frame.
    ///
    /// Safe to call from the CAN receive interrupt. `now_ms` stamps the
    /// frame for the receiver's shelf-life eviction.
    pub fn receive_can_frame(&self, id: u32, data: &[u8], now_ms: u32) {
        // frames that are not ECCONet messages are dropped
        let Ok(fid) = FrameId::decode(id) else {
            return;
        };

        // while a transfer holds the sender filter, multi-frame traffic
        // from anyone else is dropped
        let filter = self.sender_filter.load();
        if fid.frame_type != FrameType::Single && filter != 0 && filter != fid.source {
            return;
        }

        // not broadcast and not for this device
        let working = self.working_address.load();
        if fid.destination != addresses::BROADCAST && fid.destination != working {
            return;
        }

        let mut frame = RxFrame {
            sender: fid.source,
            frame_index: fid.frame_index,
            flag: match fid.frame_type {
                FrameType::Single => FrameFlag::Single,
                FrameType::Body => FrameFlag::Body,
                FrameType::Last => FrameFlag::Last,
            },
            is_event: fid.is_event,
            data_size: data.len().min(MAX_FRAME_DATA) as u8,
            timestamp: now_ms,
            data: [0; MAX_FRAME_DATA],
        };
        frame.data[..frame.data_size as usize].copy_from_slice(&data[..frame.data_size as usize]);

        // the vehicle bus gateway maintains no event index; its traffic
        // is always treated as events
        if fid.frame_type == FrameType::Single && fid.source == addresses::VEHICLE_BUS {
            frame.is_event = true;
        }

        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let write = self.write_index.load(Ordering::Relaxed) as usize % RX_BACK_BUFFER_SIZE;
            slots[write] = frame;
            self.write_index
                .store(((write + 1) % RX_BACK_BUFFER_SIZE) as u8, Ordering::Relaxed);
        });
    }

    /// Move buffered frames into `out`, oldest first, and free their slots
    pub(crate) fn drain(&self, out: &mut [RxFrame; RX_BACK_BUFFER_SIZE]) -> usize {
        critical_section::with(|cs| {
            let slots = self.slots.borrow_ref(cs);
            let write = self.write_index.load(Ordering::Relaxed) as usize % RX_BACK_BUFFER_SIZE;
            let mut read = self.read_index.load(Ordering::Relaxed) as usize % RX_BACK_BUFFER_SIZE;
            let num_new = (write + RX_BACK_BUFFER_SIZE - read) % RX_BACK_BUFFER_SIZE;
            for slot in out.iter_mut().take(num_new) {
                *slot = slots[read];
                read = (read + 1) % RX_BACK_BUFFER_SIZE;
            }
            self.read_index.store(read as u8, Ordering::Relaxed);
            num_new
        })
    }

    pub(crate) fn set_working_address(&self, address: u8) {
        self.working_address.store(address);
    }

    pub(crate) fn set_sender_filter(&self, address: u8) {
        self.sender_filter.store(address);
    }

    pub(crate) fn sender_filter(&self) -> u8 {
        self.sender_filter.load()
    }
}

impl Default for RxMbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_id(source: u8, destination: u8, frame_type: FrameType, index: u8) -> u32 {
        FrameId {
            frame_index: index,
            destination,
            is_event: false,
            source,
            frame_type,
        }
        .encode()
    }

    #[test]
    fn stores_and_drains_in_order() {
        let mbox = RxMbox::new();
        for i in 0..3 {
            mbox.receive_can_frame(frame_id(5, 0, FrameType::Single, i), &[i, 2, 3], 10);
        }
        let mut out = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        assert_eq!(3, mbox.drain(&mut out));
        for i in 0..3u8 {
            assert_eq!(i, out[i as usize].frame_index);
            assert_eq!(5, out[i as usize].sender);
            assert_eq!(FrameFlag::Single, out[i as usize].flag);
            assert_eq!(3, out[i as usize].data_size);
        }
        assert_eq!(0, mbox.drain(&mut out));
    }

    #[test]
    fn foreign_frame_types_are_dropped() {
        let mbox = RxMbox::new();
        mbox.receive_can_frame(0x0B << 24, &[1], 0);
        let mut out = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        assert_eq!(0, mbox.drain(&mut out));
    }

    #[test]
    fn destination_filter() {
        let mbox = RxMbox::new();
        mbox.set_working_address(7);
        mbox.receive_can_frame(frame_id(5, 9, FrameType::Single, 0), &[1], 0);
        mbox.receive_can_frame(frame_id(5, 7, FrameType::Single, 0), &[1], 0);
        mbox.receive_can_frame(frame_id(5, 0, FrameType::Single, 0), &[1], 0);
        let mut out = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        assert_eq!(2, mbox.drain(&mut out));
    }

    #[test]
    fn sender_filter_blocks_multi_frame_only() {
        let mbox = RxMbox::new();
        mbox.set_sender_filter(3);
        mbox.receive_can_frame(frame_id(9, 0, FrameType::Body, 0), &[1], 0);
        mbox.receive_can_frame(frame_id(9, 0, FrameType::Single, 0), &[1], 0);
        mbox.receive_can_frame(frame_id(3, 0, FrameType::Body, 0), &[1], 0);
        let mut out = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        assert_eq!(2, mbox.drain(&mut out));
        assert_eq!(FrameFlag::Single, out[0].flag);
        assert_eq!(9, out[0].sender);
        assert_eq!(3, out[1].sender);
    }

    #[test]
    fn vehicle_bus_singles_become_events() {
        let mbox = RxMbox::new();
        mbox.receive_can_frame(frame_id(addresses::VEHICLE_BUS, 0, FrameType::Single, 0), &[1], 0);
        let mut out = [RxFrame::EMPTY; RX_BACK_BUFFER_SIZE];
        assert_eq!(1, mbox.drain(&mut out));
        assert!(out[0].is_event);
    }
}
