//! Small helpers shared by the integration tests

use ecconet_common::{FrameId, FrameType, KeyPrefix, TokenKey};
use ecconet_node::Node;

use crate::sim_bus::{SimBus, SimHost};

/// The device GUID used by most tests
pub const TEST_GUID: [u32; 4] = [0xEE4C_AD97, 0x331C_E9EC, 0x9E95_7DBC, 0xA4A6_9FE5];

/// A simulated millisecond clock
#[derive(Debug, Default)]
pub struct TestClock(pub u32);

impl TestClock {
    pub fn now(&self) -> u32 {
        self.0
    }
}

/// Advance the clock one millisecond at a time, ticking every node and
/// delivering bus traffic after each round.
pub fn run_ms(
    clock: &mut TestClock,
    nodes: &mut [&mut Node<'_, SimHost>],
    bus: &SimBus<'_>,
    ms: u32,
) {
    for _ in 0..ms {
        clock.0 += 1;
        for node in nodes.iter_mut() {
            node.tick(clock.0);
        }
        bus.deliver(clock.0);
    }
}

/// Encode a single-frame token message from a peer, as it would appear
/// on the wire: event index, key, then big-endian value bytes.
pub fn single_frame_token(source: u8, event_index: u8, key: TokenKey, value: i32) -> (u32, Vec<u8>) {
    let id = FrameId {
        frame_index: 0,
        destination: 0,
        is_event: false,
        source,
        frame_type: FrameType::Single,
    }
    .encode();
    let mut data = vec![event_index, (key.raw() >> 8) as u8, key.raw() as u8];
    for shift in (0..key.value_size()).rev() {
        data.push((value >> (8 * shift)) as u8);
    }
    (id, data)
}

/// Decode the token key of a single-frame message, if the frame is one
pub fn frame_token_key(frame: &ecconet_common::CanFrame) -> Option<(FrameId, TokenKey, i32)> {
    let id = FrameId::decode(frame.id()).ok()?;
    let data = frame.data();
    if data.len() < 3 {
        return None;
    }
    let key = TokenKey::new(((data[1] as u16) << 8) | data[2] as u16);
    if key.prefix() == KeyPrefix::PatternSync as u8 {
        return None;
    }
    let mut value = 0i32;
    for byte in &data[3..] {
        value = (value << 8) | *byte as i32;
    }
    Some((id, key, value))
}
