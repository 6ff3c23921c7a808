//! CAN bus and intra-node network addresses
//!
//! Bus addresses occupy 0..=127: 0 is broadcast, 1..=120 are self-assigned
//! or static device addresses, and 121..=127 are reserved. Addresses
//! 128..=255 never appear on the wire; they reach components inside the
//! node, such as the rule engine and the token sequencers.

/// The broadcast address
pub const BROADCAST: u8 = 0;
/// Lowest self-assignable device address
pub const MIN_STANDARD: u8 = 1;
/// Highest self-assignable device address
pub const MAX_STANDARD: u8 = 120;
/// Start of the reserved bus address range
pub const MIN_RESERVED: u8 = 121;
/// End of the reserved bus address range
pub const MAX_RESERVED: u8 = 127;

/// Reserved: the vehicle bus gateway
pub const VEHICLE_BUS: u8 = 121;
/// Reserved: a PC USB-CAN adapter
pub const PC_HOST: u8 = 126;

/// Internal: the rule engine
pub const RULE_ENGINE: u8 = 132;
/// Internal: the first token sequencer; sequencers are 133..=138
pub const SEQUENCER_0: u8 = 133;
/// Internal: the last token sequencer
pub const SEQUENCER_5: u8 = 138;

/// Whether the address is a bus address (0..=127)
pub fn is_can_bus(address: u8) -> bool {
    address < 128
}

/// Whether the address reaches an intra-node component (128..=255)
pub fn is_internal(address: u8) -> bool {
    address >= 128
}

/// Whether the address reaches one of the token sequencers
pub fn is_sequencer(address: u8) -> bool {
    (SEQUENCER_0..=SEQUENCER_5).contains(&address)
}

/// Whether the address is a valid assigned device address
pub fn is_standard(address: u8) -> bool {
    (MIN_STANDARD..=MAX_STANDARD).contains(&address)
}
