//! The self-assigning CAN address allocator
//!
//! A device either carries a static address programmed into `address.can`
//! or derives proposals from its GUID and claims the first one nobody
//! defends. A claimed address is defended for as long as the node runs;
//! hearing our own address from another sender throws a non-static node
//! back into self-assignment.

use defmt_or_log::{debug, info};
use ecconet_common::{
    addresses,
    files::{AddressFile, ADDRESS_FILE},
    token::keys,
    Host, Token,
};

use crate::node::Services;
use crate::storage;
use crate::time::timer_expired;

/// How long a proposal waits for a defense before it is adopted
const CLAIM_TIME_MS: u32 = 100;

/// Seed for proposal derivation, rotated through the 7-bit address space
const ADDRESS_XOR_VALUE: u32 = 0x64;

const ADDRESS_BITS: u32 = 7;
const ADDRESS_MASK: u32 = 0x7F;

#[derive(Debug)]
pub(crate) struct CanAddress {
    file: AddressFile,
    address_offset: u8,
    xor_index: u8,
    proposed: u8,
    claim_deadline: u32,
}

impl CanAddress {
    pub fn new() -> Self {
        CanAddress {
            file: AddressFile::default(),
            address_offset: 0,
            xor_index: 0,
            proposed: 0,
            claim_deadline: 0,
        }
    }

    /// The working address, 0 while unassigned
    pub fn current(&self) -> u8 {
        self.file.address
    }

    /// Whether the address may be used on the bus
    ///
    /// Static addresses are taken on faith; self-assigned ones must be in
    /// the standard range.
    pub fn is_valid(&self) -> bool {
        addresses::is_standard(self.file.address) || self.file.is_static
    }

    /// Whether the address was programmed rather than self-assigned
    pub fn is_static(&self) -> bool {
        self.file.is_static
    }

    /// Load the persisted address and restart self-assignment.
    ///
    /// A static address is announced immediately so peers drop any
    /// conflicting claim.
    pub fn reset<H: Host>(&mut self, services: &mut Services<'_, H>) {
        let mut record = [0u8; AddressFile::SIZE];
        self.file = match storage::read_file(services.host, 0, ADDRESS_FILE, &mut record) {
            Ok(_) => AddressFile::from_bytes(record),
            Err(_) => AddressFile::default(),
        };

        self.address_offset = 0;
        self.xor_index = 0;
        self.proposed = 0;
        services.mbox.set_working_address(self.file.address);
        services.refresh_address(self.file.address, self.is_valid());

        if self.file.is_static {
            info!("announcing static address {}", self.file.address);
            services.send_token(&Token::new(
                addresses::BROADCAST,
                keys::RESPONSE_ADDRESS_IN_USE,
                self.file.address as i32,
            ));
        }
    }

    /// Run the self-assignment protocol.
    pub fn clock<H: Host>(&mut self, services: &mut Services<'_, H>) {
        if self.is_valid() {
            return;
        }

        if self.proposed == 0 {
            // propose the next candidate and claim it shortly
            self.proposed = self.next_proposed_address(services.host.guid());
            debug!("proposing address {}", self.proposed);
            services.send_token(&Token::new(
                addresses::BROADCAST,
                keys::REQUEST_ADDRESS,
                self.proposed as i32,
            ));
            self.claim_deadline = services.now.wrapping_add(CLAIM_TIME_MS);
        } else if timer_expired(services.now, self.claim_deadline) {
            // nobody defended the proposal; adopt it
            self.file.address = self.proposed;
            self.proposed = 0;
            services.mbox.set_working_address(self.file.address);
            services.refresh_address(self.file.address, self.is_valid());
            info!("adopted address {}", self.file.address);

            services.send_token(&Token::new(
                addresses::BROADCAST,
                keys::RESPONSE_ADDRESS_IN_USE,
                self.file.address as i32,
            ));

            // first status update follows well after enumeration settles
            *services.next_status_time = services.now.wrapping_add(1200);
        }
    }

    /// Watch bus traffic for collisions and rival claims.
    pub fn token_in<H: Host>(&mut self, token: &Token, services: &mut Services<'_, H>) {
        let defended_collision = token.key == keys::RESPONSE_ADDRESS_IN_USE
            && token.value == self.proposed as i32;
        let sender_collision = self.file.address != 0
            && self.file.address == token.address
            && !self.file.is_static;

        if defended_collision || sender_collision {
            // start over with the next candidate
            debug!("address collision, restarting self-assignment");
            self.file.address = 0;
            self.proposed = 0;
            services.mbox.set_working_address(0);
            services.refresh_address(0, self.is_valid());
        } else if token.key == keys::REQUEST_ADDRESS && token.value == self.file.address as i32 {
            // defend our address against the rival proposal
            services.send_token(&Token::new(
                addresses::BROADCAST,
                keys::RESPONSE_ADDRESS_IN_USE,
                self.file.address as i32,
            ));
        }
    }

    /// Derive the next candidate address from the GUID.
    ///
    /// Each attempt XORs every GUID byte with a 7-bit rotation of the
    /// seed and sums them; candidates outside 1..=120 advance the
    /// rotation (and eventually an additive offset) and retry.
    fn next_proposed_address(&mut self, guid: [u32; 4]) -> u8 {
        loop {
            let xor_value = ((ADDRESS_XOR_VALUE >> self.xor_index)
                | (ADDRESS_XOR_VALUE << (ADDRESS_BITS - self.xor_index as u32)))
                & ADDRESS_MASK;

            let mut address: u32 = 0;
            for word in guid {
                for byte in word.to_le_bytes() {
                    address = address.wrapping_add(byte as u32 ^ xor_value);
                }
            }
            address = address.wrapping_add(self.address_offset as u32) & ADDRESS_MASK;

            self.xor_index += 1;
            if self.xor_index as u32 >= ADDRESS_BITS {
                self.xor_index = 0;
                self.address_offset = (self.address_offset + 1) & ADDRESS_MASK as u8;
            }

            if (1..=addresses::MAX_STANDARD as u32).contains(&address) {
                return address as u8;
            }
        }
    }
}
