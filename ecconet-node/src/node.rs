//! The node core: tick scheduling, message routing, and status broadcast

use defmt_or_log::debug;
use ecconet_common::{
    addresses, codec,
    token::keys,
    EventIndex, Host, KeyPrefix, Token, TokenKey,
};

use crate::address::CanAddress;
use crate::ftp_client::{FtpClient, TransferInfo};
use crate::ftp_server::FtpServer;
use crate::receiver::{Receiver, MAX_MESSAGE_LEN};
use crate::rx_mbox::RxMbox;
use crate::sequencer::{Emission, Emissions, SequencerController};
use crate::time::timer_expired;
use crate::token_table::TokenTable;
use crate::transmitter::Transmitter;

pub use crate::ftp_client::StartError as StartTransferError;

/// Base status broadcast period; each node offsets it by its address so
/// simultaneous boots spread deterministically across the bus
const STATUS_PERIOD_BASE_MS: u32 = 1000 - 60;

/// Delay before the first status broadcast after reset or enumeration
const FIRST_STATUS_DELAY_MS: u32 = 1200;

/// Callback type for FTP transfer completion
pub type FtpCompleteFn<'a> = dyn FnMut(&TransferInfo, &[u8]) + 'a;

/// Event callbacks the application may provide.
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct Callbacks<'a> {
    /// Called when an FTP client transaction ends, however it ends.
    ///
    /// The second argument is the transferred data: the file contents
    /// after a completed read, empty otherwise.
    pub ftp_complete: Option<&'a mut FtpCompleteFn<'a>>,
}

impl<'a> Callbacks<'a> {
    /// Create an empty callback set
    pub const fn new() -> Self {
        Self { ftp_complete: None }
    }
}

/// The borrowed working set handed to sub-modules during a call.
///
/// Bundles the host, the transmitter, and the timers so modules can send
/// messages and arm the receiver without reaching back into the node.
pub(crate) struct Services<'s, H: Host> {
    pub host: &'s mut H,
    pub tx: &'s mut Transmitter,
    pub event_index: &'s mut EventIndex,
    pub receiver: &'s mut Receiver,
    pub mbox: &'s RxMbox,
    pub next_status_time: &'s mut u32,
    pub now: u32,
    /// Our working CAN address
    pub address: u8,
    pub address_valid: bool,
}

impl<H: Host> Services<'_, H> {
    /// Record an address change made during this call
    pub fn refresh_address(&mut self, address: u8, valid: bool) {
        self.address = address;
        self.address_valid = valid;
    }

    /// Open a message to `destination` through the transmitter
    pub fn start_message(&mut self, destination: u8) {
        self.tx
            .start_message(self.address, destination, &mut *self.event_index);
    }

    /// Point the receiver's sender filter, 0 to clear
    pub fn set_sender_filter(&mut self, address: u8) {
        self.receiver
            .set_sender_filter(self.mbox, address, self.now);
    }

    /// Send a single token as its own message.
    ///
    /// An unaddressed node sends nothing but address proposals. Input
    /// status tokens are events: they advance the event index and go out
    /// three times.
    pub fn send_token(&mut self, token: &Token) -> bool {
        if !self.address_valid && token.key != keys::REQUEST_ADDRESS {
            return false;
        }

        let is_input_event = token.key.is_input_status();
        if is_input_event {
            self.event_index.next();
            self.delay_status_update();
        }

        let repeats = if is_input_event { 3 } else { 1 };
        for _ in 0..repeats {
            self.tx.start_message_with_key(
                self.address,
                token.address,
                token.key,
                &mut *self.event_index,
            );
            self.tx.add_token(token);
            self.tx.finish_message();
        }
        true
    }

    /// Push the next status broadcast out by up to 15 ms.
    ///
    /// Events take priority on the bus; periodic status yields to them.
    pub fn delay_status_update(&mut self) {
        if (self.next_status_time.wrapping_sub(self.now) as i32) < 15 {
            *self.next_status_time = self.next_status_time.wrapping_add(15);
        }
    }
}

/// The main object representing a node.
///
/// Owns every protocol component and the host capability set, and borrows
/// the [`RxMbox`] it shares with the CAN receive path. All activity runs
/// inside [`Node::tick`]; there are no tasks and nothing blocks.
#[allow(missing_debug_implementations)]
pub struct Node<'a, H: Host> {
    host: H,
    callbacks: Callbacks<'a>,
    mbox: &'a RxMbox,
    receiver: Receiver,
    transmitter: Transmitter,
    event_index: EventIndex,
    address: CanAddress,
    token_table: TokenTable,
    sequencers: SequencerController,
    ftp_server: FtpServer,
    ftp_client: FtpClient,
    now: u32,
    next_status_time: u32,
    busy: bool,
}

impl<'a, H: Host> Node<'a, H> {
    /// Create a node and run its reset sequence.
    ///
    /// # Arguments
    /// * `host` - The host capability set
    /// * `callbacks` - Optional application event callbacks
    /// * `mbox` - The mailbox shared with the CAN receive path
    /// * `now_ms` - The platform millisecond clock
    pub fn new(host: H, callbacks: Callbacks<'a>, mbox: &'a RxMbox, now_ms: u32) -> Self {
        let mut node = Node {
            host,
            callbacks,
            mbox,
            receiver: Receiver::new(),
            transmitter: Transmitter::new(),
            event_index: EventIndex::new(),
            address: CanAddress::new(),
            token_table: TokenTable::new(),
            sequencers: SequencerController::new(),
            ftp_server: FtpServer::new(),
            ftp_client: FtpClient::new(),
            now: now_ms,
            next_status_time: 0,
            busy: false,
        };
        node.reset(now_ms);
        node
    }

    /// Reset every component, reloading the persisted files.
    pub fn reset(&mut self, now_ms: u32) {
        self.now = now_ms;
        self.next_status_time = now_ms.wrapping_add(FIRST_STATUS_DELAY_MS);
        self.event_index.reset();
        self.receiver.reset(self.mbox, now_ms);
        self.transmitter.reset();
        self.token_table.reset();
        self.ftp_client.reset(now_ms);

        {
            let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
            let Node {
                host,
                transmitter,
                event_index,
                receiver,
                mbox,
                next_status_time,
                address,
                ftp_server,
                ..
            } = self;
            let mut services = Services {
                host,
                tx: transmitter,
                event_index,
                receiver,
                mbox: *mbox,
                next_status_time,
                now: now_ms,
                address: our_address,
                address_valid,
            };
            address.reset(&mut services);
            ftp_server.reset(&mut services);
        }

        self.sequencers.reset(&mut self.host);
        self.busy = false;
    }

    /// Run one cooperative scheduling pass.
    ///
    /// Call periodically with the platform millisecond clock. Overlapping
    /// calls are dropped; the guard makes `tick` self-atomic against
    /// misuse from two contexts.
    pub fn tick(&mut self, now_ms: u32) {
        if self.busy {
            return;
        }
        self.busy = true;
        self.now = now_ms;

        // drain, sort, and route received messages
        self.receiver.run(self.mbox, now_ms);
        let mut message = [0u8; MAX_MESSAGE_LEN];
        while let Some(header) = self.receiver.next_message(&mut message) {
            self.route_message(header.sender, header.is_event, &message[..header.len]);
        }

        // one frame to the driver per tick
        self.transmitter.pump(&mut self.host);

        self.run_address_and_ftp();

        // step the sequencers
        let mut emissions = Emissions::new();
        let our_address = self.address.current();
        self.sequencers
            .clock(now_ms, our_address, &mut self.host, &mut emissions);
        self.route_emissions(&emissions);

        self.broadcast_status();
        self.busy = false;
    }

    fn run_address_and_ftp(&mut self) {
        let now = self.now;
        let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
        let Node {
            host,
            transmitter,
            event_index,
            receiver,
            mbox,
            next_status_time,
            address,
            ftp_server,
            ftp_client,
            callbacks,
            ..
        } = self;
        let mut services = Services {
            host,
            tx: transmitter,
            event_index,
            receiver,
            mbox: *mbox,
            next_status_time,
            now,
            address: our_address,
            address_valid,
        };

        address.clock(&mut services);
        ftp_server.clock(&mut services);
        if let Some(info) = ftp_client.clock(&mut services) {
            if let Some(cb) = callbacks.ftp_complete.as_mut() {
                cb(&info, &[]);
            }
        }
    }

    /// Route one reassembled message.
    fn route_message(&mut self, sender: u8, is_event: bool, bytes: &[u8]) {
        // at minimum the event index and a token key
        if bytes.len() < 3 {
            return;
        }
        let event_byte = bytes[0];
        let key_prefix = bytes[1] & KeyPrefix::MASK;
        let key =
            TokenKey::new((((bytes[1] & !KeyPrefix::MASK) as u16) << 8) | bytes[2] as u16);

        if key_prefix == KeyPrefix::PatternSync as u8 {
            // a pattern sync carries its enumeration in the key field
            let token = Token::new(sender, keys::SEQUENCER_SYNC, key.raw() as i32);
            self.receive_can_token(&token);
        } else if key.is_ftp_response() {
            self.ftp_response_in(sender, key, &bytes[3..]);
        } else if key.is_ftp_request() {
            self.ftp_request_in(sender, key, &bytes[3..]);
        } else {
            self.event_index.observe(event_byte);
            if is_event {
                self.delay_status_update();
            }

            // a command is identified by its prefix and exact body length
            let is_command =
                key_prefix == KeyPrefix::Command as u8 && bytes.len() == 3 + key.value_size();

            // events and commands always pass; everything else must be
            // fresher than the local event index
            if is_event || is_command || !self.event_index.is_expired(event_byte) {
                codec::decompress(&bytes[1..], sender, |token| {
                    self.receive_can_token(token);
                })
                .ok();
            }
        }
    }

    fn ftp_response_in(&mut self, sender: u8, key: TokenKey, body: &[u8]) {
        let now = self.now;
        let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
        let Node {
            host,
            transmitter,
            event_index,
            receiver,
            mbox,
            next_status_time,
            ftp_client,
            callbacks,
            ..
        } = self;
        let mut services = Services {
            host,
            tx: transmitter,
            event_index,
            receiver,
            mbox: *mbox,
            next_status_time,
            now,
            address: our_address,
            address_valid,
        };
        if let Some(info) = ftp_client.response_in(sender, key, body, &mut services) {
            if let Some(cb) = callbacks.ftp_complete.as_mut() {
                cb(&info, ftp_client.data());
            }
        }
    }

    fn ftp_request_in(&mut self, sender: u8, key: TokenKey, body: &[u8]) {
        let now = self.now;
        let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
        let Node {
            host,
            transmitter,
            event_index,
            receiver,
            mbox,
            next_status_time,
            ftp_server,
            ftp_client,
            ..
        } = self;
        let mut services = Services {
            host,
            tx: transmitter,
            event_index,
            receiver,
            mbox: *mbox,
            next_status_time,
            now,
            address: our_address,
            address_valid,
        };
        ftp_server.request_in(sender, key, body, ftp_client.is_busy(), &mut services);
    }

    /// Dispatch one decoded bus token: the address allocator sees
    /// everything; with a valid address, status feeds the rule engine
    /// table, commands feed the sequencers, and everything reaches the
    /// application.
    fn receive_can_token(&mut self, token: &Token) {
        {
            let now = self.now;
            let (our_address, address_valid) =
                (self.address.current(), self.address.is_valid());
            let Node {
                host,
                transmitter,
                event_index,
                receiver,
                mbox,
                next_status_time,
                address,
                ..
            } = self;
            let mut services = Services {
                host,
                tx: transmitter,
                event_index,
                receiver,
                mbox: *mbox,
                next_status_time,
                now,
                address: our_address,
                address_valid,
            };
            address.token_in(token, &mut services);
        }

        if !self.address.is_valid() {
            return;
        }

        let prefix = token.key.prefix();
        if prefix == KeyPrefix::InputStatus as u8 || prefix == KeyPrefix::OutputStatus as u8 {
            self.token_table.observe(token);
        }
        if prefix == KeyPrefix::Command as u8 {
            let mut emissions = Emissions::new();
            let our_address = self.address.current();
            self.sequencers.token_in(
                token,
                self.now,
                our_address,
                &mut self.host,
                &mut emissions,
            );
            self.route_emissions(&emissions);
        }
        self.host.token_callback(token);
    }

    /// Handle a token from the application.
    ///
    /// Internal addresses reach the rule engine table and the sequencers;
    /// bus addresses send the token over CAN once the node has an
    /// address. Local variables never leave the node.
    pub fn token_in(&mut self, token: &Token) {
        if token.address == addresses::RULE_ENGINE {
            self.token_table.publish(token.key, token.value);
        } else if addresses::is_sequencer(token.address) {
            let mut emissions = Emissions::new();
            let our_address = self.address.current();
            self.sequencers.token_in(
                token,
                self.now,
                our_address,
                &mut self.host,
                &mut emissions,
            );
            self.route_emissions(&emissions);
        } else if addresses::is_can_bus(token.address)
            && !token.key.is_local_variable()
            && self.address.is_valid()
        {
            self.send_token(token);
        }
    }

    /// Send a token over the bus as its own message.
    pub fn send_token(&mut self, token: &Token) -> bool {
        let now = self.now;
        let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
        let Node {
            host,
            transmitter,
            event_index,
            receiver,
            mbox,
            next_status_time,
            ..
        } = self;
        let mut services = Services {
            host,
            tx: transmitter,
            event_index,
            receiver,
            mbox: *mbox,
            next_status_time,
            now,
            address: our_address,
            address_valid,
        };
        services.send_token(token)
    }

    /// Broadcast a pattern sync token.
    ///
    /// The sync travels as a two-byte message: the enumeration's high
    /// bits under the sync prefix, then its low byte.
    pub fn send_sync(&mut self, token: &Token) {
        let Node {
            transmitter,
            event_index,
            address,
            ..
        } = self;
        transmitter.start_message(address.current(), addresses::BROADCAST, event_index);
        transmitter.add_byte(
            KeyPrefix::PatternSync as u8
                | (((token.value >> 8) as u8) & !(KeyPrefix::PatternSync as u8)),
        );
        transmitter.add_byte(token.value as u8);
        transmitter.finish_message();
    }

    /// Deliver buffered sequencer output.
    fn route_emissions(&mut self, emissions: &Emissions) {
        for emission in emissions {
            match emission {
                Emission::App(token) => self.host.token_callback(token),
                Emission::Sync(token) => {
                    self.token_table.observe(token);
                    self.send_sync(token);
                }
            }
        }
    }

    /// Periodic broadcast of the rule engine's exposed tokens.
    fn broadcast_status(&mut self) {
        if !timer_expired(self.now, self.next_status_time)
            || self.mbox.sender_filter() != 0
            || !self.address.is_valid()
            || !self.token_table.has_broadcast_tokens()
        {
            return;
        }

        // the address offset staggers peers that booted together
        self.next_status_time = self
            .next_status_time
            .wrapping_add(self.address.current() as u32 + STATUS_PERIOD_BASE_MS);
        debug!("broadcasting status tokens");

        let Node {
            transmitter,
            event_index,
            address,
            token_table,
            ..
        } = self;
        transmitter.start_message(address.current(), addresses::BROADCAST, event_index);
        codec::compress(token_table.tokens(), |byte| transmitter.add_byte(byte));
        transmitter.finish_message();
    }

    fn delay_status_update(&mut self) {
        if (self.next_status_time.wrapping_sub(self.now) as i32) < 15 {
            self.next_status_time = self.next_status_time.wrapping_add(15);
        }
    }

    /// Publish a token into the rule engine's exposed table for the next
    /// status broadcast
    pub fn set_exposed_token(&mut self, key: TokenKey, value: i32) {
        self.token_table.publish(key, value);
    }

    /// The working CAN address, 0 while unassigned
    pub fn can_address(&self) -> u8 {
        self.address.current()
    }

    /// Whether the node may use its address on the bus
    pub fn is_address_valid(&self) -> bool {
        self.address.is_valid()
    }

    /// Whether the address was programmed rather than self-assigned
    pub fn is_address_static(&self) -> bool {
        self.address.is_static()
    }

    /// The current event index
    pub fn event_index(&mut self) -> u8 {
        self.event_index.current()
    }

    /// Whether the indexed sequencer is running a pattern
    pub fn is_sequencer_running(&self, index: usize) -> bool {
        self.sequencers.is_running(index)
    }

    /// The number of patterns the table file declares
    pub fn num_patterns(&mut self) -> u16 {
        let Node {
            host, sequencers, ..
        } = self;
        sequencers.num_patterns(host)
    }

    /// The host capability set
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host capability set
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Data staged by the last completed FTP read
    pub fn ftp_read_data(&self) -> &[u8] {
        self.ftp_client.data()
    }

    /// Start an FTP file info request against a remote server
    pub fn ftp_file_info(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
    ) -> Result<(), StartTransferError> {
        self.with_ftp_client(|client, server_busy, services| {
            client.get_file_info(server, access_code, name, server_busy, services)
        })
    }

    /// Start an FTP indexed file info request
    pub fn ftp_indexed_file_info(
        &mut self,
        server: u8,
        access_code: u32,
        volume: u16,
        file_index: u32,
    ) -> Result<(), StartTransferError> {
        self.with_ftp_client(|client, server_busy, services| {
            client.get_indexed_file_info(
                server,
                access_code,
                volume,
                file_index,
                server_busy,
                services,
            )
        })
    }

    /// Start reading a file from a remote server
    pub fn ftp_read_file(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
    ) -> Result<(), StartTransferError> {
        self.with_ftp_client(|client, server_busy, services| {
            client.read_file(server, access_code, name, server_busy, services)
        })
    }

    /// Start writing a file to a remote server
    pub fn ftp_write_file(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
        data: &[u8],
        timestamp: u32,
    ) -> Result<(), StartTransferError> {
        self.with_ftp_client(|client, server_busy, services| {
            client.write_file(server, access_code, name, data, timestamp, server_busy, services)
        })
    }

    /// Ask a remote server to delete a file
    pub fn ftp_delete_file(
        &mut self,
        server: u8,
        access_code: u32,
        name: &str,
    ) -> Result<(), StartTransferError> {
        self.with_ftp_client(|client, server_busy, services| {
            client.delete_file(server, access_code, name, server_busy, services)
        })
    }

    fn with_ftp_client<R>(
        &mut self,
        f: impl FnOnce(&mut FtpClient, bool, &mut Services<'_, H>) -> R,
    ) -> R {
        let now = self.now;
        let (our_address, address_valid) = (self.address.current(), self.address.is_valid());
        let Node {
            host,
            transmitter,
            event_index,
            receiver,
            mbox,
            next_status_time,
            ftp_server,
            ftp_client,
            ..
        } = self;
        let mut services = Services {
            host,
            tx: transmitter,
            event_index,
            receiver,
            mbox: *mbox,
            next_status_time,
            now,
            address: our_address,
            address_valid,
        };
        f(ftp_client, ftp_server.is_busy(), &mut services)
    }
}
