//! A demo ecconet node on a Linux socketcan interface.
//!
//! Brings up a node with a RAM-backed flash image, optionally provisioned
//! with a static address, and bridges it to e.g. vcan0. Received tokens
//! print to the log; the node enumerates, answers FTP, and broadcasts any
//! statuses published with `--status`.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use clap::Parser;
use ecconet_common::{files, CanFrame, FlashError, Host, ReadHandling, SendStatus, Token};
use ecconet_node::{common::token::TokenKey, storage, Callbacks, Node, RxMbox};

static MBOX: RxMbox = RxMbox::new();

#[derive(Parser, Debug)]
struct Args {
    /// The socketcan device, e.g. "vcan0"
    socket: String,
    /// Use a static CAN address instead of self-assignment
    #[clap(long, short)]
    address: Option<u8>,
    /// Device serial, mixed into the GUID; random if omitted
    #[clap(long)]
    serial: Option<u32>,
    /// Publish an output status `key=value` on the broadcast schedule
    #[clap(long)]
    status: Vec<String>,
    /// Flash volume size in bytes
    #[clap(long, default_value = "65536")]
    flash_size: usize,
}

/// Host backed by a RAM flash image and an outbound frame channel.
struct DemoHost {
    guid: [u32; 4],
    flash: Vec<u8>,
    frames: SyncSender<CanFrame>,
}

impl Host for DemoHost {
    fn send_can(&mut self, id: u32, data: &[u8]) -> SendStatus {
        match self.frames.try_send(CanFrame::new(id, data)) {
            Ok(()) => SendStatus::Accepted,
            Err(TrySendError::Full(_)) => SendStatus::Busy,
            Err(TrySendError::Disconnected(_)) => SendStatus::Busy,
        }
    }

    fn flash_read(&mut self, _volume: u16, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.flash.len() {
            return Err(FlashError);
        }
        buf.copy_from_slice(&self.flash[start..end]);
        Ok(())
    }

    fn flash_write(&mut self, _volume: u16, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.flash.len() {
            return Err(FlashError);
        }
        self.flash[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flash_erase(&mut self, _volume: u16, offset: u32, len: u32) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start + len as usize;
        if end > self.flash.len() {
            return Err(FlashError);
        }
        self.flash[start..end].fill(0xFF);
        Ok(())
    }

    fn volume_size(&self, volume: u16) -> u32 {
        if volume == 0 {
            self.flash.len() as u32
        } else {
            0
        }
    }

    fn guid(&self) -> [u32; 4] {
        self.guid
    }

    fn token_callback(&mut self, token: &Token) {
        log::info!(
            "token from {}: key {} value {}",
            token.address,
            token.key.raw(),
            token.value
        );
    }

    fn ftp_read_handler(&mut self, _requester: u8, _info: &mut files::FileMetadata) -> ReadHandling {
        ReadHandling::Default
    }
}

fn parse_status(arg: &str) -> Option<(TokenKey, i32)> {
    let (key, value) = arg.split_once('=')?;
    Some((
        TokenKey::new(key.parse().ok()?),
        value.parse().ok()?,
    ))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    log::info!("starting node on {}", args.socket);

    let serial = args.serial.unwrap_or_else(rand::random);
    let (frame_tx, frame_rx): (SyncSender<CanFrame>, Receiver<CanFrame>) = sync_channel(64);
    let mut host = DemoHost {
        guid: [0xECC0_0001, 0x4E45_5400, serial, !serial],
        flash: vec![0xFF; args.flash_size],
        frames: frame_tx,
    };

    if let Some(address) = args.address {
        storage::write_file(&mut host, 0, files::ADDRESS_FILE, &[address, 1], 0)
            .expect("provisioning address.can");
    }

    let (mut can_tx, mut can_rx) = ecconet_common::open_socketcan(&args.socket).unwrap();

    let epoch = Instant::now();
    let now_ms = move || epoch.elapsed().as_millis() as u32;

    let mut node = Node::new(host, Callbacks::new(), &MBOX, now_ms());

    let mut statuses = Vec::new();
    for arg in &args.status {
        match parse_status(arg) {
            Some((key, value)) => statuses.push((key, value)),
            None => log::warn!("ignoring malformed status {arg:?}"),
        }
    }
    for (key, value) in &statuses {
        use ecconet_common::KeyPrefix;
        node.set_exposed_token(key.with_prefix(KeyPrefix::OutputStatus), *value);
    }

    // feed received frames into the shared mailbox
    tokio::spawn(async move {
        loop {
            match can_rx.recv().await {
                Ok(frame) => MBOX.receive_can_frame(frame.id(), frame.data(), now_ms()),
                Err(e) => {
                    log::error!("receive error: {e:?}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    // drain the node's outbound frames onto the bus
    tokio::spawn(async move {
        loop {
            while let Ok(frame) = frame_rx.try_recv() {
                if can_tx.send(frame).await.is_err() {
                    log::warn!("send error");
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let mut interval = tokio::time::interval(Duration::from_millis(1));
    loop {
        interval.tick().await;
        node.tick(now_ms());
    }
}
