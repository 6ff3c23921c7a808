//! A simulated CAN bus connecting node mailboxes and test listeners

use std::cell::RefCell;
use std::rc::Rc;

use ecconet_common::{CanFrame, FlashError, Host, SendStatus, Token};
use ecconet_node::RxMbox;

#[derive(Default)]
struct BusCore {
    /// Frames sent but not yet delivered, with the sender's node index
    pending: Vec<(usize, CanFrame)>,
    /// Every frame ever sent, for test inspection
    log: Vec<CanFrame>,
}

/// A frame-level bus: everything a node transmits is delivered to every
/// other node's mailbox on the next [`SimBus::deliver`] call.
#[derive(Default)]
pub struct SimBus<'a> {
    core: Rc<RefCell<BusCore>>,
    mailboxes: Vec<&'a RxMbox>,
}

impl<'a> SimBus<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's mailbox, returning the index its host must use
    pub fn add_node(&mut self, mbox: &'a RxMbox) -> usize {
        self.mailboxes.push(mbox);
        self.mailboxes.len() - 1
    }

    /// Create a host bound to this bus for the node at `index`.
    ///
    /// Flash volumes are RAM-backed and erased to 0xFF.
    pub fn new_host(&self, index: usize, guid: [u32; 4], volume_sizes: &[usize]) -> SimHost {
        SimHost {
            bus: self.core.clone(),
            node_index: index,
            guid,
            volumes: volume_sizes.iter().map(|s| vec![0xFF; *s]).collect(),
            tokens: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Deliver pending frames to every mailbox except the sender's
    pub fn deliver(&self, now_ms: u32) {
        let pending: Vec<(usize, CanFrame)> = {
            let mut core = self.core.borrow_mut();
            let pending = std::mem::take(&mut core.pending);
            core.log.extend(pending.iter().map(|(_, f)| *f));
            pending
        };
        for (sender, frame) in pending {
            for (index, mbox) in self.mailboxes.iter().enumerate() {
                if index != sender {
                    mbox.receive_can_frame(frame.id(), frame.data(), now_ms);
                }
            }
        }
    }

    /// Put a raw frame on the bus from outside any node
    pub fn inject(&self, id: u32, data: &[u8], now_ms: u32) {
        for mbox in &self.mailboxes {
            mbox.receive_can_frame(id, data, now_ms);
        }
        self.core.borrow_mut().log.push(CanFrame::new(id, data));
    }

    /// The bus traffic log
    pub fn frame_log(&self) -> Vec<CanFrame> {
        self.core.borrow().log.clone()
    }

    /// Forget logged traffic
    pub fn clear_log(&self) {
        self.core.borrow_mut().log.clear();
    }
}

/// A bus-attached host with RAM-backed flash volumes.
///
/// Tokens delivered to the application callback are recorded in `tokens`;
/// clone the `Rc` before handing the host to a node to watch them from
/// the test.
pub struct SimHost {
    bus: Rc<RefCell<BusCore>>,
    node_index: usize,
    guid: [u32; 4],
    volumes: Vec<Vec<u8>>,
    pub tokens: Rc<RefCell<Vec<Token>>>,
}

impl Host for SimHost {
    fn send_can(&mut self, id: u32, data: &[u8]) -> SendStatus {
        self.bus
            .borrow_mut()
            .pending
            .push((self.node_index, CanFrame::new(id, data)));
        SendStatus::Accepted
    }

    fn flash_read(&mut self, volume: u16, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let volume = self.volumes.get(volume as usize).ok_or(FlashError)?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > volume.len() {
            return Err(FlashError);
        }
        buf.copy_from_slice(&volume[start..end]);
        Ok(())
    }

    fn flash_write(&mut self, volume: u16, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let volume = self.volumes.get_mut(volume as usize).ok_or(FlashError)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > volume.len() {
            return Err(FlashError);
        }
        volume[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flash_erase(&mut self, volume: u16, offset: u32, len: u32) -> Result<(), FlashError> {
        let volume = self.volumes.get_mut(volume as usize).ok_or(FlashError)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > volume.len() {
            return Err(FlashError);
        }
        volume[start..end].fill(0xFF);
        Ok(())
    }

    fn volume_size(&self, volume: u16) -> u32 {
        self.volumes
            .get(volume as usize)
            .map(|v| v.len() as u32)
            .unwrap_or(0)
    }

    fn guid(&self) -> [u32; 4] {
        self.guid
    }

    fn token_callback(&mut self, token: &Token) {
        self.tokens.borrow_mut().push(*token);
    }
}
