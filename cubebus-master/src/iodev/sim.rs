//! Simulated bus with virtual nodes.
//!
//! `SimBus` stands in for a real RS-485 adapter: frames written by the
//! engine are delivered to a set of in-process nodes that implement the
//! node side of the protocol, bootloader included. It backs the integration
//! tests and the CLI's `--dummy` mode, and its fault behaviors cover the
//! failure paths a live bus produces only under adverse conditions.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{IoDevice, IoDirection, IoEvent};
use crate::bus::command::{BootStatus, CommandId, InfoKind, Payload, ResponseCode, BOOT_MAGIC};
use crate::bus::frame::{RawFrame, FRAME_LEN, PAYLOAD_LEN};
use crate::bus::node::Address;
use crate::flasher::image::MemoryLayout;

/// Fault injection per virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every request correctly.
    Normal,
    /// Never answer; the node looks absent.
    Silent,
    /// Answer with a corrupted checksum.
    CorruptCrc,
    /// Answer from the wrong source address.
    WrongResponder,
    /// Report a flash controller fault in every bootloader status query.
    BootFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    App,
    Bootloader,
}

/// One virtual node.
pub struct SimNode {
    addr: Address,
    layout: MemoryLayout,
    behavior: Behavior,
    version: u32,
    mode: Mode,
    unlocked: bool,
    busy_polls: u8,
    flash: Vec<u8>,
    row_accum: Vec<u8>,
}

impl SimNode {
    pub fn new(addr: Address, layout: MemoryLayout) -> Self {
        let flash = vec![0u8; layout.size() as usize];
        Self {
            addr,
            layout,
            behavior: Behavior::Normal,
            version: 0x0001_0000,
            mode: Mode::App,
            unlocked: false,
            busy_polls: 0,
            flash,
            row_accum: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn info(&self, kind: InfoKind) -> u32 {
        match kind {
            InfoKind::PhysStart => self.layout.start,
            InfoKind::PhysEnd => self.layout.end,
            InfoKind::WordSize => self.layout.word_size,
            InfoKind::RowSize => self.layout.row_size,
            InfoKind::PageSize => self.layout.page_size,
        }
    }

    /// Runs one command against this node, mutating its state.
    fn execute(&mut self, id: CommandId, payload: &[u8; PAYLOAD_LEN]) -> (ResponseCode, [u8; 4]) {
        const NONE: [u8; 4] = [0; 4];
        match (self.mode, id) {
            (Mode::App, CommandId::GetStatus) => (ResponseCode::Ok, 1u32.encode()),
            (Mode::App, CommandId::GetVersion) => (ResponseCode::Ok, self.version.encode()),
            (Mode::App, CommandId::SwapDma) => (ResponseCode::Ok, NONE),
            (Mode::App, CommandId::DetectOpenLeds) => (ResponseCode::Ok, 0u32.encode()),
            (Mode::App, CommandId::ResetCpu) => {
                self.mode = Mode::Bootloader;
                self.unlocked = false;
                self.busy_polls = 0;
                self.row_accum.clear();
                (ResponseCode::Ok, NONE)
            }
            // A reset while already in the bootloader is a harmless no-op.
            (Mode::Bootloader, CommandId::ResetCpu) => (ResponseCode::Ok, NONE),
            (Mode::Bootloader, CommandId::BlGetStatus) => {
                let status = if self.behavior == Behavior::BootFault {
                    BootStatus::faulted()
                } else if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    BootStatus::busy()
                } else {
                    BootStatus::ready()
                };
                (ResponseCode::Ok, status.encode())
            }
            (Mode::Bootloader, CommandId::BlGetInfo) => match InfoKind::decode(payload) {
                Ok(kind) => (ResponseCode::Ok, self.info(kind).encode()),
                Err(_) => (ResponseCode::InvalidPayload, NONE),
            },
            (Mode::Bootloader, CommandId::BlGetVersion) => {
                (ResponseCode::Ok, self.version.encode())
            }
            (Mode::Bootloader, CommandId::BlGetRowCrc) => {
                let crc = crate::bus::crc::crc16(&self.row_accum);
                (ResponseCode::Ok, crc.encode())
            }
            (Mode::Bootloader, CommandId::BlSetBootMagic) => {
                match u32::decode(payload) {
                    Ok(BOOT_MAGIC) => {
                        self.unlocked = true;
                        (ResponseCode::Ok, NONE)
                    }
                    _ => (ResponseCode::InvalidPayload, NONE),
                }
            }
            (Mode::Bootloader, CommandId::BlFlashErase) => {
                if !self.unlocked {
                    return (ResponseCode::InvalidCommand, NONE);
                }
                self.flash.fill(0xFF);
                self.busy_polls = 1;
                (ResponseCode::Ok, NONE)
            }
            (Mode::Bootloader, CommandId::BlResetRowPtr) => {
                if self.unlocked {
                    self.row_accum.clear();
                }
                (ResponseCode::Ok, NONE)
            }
            (Mode::Bootloader, CommandId::BlPushWord) => {
                // Words for a foreign geometry are dropped without protest;
                // a shared-bus broadcast reaches every unlocked bootloader.
                let word = self.layout.word_size as usize;
                if self.unlocked && self.row_accum.len() + word <= self.layout.row_size as usize {
                    self.row_accum.extend_from_slice(&payload[..word.min(PAYLOAD_LEN)]);
                }
                (ResponseCode::Ok, NONE)
            }
            (Mode::Bootloader, CommandId::BlBurnRow) => {
                if !self.unlocked {
                    return (ResponseCode::InvalidCommand, NONE);
                }
                let phys = match u32::decode(payload) {
                    Ok(p) => p,
                    Err(_) => return (ResponseCode::InvalidPayload, NONE),
                };
                let row = self.layout.row_size as usize;
                let offset = phys.wrapping_sub(self.layout.start) as usize;
                if self.row_accum.len() != row || offset + row > self.flash.len() {
                    return (ResponseCode::InvalidPayload, NONE);
                }
                self.flash[offset..offset + row].copy_from_slice(&self.row_accum);
                self.row_accum.clear();
                self.busy_polls = 1;
                (ResponseCode::Ok, NONE)
            }
            (Mode::Bootloader, CommandId::BlBoot) => {
                self.mode = Mode::App;
                self.unlocked = false;
                (ResponseCode::Ok, NONE)
            }
            // Everything else is out of place for the current mode.
            _ => (ResponseCode::InvalidCommand, NONE),
        }
    }
}

struct Inner {
    nodes: Vec<SimNode>,
    rx: VecDeque<u8>,
    events: VecDeque<IoEvent>,
    frames: Vec<RawFrame>,
    fail_writes: bool,
}

/// A simulated bus adapter.
///
/// Clones share the same bus, so a test can keep a handle for inspection
/// while the engine owns another.
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl SimBus {
    pub fn new(nodes: Vec<SimNode>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                rx: VecDeque::new(),
                events: VecDeque::new(),
                frames: Vec::new(),
                fail_writes: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A small populated bus for demonstration runs.
    pub fn demo() -> Self {
        let small = MemoryLayout {
            start: 0x2000,
            end: 0x2800,
            word_size: 2,
            row_size: 16,
            page_size: 64,
        };
        let large = MemoryLayout {
            start: 0x4000,
            end: 0x6000,
            word_size: 4,
            row_size: 32,
            page_size: 128,
        };
        let nodes = (0..6)
            .map(|i| {
                let addr = Address::new(i).expect("demo addresses are in range");
                let layout = if i < 4 { small } else { large };
                SimNode::new(addr, layout)
            })
            .collect();
        Self::new(nodes)
    }

    /// Every frame the engine has written so far.
    pub fn written_frames(&self) -> Vec<RawFrame> {
        self.inner.lock().unwrap().frames.clone()
    }

    /// Makes every subsequent write fail, as an unplugged adapter would.
    pub fn set_write_failure(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    /// Pushes unsolicited bytes at the master, as electrical noise or a
    /// misbehaving node would.
    pub fn inject_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.extend(bytes);
        inner.events.push_back(IoEvent::ReadyRead);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Flash contents of one virtual node.
    pub fn flash_of(&self, addr: Address) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .find(|n| n.addr == addr)
            .map(|n| n.flash.clone())
    }

    /// Whether a node is running its application rather than its bootloader.
    pub fn is_running_app(&self, addr: Address) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .find(|n| n.addr == addr)
            .map(|n| n.mode == Mode::App)
    }

    fn route(inner: &mut Inner, frame: RawFrame) {
        inner.frames.push(frame);
        inner.events.push_back(IoEvent::TransferComplete);

        if !frame.request {
            return;
        }
        let Some(id) = CommandId::from_repr(frame.code) else {
            // Unknown commands still get a response from the targeted node.
            if !frame.broadcast {
                let responder = inner
                    .nodes
                    .iter()
                    .find(|n| n.addr == frame.address && n.behavior != Behavior::Silent)
                    .map(|n| n.addr);
                if let Some(addr) = responder {
                    let response = RawFrame::response(addr, ResponseCode::Unknown as u8, [0; 4]);
                    Self::push_response(inner, response, Behavior::Normal);
                }
            }
            return;
        };

        if frame.broadcast {
            for node in inner.nodes.iter_mut() {
                let _ = node.execute(id, &frame.payload);
            }
            return;
        }

        let Some(node) = inner.nodes.iter_mut().find(|n| n.addr == frame.address) else {
            return;
        };
        if node.behavior == Behavior::Silent {
            return;
        }
        let (code, payload) = node.execute(id, &frame.payload);
        let source = match node.behavior {
            Behavior::WrongResponder => {
                Address::new((node.addr.value() + 1) % Address::COUNT)
                    .expect("wrapped address is in range")
            }
            _ => node.addr,
        };
        let behavior = node.behavior;
        let response = RawFrame::response(source, code as u8, payload);
        Self::push_response(inner, response, behavior);
    }

    fn push_response(inner: &mut Inner, response: RawFrame, behavior: Behavior) {
        let mut bytes = response.to_bytes();
        if behavior == Behavior::CorruptCrc {
            bytes[FRAME_LEN - 1] ^= 0x01;
        }
        inner.rx.extend(bytes);
        inner.events.push_back(IoEvent::ReadyRead);
    }
}

#[async_trait]
impl IoDevice for SimBus {
    async fn event(&mut self) -> io::Result<IoEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking the queue, so an event
            // pushed in between cannot be missed.
            notified.as_mut().enable();
            if let Some(ev) = self.inner.lock().unwrap().events.pop_front() {
                return Ok(ev);
            }
            notified.await;
        }
    }

    fn bytes_to_read(&self) -> usize {
        self.inner.lock().unwrap().rx.len()
    }

    fn write_room(&self) -> usize {
        usize::MAX
    }

    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = dst.len().min(inner.rx.len());
        for slot in dst[..n].iter_mut() {
            *slot = inner.rx.pop_front().expect("length checked above");
        }
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter gone"));
            }
            if src.len() >= FRAME_LEN && crate::bus::crc::crc16_is_valid(&src[..FRAME_LEN]) {
                let mut bytes = [0u8; FRAME_LEN];
                bytes.copy_from_slice(&src[..FRAME_LEN]);
                Self::route(&mut inner, RawFrame::from_bytes(&bytes));
            } else {
                // Garbage still occupies the wire.
                inner.events.push_back(IoEvent::TransferComplete);
            }
        }
        self.notify.notify_waiters();
        Ok(src.len())
    }

    fn clear(&mut self, direction: IoDirection) {
        let mut inner = self.inner.lock().unwrap();
        match direction {
            IoDirection::Input => {
                inner.rx.clear();
                inner.events.retain(|e| *e != IoEvent::ReadyRead);
            }
            IoDirection::Output => {}
            IoDirection::All => {
                inner.rx.clear();
                inner.events.clear();
            }
        }
    }
}
