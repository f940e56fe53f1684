//! Simulated hardware for the unit tests.
//!
//! [`FakeKernel`] is a tick counter with thread-flag style signals. A blocked
//! wait advances time by its full timeout unless a signal is already
//! pending, so every timeout is exact. [`SimKernel`] adds a second context,
//! the arbiter, which it runs whenever the test context yields, delays or
//! blocks. [`SimBus`] moves bytes between the DMA buffers and a
//! [`Peripheral`] and raises the DMA interrupts as soon as it is started.
//! [`SimCard`] is an SD card in SPI mode, accurate down to R1 timing.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::spi::{Mode, MODE_0};
use hex_literal::hex;

use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::kernel::{ContextId, Kernel, Signals, Ticks, WAIT_FOREVER};
use crate::sdmmc_proto::*;
use crate::spi::{
    Arbiter, ChipSelect, DmaChannel, DmaFlags, DmaTransfer, Notification, SpiDmaBus, SpiManager,
};

/// CSD of a real 8 GB card.
pub const CSD_8GB: [u8; 16] = hex!("400E00325B5900003B377F800A4040AF");
/// Same layout, C_SIZE 1: 2048 blocks, small enough to simulate.
pub const CSD_1MB: [u8; 16] = hex!("400E00325B590000 00017F800A4040AF");
/// Same layout, C_SIZE 0x3FFFFF: one block more than 32-bit addressing has.
pub const CSD_2TB: [u8; 16] = hex!("400E00325B59003F FFFF7F800A4040AF");
/// CID of a SanDisk "SL08G", made August 2019.
pub const CID: [u8; 16] = hex!("035344534C3038478012345678013801");

/// The test body.
pub const TEST_CONTEXT: ContextId = 0;
/// The arbiter, when a [`SimKernel`] runs it.
pub const ARBITER_CONTEXT: ContextId = 1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Hook {
    skip: u32,
    run: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct State {
    now: Cell<Ticks>,
    current: Cell<ContextId>,
    pending: [Cell<u32>; 2],
    interrupt: Cell<bool>,
    switches: Cell<u32>,
    signaled: RefCell<Vec<(ContextId, Signals)>>,
    waits: RefCell<Vec<(Signals, Ticks)>>,
    hook: RefCell<Option<Hook>>,
}

/// A tick counter. Yield costs one tick, delay costs what it says.
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Rc<State>,
}

impl FakeKernel {
    pub fn new() -> FakeKernel {
        FakeKernel::default()
    }

    pub fn starting_at(now: Ticks) -> FakeKernel {
        let kernel = FakeKernel::new();
        kernel.state.now.set(now);
        kernel
    }

    pub fn set_in_interrupt(&self, interrupt: bool) {
        self.state.interrupt.set(interrupt);
    }

    pub fn switch_requests(&self) -> u32 {
        self.state.switches.get()
    }

    /// Every signal sent so far, in order.
    pub fn signaled(&self) -> Vec<(ContextId, Signals)> {
        self.state.signaled.borrow().clone()
    }

    /// Every `wait_signal` call so far, as (mask, timeout).
    pub fn waits(&self) -> Vec<(Signals, Ticks)> {
        self.state.waits.borrow().clone()
    }

    /// Run `f` the next time a context blocks with nothing pending, as if
    /// another context had run meanwhile.
    pub fn when_blocked(&self, f: impl FnOnce() + 'static) {
        self.after_waits(0, f);
    }

    /// Like [`FakeKernel::when_blocked`], but let `skip` blocking waits time
    /// out first.
    pub fn after_waits(&self, skip: u32, f: impl FnOnce() + 'static) {
        *self.state.hook.borrow_mut() = Some(Hook {
            skip,
            run: Box::new(f),
        });
    }

    /// The view of this kernel an interrupt handler gets.
    pub fn interrupt(&self) -> Interrupt {
        Interrupt {
            kernel: self.clone(),
        }
    }

    fn set_current(&self, context: ContextId) {
        self.state.current.set(context);
    }

    fn consume(&self, mask: Signals) -> Signals {
        match self.state.pending.get(self.current()) {
            Some(pending) => {
                let got = Signals::from_bits_truncate(pending.get()) & mask;
                pending.set(pending.get() & !got.bits());
                got
            }
            None => Signals::empty(),
        }
    }

    /// The hook due at this blocking wait, if any.
    fn due_hook(&self) -> Option<Box<dyn FnOnce()>> {
        let mut slot = self.state.hook.borrow_mut();
        if let Some(hook) = slot.as_mut() {
            if hook.skip > 0 {
                hook.skip -= 1;
                return None;
            }
        }
        slot.take().map(|hook| hook.run)
    }
}

impl Kernel for FakeKernel {
    fn now(&self) -> Ticks {
        self.state.now.get()
    }

    fn delay(&self, ticks: Ticks) {
        self.state.now.set(self.now().wrapping_add(ticks));
    }

    fn yield_now(&self) {
        self.delay(1);
    }

    fn current(&self) -> ContextId {
        self.state.current.get()
    }

    fn wait_signal(&self, mask: Signals, timeout: Ticks) -> Signals {
        self.state.waits.borrow_mut().push((mask, timeout));
        let got = self.consume(mask);
        if !got.is_empty() || timeout == 0 {
            return got;
        }
        if let Some(hook) = self.due_hook() {
            hook();
            let got = self.consume(mask);
            if !got.is_empty() {
                return got;
            }
        }
        assert!(
            timeout != WAIT_FOREVER,
            "context {} blocked forever on {:?}",
            self.current(),
            mask
        );
        self.delay(timeout);
        self.consume(mask)
    }

    fn signal(&self, context: ContextId, bits: Signals) {
        self.state.signaled.borrow_mut().push((context, bits));
        if let Some(pending) = self.state.pending.get(context) {
            pending.set(pending.get() | bits.bits());
        }
    }

    fn in_interrupt(&self) -> bool {
        self.state.interrupt.get()
    }

    fn request_context_switch(&self) {
        self.state.switches.set(self.state.switches.get() + 1);
    }
}

/// Interrupt context: may signal, may not block.
#[derive(Clone)]
pub struct Interrupt {
    kernel: FakeKernel,
}

impl Kernel for Interrupt {
    fn now(&self) -> Ticks {
        self.kernel.now()
    }

    fn delay(&self, _ticks: Ticks) {
        panic!("delay in interrupt context");
    }

    fn yield_now(&self) {
        panic!("yield in interrupt context");
    }

    fn current(&self) -> ContextId {
        panic!("no current context in an interrupt");
    }

    fn wait_signal(&self, _mask: Signals, _timeout: Ticks) -> Signals {
        panic!("blocking wait in interrupt context");
    }

    fn signal(&self, context: ContextId, bits: Signals) {
        self.kernel.signal(context, bits)
    }

    fn in_interrupt(&self) -> bool {
        true
    }

    fn request_context_switch(&self) {
        self.kernel.request_context_switch()
    }
}

/// A scheduler with exactly two contexts: the test, and the arbiter.
///
/// The arbiter runs whenever the test context gives up the CPU, until the
/// queue is empty. While the arbiter itself waits, time passes but nothing
/// else runs.
pub struct SimKernel<'m, 'a> {
    clock: FakeKernel,
    arbiter: RefCell<Arbiter<'m, 'a, SimBus<'m, 'a>>>,
}

impl<'m, 'a> SimKernel<'m, 'a> {
    pub fn new(
        manager: &'m SpiManager<'a>,
        device: Rc<RefCell<dyn Peripheral>>,
        log: Rc<RefCell<BusLog>>,
    ) -> SimKernel<'m, 'a> {
        let clock = FakeKernel::new();
        let bus = SimBus::new(manager, clock.interrupt(), device, log);
        SimKernel {
            clock,
            arbiter: RefCell::new(Arbiter::new(manager, bus)),
        }
    }

    pub fn signaled(&self) -> Vec<(ContextId, Signals)> {
        self.clock.signaled()
    }

    /// Let the arbiter drain the queue, unless it is the one calling.
    pub fn pump(&self) {
        if let Ok(mut arbiter) = self.arbiter.try_borrow_mut() {
            let caller = self.clock.current();
            self.clock.set_current(ARBITER_CONTEXT);
            while arbiter.service(self) {}
            self.clock.set_current(caller);
        }
    }
}

impl Kernel for SimKernel<'_, '_> {
    fn now(&self) -> Ticks {
        self.clock.now()
    }

    fn delay(&self, ticks: Ticks) {
        for _ in 0..ticks {
            self.yield_now();
        }
    }

    fn yield_now(&self) {
        self.clock.yield_now();
        self.pump();
    }

    fn current(&self) -> ContextId {
        self.clock.current()
    }

    fn wait_signal(&self, mask: Signals, timeout: Ticks) -> Signals {
        let started = self.now();
        loop {
            let got = self.clock.consume(mask);
            if !got.is_empty() {
                return got;
            }
            if timeout != WAIT_FOREVER && self.elapsed(started) >= timeout {
                return got;
            }
            self.yield_now();
        }
    }

    fn signal(&self, context: ContextId, bits: Signals) {
        self.clock.signal(context, bits)
    }
}

/// What the bus should do with the next transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Move the bytes and raise transfer-complete.
    Complete,
    /// Start, then never raise an interrupt.
    Stall,
    /// Raise transfer-error on both channels.
    Error,
    /// Post both notification bits at once.
    Both,
}

#[derive(Copy, Clone, PartialEq)]
pub struct Start {
    pub first: u8,
    pub len: usize,
    pub divider: u16,
    pub mode: Mode,
}

impl std::fmt::Debug for Start {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Start")
            .field("first", &self.first)
            .field("len", &self.len)
            .field("divider", &self.divider)
            .field("mode", &crate::spi::mode_number(self.mode))
            .finish()
    }
}

/// Everything the bus saw, plus the faults it has been told to inject.
#[derive(Debug, Default)]
pub struct BusLog {
    pub starts: Vec<Start>,
    pub aborts: u32,
    pub faults: VecDeque<Fault>,
}

impl BusLog {
    pub fn shared() -> Rc<RefCell<BusLog>> {
        Rc::new(RefCell::new(BusLog::default()))
    }

    pub fn first_bytes(&self) -> Vec<u8> {
        self.starts.iter().map(|s| s.first).collect()
    }
}

/// The far end of the wires.
pub trait Peripheral {
    fn exchange(&mut self, mosi: u8) -> u8;
}

/// Loops MOSI back to MISO.
#[derive(Debug, Default)]
pub struct Echo;

impl Peripheral for Echo {
    fn exchange(&mut self, mosi: u8) -> u8 {
        mosi
    }
}

pub struct SimChannel {
    pending: DmaFlags,
    pub disabled: bool,
}

impl SimChannel {
    pub fn raising(pending: DmaFlags) -> SimChannel {
        SimChannel {
            pending,
            disabled: false,
        }
    }
}

impl DmaChannel for SimChannel {
    fn flags(&mut self) -> DmaFlags {
        self.pending
    }

    fn clear_flags(&mut self, flags: DmaFlags) {
        self.pending.remove(flags);
    }

    fn disable(&mut self) {
        self.disabled = true;
    }
}

pub struct SimBus<'m, 'a> {
    manager: &'m SpiManager<'a>,
    irq: Interrupt,
    device: Rc<RefCell<dyn Peripheral>>,
    log: Rc<RefCell<BusLog>>,
    divider: u16,
    mode: Mode,
}

impl<'m, 'a> SimBus<'m, 'a> {
    /// A bus whose DMA interrupts are handled through `irq`.
    pub fn new(
        manager: &'m SpiManager<'a>,
        irq: Interrupt,
        device: Rc<RefCell<dyn Peripheral>>,
        log: Rc<RefCell<BusLog>>,
    ) -> SimBus<'m, 'a> {
        SimBus {
            manager,
            irq,
            device,
            log,
            divider: 2,
            mode: MODE_0,
        }
    }
}

impl SpiDmaBus for SimBus<'_, '_> {
    fn set_clock_divider(&mut self, divider: u16) {
        self.divider = divider;
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    unsafe fn start(&mut self, transfer: DmaTransfer) {
        let fault = {
            let mut log = self.log.borrow_mut();
            log.starts.push(Start {
                first: *transfer.tx,
                len: transfer.len,
                divider: self.divider,
                mode: self.mode,
            });
            log.faults.pop_front().unwrap_or(Fault::Complete)
        };
        if fault == Fault::Stall {
            return;
        }
        {
            let mut device = self.device.borrow_mut();
            for i in 0..transfer.len {
                let mosi = transfer.tx.add(i).read();
                transfer.rx.add(i).write(device.exchange(mosi));
            }
        }
        let flags = match fault {
            Fault::Error => DmaFlags::TRANSFER_ERROR,
            _ => DmaFlags::TRANSFER_COMPLETE,
        };
        if fault == Fault::Both {
            self.manager.events().post(Notification::ERROR);
        }
        self.manager
            .on_tx_dma_interrupt(&mut SimChannel::raising(flags));
        self.manager
            .on_rx_dma_interrupt(&self.irq, &mut SimChannel::raising(flags));
    }

    fn abort(&mut self) {
        self.log.borrow_mut().aborts += 1;
    }
}

/// Blocks in RAM.
pub struct RamDisk {
    memory: Vec<u8>,
}

impl RamDisk {
    pub fn new(blocks: u32) -> RamDisk {
        RamDisk {
            memory: vec![0u8; blocks as usize * Block::LEN],
        }
    }

    fn span(&self, idx: BlockIdx) -> Result<std::ops::Range<usize>, BlockIdx> {
        let start = idx.0 as usize * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            return Err(idx);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    /// The first block out of range.
    type Error = BlockIdx;

    fn read(&mut self, blocks: &mut [Block], start: BlockIdx, _reason: &str) -> Result<(), BlockIdx> {
        for (n, block) in blocks.iter_mut().enumerate() {
            let span = self.span(BlockIdx(start.0 + n as u32))?;
            block.contents.copy_from_slice(&self.memory[span]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start: BlockIdx) -> Result<(), BlockIdx> {
        for (n, block) in blocks.iter().enumerate() {
            let span = self.span(BlockIdx(start.0 + n as u32))?;
            self.memory[span].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, BlockIdx> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}

/// A `ChipSelect` that counts its calls.
#[derive(Debug, Default)]
pub struct CountingSelect {
    pub selects: AtomicU32,
    pub deselects: AtomicU32,
    pub active: AtomicBool,
}

impl CountingSelect {
    pub fn counts(&self) -> (u32, u32) {
        (
            self.selects.load(Ordering::SeqCst),
            self.deselects.load(Ordering::SeqCst),
        )
    }
}

impl ChipSelect for CountingSelect {
    fn select(&self) {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    fn deselect(&self) {
        self.deselects.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }
}

enum WriteState {
    AwaitToken(u32),
    Data(u32, Vec<u8>),
}

/// An SDHC card in SPI mode.
///
/// Responses are queued behind `ncr` filler bytes; the scripts let a test
/// make the card misbehave at any step of initialization.
pub struct SimCard {
    selected: bool,
    pub idle_clocks: u32,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    busy: u32,
    write: Option<WriteState>,
    app_cmd: bool,
    ready: bool,
    storage: RamDisk,
    blocks: u32,

    pub ncr: usize,
    /// R1s for successive CMD0s; 0xFF means no answer. Defaults to 0x01.
    pub cmd0_responses: VecDeque<u8>,
    pub cmd8_r1: u8,
    pub r7: Option<[u8; 4]>,
    /// How many ACMD41s answer "still idle".
    pub acmd41_busy: u32,
    /// Answer every ACMD41 with this instead.
    pub acmd41_r1: Option<u8>,
    pub ocr: [u8; 4],
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub write_response: u8,
    pub busy_after_write: u32,

    /// Indices of every command received, in order.
    pub commands: Vec<u8>,
    pub frames: Vec<[u8; 6]>,
    pub selects: u32,
}

impl SimCard {
    /// A card whose capacity comes from `csd`. Keep it small.
    pub fn new(csd: [u8; 16]) -> SimCard {
        let c_size = (u32::from(csd[7] & 0x3F) << 16) | (u32::from(csd[8]) << 8) | u32::from(csd[9]);
        let blocks = (c_size + 1) * 1024;
        SimCard {
            selected: false,
            idle_clocks: 0,
            frame: Vec::new(),
            out: VecDeque::new(),
            busy: 0,
            write: None,
            app_cmd: false,
            ready: false,
            storage: RamDisk::new(blocks),
            blocks,
            ncr: 1,
            cmd0_responses: VecDeque::new(),
            cmd8_r1: R1_IDLE_STATE,
            r7: None,
            acmd41_busy: 0,
            acmd41_r1: None,
            ocr: [0xC0, 0xFF, 0x80, 0x00],
            csd,
            cid: CID,
            write_response: 0xE5,
            busy_after_write: 3,
            commands: Vec::new(),
            frames: Vec::new(),
            selects: 0,
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn block(&mut self, idx: u32) -> Block {
        let mut blocks = [Block::new()];
        self.storage
            .read(&mut blocks, BlockIdx(idx), "inspect")
            .unwrap();
        let [block] = blocks;
        block
    }

    pub fn set_block(&mut self, idx: u32, block: &Block) {
        self.storage
            .write(core::slice::from_ref(block), BlockIdx(idx))
            .unwrap();
    }

    fn set_selected(&mut self, selected: bool) {
        if selected && !self.selected {
            self.selects += 1;
        }
        if !selected {
            self.frame.clear();
            self.out.clear();
            self.write = None;
        }
        self.selected = selected;
    }

    fn status(&self) -> u8 {
        if self.ready {
            R1_READY_STATE
        } else {
            R1_IDLE_STATE
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        for _ in 0..self.ncr {
            self.out.push_back(0xFF);
        }
        self.out.extend(bytes.iter().cloned());
    }

    fn respond_data(&mut self, data: &[u8]) {
        self.respond(&[R1_READY_STATE]);
        self.out.push_back(0xFF);
        self.out.push_back(DATA_START_BLOCK);
        self.out.extend(data.iter().cloned());
        self.out.extend([0x00, 0x00].iter().cloned());
    }

    fn command(&mut self, frame: [u8; 6]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(index);
        self.frames.push(frame);
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);

        if frame[5] != crc7(&frame[..5]) {
            let r1 = self.status() | R1_COM_CRC_ERROR;
            self.respond(&[r1]);
            return;
        }

        match (app_cmd, index) {
            (_, CMD0) => {
                self.ready = false;
                let r1 = self.cmd0_responses.pop_front().unwrap_or(R1_IDLE_STATE);
                if self.idle_clocks >= 74 && r1 != 0xFF {
                    self.respond(&[r1]);
                }
            }
            (false, CMD8) => {
                let r1 = self.cmd8_r1;
                if r1 == R1_IDLE_STATE {
                    let r7 = self
                        .r7
                        .unwrap_or([0, 0, ((arg >> 8) & 0x0F) as u8, arg as u8]);
                    self.respond(&[r1, r7[0], r7[1], r7[2], r7[3]]);
                } else {
                    self.respond(&[r1]);
                }
            }
            (_, CMD55) => {
                self.app_cmd = true;
                let r1 = self.status();
                self.respond(&[r1]);
            }
            (true, ACMD41) => {
                let r1 = if let Some(r1) = self.acmd41_r1 {
                    r1
                } else if self.acmd41_busy > 0 {
                    self.acmd41_busy -= 1;
                    R1_IDLE_STATE
                } else {
                    self.ready = true;
                    R1_READY_STATE
                };
                self.respond(&[r1]);
            }
            (false, CMD58) => {
                let r1 = self.status();
                let ocr = self.ocr;
                self.respond(&[r1, ocr[0], ocr[1], ocr[2], ocr[3]]);
            }
            (false, CMD9) if self.ready => {
                let csd = self.csd;
                self.respond_data(&csd);
            }
            (false, CMD10) if self.ready => {
                let cid = self.cid;
                self.respond_data(&cid);
            }
            (false, CMD17) if self.ready => {
                if arg >= self.blocks {
                    self.respond(&[R1_PARAMETER_ERROR]);
                } else {
                    let block = self.block(arg);
                    self.respond_data(&block.contents);
                }
            }
            (false, CMD24) if self.ready => {
                if arg >= self.blocks {
                    self.respond(&[R1_PARAMETER_ERROR]);
                } else {
                    self.respond(&[R1_READY_STATE]);
                    self.write = Some(WriteState::AwaitToken(arg));
                }
            }
            _ => {
                let r1 = self.status() | R1_ILLEGAL_COMMAND;
                self.respond(&[r1]);
            }
        }
    }

    fn receive_block(&mut self, addr: u32, data: &[u8]) {
        self.out.push_back(self.write_response);
        if self.write_response & DATA_RES_MASK == DATA_RES_ACCEPTED {
            let mut block = Block::new();
            block.contents.copy_from_slice(&data[..Block::LEN]);
            self.set_block(addr, &block);
            self.busy = self.busy_after_write;
        }
    }
}

impl Peripheral for SimCard {
    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            self.idle_clocks += 8;
            return 0xFF;
        }
        if !self.frame.is_empty() {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let mut frame = [0u8; 6];
                frame.copy_from_slice(&self.frame);
                self.frame.clear();
                self.command(frame);
            }
            return 0xFF;
        }
        if let Some(miso) = self.out.pop_front() {
            return miso;
        }
        match self.write.take() {
            Some(WriteState::AwaitToken(addr)) => {
                self.write = if mosi == DATA_START_BLOCK {
                    Some(WriteState::Data(addr, Vec::with_capacity(Block::LEN + 2)))
                } else {
                    Some(WriteState::AwaitToken(addr))
                };
                return 0xFF;
            }
            Some(WriteState::Data(addr, mut data)) => {
                data.push(mosi);
                if data.len() == Block::LEN + 2 {
                    self.receive_block(addr, &data);
                } else {
                    self.write = Some(WriteState::Data(addr, data));
                }
                return 0xFF;
            }
            None => {}
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        if mosi & 0xC0 == 0x40 {
            self.frame.push(mosi);
        }
        0xFF
    }
}

/// The card's chip select line.
pub struct SimCs(pub Rc<RefCell<SimCard>>);

impl OutputPin for SimCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(false);
        Ok(())
    }
}
