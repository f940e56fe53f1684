//! embedded-sdmmc-dma - Shared SPI bus
//!
//! One SPI peripheral and one pair of DMA channels, shared by any number of
//! clients. Clients post transactions into a bounded FIFO owned by the
//! [`SpiManager`]; a single [`Arbiter`], running in its own context, is the
//! only code that ever programs the peripheral or the DMA controller.
//!
//! Every transaction carries a [`Completion`] through which the arbiter
//! reports the outcome. The [`SpiManager::transfer`] family borrows the
//! buffers, posts the transaction and waits for it, which is the safe way in.
//! [`SpiManager::submit`] is the raw, non-waiting entry point for interrupt
//! handlers and other callers that manage buffer lifetimes themselves.
//!
//! All waits block through the [`Kernel`]: the arbiter until it is given
//! work or its DMA finishes, requesters until their completion is signaled,
//! and lock contenders until the bus is released.

mod arbiter;
mod completion;
mod irq;


pub use arbiter::{Arbiter, ArbiterConfig};
pub use completion::Completion;
pub use irq::{DmaChannel, DmaFlags, Notification};

use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::spi::{Mode, Phase, Polarity, MODE_0};
use heapless::Deque;
use portable_atomic::{AtomicBool, Ordering};

use crate::kernel::{remaining, ContextId, Kernel, Signals, Ticks, Waiter};
use irq::DmaEvents;

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// How many transactions may wait for the arbiter at once.
pub const QUEUE_LEN: usize = 16;

/// How many contexts may block on the bus lock at once. Further contenders
/// poll once per tick.
pub const LOCK_WAITERS: usize = 8;

/// Default bound, in ticks, on every wait in the SPI layer.
pub const DEFAULT_TIMEOUT: Ticks = 100;

/// The possible errors the SPI layer can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Null or mismatched buffers, zero length, or a clock selector out of range
    InvalidArgument,
    /// The transaction queue has no free slot
    QueueFull,
    /// The transfer did not finish in time
    Timeout,
    /// The DMA controller reported a transfer error
    DmaTransfer,
    /// The bus is locked by another owner, or the completion is still in use
    Busy,
}

/// Selects the SPI bit rate as a power-of-two divider of the peripheral clock.
///
/// The names assume the 40 MHz APB clock the board runs the SPI block from.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpiClock(pub u8);

impl SpiClock {
    /// Number of valid selectors.
    pub const COUNT: u8 = 8;

    pub const MHZ_20: SpiClock = SpiClock(0);
    pub const MHZ_10: SpiClock = SpiClock(1);
    pub const MHZ_5: SpiClock = SpiClock(2);
    pub const KHZ_2500: SpiClock = SpiClock(3);
    pub const KHZ_1250: SpiClock = SpiClock(4);
    pub const KHZ_625: SpiClock = SpiClock(5);
    pub const KHZ_312: SpiClock = SpiClock(6);
    pub const KHZ_156: SpiClock = SpiClock(7);

    /// Is this a selector the hardware supports?
    pub fn is_valid(self) -> bool {
        self.0 < Self::COUNT
    }

    /// The baud rate prescaler for this selector: 2, 4, ... 256.
    pub fn divider(self) -> Option<u16> {
        if self.is_valid() {
            Some(2u16 << self.0)
        } else {
            None
        }
    }
}

/// Per-transaction bus settings.
#[derive(Copy, Clone, PartialEq)]
pub struct TransferOptions {
    /// Clock polarity and phase.
    pub mode: Mode,
    /// Bit rate.
    pub clock: SpiClock,
    /// How long the caller waits for the arbiter to signal completion.
    pub wait: Ticks,
}

impl TransferOptions {
    /// Default options at the given clock.
    pub fn at(clock: SpiClock) -> TransferOptions {
        TransferOptions {
            clock,
            ..Default::default()
        }
    }
}

impl core::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("mode", &mode_number(self.mode))
            .field("clock", &self.clock)
            .field("wait", &self.wait)
            .finish()
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            mode: MODE_0,
            clock: SpiClock::MHZ_20,
            wait: DEFAULT_TIMEOUT,
        }
    }
}

/// Something the arbiter can strobe around a transfer: usually a client's
/// chip-select line.
///
/// The arbiter calls [`ChipSelect::select`] just before starting DMA and
/// [`ChipSelect::deselect`] once the transfer has finished, failed or timed
/// out.
pub trait ChipSelect: Sync {
    /// Assert the select line.
    fn select(&self);
    /// Release the select line.
    fn deselect(&self);
}

/// An active-low chip-select on a GPIO pin, shareable with the arbiter.
pub struct PinSelect<P> {
    pin: Mutex<RefCell<P>>,
}

impl<P> PinSelect<P>
where
    P: OutputPin + Send,
{
    /// Wrap `pin`, driving it high (deselected) first.
    pub fn new(mut pin: P) -> PinSelect<P> {
        if pin.set_high().is_err() {
            warn!("Chip select pin failed to go high");
        }
        PinSelect {
            pin: Mutex::new(RefCell::new(pin)),
        }
    }

    /// Give the pin back.
    pub fn release(self) -> P {
        self.pin.into_inner().into_inner()
    }
}

impl<P> ChipSelect for PinSelect<P>
where
    P: OutputPin + Send,
{
    fn select(&self) {
        let result = critical_section::with(|cs| self.pin.borrow_ref_mut(cs).set_low());
        if result.is_err() {
            warn!("Chip select pin failed to go low");
        }
    }

    fn deselect(&self) {
        let result = critical_section::with(|cs| self.pin.borrow_ref_mut(cs).set_high());
        if result.is_err() {
            warn!("Chip select pin failed to go high");
        }
    }
}

/// The memory side of one full-duplex DMA transfer.
#[derive(Debug, Copy, Clone)]
pub struct DmaTransfer {
    /// Source of the bytes clocked out.
    pub tx: *const u8,
    /// Destination of the bytes clocked in. May equal `tx`.
    pub rx: *mut u8,
    /// Bytes in each direction.
    pub len: usize,
}

/// The SPI peripheral and its two DMA channels, as driven by the arbiter.
pub trait SpiDmaBus {
    /// Program the baud rate prescaler.
    fn set_clock_divider(&mut self, divider: u16);

    /// Program clock polarity and phase.
    fn set_mode(&mut self, mode: Mode);

    /// Program both DMA channels (transmit memory to peripheral, receive
    /// peripheral to memory), enable their complete and error interrupts,
    /// enable the peripheral's DMA requests and start both channels.
    ///
    /// # Safety
    ///
    /// Both buffers must stay valid for `transfer.len` bytes until the
    /// receive channel has signaled or [`SpiDmaBus::abort`] has returned.
    unsafe fn start(&mut self, transfer: DmaTransfer);

    /// Stop both channels. Called when a transfer times out.
    fn abort(&mut self);
}

/// One queued request.
#[derive(Copy, Clone)]
pub(crate) struct Transaction<'a> {
    pub(crate) tx: *const u8,
    pub(crate) rx: *mut u8,
    pub(crate) len: usize,
    pub(crate) mode: Mode,
    pub(crate) clock: SpiClock,
    pub(crate) select: Option<&'a dyn ChipSelect>,
    pub(crate) completion: &'a Completion,
    pub(crate) ticket: u32,
}

// The pointers are only dereferenced by the DMA controller, and only while the
// requester is blocked on `completion`.
unsafe impl Send for Transaction<'_> {}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        tx: *const u8,
        rx: *mut u8,
        len: usize,
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Transaction<'a> {
        Transaction {
            tx,
            rx,
            len,
            mode: options.mode,
            clock: options.clock,
            select,
            completion,
            ticket: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.tx.is_null() || self.rx.is_null() || self.len == 0 || !self.clock.is_valid() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn dma(&self) -> DmaTransfer {
        DmaTransfer {
            tx: self.tx,
            rx: self.rx,
            len: self.len,
        }
    }
}

/// The shared half of the SPI bus: transaction queue, DMA notification and
/// bus lock. Create one (usually as a `static`) and hand out references.
pub struct SpiManager<'a> {
    queue: Mutex<RefCell<Deque<Transaction<'a>, QUEUE_LEN>>>,
    events: DmaEvents,
    arbiter: Waiter,
    locked: AtomicBool,
    contenders: Mutex<RefCell<heapless::Vec<ContextId, LOCK_WAITERS>>>,
}

impl<'a> SpiManager<'a> {
    /// Create an empty manager.
    pub const fn new() -> SpiManager<'a> {
        SpiManager {
            queue: Mutex::new(RefCell::new(Deque::new())),
            events: DmaEvents::new(),
            arbiter: Waiter::new(),
            locked: AtomicBool::new(false),
            contenders: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Post a transaction without waiting for it.
    ///
    /// Usable from task and interrupt context alike. The arbiter is woken;
    /// from an interrupt the kernel is also asked for a context switch so the
    /// arbiter runs promptly. A full queue is reported immediately, never
    /// waited out.
    ///
    /// # Safety
    ///
    /// `tx` must be readable and `rx` writable for `len` bytes, and neither
    /// may be used for anything else, until `completion` has been signaled or
    /// its wait has returned `Timeout`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn submit<K>(
        &self,
        kernel: &K,
        tx: *const u8,
        rx: *mut u8,
        len: usize,
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Result<(), Error>
    where
        K: Kernel,
    {
        let transaction = Transaction::new(tx, rx, len, options, select, completion);
        transaction.validate()?;
        if self.is_locked() {
            return Err(Error::Busy);
        }
        self.enqueue(kernel, transaction)
    }

    /// Exchange `tx` for `rx` (equal lengths) and wait for the result.
    pub fn transfer<K>(
        &self,
        kernel: &K,
        tx: &[u8],
        rx: &mut [u8],
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Result<(), Error>
    where
        K: Kernel,
    {
        let bus = self.lock(kernel, options.wait)?;
        bus.transfer(tx, rx, options, select, completion)
    }

    /// Clock `buf` out and replace it with what came back.
    pub fn transfer_in_place<K>(
        &self,
        kernel: &K,
        buf: &mut [u8],
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Result<(), Error>
    where
        K: Kernel,
    {
        let bus = self.lock(kernel, options.wait)?;
        bus.transfer_in_place(buf, options, select, completion)
    }

    /// Take exclusive use of the bus, blocking up to `timeout` ticks for the
    /// current owner to let go.
    ///
    /// While the guard lives, other clients' transfers wait and raw
    /// submissions are refused, so a multi-transaction sequence cannot be
    /// interleaved with anybody else's traffic.
    pub fn lock<'g, K>(&'g self, kernel: &'g K, timeout: Ticks) -> Result<BusGuard<'g, 'a, K>, Error>
    where
        K: Kernel,
    {
        let me = kernel.current();
        let started = kernel.now();
        loop {
            // Enlist before trying, so a release in between is not missed.
            let enlisted = self.enlist(me);
            if let Some(guard) = self.try_lock(kernel) {
                self.delist(me);
                return Ok(guard);
            }
            let left = remaining(timeout, kernel.elapsed(started));
            if left == 0 {
                self.delist(me);
                return Err(Error::Busy);
            }
            kernel.wait_signal(Signals::BUS, if enlisted { left } else { 1 });
        }
    }

    /// Take exclusive use of the bus if nobody holds it.
    pub fn try_lock<'g, K>(&'g self, kernel: &'g K) -> Option<BusGuard<'g, 'a, K>>
    where
        K: Kernel,
    {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusGuard {
                manager: self,
                kernel,
            })
    }

    /// Is the bus exclusively held?
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Transactions waiting for the arbiter.
    pub fn pending(&self) -> usize {
        critical_section::with(|cs| self.queue.borrow_ref(cs).len())
    }

    /// Transmit DMA channel interrupt. Acknowledges the channel only.
    pub fn on_tx_dma_interrupt<C>(&self, channel: &mut C)
    where
        C: DmaChannel,
    {
        let _ = irq::acknowledge(channel);
    }

    /// Receive DMA channel interrupt. Acknowledges the channel, posts the
    /// outcome and wakes the arbiter. Returns `true` if the arbiter was
    /// notified, in which case the caller should request a context switch on
    /// the way out.
    pub fn on_rx_dma_interrupt<K, C>(&self, kernel: &K, channel: &mut C) -> bool
    where
        K: Kernel,
        C: DmaChannel,
    {
        match irq::acknowledge(channel) {
            Some(notification) => {
                self.events.post(notification);
                self.arbiter.wake(kernel, Signals::DMA);
                true
            }
            None => false,
        }
    }

    pub(crate) fn enqueue<K>(&self, kernel: &K, mut transaction: Transaction<'a>) -> Result<(), Error>
    where
        K: Kernel,
    {
        transaction.validate()?;
        transaction.ticket = transaction.completion.arm()?;
        if let Err(rejected) = self.push(transaction) {
            rejected.completion.disarm(rejected.ticket);
            warn!("SPI queue full, dropping {} byte transfer", rejected.len);
            return Err(Error::QueueFull);
        }
        trace!("Queued {} byte transfer", transaction.len);
        self.arbiter.wake(kernel, Signals::QUEUE);
        if kernel.in_interrupt() {
            kernel.request_context_switch();
        }
        Ok(())
    }

    pub(crate) fn push(&self, transaction: Transaction<'a>) -> Result<(), Transaction<'a>> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).push_back(transaction))
    }

    pub(crate) fn pop(&self) -> Option<Transaction<'a>> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
    }

    pub(crate) fn events(&self) -> &DmaEvents {
        &self.events
    }

    /// Record the context the arbiter runs in.
    pub(crate) fn attach(&self, context: ContextId) {
        self.arbiter.set(context);
    }

    /// Add `context` to the lock contenders. `false` if there is no room.
    fn enlist(&self, context: ContextId) -> bool {
        critical_section::with(|cs| {
            let mut contenders = self.contenders.borrow_ref_mut(cs);
            contenders.contains(&context) || contenders.push(context).is_ok()
        })
    }

    fn delist(&self, context: ContextId) {
        critical_section::with(|cs| {
            self.contenders
                .borrow_ref_mut(cs)
                .retain(|&waiting| waiting != context)
        })
    }

    fn unlock<K>(&self, kernel: &K)
    where
        K: Kernel,
    {
        self.locked.store(false, Ordering::Release);
        let contenders = critical_section::with(|cs| self.contenders.borrow_ref(cs).clone());
        for &context in contenders.iter() {
            kernel.signal(context, Signals::BUS);
        }
    }
}

/// Exclusive use of the bus, from [`SpiManager::lock`]. Released on drop,
/// which wakes the contexts blocked on the lock.
pub struct BusGuard<'g, 'a, K>
where
    K: Kernel,
{
    manager: &'g SpiManager<'a>,
    kernel: &'g K,
}

impl<'g, 'a, K> BusGuard<'g, 'a, K>
where
    K: Kernel,
{
    /// Exchange `tx` for `rx` (equal lengths) and wait for the result.
    pub fn transfer(
        &self,
        tx: &[u8],
        rx: &mut [u8],
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Result<(), Error> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidArgument);
        }
        let transaction = Transaction::new(
            tx.as_ptr(),
            rx.as_mut_ptr(),
            tx.len(),
            options,
            select,
            completion,
        );
        self.manager.enqueue(self.kernel, transaction)?;
        completion.wait(self.kernel, options.wait)
    }

    /// Clock `buf` out and replace it with what came back.
    pub fn transfer_in_place(
        &self,
        buf: &mut [u8],
        options: TransferOptions,
        select: Option<&'a dyn ChipSelect>,
        completion: &'a Completion,
    ) -> Result<(), Error> {
        let ptr = buf.as_mut_ptr();
        let transaction =
            Transaction::new(ptr as *const u8, ptr, buf.len(), options, select, completion);
        self.manager.enqueue(self.kernel, transaction)?;
        completion.wait(self.kernel, options.wait)
    }

    /// The scheduler this guard waits through.
    pub fn kernel(&self) -> &'g K {
        self.kernel
    }
}

impl<K> Drop for BusGuard<'_, '_, K>
where
    K: Kernel,
{
    fn drop(&mut self) {
        self.manager.unlock(self.kernel);
    }
}

/// The SPI mode number (0 to 3) for logging.
pub(crate) fn mode_number(mode: Mode) -> u8 {
    let polarity = match mode.polarity {
        Polarity::IdleLow => 0,
        Polarity::IdleHigh => 2,
    };
    let phase = match mode.phase {
        Phase::CaptureOnFirstTransition => 0,
        Phase::CaptureOnSecondTransition => 1,
    };
    polarity | phase
}
