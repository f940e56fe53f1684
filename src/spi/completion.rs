//! embedded-sdmmc-dma - Request completion
//!
//! A [`Completion`] is the synchronization handle a requester hands to the
//! SPI manager together with its transaction. The arbiter writes the
//! transaction's status into it and signals it; the requester waits on it.
//!
//! The state word packs a ticket (bumped on every request) with a two-bit
//! phase. The ticket lets the arbiter recognise queue entries whose requester
//! has already given up, so a reused handle is never confused with a stale
//! entry.
//!
//! A requester blocked in [`Completion::wait`] is woken with
//! [`Signals::COMPLETION`] when the arbiter finishes its request.

use portable_atomic::{AtomicU32, AtomicU8, Ordering};

use super::Error;
use crate::kernel::{remaining, Kernel, Signals, Ticks, Waiter, WAIT_FOREVER};

const PHASE_MASK: u32 = 0b11;
const TICKET_STEP: u32 = PHASE_MASK + 1;

const IDLE: u32 = 0;
const QUEUED: u32 = 1;
const ACTIVE: u32 = 2;
const DONE: u32 = 3;

const STATUS_OK: u8 = 0;
const STATUS_INVALID_ARGUMENT: u8 = 1;
const STATUS_TIMEOUT: u8 = 2;
const STATUS_DMA_TRANSFER: u8 = 3;

/// Binary-semaphore style completion handle with a status slot.
pub struct Completion {
    state: AtomicU32,
    status: AtomicU8,
    waiter: Waiter,
}

impl Completion {
    /// Create an idle handle.
    pub const fn new() -> Completion {
        Completion {
            state: AtomicU32::new(IDLE),
            status: AtomicU8::new(STATUS_OK),
            waiter: Waiter::new(),
        }
    }

    /// Is a request using this handle queued or being executed?
    pub fn is_pending(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire) & PHASE_MASK, QUEUED | ACTIVE)
    }

    /// Take the result of a finished request.
    ///
    /// Returns `None` if nothing has been signaled since the last take.
    pub fn take(&self) -> Option<Result<(), Error>> {
        let current = self.state.load(Ordering::Acquire);
        if current & PHASE_MASK != DONE {
            return None;
        }
        let idle = (current & !PHASE_MASK) | IDLE;
        self.state
            .compare_exchange(current, idle, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(decode_status(self.status.load(Ordering::Acquire)))
    }

    /// Block until the outstanding request is signaled.
    ///
    /// If `timeout` passes before the arbiter has picked the request up, the
    /// request is withdrawn and `Timeout` is returned. A request the arbiter
    /// has already started is always waited out: its buffers are in use.
    pub fn wait<K>(&self, kernel: &K, timeout: Ticks) -> Result<(), Error>
    where
        K: Kernel,
    {
        self.waiter.set(kernel.current());
        let result = self.block(kernel, timeout);
        self.waiter.clear();
        result
    }

    fn block<K>(&self, kernel: &K, timeout: Ticks) -> Result<(), Error>
    where
        K: Kernel,
    {
        let started = kernel.now();
        loop {
            if let Some(result) = self.take() {
                return result;
            }
            let mut left = remaining(timeout, kernel.elapsed(started));
            if left == 0 {
                let current = self.state.load(Ordering::Acquire);
                match current & PHASE_MASK {
                    QUEUED => {
                        let withdrawn = (current & !PHASE_MASK) | IDLE;
                        if self
                            .state
                            .compare_exchange(
                                current,
                                withdrawn,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Err(Error::Timeout);
                        }
                        // Claimed under our feet; fall through and wait it out.
                        left = WAIT_FOREVER;
                    }
                    IDLE => return Err(Error::Timeout),
                    _ => left = WAIT_FOREVER,
                }
            }
            kernel.wait_signal(Signals::COMPLETION, left);
        }
    }

    /// Prepare for a new request. Returns the ticket to put in the queue.
    pub(crate) fn arm(&self) -> Result<u32, Error> {
        let current = self.state.load(Ordering::Acquire);
        if matches!(current & PHASE_MASK, QUEUED | ACTIVE) {
            return Err(Error::Busy);
        }
        let ticket = (current & !PHASE_MASK).wrapping_add(TICKET_STEP);
        self.state
            .compare_exchange(
                current,
                ticket | QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::Busy)?;
        Ok(ticket)
    }

    /// Undo [`Completion::arm`] when the request never made it into the queue.
    pub(crate) fn disarm(&self, ticket: u32) {
        let _ = self.state.compare_exchange(
            ticket | QUEUED,
            ticket | IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Called by the arbiter before touching a request's buffers.
    ///
    /// Fails if the requester has withdrawn this ticket.
    pub(crate) fn claim(&self, ticket: u32) -> bool {
        self.state
            .compare_exchange(
                ticket | QUEUED,
                ticket | ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish the status of a claimed request and wake the requester.
    pub(crate) fn finish<K>(&self, kernel: &K, ticket: u32, result: Result<(), Error>)
    where
        K: Kernel,
    {
        self.status.store(encode_status(result), Ordering::Release);
        if self
            .state
            .compare_exchange(
                ticket | ACTIVE,
                ticket | DONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.waiter.wake(kernel, Signals::COMPLETION);
        }
    }
}

impl Default for Completion {
    fn default() -> Completion {
        Completion::new()
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("Completion")
            .field("ticket", &(state >> 2))
            .field("phase", &(state & PHASE_MASK))
            .finish()
    }
}

fn encode_status(result: Result<(), Error>) -> u8 {
    match result {
        Ok(()) => STATUS_OK,
        Err(Error::InvalidArgument) => STATUS_INVALID_ARGUMENT,
        Err(Error::Timeout) => STATUS_TIMEOUT,
        Err(_) => STATUS_DMA_TRANSFER,
    }
}

fn decode_status(status: u8) -> Result<(), Error> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_INVALID_ARGUMENT => Err(Error::InvalidArgument),
        STATUS_TIMEOUT => Err(Error::Timeout),
        _ => Err(Error::DmaTransfer),
    }
}
