//! embedded-sdmmc-dma - Scheduler services
//!
//! Everything in this crate that waits does so through a [`Kernel`]. On
//! target this wraps the RTOS (tick count, task delay, task notifications,
//! "am I in an ISR"); in tests it is a fake tick counter, which makes every
//! timeout exact and repeatable.
//!
//! Blocking waits use per-context [`Signals`], in the manner of thread flags
//! or task notifications: a bit set with [`Kernel::signal`] stays pending
//! until the target context consumes it with [`Kernel::wait_signal`], so a
//! wake-up sent before the target starts waiting is never lost.

use portable_atomic::{AtomicUsize, Ordering};

/// A point in time, or a duration, in scheduler ticks. Wraps around.
pub type Ticks = u32;

/// Identifies a task to [`Kernel::signal`]. `ContextId::MAX` is reserved.
pub type ContextId = usize;

/// A timeout that never expires.
pub const WAIT_FOREVER: Ticks = Ticks::MAX;

bitflags::bitflags! {
    /// The wake-up reasons this crate delivers to a blocked context.
    pub struct Signals: u32 {
        /// A transaction was queued for the arbiter.
        const QUEUE = 1 << 0;
        /// The receive DMA interrupt posted a notification.
        const DMA = 1 << 1;
        /// The arbiter finished a request the context is waiting for.
        const COMPLETION = 1 << 2;
        /// The bus lock was released.
        const BUS = 1 << 3;
    }
}

/// The services of the scheduler the crate runs on.
pub trait Kernel {
    /// The current tick count.
    fn now(&self) -> Ticks;

    /// Suspend the calling context for `ticks` ticks.
    fn delay(&self, ticks: Ticks);

    /// Give other contexts of equal or lower priority a chance to run.
    fn yield_now(&self);

    /// The calling context.
    fn current(&self) -> ContextId;

    /// Block the calling context until one of `mask` is pending for it, or
    /// `timeout` ticks have passed.
    ///
    /// Consumes and returns the pending bits in `mask`; empty on timeout.
    /// Bits outside `mask` stay pending. [`WAIT_FOREVER`] never times out.
    fn wait_signal(&self, mask: Signals, timeout: Ticks) -> Signals;

    /// Make `bits` pending for `context`, waking it if it waits for any of
    /// them. Must be callable from interrupt context.
    fn signal(&self, context: ContextId, bits: Signals);

    /// Are we executing in interrupt context?
    fn in_interrupt(&self) -> bool {
        false
    }

    /// Ask for a context switch once the current interrupt returns.
    fn request_context_switch(&self) {}

    /// Ticks elapsed since `start`.
    fn elapsed(&self, start: Ticks) -> Ticks {
        self.now().wrapping_sub(start)
    }
}

impl<T> Kernel for &T
where
    T: Kernel,
{
    fn now(&self) -> Ticks {
        (*self).now()
    }

    fn delay(&self, ticks: Ticks) {
        (*self).delay(ticks)
    }

    fn yield_now(&self) {
        (*self).yield_now()
    }

    fn current(&self) -> ContextId {
        (*self).current()
    }

    fn wait_signal(&self, mask: Signals, timeout: Ticks) -> Signals {
        (*self).wait_signal(mask, timeout)
    }

    fn signal(&self, context: ContextId, bits: Signals) {
        (*self).signal(context, bits)
    }

    fn in_interrupt(&self) -> bool {
        (*self).in_interrupt()
    }

    fn request_context_switch(&self) {
        (*self).request_context_switch()
    }
}

/// What is left of `timeout` after `waited` ticks.
pub(crate) fn remaining(timeout: Ticks, waited: Ticks) -> Ticks {
    if timeout == WAIT_FOREVER {
        WAIT_FOREVER
    } else {
        timeout.saturating_sub(waited)
    }
}

const NOBODY: ContextId = ContextId::MAX;

/// A slot naming the context to wake, if any.
pub(crate) struct Waiter {
    context: AtomicUsize,
}

impl Waiter {
    pub(crate) const fn new() -> Waiter {
        Waiter {
            context: AtomicUsize::new(NOBODY),
        }
    }

    pub(crate) fn set(&self, context: ContextId) {
        self.context.store(context, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.context.store(NOBODY, Ordering::Release);
    }

    /// Signal the registered context. Returns `false` if there is none.
    pub(crate) fn wake<K>(&self, kernel: &K, bits: Signals) -> bool
    where
        K: Kernel,
    {
        match self.context.load(Ordering::Acquire) {
            NOBODY => false,
            context => {
                kernel.signal(context, bits);
                true
            }
        }
    }
}

/// How long a polling loop may keep trying.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollLimit {
    /// Give up after this many unsuccessful attempts.
    Attempts(u32),
    /// Give up once this many ticks have passed since the first attempt.
    Elapsed(Ticks),
}

/// A bounded retry policy for busy-polling loops.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Poll {
    /// When to give up.
    pub limit: PollLimit,
    /// Pause between attempts. Zero means "just yield".
    pub interval: Ticks,
}

impl Poll {
    /// Retry up to `attempts` times, `interval` ticks apart.
    pub const fn attempts(attempts: u32, interval: Ticks) -> Poll {
        Poll {
            limit: PollLimit::Attempts(attempts),
            interval,
        }
    }

    /// Retry for up to `budget` ticks, `interval` ticks apart.
    pub const fn elapsed(budget: Ticks, interval: Ticks) -> Poll {
        Poll {
            limit: PollLimit::Elapsed(budget),
            interval,
        }
    }

    /// Start a polling loop governed by this policy.
    pub fn start<K>(self, kernel: &K) -> Poller<'_, K>
    where
        K: Kernel,
    {
        Poller {
            kernel,
            policy: self,
            started: kernel.now(),
            attempts: 0,
        }
    }
}

/// One run of a [`Poll`] policy.
///
/// Call [`Poller::retry`] after every unsuccessful attempt: it either pauses
/// and lets you go round again, or hands back the error you gave it.
pub struct Poller<'k, K> {
    kernel: &'k K,
    policy: Poll,
    started: Ticks,
    attempts: u32,
}

impl<'k, K> Poller<'k, K>
where
    K: Kernel,
{
    /// Record a failed attempt. Returns `Err(err)` once the budget is spent.
    pub fn retry<E>(&mut self, err: E) -> Result<(), E> {
        self.attempts += 1;
        let exhausted = match self.policy.limit {
            PollLimit::Attempts(max) => self.attempts >= max,
            PollLimit::Elapsed(budget) => self.kernel.elapsed(self.started) >= budget,
        };
        if exhausted {
            return Err(err);
        }
        if self.policy.interval == 0 {
            self.kernel.yield_now();
        } else {
            self.kernel.delay(self.policy.interval);
        }
        Ok(())
    }

    /// Unsuccessful attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
