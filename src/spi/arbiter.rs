//! embedded-sdmmc-dma - Bus arbiter
//!
//! The arbiter is the single owner of the SPI peripheral. It takes one
//! transaction at a time from the manager's queue, configures the bus for
//! it, runs it to completion over DMA and reports the outcome through the
//! transaction's [`Completion`](super::Completion).
//!
//! Between transactions the arbiter sleeps on [`Signals::QUEUE`]; while DMA
//! runs it sleeps on [`Signals::DMA`]. It never polls.

use super::{mode_number, Error, SpiDmaBus, SpiManager, Transaction, DEFAULT_TIMEOUT};
use crate::kernel::{remaining, Kernel, Signals, Ticks, WAIT_FOREVER};
use crate::spi::irq::Notification;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Arbiter tuning.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// How long to wait for the receive DMA interrupt before aborting.
    pub dma_timeout: Ticks,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            dma_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Executes queued transactions, one at a time, in FIFO order.
pub struct Arbiter<'m, 'a, B>
where
    B: SpiDmaBus,
{
    manager: &'m SpiManager<'a>,
    bus: B,
    config: ArbiterConfig,
}

impl<'m, 'a, B> Arbiter<'m, 'a, B>
where
    B: SpiDmaBus,
{
    /// Create an arbiter for `manager`'s queue, driving `bus`.
    pub fn new(manager: &'m SpiManager<'a>, bus: B) -> Arbiter<'m, 'a, B> {
        Arbiter::with_config(manager, bus, ArbiterConfig::default())
    }

    /// Create an arbiter with non-default tuning.
    pub fn with_config(
        manager: &'m SpiManager<'a>,
        bus: B,
        config: ArbiterConfig,
    ) -> Arbiter<'m, 'a, B> {
        Arbiter {
            manager,
            bus,
            config,
        }
    }

    /// Borrow the bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Give the bus back.
    pub fn free(self) -> B {
        self.bus
    }

    /// The arbiter's task body. Never returns.
    ///
    /// Run it in the highest-priority context that uses the bus.
    pub fn run<K>(&mut self, kernel: &K) -> !
    where
        K: Kernel,
    {
        loop {
            if !self.service(kernel) {
                kernel.wait_signal(Signals::QUEUE, WAIT_FOREVER);
            }
        }
    }

    /// Execute the transaction at the head of the queue, if there is one.
    ///
    /// Must be called from the arbiter's own context: it registers that
    /// context as the one producers and the DMA interrupt wake. Returns
    /// `false` if the queue was empty.
    pub fn service<K>(&mut self, kernel: &K) -> bool
    where
        K: Kernel,
    {
        self.manager.attach(kernel.current());
        let transaction = match self.manager.pop() {
            Some(t) => t,
            None => return false,
        };
        if !transaction.completion.claim(transaction.ticket) {
            debug!("Skipping withdrawn transfer");
            return true;
        }
        let result = self.execute(kernel, &transaction);
        transaction
            .completion
            .finish(kernel, transaction.ticket, result);
        true
    }

    fn execute<K>(&mut self, kernel: &K, transaction: &Transaction<'a>) -> Result<(), Error>
    where
        K: Kernel,
    {
        transaction.validate()?;
        let divider = transaction.clock.divider().ok_or(Error::InvalidArgument)?;
        trace!(
            "Transfer {} bytes, divider {}, mode {}",
            transaction.len,
            divider,
            mode_number(transaction.mode)
        );
        self.bus.set_clock_divider(divider);
        self.bus.set_mode(transaction.mode);

        self.manager.events().clear();
        // Drop a wake-up left over from an earlier, timed out transfer.
        kernel.wait_signal(Signals::DMA, 0);
        if let Some(select) = transaction.select {
            select.select();
        }

        // Safety: the requester keeps both buffers alive until the
        // completion is finished, which happens below.
        unsafe { self.bus.start(transaction.dma()) };

        let result = match self.wait_for_dma(kernel) {
            None => {
                warn!("DMA timeout after {} ticks", self.config.dma_timeout);
                self.bus.abort();
                Err(Error::Timeout)
            }
            Some(n) if n.contains(Notification::ERROR) => {
                warn!("DMA transfer error");
                Err(Error::DmaTransfer)
            }
            Some(_) => Ok(()),
        };

        if let Some(select) = transaction.select {
            select.deselect();
        }
        result
    }

    fn wait_for_dma<K>(&self, kernel: &K) -> Option<Notification>
    where
        K: Kernel,
    {
        let events = self.manager.events();
        let started = kernel.now();
        loop {
            let notification = events.take();
            if !notification.is_empty() {
                return Some(notification);
            }
            let left = remaining(self.config.dma_timeout, kernel.elapsed(started));
            if left == 0 {
                return None;
            }
            kernel.wait_signal(Signals::DMA, left);
        }
    }
}
