//! embedded-sdmmc-dma - DMA interrupt handling
//!
//! The transmit and receive DMA channels each raise an interrupt on
//! transfer-complete or transfer-error. Both handlers acknowledge the
//! hardware, but only the receive side tells the arbiter: in a full-duplex
//! transfer the last byte is received after it is sent, so receive-complete
//! is "transaction done".

use portable_atomic::{AtomicU8, Ordering};

bitflags::bitflags! {
    /// Interrupt status flags of one DMA channel.
    pub struct DmaFlags: u8 {
        /// Transfer complete.
        const TRANSFER_COMPLETE = 0b0000_0001;
        /// Half transfer.
        const HALF_TRANSFER = 0b0000_0010;
        /// Transfer error.
        const TRANSFER_ERROR = 0b0000_0100;
    }
}

bitflags::bitflags! {
    /// What the receive interrupt tells the arbiter.
    pub struct Notification: u8 {
        /// The transaction's last byte has landed in memory.
        const COMPLETE = 0b01;
        /// The DMA controller reported a bus error.
        const ERROR = 0b10;
    }
}

/// The interrupt-side view of one DMA channel.
pub trait DmaChannel {
    /// Read the channel's pending interrupt flags.
    fn flags(&mut self) -> DmaFlags;
    /// Acknowledge the given flags.
    fn clear_flags(&mut self, flags: DmaFlags);
    /// Stop the channel.
    fn disable(&mut self);
}

/// Notification bits delivered from interrupt context to the arbiter.
pub(crate) struct DmaEvents {
    bits: AtomicU8,
}

impl DmaEvents {
    pub(crate) const fn new() -> DmaEvents {
        DmaEvents {
            bits: AtomicU8::new(0),
        }
    }

    pub(crate) fn post(&self, notification: Notification) {
        self.bits.fetch_or(notification.bits(), Ordering::AcqRel);
    }

    pub(crate) fn take(&self) -> Notification {
        Notification::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn clear(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

/// Acknowledge whichever of complete/error is pending and stop the channel.
///
/// Complete is checked first; a channel never reports both for one transfer.
pub(crate) fn acknowledge<C>(channel: &mut C) -> Option<Notification>
where
    C: DmaChannel,
{
    let flags = channel.flags();
    if flags.contains(DmaFlags::TRANSFER_COMPLETE) {
        channel.clear_flags(DmaFlags::TRANSFER_COMPLETE);
        channel.disable();
        Some(Notification::COMPLETE)
    } else if flags.contains(DmaFlags::TRANSFER_ERROR) {
        channel.clear_flags(DmaFlags::TRANSFER_ERROR);
        channel.disable();
        Some(Notification::ERROR)
    } else {
        None
    }
}
