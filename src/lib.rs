//! # embedded-sdmmc-dma
//!
//! > A shared, DMA-driven SPI bus and an SD card driver for Embedded Rust
//!
//! This crate lets several drivers share one SPI peripheral. Every transfer
//! is a transaction posted to a [`SpiManager`](spi::SpiManager); a single
//! [`Arbiter`](spi::Arbiter) runs them one after the other over DMA, so
//! nothing else ever touches the peripheral registers. On top of that sits
//! an SD card driver speaking the SPI-mode protocol, exposed as a
//! [`BlockDevice`] of 512-byte blocks for a filesystem or USB mass storage
//! class to consume.
//!
//! It is `#![no_std]`, does not allocate, and waits only through the
//! [`Kernel`] trait, which you implement for your scheduler. Waiting
//! contexts block on [`Signals`] (thread flags, event bits) and are woken by
//! whoever finishes their work, so an idle bus costs no CPU time.
//!
//! ## Using the crate
//!
//! ```rust,ignore
//! static COMPLETION: Completion = Completion::new();
//! static SPI: SpiManager<'static> = SpiManager::new();
//!
//! // In the arbiter task, which owns the hardware:
//! let mut arbiter = Arbiter::new(&SPI, board_spi_dma);
//! arbiter.run(&kernel);
//!
//! // In the DMA interrupt handlers:
//! SPI.on_tx_dma_interrupt(&mut tx_channel);
//! if SPI.on_rx_dma_interrupt(&isr_kernel, &mut rx_channel) {
//!     kernel.request_context_switch();
//! }
//!
//! // In the storage task:
//! let mut card = SdCard::new(&SPI, kernel, &COMPLETION, sd_cs_pin);
//! match card.init() {
//!     Ok(info) => writeln!(uart, "{} MiB card", info.size_mb).unwrap(),
//!     Err(e) => writeln!(uart, "Err: {:?}", e).unwrap(),
//! }
//! let mut block = [0u8; 512];
//! card.read_block(0, &mut block)?;
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `refcell-blockdevice`: `BlockDevice` for `RefCell<T>` and `&RefCell<T>`, so one card can
//! serve several users.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("Enable only one of the `log` and `defmt-log` features");

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("Enable either the `log` or the `defmt-log` feature");

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(test)]
mod sim;

#[macro_use]
mod structure;

pub mod block_device;
pub mod kernel;
pub mod sdmmc;
pub mod sdmmc_proto;
pub mod spi;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
pub use crate::kernel::{ContextId, Kernel, Poll, Signals, Ticks, WAIT_FOREVER};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{AcquireOpts, CardInfo, SdCard};
pub use crate::spi::{Arbiter, Completion, SpiManager, TransferOptions};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
