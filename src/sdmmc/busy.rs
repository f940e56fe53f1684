use embedded_hal::digital::v2::OutputPin;

use crate::block_device::Block;
use crate::kernel::{Kernel, Ticks};
use crate::sdmmc_proto::*;
use crate::spi::{BusGuard, Completion, TransferOptions};

use super::{AcquireOpts, Error};

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// A struct used to ensure that communication only occurs
/// when CS is low.
///
/// Holds the bus lock for its lifetime and deasserts chip select on drop, on
/// every path out of a command sequence.
pub(crate) struct SdMmcSpiBusy<'b, 'g, 'a, K, CS>
where
    K: Kernel,
    CS: OutputPin,
{
    bus: &'b BusGuard<'g, 'a, K>,
    completion: &'a Completion,
    cs: &'b mut CS,
    scratch: &'b mut Block,
    opts: &'b AcquireOpts,
    options: TransferOptions,
}

impl<'b, 'g, 'a, K, CS> Drop for SdMmcSpiBusy<'b, 'g, 'a, K, CS>
where
    K: Kernel,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.deselect().ok();
    }
}

impl<'b, 'g, 'a, K, CS> SdMmcSpiBusy<'b, 'g, 'a, K, CS>
where
    K: Kernel,
    CS: OutputPin,
{
    pub fn new(
        bus: &'b BusGuard<'g, 'a, K>,
        completion: &'a Completion,
        cs: &'b mut CS,
        scratch: &'b mut Block,
        opts: &'b AcquireOpts,
        options: TransferOptions,
    ) -> Result<Self, Error> {
        let mut me = Self {
            bus,
            completion,
            cs,
            scratch,
            opts,
            options,
        };
        me.select()?;
        Ok(me)
    }

    pub fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::GpioError)
    }

    pub fn deselect(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)
    }

    fn kernel(&self) -> &'g K {
        self.bus.kernel()
    }

    pub fn delay(&self, ticks: Ticks) {
        self.kernel().delay(ticks)
    }

    /// Clock `buf` out and replace it with the card's reply, in one DMA
    /// transaction.
    fn exchange(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.bus
            .transfer_in_place(buf, self.options, None, self.completion)
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        let mut byte = [0xFF];
        self.exchange(&mut byte)?;
        Ok(byte[0])
    }

    /// Fill `buffer` from the card while clocking out 0xFF.
    pub fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer.iter_mut() {
            *b = 0xFF;
        }
        self.exchange(buffer)
    }

    /// Send `data`. Whatever the card clocks back is dropped in the scratch
    /// block.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(Block::LEN) {
            let sink = &mut self.scratch.contents[..chunk.len()];
            self.bus
                .transfer(chunk, sink, self.options, None, self.completion)
                .map_err(Error::Transport)?;
        }
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let kernel = self.kernel();
        let mut poll = self.opts.busy_poll.start(kernel);
        loop {
            if self.receive()? == 0xFF {
                return Ok(());
            }
            poll.retry(Error::TimeoutWaitNotBusy)?;
        }
    }

    /// Read bytes until one has bit 7 clear: that's the R1.
    pub fn read_r1(&mut self, command: u8) -> Result<u8, Error> {
        let kernel = self.kernel();
        let mut poll = self.opts.r1_poll.start(kernel);
        loop {
            let r1 = self.receive()?;
            if r1 & R1_START_BIT == 0 {
                return Ok(r1);
            }
            poll.retry(Error::TimeoutCommand(command))?;
        }
    }

    /// Skip 0xFF filler until `token` arrives.
    pub fn wait_data_token(&mut self, token: u8) -> Result<(), Error> {
        let kernel = self.kernel();
        let mut poll = self.opts.token_poll.start(kernel);
        loop {
            match self.receive()? {
                b if b == token => return Ok(()),
                0xFF => poll.retry(Error::TimeoutDataToken)?,
                b => return Err(Error::UnexpectedToken(b)),
            }
        }
    }

    /// Send a command frame without waiting for anything.
    pub fn send_command(&mut self, command: u8, arg: u32) -> Result<(), Error> {
        trace!("CMD{} arg {:x}", command, arg);
        self.write_bytes(&command_frame(command, arg))
    }

    /// Perform a command.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.wait_not_busy()?;
        self.send_command(command, arg)?;
        self.read_r1(command)
    }

    /// Read a data block: start token, payload, two CRC bytes. The CRC is
    /// clocked out and dropped; the card runs with CRC checking off.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.wait_data_token(DATA_START_BLOCK)?;
        self.read_bytes(buffer)?;
        let mut crc = [0xFF; 2];
        self.read_bytes(&mut crc)
    }

    /// Write a data block and check the card's data response.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.write_bytes(&[token])?;
        self.write_bytes(buffer)?;
        self.write_bytes(&[0xFF, 0xFF])?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteRejected(status))
        } else {
            Ok(())
        }
    }
}
