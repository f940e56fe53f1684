//! embedded-sdmmc-dma - SDMMC Protocol
//!
//! Implements the SD card SPI-mode protocol on top of the shared SPI bus.
//! Every byte goes through the [`SpiManager`] as a DMA transaction; the card
//! driver never touches the peripheral itself. It does drive its own chip
//! select, because SPI mode is entered by clocking with chip select high.
//!
//! Only SDHC/SDXC (CSD version 2) cards are supported.

mod busy;
use busy::SdMmcSpiBusy;


use embedded_hal::digital::v2::{InputPin, OutputPin};

use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::kernel::{Kernel, Poll, Ticks};
use crate::sdmmc_proto::*;
use crate::spi::{self, Completion, SpiClock, SpiManager, TransferOptions};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Bytes of 0xFF clocked with chip select high before CMD0: 192 clocks.
const DUMMY_BYTES: usize = 24;

/// The possible errors `SdCard` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI layer
    Transport(spi::Error),
    /// The card-detect switch says there is no card
    NotPresent,
    /// The card did not answer CMD0 or CMD8 the way an SD card should
    UnknownCard,
    /// The card is an SD card, but not one we can drive (v1, standard
    /// capacity, or an unexpected CSD layout)
    Unsupported,
    /// The card returned this unexpected R1 status
    R1Error(u8),
    /// We were waiting for a data token and got this byte instead
    UnexpectedToken(u8),
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a response when executing this application-specific command
    TimeoutACommand(u8),
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// The data start token never arrived
    TimeoutDataToken,
    /// The card refused a data block with this response token
    WriteRejected(u8),
    /// Can't perform this operation before the card is initialized
    NotInitialized,
    /// The block address is beyond the end of the card
    InvalidArgument,
    /// Couldn't set a GPIO pin
    GpioError,
}

impl From<spi::Error> for Error {
    fn from(e: spi::Error) -> Error {
        Error::Transport(e)
    }
}

/// What we learned about the card during initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// The CSD_STRUCTURE field: 1 for CSD version 2.
    pub csd_version: u8,
    /// Capacity in 512-byte blocks.
    pub block_count: u32,
    /// Erase sector size in bytes.
    pub erase_sector_size: u32,
    /// Capacity in MiB.
    pub size_mb: u32,
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AcquireOpts {
    /// Clock for everything up to and including CMD58. Must be 400 kHz or less.
    pub init_clock: SpiClock,
    /// Clock for register reads and data transfers once the card is ready.
    pub data_clock: SpiClock,
    /// Wait bound for each SPI transaction.
    pub spi_timeout: Ticks,
    /// Wait bound for getting hold of the bus.
    pub lock_timeout: Ticks,
    /// Waiting for the card to release MISO.
    pub busy_poll: Poll,
    /// Waiting for a data start token.
    pub token_poll: Poll,
    /// Waiting for an R1 after a command frame.
    pub r1_poll: Poll,
    /// The whole CMD55/ACMD41 loop.
    pub init_poll: Poll,
    /// Settling time after power on.
    pub power_up_delay: Ticks,
    /// Pause between CMD0 and its R1, and around the CMD0 retry.
    pub cmd0_settle: Ticks,
    /// How often to ask the card-detect switch.
    pub detect_polls: u32,
    /// Pause between card-detect polls.
    pub detect_interval: Ticks,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            init_clock: SpiClock::KHZ_156,
            data_clock: SpiClock::MHZ_10,
            spi_timeout: spi::DEFAULT_TIMEOUT,
            lock_timeout: 1000,
            busy_poll: Poll::elapsed(1000, 0),
            token_poll: Poll::elapsed(200, 0),
            r1_poll: Poll::attempts(32, 1),
            init_poll: Poll::elapsed(1000, 1),
            power_up_delay: 500,
            cmd0_settle: 10,
            detect_polls: 10,
            detect_interval: 10,
        }
    }
}

/// A card-detect switch.
pub trait CardDetect {
    /// Is there a card in the socket?
    fn card_present(&mut self) -> Result<bool, Error>;
}

/// For sockets without a card-detect switch.
#[derive(Debug, Default, Copy, Clone)]
pub struct AlwaysPresent;

impl CardDetect for AlwaysPresent {
    fn card_present(&mut self) -> Result<bool, Error> {
        Ok(true)
    }
}

/// A card-detect switch on a GPIO input.
pub struct DetectPin<P> {
    pin: P,
    active_high: bool,
}

impl<P> DetectPin<P>
where
    P: InputPin,
{
    /// The pin reads low when a card is inserted.
    pub fn active_low(pin: P) -> DetectPin<P> {
        DetectPin {
            pin,
            active_high: false,
        }
    }

    /// The pin reads high when a card is inserted.
    pub fn active_high(pin: P) -> DetectPin<P> {
        DetectPin {
            pin,
            active_high: true,
        }
    }
}

impl<P> CardDetect for DetectPin<P>
where
    P: InputPin,
{
    fn card_present(&mut self) -> Result<bool, Error> {
        let high = self.pin.is_high().map_err(|_| Error::GpioError)?;
        Ok(high == self.active_high)
    }
}

/// Switchable card supply.
pub trait PowerSwitch {
    /// Turn the card's supply on or off.
    fn set_power(&mut self, on: bool) -> Result<(), Error>;
}

/// For boards where the card is always powered.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoPowerSwitch;

impl PowerSwitch for NoPowerSwitch {
    fn set_power(&mut self, _on: bool) -> Result<(), Error> {
        Ok(())
    }
}

/// A load switch on a GPIO output.
pub struct PowerPin<P> {
    pin: P,
    active_high: bool,
}

impl<P> PowerPin<P>
where
    P: OutputPin,
{
    /// Driving the pin low powers the card.
    pub fn active_low(pin: P) -> PowerPin<P> {
        PowerPin {
            pin,
            active_high: false,
        }
    }

    /// Driving the pin high powers the card.
    pub fn active_high(pin: P) -> PowerPin<P> {
        PowerPin {
            pin,
            active_high: true,
        }
    }
}

impl<P> PowerSwitch for PowerPin<P>
where
    P: OutputPin,
{
    fn set_power(&mut self, on: bool) -> Result<(), Error> {
        let result = if on == self.active_high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|_| Error::GpioError)
    }
}

/// An SD card on the shared SPI bus.
///
/// Built from a reference to the bus manager, the scheduler, a completion
/// handle for its transactions and its chip select pin. Card detect and power
/// switch are optional and added with [`SdCard::with_card_detect`] and
/// [`SdCard::with_power_switch`].
pub struct SdCard<'m, 'a, K, CS, D = AlwaysPresent, P = NoPowerSwitch>
where
    K: Kernel,
    CS: OutputPin,
    D: CardDetect,
    P: PowerSwitch,
{
    manager: &'m SpiManager<'a>,
    kernel: K,
    completion: &'a Completion,
    cs: CS,
    detect: D,
    power: P,
    opts: AcquireOpts,
    session: Option<CardInfo>,
    scratch: Block,
}

impl<'m, 'a, K, CS> SdCard<'m, 'a, K, CS>
where
    K: Kernel,
    CS: OutputPin,
{
    /// Create a new, uninitialized card.
    pub fn new(
        manager: &'m SpiManager<'a>,
        kernel: K,
        completion: &'a Completion,
        cs: CS,
    ) -> SdCard<'m, 'a, K, CS> {
        SdCard::new_with_opts(manager, kernel, completion, cs, AcquireOpts::default())
    }

    /// Create a new, uninitialized card with non-default timing.
    pub fn new_with_opts(
        manager: &'m SpiManager<'a>,
        kernel: K,
        completion: &'a Completion,
        cs: CS,
        opts: AcquireOpts,
    ) -> SdCard<'m, 'a, K, CS> {
        SdCard {
            manager,
            kernel,
            completion,
            cs,
            detect: AlwaysPresent,
            power: NoPowerSwitch,
            opts,
            session: None,
            scratch: Block::new(),
        }
    }
}

impl<'m, 'a, K, CS, D, P> SdCard<'m, 'a, K, CS, D, P>
where
    K: Kernel,
    CS: OutputPin,
    D: CardDetect,
    P: PowerSwitch,
{
    /// Check `detect` before initializing.
    pub fn with_card_detect<D2>(self, detect: D2) -> SdCard<'m, 'a, K, CS, D2, P>
    where
        D2: CardDetect,
    {
        SdCard {
            manager: self.manager,
            kernel: self.kernel,
            completion: self.completion,
            cs: self.cs,
            detect,
            power: self.power,
            opts: self.opts,
            session: None,
            scratch: self.scratch,
        }
    }

    /// Power the card through `power`.
    pub fn with_power_switch<P2>(self, power: P2) -> SdCard<'m, 'a, K, CS, D, P2>
    where
        P2: PowerSwitch,
    {
        SdCard {
            manager: self.manager,
            kernel: self.kernel,
            completion: self.completion,
            cs: self.cs,
            detect: self.detect,
            power,
            opts: self.opts,
            session: None,
            scratch: self.scratch,
        }
    }

    /// Give back the pins.
    pub fn free(self) -> (CS, D, P) {
        (self.cs, self.detect, self.power)
    }

    /// Initializes the card into a known state.
    ///
    /// Does nothing if the card is already initialized. On failure the card
    /// stays uninitialized until the next call.
    pub fn init(&mut self) -> Result<CardInfo, Error> {
        if let Some(info) = self.session {
            return Ok(info);
        }
        debug!("Initializing card with opts: {:?}", self.opts);
        self.power.set_power(true)?;
        if !self.card_present()? {
            warn!("No card in socket");
            self.power.set_power(false)?;
            return Err(Error::NotPresent);
        }
        self.kernel.delay(self.opts.power_up_delay);
        match self.acquire() {
            Ok(info) => {
                debug!("Card ready: {:?}", info);
                self.session = Some(info);
                Ok(info)
            }
            Err(e) => {
                warn!("Card init failed: {:?}", e);
                Err(e)
            }
        }
    }

    /// Forget the session, so the next [`SdCard::init`] runs the full
    /// sequence again.
    pub fn mark_card_uninit(&mut self) {
        self.session = None;
    }

    /// Has initialization completed?
    pub fn ready(&self) -> bool {
        self.session.is_some()
    }

    /// What initialization found out, if it has completed.
    pub fn card_info(&self) -> Option<CardInfo> {
        self.session
    }

    /// Capacity in blocks, or zero if the card is not initialized.
    pub fn block_count(&self) -> u32 {
        self.session.map(|info| info.block_count).unwrap_or(0)
    }

    /// Always 512.
    pub fn block_size(&self) -> u32 {
        Block::LEN_U32
    }

    /// Read one block.
    pub fn read_block(&mut self, block_idx: u32, buffer: &mut [u8; Block::LEN]) -> Result<(), Error> {
        self.check_address(block_idx)?;
        trace!("Read block {}", block_idx);
        self.with_chip_select(|s| {
            let r1 = s.card_command(CMD17, block_idx)?;
            if r1 != R1_READY_STATE {
                return Err(Error::R1Error(r1));
            }
            s.read_data(buffer)
        })
    }

    /// Write one block.
    pub fn write_block(&mut self, block_idx: u32, buffer: &[u8; Block::LEN]) -> Result<(), Error> {
        self.check_address(block_idx)?;
        trace!("Write block {}", block_idx);
        self.with_chip_select(|s| {
            let r1 = s.card_command(CMD24, block_idx)?;
            if r1 != R1_READY_STATE {
                return Err(Error::R1Error(r1));
            }
            s.write_data(DATA_START_BLOCK, buffer)?;
            s.wait_not_busy()
        })
    }

    /// Read the Operating Conditions Register.
    pub fn read_ocr(&mut self) -> Result<Ocr, Error> {
        self.check_ready()?;
        self.with_chip_select(|s| {
            let r1 = s.card_command(CMD58, 0)?;
            if r1 != R1_READY_STATE {
                return Err(Error::R1Error(r1));
            }
            let mut ocr = [0u8; 4];
            s.read_bytes(&mut ocr)?;
            Ok(Ocr::from_bytes(ocr))
        })
    }

    /// Read the 'card identification' register.
    pub fn read_cid(&mut self) -> Result<Cid, Error> {
        self.check_ready()?;
        self.with_chip_select(|s| {
            let mut cid = Cid::default();
            read_register(s, CMD10, &mut cid.data)?;
            Ok(cid)
        })
    }

    /// Read the 'card specific data' register.
    pub fn read_csd(&mut self) -> Result<CsdV2, Error> {
        self.check_ready()?;
        self.with_chip_select(|s| {
            let mut csd = CsdV2::default();
            read_register(s, CMD9, &mut csd.data)?;
            Ok(csd)
        })
    }

    fn card_present(&mut self) -> Result<bool, Error> {
        for _ in 0..self.opts.detect_polls {
            if self.detect.card_present()? {
                return Ok(true);
            }
            self.kernel.delay(self.opts.detect_interval);
        }
        Ok(false)
    }

    fn check_ready(&self) -> Result<CardInfo, Error> {
        self.session.ok_or(Error::NotInitialized)
    }

    fn check_address(&self, block_idx: u32) -> Result<(), Error> {
        let info = self.check_ready()?;
        if block_idx >= info.block_count {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn transfer_options(&self, clock: SpiClock) -> TransferOptions {
        TransferOptions {
            clock,
            wait: self.opts.spi_timeout,
            ..Default::default()
        }
    }

    /// Run a command sequence with the bus locked and chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdMmcSpiBusy<'_, '_, 'a, K, CS>) -> Result<R, Error>,
    {
        let options = self.transfer_options(self.opts.data_clock);
        let bus = self.manager.lock(&self.kernel, self.opts.lock_timeout)?;
        let mut busy = SdMmcSpiBusy::new(
            &bus,
            self.completion,
            &mut self.cs,
            &mut self.scratch,
            &self.opts,
            options,
        )?;
        f(&mut busy)
    }

    /// The reset sequence, from dummy clocks to validated CSD.
    fn acquire(&mut self) -> Result<CardInfo, Error> {
        let init = self.transfer_options(self.opts.init_clock);
        let data = self.transfer_options(self.opts.data_clock);
        let opts = self.opts;
        let kernel = &self.kernel;
        let bus = self.manager.lock(kernel, opts.lock_timeout)?;

        trace!("Reset card..");
        // Supply at least 74 clock cycles without CS asserted.
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        let dummy = [0xFF; DUMMY_BYTES];
        bus.transfer(
            &dummy,
            &mut self.scratch.contents[..DUMMY_BYTES],
            init,
            None,
            self.completion,
        )?;

        let mut s = SdMmcSpiBusy::new(
            &bus,
            self.completion,
            &mut self.cs,
            &mut self.scratch,
            &opts,
            init,
        )?;

        // Enter SPI mode
        match go_idle(&mut s, opts.cmd0_settle) {
            Ok(R1_IDLE_STATE) => {}
            Err(Error::Transport(e)) => return Err(Error::Transport(e)),
            first => {
                warn!("CMD0 got {:?}, trying again..", first);
                s.deselect()?;
                s.delay(opts.cmd0_settle);
                s.select()?;
                s.delay(opts.cmd0_settle);
                let r1 = go_idle(&mut s, opts.cmd0_settle)?;
                if r1 != R1_IDLE_STATE {
                    return Err(Error::UnknownCard);
                }
            }
        }

        // Check card version
        match s.card_command(CMD8, CMD8_ARG)? {
            R1_IDLE_STATE => {
                let mut r7 = [0u8; 4];
                s.read_bytes(&mut r7)?;
                if (r7[2] & 0x0F) != 1 || r7[3] != CMD8_CHECK_PATTERN {
                    warn!("Bad R7: {:?}", r7);
                    return Err(Error::UnknownCard);
                }
            }
            r1 if r1 == (R1_IDLE_STATE | R1_ILLEGAL_COMMAND) => {
                debug!("Version 1 card");
                return Err(Error::Unsupported);
            }
            r1 => {
                warn!("CMD8 got {:x}", r1);
                return Err(Error::UnknownCard);
            }
        }

        let mut poll = opts.init_poll.start(kernel);
        loop {
            let r1 = s.card_command(CMD55, 0)?;
            if r1 != R1_IDLE_STATE {
                return Err(Error::R1Error(r1));
            }
            match s.card_command(ACMD41, ACMD41_HCS)? {
                R1_READY_STATE => break,
                R1_IDLE_STATE => poll.retry(Error::TimeoutACommand(ACMD41))?,
                r1 => return Err(Error::R1Error(r1)),
            }
        }
        debug!("Card left idle after {} ACMD41 retries", poll.attempts());

        let r1 = s.card_command(CMD58, 0)?;
        if r1 != R1_READY_STATE {
            return Err(Error::R1Error(r1));
        }
        let mut ocr = [0u8; 4];
        s.read_bytes(&mut ocr)?;
        let ocr = Ocr::from_bytes(ocr);
        if !(ocr.power_up_done() && ocr.high_capacity()) {
            warn!("Standard capacity card, OCR {:x}", ocr.0);
            return Err(Error::Unsupported);
        }
        drop(s);

        let mut s = SdMmcSpiBusy::new(
            &bus,
            self.completion,
            &mut self.cs,
            &mut self.scratch,
            &opts,
            data,
        )?;
        let mut csd = CsdV2::default();
        read_register(&mut s, CMD9, &mut csd.data)?;
        drop(s);
        check_csd(&csd)
    }
}

/// Send CMD0 and collect its R1 after the settling delay.
fn go_idle<K, CS>(s: &mut SdMmcSpiBusy<'_, '_, '_, K, CS>, settle: Ticks) -> Result<u8, Error>
where
    K: Kernel,
    CS: OutputPin,
{
    s.send_command(CMD0, 0)?;
    s.delay(settle);
    s.read_r1(CMD0)
}

/// CMD9/CMD10: R1, then the register as a 16 byte data block.
fn read_register<K, CS>(
    s: &mut SdMmcSpiBusy<'_, '_, '_, K, CS>,
    command: u8,
    data: &mut [u8; 16],
) -> Result<(), Error>
where
    K: Kernel,
    CS: OutputPin,
{
    let r1 = s.card_command(command, 0)?;
    if r1 != R1_READY_STATE {
        return Err(Error::R1Error(r1));
    }
    s.read_data(data)
}

/// Accept only the CSD layout we know how to drive.
fn check_csd(csd: &CsdV2) -> Result<CardInfo, Error> {
    debug!("CSD: {:?}", csd.data);
    if csd.csd_structure() != 1
        || csd.read_block_length() != 9
        || csd.write_block_length() != 9
        || csd.erase_sector_bytes() != 65536
    {
        warn!("Unsupported CSD {:?}", csd.data);
        return Err(Error::Unsupported);
    }
    let block_count = match csd.card_capacity_blocks() {
        Some(count) => count,
        None => {
            warn!("C_SIZE {} does not fit in 32-bit block addresses", csd.device_size());
            return Err(Error::Unsupported);
        }
    };
    Ok(CardInfo {
        csd_version: csd.csd_structure(),
        block_count,
        erase_sector_size: csd.erase_sector_bytes(),
        size_mb: csd.card_capacity_mib(),
    })
}

impl<'m, 'a, K, CS, D, P> BlockDevice for SdCard<'m, 'a, K, CS, D, P>
where
    K: Kernel,
    CS: OutputPin,
    D: CardDetect,
    P: PowerSwitch,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (offset, block) in blocks.iter_mut().enumerate() {
            let idx = start_block_idx
                .checked_add(offset as u32)
                .ok_or(Error::InvalidArgument)?;
            self.read_block(idx.0, &mut block.contents)?;
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (offset, block) in blocks.iter().enumerate() {
            let idx = start_block_idx
                .checked_add(offset as u32)
                .ok_or(Error::InvalidArgument)?;
            self.write_block(idx.0, &block.contents)?;
        }
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let info = self.check_ready()?;
        Ok(BlockCount(info.block_count))
    }
}
