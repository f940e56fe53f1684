//! embedded-sdmmc-dma - Constants and register layouts from the SD
//! Specifications (SPI mode)
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the card identification information (CID register)
pub const CMD10: u8 = 0x0A;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

/// CMD8 argument: 2.7-3.6 V range, check pattern 0xAA
pub const CMD8_ARG: u32 = 0x0000_01AA;
/// CMD8 check pattern, echoed in the last byte of R7
pub const CMD8_CHECK_PATTERN: u8 = 0xAA;
/// ACMD41 argument: host supports high capacity cards
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;
/// status bit for a command CRC mismatch
pub const R1_COM_CRC_ERROR: u8 = 0x08;
/// status bit for an out-of-range argument
pub const R1_PARAMETER_ERROR: u8 = 0x40;
/// Bit 7 of an R1 is always clear; 0xFF means "no response yet"
pub const R1_START_BIT: u8 = 0x80;
/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Compute the CRC7 of a command frame, shifted up with the end bit set, as
/// it goes in the frame's last byte.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Build the six byte frame for `command` with argument `arg`.
pub fn command_frame(command: u8, arg: u32) -> [u8; 6] {
    let arg = arg.to_be_bytes();
    let mut frame = [0x40 | command, arg[0], arg[1], arg[2], arg[3], 0];
    frame[5] = crc7(&frame[0..5]);
    frame
}

/// Card Specific Data, version 2 (SDHC/SDXC)
#[derive(Default, Clone, PartialEq, Eq)]
pub struct CsdV2 {
    /// The 16 bytes as received, most significant first
    pub data: [u8; 16],
}

impl CsdV2 {
    /// Wrap a register as received.
    pub const fn from_bytes(data: [u8; 16]) -> CsdV2 {
        CsdV2 { data }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_structure, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(write_block_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(permanent_write_protect, bool, 14, 5);
    define_field!(temporary_write_protect, bool, 14, 4);

    /// Returns the card capacity in 512-byte blocks, or `None` if it does not
    /// fit in a `u32` (C_SIZE 0x3FFFFF, a full 2 TiB).
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        (self.device_size() + 1).checked_mul(1024)
    }

    /// Returns the card capacity in MiB.
    pub fn card_capacity_mib(&self) -> u32 {
        (self.device_size() + 1) / 2
    }

    /// Returns the erase sector size in bytes.
    pub fn erase_sector_bytes(&self) -> u32 {
        (u32::from(self.erase_sector_size()) + 1) * 512
    }
}

impl core::fmt::Debug for CsdV2 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CsdV2")
            .field("csd_structure", &self.csd_structure())
            .field("device_size", &self.device_size())
            .field("read_block_length", &self.read_block_length())
            .field("write_block_length", &self.write_block_length())
            .field("erase_sector_size", &self.erase_sector_size())
            .finish()
    }
}

/// Card Identification register
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Cid {
    /// The 16 bytes as received, most significant first
    pub data: [u8; 16],
}

impl Cid {
    /// Wrap a register as received.
    pub const fn from_bytes(data: [u8; 16]) -> Cid {
        Cid { data }
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(serial_number, u32, [(9, 0, 8), (10, 0, 8), (11, 0, 8), (12, 0, 8)]);
    define_field!(manufacture_month, u8, 14, 0, 4);

    /// The two ASCII characters identifying the OEM.
    pub fn oem_id(&self) -> [u8; 2] {
        [self.data[1], self.data[2]]
    }

    /// The five ASCII characters of the product name.
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }

    /// Manufacture year, 2000 to 2255.
    pub fn manufacture_year(&self) -> u16 {
        let offset = ((self.data[13] & 0x0F) << 4) | (self.data[14] >> 4);
        2000 + u16::from(offset)
    }
}

/// Operating Conditions Register
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Assemble from the four bytes following a CMD58 R1.
    pub fn from_bytes(bytes: [u8; 4]) -> Ocr {
        Ocr(u32::from_be_bytes(bytes))
    }

    /// Card power up status: the card has finished initialising.
    pub fn power_up_done(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Card Capacity Status: block addressed (SDHC/SDXC).
    pub fn high_capacity(self) -> bool {
        self.0 & (1 << 30) != 0
    }

    /// UHS-II card status.
    pub fn uhs2(self) -> bool {
        self.0 & (1 << 29) != 0
    }
}
