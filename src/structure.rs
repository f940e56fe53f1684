//! embedded-sdmmc-dma - Useful macros for parsing SD/MMC structures.
//!
//! Registers are stored as the big-endian byte array the card sends. A field
//! is addressed by byte offset into that array, start bit within the byte and
//! width; fields that straddle bytes list their parts most significant first.

macro_rules! access_field {
    ($self:expr, $offset:expr, $start_bit:expr, 1) => {
        ($self.data()[$offset] & (1 << $start_bit)) != 0
    };
    ($self:expr, $offset:expr, $start:expr, $num_bits:expr) => {
        ($self.data()[$offset] >> $start) & (((1u16 << $num_bits) - 1) as u8)
    };
}

macro_rules! define_field {
    ($name:ident, bool, $offset:expr, $bit:expr) => {
        doc_comment::doc_comment! {
            concat!("Is the `", stringify!($name), "` flag (byte ", stringify!($offset),
                ", bit ", stringify!($bit), ") set?"),
            pub fn $name(&self) -> bool {
                access_field!(self, $offset, $bit, 1)
            }
        }
    };
    ($name:ident, u8, $offset:expr, $start_bit:expr, $num_bits:expr) => {
        doc_comment::doc_comment! {
            concat!("The ", stringify!($num_bits), "-bit `", stringify!($name),
                "` field at byte ", stringify!($offset), ", bit ", stringify!($start_bit), "."),
            pub fn $name(&self) -> u8 {
                access_field!(self, $offset, $start_bit, $num_bits)
            }
        }
    };
    ($name:ident, $type:ty, [ $( ( $offset:expr, $start_bit:expr, $num_bits:expr ) ),+ ]) => {
        doc_comment::doc_comment! {
            concat!("The `", stringify!($name), "` field, assembled from several bytes."),
            pub fn $name(&self) -> $type {
                let mut result = 0;
                $(
                    result <<= $num_bits;
                    let part = access_field!(self, $offset, $start_bit, $num_bits) as $type;
                    result |= part;
                )+
                result
            }
        }
    };
}
