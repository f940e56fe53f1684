//! Sharing one block device between several users.
//!
//! A USB mass-storage class and a filesystem commonly sit on the same card;
//! each can hold a `&RefCell<SdCard>` and go through these impls.

use core::cell::RefCell;

use super::{Block, BlockCount, BlockDevice, BlockIdx};

impl<T> BlockDevice for RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        self.get_mut().read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.get_mut().write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.get_mut().num_blocks()
    }
}

/// Panics if the device is already borrowed, as [`RefCell::borrow_mut`] does.
impl<T> BlockDevice for &RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        self.borrow_mut().read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.borrow_mut().write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.borrow_mut().num_blocks()
    }
}
