//! Read-modify-write staging for attribute blocks.
//!
//! A mutation may touch several attribute blocks (the slot being written,
//! the block holding the record being replaced). Staging them here keeps
//! each block's edits in one buffer even when both land in the same block,
//! then writes everything back in one pass.

use herd_block::BlockDevice;
use herd_error::Result;
use herd_types::BlockNumber;

pub(crate) struct BlockEdit<'a> {
    dev: &'a dyn BlockDevice,
    loaded: Vec<(BlockNumber, Vec<u8>)>,
}

impl<'a> BlockEdit<'a> {
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self {
            dev,
            loaded: Vec::new(),
        }
    }

    /// Buffer for `block`, reading it on first access.
    pub fn get_mut(&mut self, block: BlockNumber) -> Result<&mut Vec<u8>> {
        if let Some(pos) = self.loaded.iter().position(|(b, _)| *b == block) {
            return Ok(&mut self.loaded[pos].1);
        }
        let bytes = self.dev.read_block(block)?.into_inner();
        self.loaded.push((block, bytes));
        let last = self.loaded.len() - 1;
        Ok(&mut self.loaded[last].1)
    }

    /// Stage a freshly built block without reading the device.
    pub fn insert(&mut self, block: BlockNumber, bytes: Vec<u8>) {
        if let Some(pos) = self.loaded.iter().position(|(b, _)| *b == block) {
            self.loaded[pos].1 = bytes;
        } else {
            self.loaded.push((block, bytes));
        }
    }

    /// Write every staged block back to the device.
    pub fn flush(self) -> Result<()> {
        for (block, bytes) in self.loaded {
            self.dev.write_block(block, &bytes)?;
        }
        Ok(())
    }
}
