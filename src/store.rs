//! BlockStore trait for abstracting device I/O.
//!
//! The engine only ever reads and writes whole blocks by index. A real device
//! backend maps `index` to byte offset `index * BLOCK_SIZE`; `InMemoryStore`
//! simulates the device for tests and tooling.
//!
//! # Security Notes
//!
//! - The store has no security logic: everything it receives is already a
//!   sealed token
//! - A missing block reads as `None`, which the engine treats like any other
//!   block that is not one of its links

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Whole-block device operations
pub trait BlockStore {
    /// Read the block at `index`, if anything was ever written there
    fn read(&self, index: u64) -> Option<Vec<u8>>;

    /// Write one whole block at `index`
    fn write(&mut self, index: u64, data: &[u8]);

    /// Flush pending writes to the device
    fn flush(&mut self);
}

/// In-memory block store
/// Uses Rc<RefCell<...>> so clones share the same underlying blocks
#[derive(Default, Clone)]
pub struct InMemoryStore {
    blocks: Rc<RefCell<HashMap<u64, Vec<u8>>>>,
    /// Total writes (for checking that failed operations write nothing)
    write_count: Rc<Cell<usize>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of one block
    #[must_use]
    pub fn block(&self, index: u64) -> Option<Vec<u8>> {
        self.blocks.borrow().get(&index).cloned()
    }

    /// Number of blocks ever written
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.borrow().is_empty()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_count.get()
    }

    pub fn reset_write_count(&self) {
        self.write_count.set(0);
    }

    /// Flip every bit of one stored byte; returns false if there is no such byte
    pub fn corrupt_byte(&self, index: u64, offset: usize) -> bool {
        let mut blocks = self.blocks.borrow_mut();
        match blocks.get_mut(&index).and_then(|block| block.get_mut(offset)) {
            Some(byte) => {
                *byte ^= 0xFF;
                true
            }
            None => false,
        }
    }

    /// Drop a block entirely, as if it had never been written
    pub fn wipe(&self, index: u64) -> Option<Vec<u8>> {
        self.blocks.borrow_mut().remove(&index)
    }
}

impl BlockStore for InMemoryStore {
    fn read(&self, index: u64) -> Option<Vec<u8>> {
        self.block(index)
    }

    fn write(&mut self, index: u64, data: &[u8]) {
        self.blocks.borrow_mut().insert(index, data.to_vec());
        self.write_count.set(self.write_count.get() + 1);
    }

    fn flush(&mut self) {
        // No-op for in-memory
    }
}
