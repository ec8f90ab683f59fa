//! Block allocation policies.
//!
//! - First link: draw password-seeded candidates until one is free. Its
//!   address is secret and never stored anywhere.
//! - Continuation links: lowest free block. These addresses are embedded in
//!   the previous link's payload, so only non-collision matters.

use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::config::SearchLimits;
use crate::sequencer::AddressSequencer;

/// Errors from block allocation
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("No free block found within {attempts} attempts")]
    Exhausted { attempts: u64 },
}

/// Outcome of a first-link allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirstLink {
    /// Block that now holds the first link
    pub index: u64,
    /// First candidate drawn this session (cycle-detection anchor)
    pub anchor: u64,
    /// Candidates drawn, including the accepted one
    pub attempts: u64,
}

/// Claims free blocks from a bitmap for one hide call
pub struct BlockAllocator<'a> {
    bitmap: &'a mut Bitmap,
    total_blocks: u64,
    max_attempts: u64,
}

impl<'a> BlockAllocator<'a> {
    /// Allocate within `[0, total_blocks)` of `bitmap`
    pub fn new(bitmap: &'a mut Bitmap, total_blocks: u64, limits: &SearchLimits) -> Self {
        let total_blocks = total_blocks.min(bitmap.len());
        Self {
            bitmap,
            total_blocks,
            max_attempts: limits.max_attempts(total_blocks),
        }
    }

    #[must_use]
    pub fn is_free(&self, index: u64) -> bool {
        index < self.total_blocks && self.bitmap.is_free(index)
    }

    pub fn mark_used(&mut self, index: u64) {
        self.bitmap.mark_used(index);
    }

    /// Return a claimed block to the free pool
    pub fn release(&mut self, index: u64) {
        self.bitmap.release(index);
    }

    /// Free blocks left in range
    #[must_use]
    pub fn free_count(&self) -> u64 {
        (0..self.total_blocks)
            .filter(|&i| self.bitmap.is_free(i))
            .count() as u64
    }

    /// Claim the first free candidate from `sequencer`
    pub fn allocate_first(&mut self, sequencer: &mut AddressSequencer) -> Result<FirstLink, AllocError> {
        if self.bitmap.first_free_below(self.total_blocks).is_none() {
            warn!(total_blocks = self.total_blocks, "no free block on device");
            return Err(AllocError::Exhausted { attempts: 0 });
        }

        for attempts in 1..=self.max_attempts {
            let candidate = sequencer.next_index();
            if !self.is_free(candidate) {
                continue;
            }

            self.mark_used(candidate);
            let anchor = sequencer.anchor().unwrap_or(candidate);
            debug!(attempts, reseeds = sequencer.reseeds(), "first link placed");
            return Ok(FirstLink {
                index: candidate,
                anchor,
                attempts,
            });
        }

        warn!(attempts = self.max_attempts, "first-link search exhausted");
        Err(AllocError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    /// Claim the lowest free block
    pub fn allocate_continuation(&mut self) -> Result<u64, AllocError> {
        let index = self
            .bitmap
            .first_free_below(self.total_blocks)
            .ok_or(AllocError::Exhausted { attempts: 0 })?;
        self.mark_used(index);
        Ok(index)
    }
}
