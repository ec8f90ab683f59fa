//! Device occupancy bitmap.
//!
//! One bit per physical block, 1 = occupied. Seeded from the device's real
//! occupancy by the caller, then mutated as the engine claims blocks.

/// Error types for bitmap construction
#[derive(Debug, thiserror::Error)]
pub enum BitmapError {
    #[error("Invalid bitmap character {found:?} at position {position}")]
    InvalidCharacter { position: usize, found: char },
}

const WORD_BITS: u64 = 64;

/// Occupancy bit vector over block indices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: u64,
}

impl Bitmap {
    /// Bitmap of `len` blocks, all free
    #[must_use]
    pub fn new_free(len: u64) -> Self {
        let word_count = len.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0u64; word_count],
            len,
        }
    }

    /// Parse a run of `'0'` (free) and `'1'` (used) characters
    pub fn from_bit_str(bits: &str) -> Result<Self, BitmapError> {
        let mut bitmap = Self::new_free(bits.len() as u64);
        for (position, c) in bits.chars().enumerate() {
            match c {
                '0' => {}
                '1' => {
                    bitmap.mark_used(position as u64);
                }
                found => return Err(BitmapError::InvalidCharacter { position, found }),
            }
        }
        Ok(bitmap)
    }

    /// Number of blocks covered
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / WORD_BITS) as usize, 1u64 << (index % WORD_BITS))
    }

    /// Whether `index` is in range and unoccupied
    #[must_use]
    pub fn is_free(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.words[word] & mask == 0
    }

    /// Mark `index` occupied; returns whether it was free before
    ///
    /// Out-of-range indices are ignored.
    pub fn mark_used(&mut self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        let was_free = self.words[word] & mask == 0;
        self.words[word] |= mask;
        was_free
    }

    /// Mark `index` free again
    pub fn release(&mut self, index: u64) {
        if index < self.len {
            let (word, mask) = Self::locate(index);
            self.words[word] &= !mask;
        }
    }

    /// Lowest free index strictly below `limit`
    #[must_use]
    pub fn first_free_below(&self, limit: u64) -> Option<u64> {
        let limit = limit.min(self.len);
        for (i, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let index = i as u64 * WORD_BITS + u64::from((!word).trailing_zeros());
            return (index < limit).then_some(index);
        }
        None
    }

    /// Number of free blocks
    #[must_use]
    pub fn free_count(&self) -> u64 {
        let used: u64 = self.words.iter().map(|w| u64::from(w.count_ones())).sum();
        self.len - used
    }
}
