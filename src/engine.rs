//! Hiding engine: places and recovers metadata chains.
//!
//! `hide` splits a blob into fixed-size chunks and seals each one into its own
//! block. The first block is found by password-seeded search; every later
//! block is the lowest free one, and its index is carried inside the previous
//! link. Nothing outside the chain records where it lives.
//!
//! `retrieve` replays the first-block search, then follows the embedded
//! pointers link by link.
//!
//! # Retrieval states (per link)
//!
//! ```text
//! SEARCHING (first link only)
//!   → DECRYPTED
//!   → MARKER_VALID | MARKER_INVALID (first link: keep searching)
//!   → ACCUMULATED
//!   → HAS_NEXT (loop) | TERMINAL
//! ```
//!
//! # Security Properties
//!
//! - **No index**: password + block count fully determine how to walk a chain
//! - **Fail closed**: a link that does not authenticate is never read further;
//!   during the first-link search it is just "not my block"
//! - **Fail fast mid-chain**: once the head is found, any bad link ends the walk
//!   with a `PartialRecovery` holding only the chunks before it
//! - **All or nothing hide**: every address is planned and every token sealed
//!   before the first write; on failure claimed blocks are released
//! - **Exclusive session**: `hide`, `retrieve` and `wipe` take `&mut self`, so
//!   one call owns bitmap, sequencer and store for its whole duration

use std::collections::HashSet;

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::allocator::{AllocError, BlockAllocator};
use crate::bitmap::Bitmap;
use crate::chain::{ChainLayout, CodecError, Link, NextPointer, HEAD_MARKER, LINK_MARKER, PAD};
use crate::config::EngineConfig;
use crate::crypto::{decrypt_block, derive_key, encrypt_block, ChainKey, CryptoError, BLOCK_SIZE};
use crate::sequencer::{parse_seed, AddressSequencer};
use crate::store::BlockStore;

/// Largest device the 8-digit pointer field can address
pub const MAX_TOTAL_BLOCKS: u64 = 100_000_000;

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Password must start with a decimal seed")]
    InvalidPassword,
    #[error("Block count {total_blocks} outside 1..={max}")]
    BlockCount { total_blocks: u64, max: u64 },
    #[error("Metadata ends with a padding byte")]
    TrailingPadding,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
}

/// Why a walk stopped before the terminal link
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainFault {
    #[error("First link not found after {attempts} attempts")]
    FirstLinkNotFound { attempts: u64 },
    #[error("Link {link} at block {block} is corrupted")]
    Corruption { link: usize, block: u64 },
    #[error("Link {link} has a malformed pointer (block {block})")]
    MalformedPointer { link: usize, block: u64 },
}

/// Where a hidden chain was written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSummary {
    pub links_used: usize,
    pub first_block: u64,
    /// Every link's block, in chain order
    pub blocks: Vec<u64>,
}

/// A fully recovered chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recovered {
    pub bytes: Vec<u8>,
    pub first_block: u64,
    pub links: usize,
}

/// Chunks recovered before the walk hit a fault
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialRecovery {
    pub bytes: Vec<u8>,
    pub chunks_recovered: usize,
    pub fault: ChainFault,
}

/// Outcome of `retrieve`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    Complete(Recovered),
    Partial(PartialRecovery),
}

impl Recovery {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Complete(recovered) => &recovered.bytes,
            Self::Partial(partial) => &partial.bytes,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    #[must_use]
    pub fn chunks_recovered(&self) -> usize {
        match self {
            Self::Complete(recovered) => recovered.links,
            Self::Partial(partial) => partial.chunks_recovered,
        }
    }
}

/// What one block turned out to be
enum LinkCheck {
    /// Nothing stored there
    Absent,
    /// Tag check failed (foreign block, wrong key or tampered)
    Rejected,
    /// Authentic, but not the kind of link expected here
    WrongMarker,
    /// Authentic with the right marker, but fields do not parse
    Undecodable,
    Accepted(Link),
}

/// Result of following a chain from its head
struct Walk {
    blocks: Vec<u64>,
    bytes: Vec<u8>,
    fault: Option<ChainFault>,
}

/// Hides and retrieves chains on one device
///
/// Owns the device's block store and occupancy bitmap. The bitmap persists
/// across calls, so successive hides never reuse each other's blocks.
pub struct HidingEngine<S: BlockStore> {
    store: S,
    bitmap: Bitmap,
    config: EngineConfig,
    layout: ChainLayout,
}

impl<S: BlockStore> HidingEngine<S> {
    /// Create an engine with production search limits
    pub fn new(store: S, bitmap: Bitmap) -> Result<Self, EngineError> {
        Self::with_config(store, bitmap, EngineConfig::default())
    }

    /// Create an engine with custom configuration
    ///
    /// Fails with a configuration error if the payload layout is inconsistent.
    pub fn with_config(store: S, bitmap: Bitmap, config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            store,
            bitmap,
            config,
            layout: ChainLayout::standard()?,
        })
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Mutable occupancy, for callers that learn of new device usage
    pub fn bitmap_mut(&mut self) -> &mut Bitmap {
        &mut self.bitmap
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Metadata bytes carried per link
    #[must_use]
    pub fn chunk_capacity(&self) -> usize {
        self.layout.chunk_capacity()
    }

    /// Consume the engine and return its store and bitmap
    pub fn into_parts(self) -> (S, Bitmap) {
        (self.store, self.bitmap)
    }

    fn check_block_count(&self, total_blocks: u64, max: u64) -> Result<(), EngineError> {
        let max = max.min(MAX_TOTAL_BLOCKS).min(self.layout.max_pointer() + 1);
        if total_blocks == 0 || total_blocks > max {
            return Err(EngineError::BlockCount { total_blocks, max });
        }
        Ok(())
    }

    // ============================================================
    // HIDE
    // ============================================================

    /// Hide `metadata` under `password` within the first `total_blocks` blocks
    pub fn hide(
        &mut self,
        password: &str,
        total_blocks: u64,
        metadata: &[u8],
    ) -> Result<ChainSummary, EngineError> {
        let seed = parse_seed(password).ok_or(EngineError::InvalidPassword)?;
        self.check_block_count(total_blocks, self.bitmap.len())?;
        if metadata.last() == Some(&PAD) {
            return Err(EngineError::TrailingPadding);
        }

        let capacity = self.layout.chunk_capacity();
        let chunks: Vec<&[u8]> = if metadata.is_empty() {
            vec![metadata]
        } else {
            metadata.chunks(capacity).collect()
        };
        debug_assert_eq!(chunks.len(), self.layout.chunks_needed(metadata.len()));

        let key = derive_key(password);
        let blocks = self.plan_chain(seed, total_blocks, chunks.len())?;

        let tokens = match self.seal_chain(&key, &chunks, &blocks) {
            Ok(tokens) => tokens,
            Err(err) => {
                self.release_all(&blocks);
                return Err(err);
            }
        };

        for (&block, token) in blocks.iter().zip(&tokens) {
            self.store.write(block, token);
        }
        self.store.flush();

        info!(links = blocks.len(), bytes = metadata.len(), "metadata hidden");
        Ok(ChainSummary {
            links_used: blocks.len(),
            first_block: blocks[0],
            blocks,
        })
    }

    /// Claim every block of the chain: the head by search, the rest by scan
    ///
    /// The head is claimed before any continuation, so a candidate drawn while
    /// searching can never be one of this chain's later links.
    fn plan_chain(&mut self, seed: u64, total_blocks: u64, links: usize) -> Result<Vec<u64>, EngineError> {
        let limits = *self.config.limits();
        let mut allocator = BlockAllocator::new(&mut self.bitmap, total_blocks, &limits);
        let mut sequencer = AddressSequencer::new(seed, total_blocks);

        let first = allocator.allocate_first(&mut sequencer)?;
        let mut blocks = Vec::with_capacity(links);
        blocks.push(first.index);

        while blocks.len() < links {
            match allocator.allocate_continuation() {
                Ok(index) => blocks.push(index),
                Err(err) => {
                    for &block in &blocks {
                        allocator.release(block);
                    }
                    warn!(needed = links, claimed = blocks.len(), "device too full for chain");
                    return Err(err.into());
                }
            }
        }

        debug!(links, attempts = first.attempts, "chain planned");
        Ok(blocks)
    }

    fn seal_chain(&self, key: &ChainKey, chunks: &[&[u8]], blocks: &[u64]) -> Result<Vec<Vec<u8>>, EngineError> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| -> Result<Vec<u8>, EngineError> {
                let marker = if i == 0 { HEAD_MARKER } else { LINK_MARKER };
                let next = blocks.get(i + 1).map_or(NextPointer::End, |&b| NextPointer::Block(b));
                let payload = self.layout.encode(marker, chunk, next)?;
                Ok(encrypt_block(&payload, key)?)
            })
            .collect()
    }

    fn release_all(&mut self, blocks: &[u64]) {
        for &block in blocks {
            self.bitmap.release(block);
        }
    }

    // ============================================================
    // RETRIEVE
    // ============================================================

    /// Recover the chain hidden under `password`
    ///
    /// Structural problems never surface as errors: they end the walk with a
    /// `Recovery::Partial`. Errors are reserved for unusable arguments.
    pub fn retrieve(&mut self, password: &str, total_blocks: u64) -> Result<Recovery, EngineError> {
        let seed = parse_seed(password).ok_or(EngineError::InvalidPassword)?;
        self.check_block_count(total_blocks, MAX_TOTAL_BLOCKS)?;

        let key = derive_key(password);
        let walk = self.walk(&key, seed, total_blocks);

        let recovery = match walk.fault {
            None => {
                info!(links = walk.blocks.len(), bytes = walk.bytes.len(), "metadata retrieved");
                Recovery::Complete(Recovered {
                    first_block: walk.blocks[0],
                    links: walk.blocks.len(),
                    bytes: walk.bytes,
                })
            }
            Some(fault) => {
                warn!(chunks = walk.blocks.len(), %fault, "partial recovery");
                Recovery::Partial(PartialRecovery {
                    chunks_recovered: walk.blocks.len(),
                    bytes: walk.bytes,
                    fault,
                })
            }
        };
        Ok(recovery)
    }

    /// Overwrite every reachable link with random bytes and free its block
    ///
    /// Chains are immutable; updating one means wiping it and hiding again.
    /// Returns the number of blocks wiped.
    pub fn wipe(&mut self, password: &str, total_blocks: u64) -> Result<usize, EngineError> {
        let seed = parse_seed(password).ok_or(EngineError::InvalidPassword)?;
        self.check_block_count(total_blocks, MAX_TOTAL_BLOCKS)?;

        let key = derive_key(password);
        let walk = self.walk(&key, seed, total_blocks);

        let mut rng = rand::rng();
        let mut noise = vec![0u8; BLOCK_SIZE];
        for &block in &walk.blocks {
            rng.fill_bytes(&mut noise);
            self.store.write(block, &noise);
            self.bitmap.release(block);
        }
        self.store.flush();

        info!(links = walk.blocks.len(), "chain wiped");
        Ok(walk.blocks.len())
    }

    /// Read, authenticate and decode the link at `index`
    fn open_link(&self, key: &ChainKey, index: u64, expected_marker: u8) -> LinkCheck {
        let Some(token) = self.store.read(index) else {
            return LinkCheck::Absent;
        };
        let Ok(payload) = decrypt_block(&token, key) else {
            return LinkCheck::Rejected;
        };
        if payload.first() != Some(&expected_marker) {
            return LinkCheck::WrongMarker;
        }
        match self.layout.decode(&payload) {
            Ok(link) => LinkCheck::Accepted(link),
            Err(_) => LinkCheck::Undecodable,
        }
    }

    /// Replay the head search, then follow pointers until the end or a fault
    fn walk(&self, key: &ChainKey, seed: u64, total_blocks: u64) -> Walk {
        let mut walk = Walk {
            blocks: Vec::new(),
            bytes: Vec::new(),
            fault: None,
        };

        let Some((mut block, mut link)) = self.find_head(key, seed, total_blocks, &mut walk) else {
            return walk;
        };

        let mut visited = HashSet::from([block]);
        loop {
            walk.blocks.push(block);
            let next = match link.next {
                NextPointer::End => {
                    walk.bytes.extend_from_slice(link.trimmed_chunk());
                    return walk;
                }
                NextPointer::Block(next) => next,
            };

            // Only the terminal chunk carries padding
            walk.bytes.extend_from_slice(&link.chunk);

            let position = walk.blocks.len();
            if next >= total_blocks {
                walk.fault = Some(ChainFault::MalformedPointer { link: position, block: next });
                return walk;
            }
            if !visited.insert(next) || walk.blocks.len() as u64 >= total_blocks {
                walk.fault = Some(ChainFault::Corruption { link: position, block: next });
                return walk;
            }

            match self.open_link(key, next, LINK_MARKER) {
                LinkCheck::Accepted(next_link) => {
                    block = next;
                    link = next_link;
                }
                LinkCheck::Undecodable => {
                    walk.fault = Some(ChainFault::MalformedPointer { link: position, block: next });
                    return walk;
                }
                LinkCheck::Absent | LinkCheck::Rejected | LinkCheck::WrongMarker => {
                    walk.fault = Some(ChainFault::Corruption { link: position, block: next });
                    return walk;
                }
            }
        }
    }

    /// Draw candidates exactly as `hide` did until one opens as a head link
    fn find_head(&self, key: &ChainKey, seed: u64, total_blocks: u64, walk: &mut Walk) -> Option<(u64, Link)> {
        let max_attempts = self.config.limits().max_attempts(total_blocks);
        let mut sequencer = AddressSequencer::new(seed, total_blocks);

        for _ in 0..max_attempts {
            let candidate = sequencer.next_index();
            match self.open_link(key, candidate, HEAD_MARKER) {
                LinkCheck::Accepted(link) => {
                    debug!(attempts = sequencer.draws(), reseeds = sequencer.reseeds(), "first link found");
                    return Some((candidate, link));
                }
                LinkCheck::Undecodable => {
                    walk.fault = Some(ChainFault::MalformedPointer { link: 0, block: candidate });
                    return None;
                }
                LinkCheck::Absent | LinkCheck::Rejected | LinkCheck::WrongMarker => {}
            }
        }

        walk.fault = Some(ChainFault::FirstLinkNotFound { attempts: max_attempts });
        None
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::CHUNK_CAPACITY;
    use crate::config::SearchLimits;
    use crate::store::InMemoryStore;

    const PASSWORD: &str = "4242-unit";
    const TOTAL: u64 = 4096;

    fn engine(store: InMemoryStore) -> HidingEngine<InMemoryStore> {
        HidingEngine::with_config(
            store,
            Bitmap::new_free(TOTAL),
            EngineConfig::with_limits(SearchLimits::TEST),
        )
        .unwrap()
    }

    fn metadata(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    #[test]
    fn test_hide_retrieve_multi_link() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());
        let data = metadata(CHUNK_CAPACITY * 2 + 17);

        let summary = engine.hide(PASSWORD, TOTAL, &data).unwrap();
        assert_eq!(summary.links_used, 3);
        assert_eq!(store.len(), 3);

        match engine.retrieve(PASSWORD, TOTAL).unwrap() {
            Recovery::Complete(recovered) => {
                assert_eq!(recovered.bytes, data);
                assert_eq!(recovered.links, 3);
                assert_eq!(recovered.first_block, summary.first_block);
            }
            Recovery::Partial(partial) => panic!("unexpected partial recovery: {:?}", partial.fault),
        }
    }

    #[test]
    fn test_continuations_take_lowest_free_blocks() {
        let mut engine = engine(InMemoryStore::new());
        let summary = engine.hide(PASSWORD, TOTAL, &metadata(CHUNK_CAPACITY * 3)).unwrap();

        let mut expected: Vec<u64> = (0..4).filter(|&b| b != summary.first_block).take(2).collect();
        expected.insert(0, summary.first_block);
        assert_eq!(summary.blocks, expected);
    }

    #[test]
    fn test_exact_multiple_of_capacity() {
        let mut engine = engine(InMemoryStore::new());
        let data = metadata(CHUNK_CAPACITY * 2);

        assert_eq!(engine.hide(PASSWORD, TOTAL, &data).unwrap().links_used, 2);
        assert_eq!(engine.retrieve(PASSWORD, TOTAL).unwrap().bytes(), data.as_slice());
    }

    #[test]
    fn test_empty_metadata_uses_one_link() {
        let mut engine = engine(InMemoryStore::new());
        assert_eq!(engine.hide(PASSWORD, TOTAL, b"").unwrap().links_used, 1);

        let recovery = engine.retrieve(PASSWORD, TOTAL).unwrap();
        assert!(recovery.is_complete());
        assert!(recovery.bytes().is_empty());
    }

    #[test]
    fn test_inner_spaces_survive() {
        let mut engine = engine(InMemoryStore::new());
        // Chunk boundary falls inside a run of spaces
        let mut data = vec![b' '; CHUNK_CAPACITY + 10];
        data[0] = b'<';
        data.push(b'>');

        engine.hide(PASSWORD, TOTAL, &data).unwrap();
        assert_eq!(engine.retrieve(PASSWORD, TOTAL).unwrap().bytes(), data.as_slice());
    }

    #[test]
    fn test_trailing_space_rejected() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());
        assert!(matches!(
            engine.hide(PASSWORD, TOTAL, b"ends in space "),
            Err(EngineError::TrailingPadding)
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_invalid_password() {
        let mut engine = engine(InMemoryStore::new());
        assert!(matches!(engine.hide("no-seed", TOTAL, b"x"), Err(EngineError::InvalidPassword)));
        assert!(matches!(engine.retrieve("abc", TOTAL), Err(EngineError::InvalidPassword)));
    }

    #[test]
    fn test_block_count_validated() {
        let mut engine = engine(InMemoryStore::new());
        assert!(matches!(engine.hide(PASSWORD, 0, b"x"), Err(EngineError::BlockCount { .. })));
        assert!(matches!(
            engine.hide(PASSWORD, TOTAL + 1, b"x"),
            Err(EngineError::BlockCount { max: TOTAL, .. })
        ));
        assert!(matches!(
            engine.retrieve(PASSWORD, MAX_TOTAL_BLOCKS + 1),
            Err(EngineError::BlockCount { .. })
        ));
    }

    #[test]
    fn test_exhaustion_writes_nothing() {
        let store = InMemoryStore::new();
        let mut engine = HidingEngine::with_config(
            store.clone(),
            Bitmap::from_bit_str("1001").unwrap(),
            EngineConfig::with_limits(SearchLimits::TEST),
        )
        .unwrap();

        // Two free blocks, three links needed
        let result = engine.hide("1-full", 4, &metadata(CHUNK_CAPACITY * 2 + 1));
        assert!(matches!(result, Err(EngineError::Alloc(AllocError::Exhausted { .. }))));
        assert_eq!(store.write_count(), 0);
        assert_eq!(engine.bitmap().free_count(), 2);
    }

    #[test]
    fn test_second_hide_does_not_collide() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());

        let a = engine.hide("10-first", TOTAL, &metadata(CHUNK_CAPACITY + 1)).unwrap();
        let b = engine.hide("20-second", TOTAL, &metadata(CHUNK_CAPACITY + 2)).unwrap();

        let a_blocks: HashSet<_> = a.blocks.iter().collect();
        assert!(b.blocks.iter().all(|block| !a_blocks.contains(block)));
        assert_eq!(store.len(), 4);

        assert_eq!(engine.retrieve("10-first", TOTAL).unwrap().bytes(), metadata(CHUNK_CAPACITY + 1).as_slice());
        assert_eq!(engine.retrieve("20-second", TOTAL).unwrap().bytes(), metadata(CHUNK_CAPACITY + 2).as_slice());
    }

    #[test]
    fn test_wrong_password_recovers_nothing() {
        let mut engine = engine(InMemoryStore::new());
        engine.hide(PASSWORD, TOTAL, b"secret").unwrap();

        match engine.retrieve("4242-other", TOTAL).unwrap() {
            Recovery::Partial(partial) => {
                assert_eq!(partial.chunks_recovered, 0);
                assert!(partial.bytes.is_empty());
                assert!(matches!(partial.fault, ChainFault::FirstLinkNotFound { .. }));
            }
            Recovery::Complete(_) => panic!("wrong password must not recover data"),
        }
    }

    #[test]
    fn test_missing_mid_link_is_partial() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());
        let data = metadata(CHUNK_CAPACITY * 3);
        let summary = engine.hide(PASSWORD, TOTAL, &data).unwrap();

        store.wipe(summary.blocks[2]);

        match engine.retrieve(PASSWORD, TOTAL).unwrap() {
            Recovery::Partial(partial) => {
                assert_eq!(partial.chunks_recovered, 2);
                assert_eq!(partial.bytes, data[..CHUNK_CAPACITY * 2]);
                assert_eq!(partial.fault, ChainFault::Corruption { link: 2, block: summary.blocks[2] });
            }
            Recovery::Complete(_) => panic!("missing link must not complete"),
        }
    }

    #[test]
    fn test_head_copy_mid_chain_is_corruption() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());
        let summary = engine.hide(PASSWORD, TOTAL, &metadata(CHUNK_CAPACITY + 5)).unwrap();

        // Replace the second link with a copy of the head (wrong marker mid-chain)
        let head = store.block(summary.blocks[0]).unwrap();
        let mut writer = store.clone();
        writer.write(summary.blocks[1], &head);

        let recovery = engine.retrieve(PASSWORD, TOTAL).unwrap();
        assert_eq!(recovery.chunks_recovered(), 1);
        assert!(!recovery.is_complete());
    }

    #[test]
    fn test_wipe_then_rehide() {
        let store = InMemoryStore::new();
        let mut engine = engine(store.clone());
        engine.hide(PASSWORD, TOTAL, &metadata(CHUNK_CAPACITY + 1)).unwrap();
        assert_eq!(engine.bitmap().free_count(), TOTAL - 2);

        assert_eq!(engine.wipe(PASSWORD, TOTAL).unwrap(), 2);
        assert_eq!(engine.bitmap().free_count(), TOTAL);
        assert!(!engine.retrieve(PASSWORD, TOTAL).unwrap().is_complete());

        engine.hide(PASSWORD, TOTAL, b"updated").unwrap();
        assert_eq!(engine.retrieve(PASSWORD, TOTAL).unwrap().bytes(), b"updated");
    }

    #[test]
    fn test_into_parts() {
        let mut engine = engine(InMemoryStore::new());
        engine.hide(PASSWORD, TOTAL, b"x").unwrap();
        let (store, bitmap) = engine.into_parts();
        assert_eq!(store.len(), 1);
        assert_eq!(bitmap.free_count(), TOTAL - 1);
    }
}
