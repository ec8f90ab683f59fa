//! Calypso Hide - Password-addressed metadata chains in unused device blocks
//!
//! This crate hides a metadata blob inside blocks a device reports as free,
//! so that nothing outside the hidden blocks reveals where they are. It uses:
//! - A password-seeded address sequence to place (and later find) the first link
//! - Fixed 4096-byte authenticated tokens that look like random noise
//! - A pointer embedded in each link to reach the next one
//! - Memory safety with zeroize on drop for keys and decrypted payloads
//!
//! ## Architecture
//!
//! ```text
//! Caller (device occupancy + password + total block count)
//!     ↓ hide / retrieve / wipe
//! HidingEngine
//!     ├── AddressSequencer (seed → candidate first-link blocks)
//!     ├── BlockAllocator over Bitmap (first link by search, rest lowest-free)
//!     ├── ChainLayout (marker | chunk | next pointer)
//!     └── Block crypto (PBKDF2 key, AES-128-CBC + HMAC-SHA256 token)
//!     ↓ read/write whole blocks by index
//! BlockStore (device or InMemoryStore)
//!     ↓
//! device: [..][link k+1][..][link 0][..][link 1][..]
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bitmap;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod sequencer;
pub mod store;

pub use allocator::{AllocError, BlockAllocator, FirstLink};
pub use bitmap::{Bitmap, BitmapError};
pub use chain::{
    ChainLayout, CodecError, Link, NextPointer,
    CHUNK_CAPACITY, HEAD_MARKER, LINK_MARKER, MARKER_LEN, PAD, POINTER_LEN,
};
pub use config::{EngineConfig, SearchLimits};
pub use crypto::{
    decrypt_block, derive_key, encrypt_block, token_timestamp,
    ChainKey, CryptoError, BLOCK_SIZE, PAYLOAD_LEN,
};
pub use engine::{
    ChainFault, ChainSummary, EngineError, HidingEngine,
    PartialRecovery, Recovered, Recovery, MAX_TOTAL_BLOCKS,
};
pub use sequencer::{parse_seed, AddressSequencer, SEQUENCER_VERSION};
pub use store::{BlockStore, InMemoryStore};
