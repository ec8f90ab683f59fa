//! Link payload format.
//!
//! Every link seals one fixed-length plaintext payload:
//!
//! ```text
//! [0]              marker
//! [1..1+M]         metadata chunk, right-padded with spaces
//! [1+M..1+M+8]     next block index as decimal text, right-padded with spaces
//!                  ("-1" on the last link)
//! ```
//!
//! With the standard geometry `M` = 4007 and the payload fills the cipher's
//! 4016-byte plaintext capacity exactly.

use zeroize::Zeroizing;

use crate::crypto::PAYLOAD_LEN;

// ============================================================
// CONSTANTS
// ============================================================

/// Marker of the first link of a chain (`0b10111011`)
pub const HEAD_MARKER: u8 = 0xBB;

/// Marker of every later link
pub const LINK_MARKER: u8 = 0xBA;

pub const MARKER_LEN: usize = 1;

/// Width of the next-pointer text field
pub const POINTER_LEN: usize = 8;

/// Metadata bytes carried per link
pub const CHUNK_CAPACITY: usize = PAYLOAD_LEN - MARKER_LEN - POINTER_LEN;

/// Padding byte for both variable fields
pub const PAD: u8 = b' ';

const END_OF_CHAIN: &str = "-1";

/// Errors from payload encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Field widths {marker} + {chunk} + {pointer} do not fill payload of {payload} bytes")]
    Configuration {
        marker: usize,
        chunk: usize,
        pointer: usize,
        payload: usize,
    },
    #[error("Chunk of {len} bytes exceeds capacity {capacity}")]
    ChunkTooLong { len: usize, capacity: usize },
    #[error("Pointer {0} does not fit the pointer field")]
    PointerOverflow(u64),
    #[error("Payload is {0} bytes, not the fixed payload length")]
    WrongLength(usize),
    #[error("Malformed next pointer")]
    MalformedPointer,
}

// ============================================================
// NEXT POINTER
// ============================================================

/// Where the chain continues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextPointer {
    /// Next link lives at this block
    Block(u64),
    /// This is the last link (`-1` on disk)
    End,
}

impl NextPointer {
    fn to_text(self) -> String {
        match self {
            Self::Block(index) => index.to_string(),
            Self::End => END_OF_CHAIN.to_string(),
        }
    }

    fn from_text(field: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(field)
            .map_err(|_| CodecError::MalformedPointer)?
            .trim_end_matches(PAD as char);
        if text == END_OF_CHAIN {
            return Ok(Self::End);
        }
        // `u64::from_str` accepts a leading '+', which encode never writes
        if !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::MalformedPointer);
        }
        text.parse().map(Self::Block).map_err(|_| CodecError::MalformedPointer)
    }
}

// ============================================================
// DECODED LINK
// ============================================================

/// Plaintext fields of one link
#[derive(Debug, PartialEq, Eq)]
pub struct Link {
    pub marker: u8,
    /// Full fixed-width chunk, padding included
    pub chunk: Zeroizing<Vec<u8>>,
    pub next: NextPointer,
}

impl Link {
    /// Chunk with trailing space padding removed
    #[must_use]
    pub fn trimmed_chunk(&self) -> &[u8] {
        let end = self
            .chunk
            .iter()
            .rposition(|&b| b != PAD)
            .map_or(0, |i| i + 1);
        &self.chunk[..end]
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next == NextPointer::End
    }
}

// ============================================================
// LAYOUT
// ============================================================

/// Field widths of a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainLayout {
    chunk_len: usize,
    pointer_len: usize,
}

impl ChainLayout {
    /// Check that the field widths exactly fill the payload
    pub fn new(chunk_len: usize, pointer_len: usize) -> Result<Self, CodecError> {
        let total = MARKER_LEN
            .checked_add(chunk_len)
            .and_then(|n| n.checked_add(pointer_len));
        if total != Some(PAYLOAD_LEN) {
            return Err(CodecError::Configuration {
                marker: MARKER_LEN,
                chunk: chunk_len,
                pointer: pointer_len,
                payload: PAYLOAD_LEN,
            });
        }
        Ok(Self {
            chunk_len,
            pointer_len,
        })
    }

    /// Standard layout (4007-byte chunks, 8-byte pointers)
    pub fn standard() -> Result<Self, CodecError> {
        Self::new(CHUNK_CAPACITY, POINTER_LEN)
    }

    #[must_use]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_len
    }

    /// Largest block index the pointer field can carry
    #[must_use]
    pub fn max_pointer(&self) -> u64 {
        u32::try_from(self.pointer_len)
            .ok()
            .and_then(|digits| 10u64.checked_pow(digits))
            .map_or(u64::MAX, |limit| limit - 1)
    }

    /// Links needed for `len` bytes of metadata (at least one)
    #[must_use]
    pub fn chunks_needed(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_len.max(1)).max(1)
    }

    /// Build one payload
    pub fn encode(
        &self,
        marker: u8,
        chunk: &[u8],
        next: NextPointer,
    ) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        if chunk.len() > self.chunk_len {
            return Err(CodecError::ChunkTooLong {
                len: chunk.len(),
                capacity: self.chunk_len,
            });
        }
        let pointer = next.to_text();
        if pointer.len() > self.pointer_len {
            let index = match next {
                NextPointer::Block(index) => index,
                NextPointer::End => 0,
            };
            return Err(CodecError::PointerOverflow(index));
        }

        let mut payload = Zeroizing::new(Vec::with_capacity(PAYLOAD_LEN));
        payload.push(marker);
        payload.extend_from_slice(chunk);
        payload.resize(MARKER_LEN + self.chunk_len, PAD);
        payload.extend_from_slice(pointer.as_bytes());
        payload.resize(MARKER_LEN + self.chunk_len + self.pointer_len, PAD);

        if payload.len() != PAYLOAD_LEN {
            return Err(CodecError::Configuration {
                marker: MARKER_LEN,
                chunk: self.chunk_len,
                pointer: self.pointer_len,
                payload: PAYLOAD_LEN,
            });
        }
        Ok(payload)
    }

    /// Split a payload into its fields
    ///
    /// Does not check the marker; callers compare it against what they expect.
    pub fn decode(&self, payload: &[u8]) -> Result<Link, CodecError> {
        if payload.len() != PAYLOAD_LEN {
            return Err(CodecError::WrongLength(payload.len()));
        }
        let chunk_end = MARKER_LEN + self.chunk_len;
        let next = NextPointer::from_text(&payload[chunk_end..chunk_end + self.pointer_len])?;

        Ok(Link {
            marker: payload[0],
            chunk: Zeroizing::new(payload[MARKER_LEN..chunk_end].to_vec()),
            next,
        })
    }
}
