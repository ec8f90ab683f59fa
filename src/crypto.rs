//! Key derivation and per-block authenticated encryption.
//!
//! - PBKDF2-HMAC-SHA256 for password → chain key
//! - AES-128-CBC + HMAC-SHA256 (encrypt-then-MAC) for one block token
//! - Thread RNG for IVs and filler bytes
//!
//! # Token layout (one physical block)
//!
//! ```text
//! [0]            version (0x80)
//! [1..9]         timestamp, big-endian Unix seconds
//! [9..25]        IV
//! [25..4057]     ciphertext (PKCS#7-padded payload)
//! [4057..4064]   random filler
//! [4064..4096]   HMAC-SHA256 over [0..4064]
//! ```
//!
//! # Security Properties
//!
//! - **Fail closed**: the tag is verified before any other field is read, and
//!   every failure surfaces as the same `CryptoError::Authentication`, so a
//!   wrong key cannot be told apart from a tampered or foreign block
//! - **Zeroize on drop**: `ChainKey` clears both halves when dropped and
//!   decrypted payloads are returned as `Zeroizing<Vec<u8>>`
//! - **No visible structure**: every byte of a token is either ciphertext,
//!   random, or a MAC, except the version byte and timestamp header

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Error types for crypto operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Authentication failed")]
    Authentication,
    #[error("Invalid payload length")]
    InvalidLength,
    #[error("Invalid key")]
    InvalidKey,
}

// ============================================================
// CONSTANTS
// ============================================================

/// Size of one physical block, and of one token
pub const BLOCK_SIZE: usize = 4096;

pub const VERSION_LEN: usize = 1;
pub const TIMESTAMP_LEN: usize = 8;
pub const IV_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;

/// AES block length (PKCS#7 pads to a multiple of this)
pub const AES_BLOCK_LEN: usize = 16;

/// Bytes of a token that are not ciphertext or filler
pub const TOKEN_OVERHEAD: usize = VERSION_LEN + TIMESTAMP_LEN + IV_LEN + HMAC_LEN;

/// Ciphertext bytes per token (`D`): the space left by the header and tag,
/// rounded down to whole AES blocks
pub const CIPHERTEXT_LEN: usize = (BLOCK_SIZE - TOKEN_OVERHEAD) / AES_BLOCK_LEN * AES_BLOCK_LEN;

/// Plaintext payload bytes per token
///
/// PKCS#7 always adds 1..=16 bytes, so a payload of `D - 16` bytes pads to
/// exactly `D`.
pub const PAYLOAD_LEN: usize = CIPHERTEXT_LEN - AES_BLOCK_LEN;

const TIMESTAMP_START: usize = VERSION_LEN;
const IV_START: usize = TIMESTAMP_START + TIMESTAMP_LEN;
const CIPHERTEXT_START: usize = IV_START + IV_LEN;
const FILLER_START: usize = CIPHERTEXT_START + CIPHERTEXT_LEN;
const HMAC_START: usize = BLOCK_SIZE - HMAC_LEN;

/// Token format version byte
pub const TOKEN_VERSION: u8 = 0x80;

/// Fixed, non-secret PBKDF2 salt
pub const KDF_SALT: [u8; 16] = *b"F\x18\xad$\xbd\xc2\xa5\xd9d.\xd1\xc0\x92\x1b)\xb4";

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 100_000;

const _: () = assert!(FILLER_START <= HMAC_START);

// ============================================================
// KEY DERIVATION
// ============================================================

/// Symmetric key for every link of a chain
///
/// 32 bytes of PBKDF2 output, split into a signing half and an encryption half.
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    signing: [u8; 16],
    encryption: [u8; 16],
}

impl ChainKey {
    /// HMAC-SHA256 key
    #[must_use]
    pub fn signing_key(&self) -> &[u8; 16] {
        &self.signing
    }

    /// AES-128 key
    #[must_use]
    pub fn encryption_key(&self) -> &[u8; 16] {
        &self.encryption
    }
}

/// Derive the chain key from the whole password
///
/// Pure: the same password always yields the same key.
#[must_use]
pub fn derive_key(password: &str) -> ChainKey {
    let mut okm = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &KDF_SALT, KDF_ITERATIONS, &mut okm[..]);

    let mut key = ChainKey {
        signing: [0u8; 16],
        encryption: [0u8; 16],
    };
    key.signing.copy_from_slice(&okm[..16]);
    key.encryption.copy_from_slice(&okm[16..]);
    key
}

// ============================================================
// BLOCK CIPHER
// ============================================================

fn new_mac(key: &ChainKey) -> Result<HmacSha256, CryptoError> {
    HmacSha256::new_from_slice(key.signing_key()).map_err(|_| CryptoError::InvalidKey)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seal one payload into a full-block token
///
/// Draws a fresh IV, filler and timestamp on every call, so sealing the same
/// payload twice yields unrelated tokens.
pub fn encrypt_block(payload: &[u8], key: &ChainKey) -> Result<Vec<u8>, CryptoError> {
    if payload.len() != PAYLOAD_LEN {
        return Err(CryptoError::InvalidLength);
    }

    let mut rng = rand::rng();
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes128CbcEnc::new(&(*key.encryption_key()).into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(payload);
    if ciphertext.len() != CIPHERTEXT_LEN {
        return Err(CryptoError::InvalidLength);
    }

    let mut token = vec![0u8; BLOCK_SIZE];
    token[0] = TOKEN_VERSION;
    token[TIMESTAMP_START..IV_START].copy_from_slice(&unix_timestamp().to_be_bytes());
    token[IV_START..CIPHERTEXT_START].copy_from_slice(&iv);
    token[CIPHERTEXT_START..FILLER_START].copy_from_slice(&ciphertext);
    rng.fill_bytes(&mut token[FILLER_START..HMAC_START]);

    let mut mac = new_mac(key)?;
    mac.update(&token[..HMAC_START]);
    let tag = mac.finalize().into_bytes();
    token[HMAC_START..].copy_from_slice(&tag);

    Ok(token)
}

/// Open a token sealed by [`encrypt_block`]
///
/// Checks the tag (constant time) before reading anything else. Any failure
/// is `CryptoError::Authentication`.
pub fn decrypt_block(token: &[u8], key: &ChainKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if token.len() != BLOCK_SIZE {
        return Err(CryptoError::Authentication);
    }

    let mut mac = new_mac(key).map_err(|_| CryptoError::Authentication)?;
    mac.update(&token[..HMAC_START]);
    mac.verify_slice(&token[HMAC_START..])
        .map_err(|_| CryptoError::Authentication)?;

    if token[0] != TOKEN_VERSION {
        return Err(CryptoError::Authentication);
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&token[IV_START..CIPHERTEXT_START]);

    let plaintext = Aes128CbcDec::new(&(*key.encryption_key()).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&token[CIPHERTEXT_START..FILLER_START])
        .map_err(|_| CryptoError::Authentication)?;

    Ok(Zeroizing::new(plaintext))
}

/// Read the (unauthenticated) creation timestamp of a token
#[must_use]
pub fn token_timestamp(token: &[u8]) -> Option<u64> {
    let bytes = token.get(TIMESTAMP_START..IV_START)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

// ============================================================
// TESTS
// ============================================================
