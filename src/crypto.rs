//! Key hierarchy and authenticated encryption.
//!
//! - Argon2id: password → 64-byte master key
//! - HKDF-SHA256: master key → slot indices, per-slot keys, session AEAD key
//! - AES-256-SIV: slot and block encryption
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `MasterKey`, `SlotKey`, `SessionAeadKey`, `BlockKey`
//!   and `SessionKeys` clear their bytes when dropped
//! - **Nonce-misuse resistance**: slots use a zero nonce under a key that is
//!   unique per (password, slot index); blocks use a fresh random nonce
//! - **Domain separation**: every HKDF expansion uses a distinct label
//!   (`slot-{n}`, `addr-key-{index}`, `aead`, block id)

use aes_siv::aead::{Aead, KeyInit, Payload};
use aes_siv::{Aes256SivAead, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::blob::{SlotContent, SLOTS_PER_SESSION, SLOT_SIZE};
use crate::config::KdfParams;

/// AES-256-SIV key size (two 256-bit keys)
pub const KEY_SIZE: usize = 64;

/// AES-SIV nonce size used for blocks
pub const NONCE_SIZE: usize = 16;

/// AES-SIV synthetic IV prepended to every ciphertext
pub const AEAD_TAG_SIZE: usize = 16;

/// Derivation attempts before giving up on collecting unique slot indices
const MAX_INDEX_CANDIDATES: u32 = 4096;

/// Error types for crypto operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid authentication tag")]
    InvalidTag,
    #[error("Invalid length")]
    InvalidLength,
}

/// Domain separation constants
const PASSWORD_KDF_SALT: &[u8] = b"deniable-storage-password-v1";
const KEY_DERIVATION_SALT: &[u8] = b"deniable-storage-kdf-v1";

/// Master key derived from password (64 bytes)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Per-slot key, bound to one slot index of one password
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SlotKey([u8; KEY_SIZE]);

impl SlotKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Session AEAD key for data and root blocks
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionAeadKey([u8; KEY_SIZE]);

impl SessionAeadKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Clone for SessionAeadKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// Key for a single block referenced from an allocation table
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BlockKey([u8; KEY_SIZE]);

impl BlockKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Derive master key from password using Argon2id
///
/// The salt is a fixed domain constant: the same password must always land
/// on the same slots without any stored per-user state.
pub fn derive_master_key(password: &str, kdf: &KdfParams) -> Result<MasterKey, CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_SIZE))
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.as_bytes(), PASSWORD_KDF_SALT, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(MasterKey(key))
}

fn expander(ikm: &[u8]) -> Hkdf<Sha256> {
    Hkdf::<Sha256>::new(Some(KEY_DERIVATION_SALT), ikm)
}

fn expand_into(hk: &Hkdf<Sha256>, label: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    hk.expand(label, out).map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Collect SLOTS_PER_SESSION distinct slot indices
///
/// Candidates come from labels "slot-0", "slot-1", ... (2 bytes, big-endian);
/// duplicates are skipped so every session owns exactly 46 distinct slots.
fn derive_slot_indices_from_expander(
    hk: &Hkdf<Sha256>,
) -> Result<[u16; SLOTS_PER_SESSION], CryptoError> {
    let mut indices: Vec<u16> = Vec::with_capacity(SLOTS_PER_SESSION);
    let mut counter = 0u32;

    while indices.len() < SLOTS_PER_SESSION {
        if counter >= MAX_INDEX_CANDIDATES {
            return Err(CryptoError::KeyDerivationFailed);
        }
        let mut bytes = [0u8; 2];
        expand_into(hk, format!("slot-{}", counter).as_bytes(), &mut bytes)?;
        let index = u16::from_be_bytes(bytes);
        if !indices.contains(&index) {
            indices.push(index);
        }
        counter += 1;
    }

    indices.try_into().map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Derive the session's slot indices from the master key
pub fn derive_slot_indices(master: &MasterKey) -> Result<[u16; SLOTS_PER_SESSION], CryptoError> {
    derive_slot_indices_from_expander(&expander(master.as_bytes()))
}

fn derive_slot_key_from_expander(hk: &Hkdf<Sha256>, slot_index: u16) -> Result<SlotKey, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    expand_into(hk, format!("addr-key-{}", slot_index).as_bytes(), &mut key)?;
    Ok(SlotKey(key))
}

/// Derive the key protecting `slot_index` for this master key
pub fn derive_slot_key(master: &MasterKey, slot_index: u16) -> Result<SlotKey, CryptoError> {
    derive_slot_key_from_expander(&expander(master.as_bytes()), slot_index)
}

/// Derive session AEAD key from master key (label "aead")
pub fn derive_session_aead_key(master: &MasterKey) -> Result<SessionAeadKey, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    expand_into(&expander(master.as_bytes()), b"aead", &mut key)?;
    Ok(SessionAeadKey(key))
}

/// Derive a per-block key from the session key, using the block id as label
pub fn derive_block_key(session_key: &SessionAeadKey, block_id: &[u8; 32]) -> Result<BlockKey, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    expand_into(&expander(session_key.as_bytes()), block_id, &mut key)?;
    Ok(BlockKey(key))
}

fn cipher(key: &[u8; KEY_SIZE]) -> Result<Aes256SivAead, CryptoError> {
    Aes256SivAead::new_from_slice(key).map_err(|_| CryptoError::InvalidLength)
}

/// Encrypt with AES-256-SIV
///
/// Output is the 16-byte synthetic IV followed by the ciphertext.
pub fn aead_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cipher(key)?
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt with AES-256-SIV
///
/// Returns `None` on any authentication failure: tampered ciphertext,
/// wrong key, wrong nonce or wrong associated data all look the same.
#[must_use]
pub fn aead_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Option<Vec<u8>> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return None;
    }
    cipher(key)
        .ok()?
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .ok()
}

/// Encrypt slot content into a 32-byte slot
///
/// Zero nonce, slot index as associated data: a valid slot copied to
/// another position no longer authenticates.
pub fn encrypt_slot(content: &SlotContent, key: &SlotKey, slot_index: u16) -> Result<[u8; SLOT_SIZE], CryptoError> {
    let mut plaintext = content.to_bytes();
    let ciphertext = aead_encrypt(
        key.as_bytes(),
        &[0u8; NONCE_SIZE],
        &plaintext,
        &slot_index.to_be_bytes(),
    );
    plaintext.zeroize();
    let ciphertext = ciphertext?;

    ciphertext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt a 32-byte slot
pub fn decrypt_slot(encrypted: &[u8; SLOT_SIZE], key: &SlotKey, slot_index: u16) -> Result<SlotContent, CryptoError> {
    let mut plaintext = aead_decrypt(
        key.as_bytes(),
        &[0u8; NONCE_SIZE],
        encrypted,
        &slot_index.to_be_bytes(),
    )
    .ok_or(CryptoError::InvalidTag)?;

    let content = SlotContent::from_bytes(&plaintext).ok_or(CryptoError::DecryptionFailed);
    plaintext.zeroize();
    content
}

/// All key material for one password
///
/// Holds the 46 slot indices, the key for each of those slots and the
/// session AEAD key. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// The 46 distinct slot indices this session uses
    #[zeroize(skip)]
    pub indices: [u16; SLOTS_PER_SESSION],
    /// Per-slot keys, same order as `indices`
    keys: [SlotKey; SLOTS_PER_SESSION],
    session_key: SessionAeadKey,
}

impl SessionKeys {
    /// Derive all session keys from password
    ///
    /// One Argon2id call, one HKDF extract, then expansions for the
    /// indices, the 46 slot keys and the session key.
    pub fn derive(password: &str, kdf: &KdfParams) -> Result<Self, CryptoError> {
        let master = derive_master_key(password, kdf)?;
        let hk = expander(master.as_bytes());

        let indices = derive_slot_indices_from_expander(&hk)?;

        let keys: Vec<SlotKey> = indices
            .iter()
            .map(|&slot_index| derive_slot_key_from_expander(&hk, slot_index))
            .collect::<Result<_, _>>()?;
        let keys: [SlotKey; SLOTS_PER_SESSION] =
            keys.try_into().map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut session_key = [0u8; KEY_SIZE];
        expand_into(&hk, b"aead", &mut session_key)?;

        Ok(Self {
            indices,
            keys,
            session_key: SessionAeadKey(session_key),
        })
    }

    /// Get the key for a position (0-45, not slot index)
    #[must_use]
    pub fn get_key(&self, position: usize) -> Option<&SlotKey> {
        self.keys.get(position)
    }

    /// Get slot index and key together
    #[must_use]
    pub fn get_slot_info(&self, position: usize) -> Option<(u16, &SlotKey)> {
        if position < SLOTS_PER_SESSION {
            Some((self.indices[position], &self.keys[position]))
        } else {
            None
        }
    }

    /// Position of a slot index within this session, if it belongs to it
    #[must_use]
    pub fn position_of(&self, slot_index: u16) -> Option<usize> {
        self.indices.iter().position(|&i| i == slot_index)
    }

    #[must_use]
    pub fn session_key(&self) -> &SessionAeadKey {
        &self.session_key
    }
}

// ============================================================
// TESTS
// ============================================================
