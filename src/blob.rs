//! Addressing blob format for plausible deniability storage.
//!
//! The addressing blob is a fixed 2 MB file containing 65,536 slots of 32 bytes each.
//! Each session writes to k=46 pseudo-random slots for redundancy.
//! Slot positions are derived from the password via KDF.
//!
//! # Security Properties
//!
//! - All slots are indistinguishable from random data
//! - No metadata reveals which slots are in use
//! - Slot scanning always visits all 46 slots of a session

use rand::RngCore;
use zeroize::Zeroize;

use crate::block::{MAX_DATA_BLOCK_SIZE, MIN_DATA_BLOCK_SIZE};
use crate::crypto::{decrypt_slot, encrypt_slot, CryptoError, SessionKeys, SlotKey};

// ============================================================
// ADDRESSING BLOB CONSTANTS
// ============================================================

/// Number of slots in the addressing blob
pub const SLOT_COUNT: usize = 65_536;

/// Size of each slot in bytes
/// SIV tag (16 bytes) + ciphertext (16 bytes)
pub const SLOT_SIZE: usize = 32;

/// Total size of addressing blob: 65,536 × 32 = 2 MB
pub const ADDRESSING_BLOB_SIZE: usize = SLOT_COUNT * SLOT_SIZE;

/// Number of slots each session writes to (redundancy factor)
pub const SLOTS_PER_SESSION: usize = 46;

/// Error types for addressing blob operations
#[derive(Debug, thiserror::Error)]
pub enum AddressingError {
    #[error("Slot index {0} out of range")]
    SlotOutOfRange(usize),
    #[error("Invalid addressing blob size: {0} bytes")]
    InvalidBlobSize(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ============================================================
// SLOT DATA STRUCTURES
// ============================================================

/// Plaintext content of a slot (before encryption)
///
/// Points at the padding region that precedes the session's current block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroize)]
pub struct SlotContent {
    /// Data blob offset where the padding before the block starts
    pub offset: u64,
    /// Serialized size of the block, used to find it after the padding
    pub block_size: u32,
    /// Random bytes, refreshed on every write so rewritten slots change
    pub nonce: [u8; 4],
}

impl SlotContent {
    /// Size of plaintext content (8 + 4 + 4 = 16 bytes)
    pub const SIZE: usize = 16;

    pub fn new(offset: u64, block_size: u32) -> Self {
        Self {
            offset,
            block_size,
            nonce: [0u8; 4],
        }
    }

    /// Serialize to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.offset.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.nonce);
        bytes
    }

    /// Deserialize from bytes (big-endian)
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            offset: u64::from_be_bytes(bytes[0..8].try_into().ok()?),
            block_size: u32::from_be_bytes(bytes[8..12].try_into().ok()?),
            nonce: bytes[12..16].try_into().ok()?,
        })
    }

    /// Structural check on a decrypted slot
    pub fn is_plausible(&self) -> bool {
        (MIN_DATA_BLOCK_SIZE..=MAX_DATA_BLOCK_SIZE).contains(&self.block_size)
            && self.offset.checked_add(u64::from(self.block_size)).is_some()
    }

    /// Same block location, ignoring the per-write nonce
    pub fn same_location(&self, other: &SlotContent) -> bool {
        self.offset == other.offset && self.block_size == other.block_size
    }
}

/// Result of scanning a session's slots (slot AEAD phase only)
///
/// The caller still has to check each valid slot against the data blob
/// and treat slots whose block does not decrypt as corrupted.
#[derive(Debug, Default)]
pub struct UnlockResult {
    /// Decrypted slots: (position, content)
    pub valid_slots: Vec<(usize, SlotContent)>,
    /// Positions (0-45) that failed slot decryption or structural checks
    pub slot_decrypt_failed: Vec<usize>,
}

impl UnlockResult {
    /// First valid slot content, if any
    pub fn first(&self) -> Option<SlotContent> {
        self.valid_slots.first().map(|(_, content)| *content)
    }
}

// ============================================================
// ADDRESSING BLOB
// ============================================================

/// The addressing blob containing all 65,536 slots
pub struct AddressingBlob {
    data: Vec<u8>,
}

impl AddressingBlob {
    /// Create a new addressing blob filled with random data
    pub fn new_random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut data = vec![0u8; ADDRESSING_BLOB_SIZE];
        rng.fill_bytes(&mut data);
        Self { data }
    }

    /// Wrap bytes loaded from storage
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, AddressingError> {
        if bytes.len() != ADDRESSING_BLOB_SIZE {
            return Err(AddressingError::InvalidBlobSize(bytes.len()));
        }
        Ok(Self { data: bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Raw slot bytes by index
    pub fn get_slot(&self, index: usize) -> Option<[u8; SLOT_SIZE]> {
        if index >= SLOT_COUNT {
            return None;
        }
        let offset = index * SLOT_SIZE;
        self.data[offset..offset + SLOT_SIZE].try_into().ok()
    }

    /// Overwrite raw slot bytes by index
    pub fn set_slot(&mut self, index: usize, slot: &[u8; SLOT_SIZE]) -> bool {
        if index >= SLOT_COUNT {
            return false;
        }
        let offset = index * SLOT_SIZE;
        self.data[offset..offset + SLOT_SIZE].copy_from_slice(slot);
        true
    }

    /// Encrypt `content` into one slot, with a fresh slot nonce
    pub fn write_slot<R: RngCore + ?Sized>(
        &mut self,
        slot_index: usize,
        content: &SlotContent,
        key: &SlotKey,
        rng: &mut R,
    ) -> Result<(), AddressingError> {
        let index = u16::try_from(slot_index).map_err(|_| AddressingError::SlotOutOfRange(slot_index))?;
        let mut content = *content;
        rng.fill_bytes(&mut content.nonce);

        let encrypted = encrypt_slot(&content, key, index)?;
        if !self.set_slot(slot_index, &encrypted) {
            return Err(AddressingError::SlotOutOfRange(slot_index));
        }
        Ok(())
    }

    /// Decrypt one slot; `Ok(None)` when it does not authenticate
    pub fn read_slot(&self, slot_index: usize, key: &SlotKey) -> Result<Option<SlotContent>, AddressingError> {
        let encrypted = self
            .get_slot(slot_index)
            .ok_or(AddressingError::SlotOutOfRange(slot_index))?;
        let index = u16::try_from(slot_index).map_err(|_| AddressingError::SlotOutOfRange(slot_index))?;
        Ok(decrypt_slot(&encrypted, key, index).ok())
    }

    /// Write `content` into all 46 slots of the session
    pub fn write_session_address<R: RngCore + ?Sized>(
        &mut self,
        keys: &SessionKeys,
        content: &SlotContent,
        rng: &mut R,
    ) -> Result<(), AddressingError> {
        let positions: Vec<usize> = (0..SLOTS_PER_SESSION).collect();
        self.write_positions(keys, &positions, content, rng)
    }

    /// Write `content` into selected positions (0-45) of the session
    ///
    /// Used to heal corrupted slots without touching the healthy ones.
    pub fn write_positions<R: RngCore + ?Sized>(
        &mut self,
        keys: &SessionKeys,
        positions: &[usize],
        content: &SlotContent,
        rng: &mut R,
    ) -> Result<(), AddressingError> {
        for &position in positions {
            let (slot_index, key) = keys
                .get_slot_info(position)
                .ok_or(AddressingError::SlotOutOfRange(position))?;
            self.write_slot(usize::from(slot_index), content, key, rng)?;
        }
        Ok(())
    }

    /// Decrypt all 46 slots of the session
    ///
    /// CRITICAL: always visits every slot, no early exit.
    pub fn scan_slots(&self, keys: &SessionKeys) -> UnlockResult {
        let mut result = UnlockResult::default();

        for position in 0..SLOTS_PER_SESSION {
            let Some((slot_index, key)) = keys.get_slot_info(position) else {
                continue;
            };
            match self.read_slot(usize::from(slot_index), key) {
                Ok(Some(content)) if content.is_plausible() => {
                    result.valid_slots.push((position, content));
                }
                _ => result.slot_decrypt_failed.push(position),
            }
        }

        result
    }

    /// First valid slot content of the session, after a full scan
    pub fn read_slots(&self, keys: &SessionKeys) -> Option<SlotContent> {
        self.scan_slots(keys).first()
    }

    /// Overwrite all 46 slots of the session with random bytes
    pub fn wipe_session_slots<R: RngCore + ?Sized>(&mut self, keys: &SessionKeys, rng: &mut R) {
        let mut noise = [0u8; SLOT_SIZE];
        for &slot_index in &keys.indices {
            rng.fill_bytes(&mut noise);
            self.set_slot(usize::from(slot_index), &noise);
        }
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfParams;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(46)
    }

    fn keys(password: &str) -> SessionKeys {
        SessionKeys::derive(password, &KdfParams::TEST).unwrap()
    }

    #[test]
    fn test_addressing_blob_size() {
        assert_eq!(ADDRESSING_BLOB_SIZE, 2 * 1024 * 1024);
        let blob = AddressingBlob::new_random(&mut rng());
        assert_eq!(blob.as_bytes().len(), ADDRESSING_BLOB_SIZE);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_size() {
        assert!(matches!(
            AddressingBlob::from_bytes(vec![0u8; 100]),
            Err(AddressingError::InvalidBlobSize(100))
        ));
        assert!(AddressingBlob::from_bytes(vec![0u8; ADDRESSING_BLOB_SIZE]).is_ok());
    }

    #[test]
    fn test_slot_content_big_endian_format() {
        let content = SlotContent {
            offset: 0x0102_0304_0506_0708,
            block_size: 0x090A_0B0C,
            nonce: [0xD, 0xE, 0xF, 0x10],
        };
        let bytes = content.to_bytes();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(SlotContent::from_bytes(&bytes), Some(content));
        assert_eq!(SlotContent::from_bytes(&bytes[..15]), None);
    }

    #[test]
    fn test_slot_content_plausibility() {
        assert!(SlotContent::new(0, MIN_DATA_BLOCK_SIZE).is_plausible());
        assert!(!SlotContent::new(0, MIN_DATA_BLOCK_SIZE - 1).is_plausible());
        assert!(!SlotContent::new(0, MAX_DATA_BLOCK_SIZE + 1).is_plausible());
        assert!(!SlotContent::new(u64::MAX, 1024).is_plausible());
    }

    #[test]
    fn test_slot_out_of_range() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let key = k.get_key(0).unwrap();

        assert!(blob.get_slot(SLOT_COUNT).is_none());
        assert!(!blob.set_slot(SLOT_COUNT, &[0u8; SLOT_SIZE]));
        assert!(matches!(
            blob.write_slot(SLOT_COUNT, &SlotContent::new(0, 1024), key, &mut rng),
            Err(AddressingError::SlotOutOfRange(SLOT_COUNT))
        ));
        assert!(matches!(
            blob.read_slot(SLOT_COUNT, key),
            Err(AddressingError::SlotOutOfRange(_))
        ));
    }

    #[test]
    fn test_write_then_read_slot() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let (index, key) = k.get_slot_info(3).unwrap();
        let content = SlotContent::new(4242, 2048);

        blob.write_slot(usize::from(index), &content, key, &mut rng).unwrap();
        let read = blob.read_slot(usize::from(index), key).unwrap().unwrap();
        assert!(read.same_location(&content));
    }

    #[test]
    fn test_rewrite_changes_slot_bytes() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let (index, key) = k.get_slot_info(0).unwrap();
        let content = SlotContent::new(1, 2048);

        blob.write_slot(usize::from(index), &content, key, &mut rng).unwrap();
        let first = blob.get_slot(usize::from(index)).unwrap();
        blob.write_slot(usize::from(index), &content, key, &mut rng).unwrap();
        let second = blob.get_slot(usize::from(index)).unwrap();

        assert_ne!(first, second, "slot nonce must refresh on every write");
    }

    #[test]
    fn test_session_address_roundtrip() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let content = SlotContent::new(123_456, 4096);

        blob.write_session_address(&k, &content, &mut rng).unwrap();

        let scan = blob.scan_slots(&k);
        assert_eq!(scan.valid_slots.len(), SLOTS_PER_SESSION);
        assert!(scan.slot_decrypt_failed.is_empty());
        assert!(blob.read_slots(&k).unwrap().same_location(&content));
    }

    #[test]
    fn test_fresh_blob_has_no_session() {
        let blob = AddressingBlob::new_random(&mut rng());
        let k = keys("password");

        let scan = blob.scan_slots(&k);
        assert!(scan.valid_slots.is_empty());
        assert_eq!(scan.slot_decrypt_failed.len(), SLOTS_PER_SESSION);
        assert!(blob.read_slots(&k).is_none());
    }

    #[test]
    fn test_survives_ten_corrupted_slots() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let content = SlotContent::new(99, 4096);
        blob.write_session_address(&k, &content, &mut rng).unwrap();

        for position in 0..10 {
            let mut noise = [0u8; SLOT_SIZE];
            rng.fill_bytes(&mut noise);
            blob.set_slot(usize::from(k.indices[position]), &noise);
        }

        let scan = blob.scan_slots(&k);
        assert_eq!(scan.valid_slots.len(), SLOTS_PER_SESSION - 10);
        assert_eq!(scan.slot_decrypt_failed, (0..10).collect::<Vec<_>>());
        assert!(blob.read_slots(&k).unwrap().same_location(&content));
    }

    #[test]
    fn test_heal_positions() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        let content = SlotContent::new(7, 4096);
        blob.write_session_address(&k, &content, &mut rng).unwrap();

        blob.set_slot(usize::from(k.indices[5]), &[0u8; SLOT_SIZE]);
        let untouched = blob.get_slot(usize::from(k.indices[6])).unwrap();

        let failed = blob.scan_slots(&k).slot_decrypt_failed;
        assert_eq!(failed, vec![5]);
        blob.write_positions(&k, &failed, &content, &mut rng).unwrap();

        assert!(blob.scan_slots(&k).slot_decrypt_failed.is_empty());
        assert_eq!(blob.get_slot(usize::from(k.indices[6])).unwrap(), untouched);
    }

    #[test]
    fn test_wipe_session_slots() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let k = keys("password");
        blob.write_session_address(&k, &SlotContent::new(1, 4096), &mut rng).unwrap();

        blob.wipe_session_slots(&k, &mut rng);
        assert!(blob.read_slots(&k).is_none());
    }

    #[test]
    fn test_two_sessions_coexist() {
        let mut rng = rng();
        let mut blob = AddressingBlob::new_random(&mut rng);
        let a = keys("alice");
        let b = keys("bob");
        blob.write_session_address(&a, &SlotContent::new(10, 4096), &mut rng).unwrap();
        blob.write_session_address(&b, &SlotContent::new(20, 8192), &mut rng).unwrap();

        assert_eq!(blob.read_slots(&a).unwrap().offset, 10);
        assert_eq!(blob.read_slots(&b).unwrap().offset, 20);
    }
}
