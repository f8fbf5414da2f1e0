//! Session facade for plausible deniability storage.
//!
//! Manages the lifecycle of password-protected sessions:
//! - Create (append padding + block, write 46 slots)
//! - Unlock (scan all 46 slots, locate and decrypt the block, self-heal)
//! - Update (append a new version linked to the old one)
//! - Delete (overwrite every version and the 46 slots with noise)
//!
//! # Security Properties
//!
//! - **Self-healing slots**: on unlock, slots that fail to decrypt or point
//!   at the wrong place are rewritten; healthy slots are left alone
//! - **Full scan**: all 46 slots are decrypted on every lookup
//! - **Pareto padding**: random padding before every block hides boundaries
//! - **Zeroized output**: `UnlockedSession` clears its payload on drop
//! - **Quiet logs**: passwords, keys, offsets and sizes are never logged

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::blob::{AddressingBlob, AddressingError, SlotContent, ADDRESSING_BLOB_SIZE};
use crate::block::{DATA_BLOCK_OVERHEAD, MAX_DATA_BLOCK_SIZE};
use crate::config::StorageConfig;
use crate::crypto::{CryptoError, SessionKeys, AEAD_TAG_SIZE};
use crate::data_blob::{
    append_block, append_random_padding, block_candidates, create_data_block, generate_padding,
    parse_data_blob, BlockHeader, BlockRef, BLOCK_HEADER_SIZE,
};
use crate::distribution::generate_padding_size;
use crate::fs::StorageAdapter;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid password: {0}")]
    InvalidPassword(&'static str),
    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Storage is not initialized")]
    NotInitialized,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Invalid blob: {0}")]
    InvalidBlob(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage adapter error: {0}")]
    Adapter(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Addressing error: {0}")]
    Addressing(#[from] AddressingError),
}

/// Decrypted session contents
///
/// The payload is zeroized when this value is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct UnlockedSession {
    pub data: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl UnlockedSession {
    /// Take the payload out, leaving an empty buffer behind
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl std::fmt::Debug for UnlockedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedSession")
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Where a session currently lives, plus its provenance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionAddress {
    /// Start of the padding in front of the block
    pub offset: u64,
    pub block_size: u32,
    pub created_at: u64,
    pub updated_at: u64,
    pub salt: [u8; 16],
}

/// Blob sizes in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageStats {
    pub addressing_blob_size: u64,
    pub data_blob_size: u64,
}

/// A session found through its slots and decrypted
struct ResolvedSession {
    slot: SlotContent,
    block_start: u64,
    header: BlockHeader,
    data: Zeroizing<Vec<u8>>,
    /// Positions whose slot must be rewritten
    corrupted: Vec<usize>,
}

impl ResolvedSession {
    fn block_ref(&self) -> BlockRef {
        BlockRef {
            block_start: self.block_start,
            block_size: self.slot.block_size,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Multi-session deniable storage over a [`StorageAdapter`]
///
/// Every mutating operation takes `&mut self`; one instance owns its
/// storage for the duration of each call.
pub struct DeniableStorage<S: StorageAdapter, R: RngCore + CryptoRng = OsRng> {
    storage: S,
    config: StorageConfig,
    rng: R,
    initialized: bool,
}

impl<S: StorageAdapter> DeniableStorage<S, OsRng> {
    /// Create storage with default config for this build
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, StorageConfig::default())
    }

    pub fn with_config(storage: S, config: StorageConfig) -> Self {
        Self::with_rng(storage, config, OsRng)
    }
}

impl<S: StorageAdapter, R: RngCore + CryptoRng> DeniableStorage<S, R> {
    /// Create storage with an explicit random source
    pub fn with_rng(storage: S, config: StorageConfig, rng: R) -> Self {
        Self {
            storage,
            config,
            rng,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Prepare both blobs
    ///
    /// A missing addressing blob is created as 2 MB of noise, a missing
    /// data blob is seeded with Pareto-sized padding. Existing blobs are
    /// kept. Calling again is a no-op.
    pub fn initialize(&mut self) -> Result<(), StorageError> {
        if self.initialized {
            return Ok(());
        }
        debug!("initializing storage");
        self.storage.initialize()?;

        if self.storage.has_addressing_blob()? {
            let len = self.storage.read_addressing_blob()?.len();
            if len != ADDRESSING_BLOB_SIZE {
                return Err(StorageError::InvalidBlob(format!(
                    "addressing blob is {} bytes, expected {}",
                    len, ADDRESSING_BLOB_SIZE
                )));
            }
        } else {
            let blob = AddressingBlob::new_random(&mut self.rng);
            self.storage.write_addressing_blob(blob.as_bytes())?;
        }

        if !self.storage.has_data_blob()? {
            let size = generate_padding_size(&mut self.rng, self.config.padding());
            self.storage.write_data_blob(&[])?;
            append_random_padding(&mut self.storage, u64::from(size), &mut self.rng)?;
        }

        self.initialized = true;
        Ok(())
    }

    /// Store `data` under `password`
    ///
    /// An existing session under the same password is replaced: the new
    /// version is written first, then every block of the old chain is
    /// overwritten with noise.
    pub fn create_session(&mut self, password: &str, data: &[u8]) -> Result<(), StorageError> {
        self.validate_password(password)?;
        self.validate_payload(data)?;
        self.ensure_initialized()?;

        let keys = SessionKeys::derive(password, self.config.kdf())?;
        let mut blob = self.load_addressing_blob()?;
        let replaced = self.resolve(&keys, &blob)?.map(|resolved| resolved.block_ref());

        let now = now_millis();
        let mut salt = [0u8; 16];
        self.rng.fill_bytes(&mut salt);
        let header = BlockHeader {
            used_length: 0,
            created_at: now,
            updated_at: now,
            salt,
            previous: None,
        };

        self.write_version(&keys, &mut blob, &header, data)?;
        if let Some(old) = replaced {
            let wiped = self.wipe_chain(&keys, old)?;
            trace!("wiped {} replaced block versions", wiped);
        }
        debug!("session created");
        Ok(())
    }

    /// Decrypt the session stored under `password`
    ///
    /// `Ok(None)` for a wrong password, an absent session or a block that
    /// no longer decrypts. Corrupted slots are repaired on success.
    pub fn unlock_session(&mut self, password: &str) -> Result<Option<UnlockedSession>, StorageError> {
        self.validate_password(password)?;
        self.ensure_initialized()?;

        let keys = SessionKeys::derive(password, self.config.kdf())?;
        let mut blob = self.load_addressing_blob()?;

        let Some(mut resolved) = self.resolve(&keys, &blob)? else {
            trace!("unlock found no session");
            return Ok(None);
        };
        self.heal(&keys, &mut blob, &resolved)?;

        Ok(Some(UnlockedSession {
            data: std::mem::take(&mut *resolved.data),
            created_at: resolved.header.created_at,
            updated_at: resolved.header.updated_at,
        }))
    }

    /// Location and provenance of the session under `password`
    pub fn session_address(&mut self, password: &str) -> Result<Option<SessionAddress>, StorageError> {
        self.validate_password(password)?;
        self.ensure_initialized()?;

        let keys = SessionKeys::derive(password, self.config.kdf())?;
        let blob = self.load_addressing_blob()?;

        Ok(self.resolve(&keys, &blob)?.map(|resolved| SessionAddress {
            offset: resolved.slot.offset,
            block_size: resolved.slot.block_size,
            created_at: resolved.header.created_at,
            updated_at: resolved.header.updated_at,
            salt: resolved.header.salt,
        }))
    }

    /// Replace the payload of an existing session
    ///
    /// Appends a new block that keeps `created_at` and the salt and links
    /// back to the previous block, then repoints all 46 slots. The previous
    /// block is left as it is.
    pub fn update_session(&mut self, password: &str, data: &[u8]) -> Result<(), StorageError> {
        self.validate_password(password)?;
        self.validate_payload(data)?;
        self.ensure_initialized()?;

        let keys = SessionKeys::derive(password, self.config.kdf())?;
        let mut blob = self.load_addressing_blob()?;
        let resolved = self.resolve(&keys, &blob)?.ok_or(StorageError::SessionNotFound)?;

        let header = BlockHeader {
            used_length: 0,
            created_at: resolved.header.created_at,
            updated_at: now_millis().max(resolved.header.created_at),
            salt: resolved.header.salt,
            previous: Some(resolved.block_ref()),
        };

        self.write_version(&keys, &mut blob, &header, data)?;
        debug!("session updated");
        Ok(())
    }

    /// Destroy the session under `password`
    ///
    /// Every block in the update chain is overwritten with noise, then the
    /// 46 slots. Padding is left untouched.
    pub fn delete_session(&mut self, password: &str) -> Result<(), StorageError> {
        self.validate_password(password)?;
        self.ensure_initialized()?;

        let keys = SessionKeys::derive(password, self.config.kdf())?;
        let mut blob = self.load_addressing_blob()?;
        let resolved = self.resolve(&keys, &blob)?.ok_or(StorageError::SessionNotFound)?;

        let wiped = self.wipe_chain(&keys, resolved.block_ref())?;
        trace!("wiped {} block versions", wiped);

        blob.wipe_session_slots(&keys, &mut self.rng);
        self.storage.write_addressing_blob(blob.as_bytes())?;
        debug!("session deleted");
        Ok(())
    }

    /// Current blob sizes
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let addressing_blob_size = if self.storage.has_addressing_blob()? {
            ADDRESSING_BLOB_SIZE as u64
        } else {
            0
        };
        Ok(StorageStats {
            addressing_blob_size,
            data_blob_size: self.storage.data_blob_size()?,
        })
    }

    /// Destroy all blobs through the adapter
    ///
    /// The instance must be initialized again before further use.
    pub fn secure_wipe_all(&mut self) -> Result<(), StorageError> {
        self.storage.secure_wipe()?;
        self.initialized = false;
        debug!("storage wiped");
        Ok(())
    }

    // ------------------------------------------------------------
    // internals
    // ------------------------------------------------------------

    fn validate_password(&self, password: &str) -> Result<(), StorageError> {
        if password.is_empty() {
            return Err(StorageError::InvalidPassword("password must not be empty"));
        }
        if password.chars().count() > self.config.limits().max_password_chars {
            return Err(StorageError::InvalidPassword("password is too long"));
        }
        Ok(())
    }

    /// Enforce the configured limit and what a single block can hold
    fn validate_payload(&self, data: &[u8]) -> Result<(), StorageError> {
        let block_capacity = MAX_DATA_BLOCK_SIZE as usize - DATA_BLOCK_OVERHEAD - AEAD_TAG_SIZE - BLOCK_HEADER_SIZE;
        let max = self.config.limits().max_payload_bytes.min(block_capacity);
        if data.len() > max {
            return Err(StorageError::PayloadTooLarge { size: data.len(), max });
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), StorageError> {
        if self.initialized {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    fn load_addressing_blob(&self) -> Result<AddressingBlob, StorageError> {
        Ok(AddressingBlob::from_bytes(self.storage.read_addressing_blob()?)?)
    }

    /// Append a new block and point all 46 slots at it
    ///
    /// The data blob is written before the addressing blob: if the second
    /// write fails, the appended bytes are just more padding.
    fn write_version(
        &mut self,
        keys: &SessionKeys,
        blob: &mut AddressingBlob,
        header: &BlockHeader,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let padding = *self.config.padding();
        let block = create_data_block(header, data, keys.session_key(), &mut self.rng, &padding)?;
        let appended = append_block(&mut self.storage, &block, &mut self.rng, &padding)?;

        let content = SlotContent::new(appended.padding_start, block.size);
        blob.write_session_address(keys, &content, &mut self.rng)?;
        self.storage.write_addressing_blob(blob.as_bytes())?;
        Ok(())
    }

    /// Find and decrypt the session's current block
    ///
    /// Visits every valid slot: the first one whose block decrypts wins,
    /// the others are checked against it and marked corrupted on mismatch.
    fn resolve(&self, keys: &SessionKeys, blob: &AddressingBlob) -> Result<Option<ResolvedSession>, StorageError> {
        let scan = blob.scan_slots(keys);
        if scan.valid_slots.is_empty() {
            return Ok(None);
        }

        let data_size = self.storage.data_blob_size()?;
        let mut corrupted = scan.slot_decrypt_failed;
        let mut found: Option<ResolvedSession> = None;

        for (position, content) in &scan.valid_slots {
            let in_bounds = content
                .offset
                .checked_add(u64::from(content.block_size))
                .map_or(false, |end| end <= data_size);
            if !in_bounds {
                corrupted.push(*position);
                continue;
            }

            match &found {
                Some(resolved) => {
                    if !resolved.slot.same_location(content) {
                        corrupted.push(*position);
                    }
                }
                None => match self.open_block(content, keys, data_size)? {
                    Some(resolved) => found = Some(resolved),
                    None => corrupted.push(*position),
                },
            }
        }

        Ok(found.map(|mut resolved| {
            corrupted.sort_unstable();
            resolved.corrupted = corrupted;
            resolved
        }))
    }

    /// Scan forward from the slot's offset for a block that decrypts
    fn open_block(
        &self,
        content: &SlotContent,
        keys: &SessionKeys,
        data_size: u64,
    ) -> Result<Option<ResolvedSession>, StorageError> {
        let max_padding = self.config.padding().pareto_max;
        let window_len = (u64::from(max_padding) + 4).min(data_size - content.offset);
        let window = self.storage.read_data_range(content.offset, window_len)?;
        let block_size = u64::from(content.block_size);

        for relative in block_candidates(&window, 0, content.block_size, max_padding) {
            let block_start = content.offset + relative;
            if block_start + block_size > data_size {
                break;
            }
            let bytes = self.storage.read_data_range(block_start, block_size)?;
            if let Some((header, data)) = parse_data_blob(&bytes, 0, keys.session_key()) {
                return Ok(Some(ResolvedSession {
                    slot: *content,
                    block_start,
                    header,
                    data: Zeroizing::new(data),
                    corrupted: Vec::new(),
                }));
            }
            trace!("size header matched but block did not decrypt");
        }
        Ok(None)
    }

    /// Rewrite only the corrupted slot positions
    fn heal(
        &mut self,
        keys: &SessionKeys,
        blob: &mut AddressingBlob,
        resolved: &ResolvedSession,
    ) -> Result<(), StorageError> {
        if resolved.corrupted.is_empty() {
            return Ok(());
        }
        trace!("healing {} slots", resolved.corrupted.len());
        blob.write_positions(keys, &resolved.corrupted, &resolved.slot, &mut self.rng)?;
        self.storage.write_addressing_blob(blob.as_bytes())?;
        Ok(())
    }

    /// Overwrite `head` and every earlier version it links to
    ///
    /// Links must point strictly backwards; the walk stops at the first
    /// block that does not decrypt. Returns the number of blocks wiped.
    fn wipe_chain(&mut self, keys: &SessionKeys, head: BlockRef) -> Result<usize, StorageError> {
        let data_size = self.storage.data_blob_size()?;
        let mut current = Some(head);
        let mut wiped = 0;

        while let Some(block) = current {
            let size = u64::from(block.block_size);
            let in_bounds = block
                .block_start
                .checked_add(size)
                .map_or(false, |end| end <= data_size);
            if !in_bounds {
                break;
            }

            let bytes = self.storage.read_data_range(block.block_start, size)?;
            let Some((header, mut data)) = parse_data_blob(&bytes, 0, keys.session_key()) else {
                break;
            };
            data.zeroize();

            let noise = generate_padding(&mut self.rng, bytes.len());
            self.storage.write_data_range(block.block_start, &noise)?;
            wiped += 1;

            current = header.previous.filter(|prev| prev.block_start < block.block_start);
        }
        Ok(wiped)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::SLOT_SIZE;
    use crate::config::{KdfParams, Limits, PaddingValues};
    use crate::fs::{BlobKind, InMemoryStorage};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    type TestStorage = DeniableStorage<InMemoryStorage, ChaCha20Rng>;

    fn config() -> StorageConfig {
        StorageConfig::with_padding(PaddingValues::TEST).with_kdf(KdfParams::TEST)
    }

    fn setup(seed: u64) -> (TestStorage, InMemoryStorage) {
        let fs = InMemoryStorage::new();
        let mut storage = DeniableStorage::with_rng(fs.clone(), config(), ChaCha20Rng::seed_from_u64(seed));
        storage.initialize().unwrap();
        (storage, fs)
    }

    #[test]
    fn test_initialize_creates_blobs() {
        let (storage, fs) = setup(1);
        let stats = storage.stats().unwrap();
        assert_eq!(stats.addressing_blob_size, ADDRESSING_BLOB_SIZE as u64);
        assert!(stats.data_blob_size >= u64::from(PaddingValues::TEST.pareto_min));
        assert!(stats.data_blob_size <= u64::from(PaddingValues::TEST.pareto_max));
        assert_eq!(fs.write_count(BlobKind::Addressing), 1);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (mut storage, fs) = setup(2);
        let before = fs.get_blob(BlobKind::Data).unwrap();
        storage.initialize().unwrap();
        assert_eq!(fs.get_blob(BlobKind::Data).unwrap(), before);
        assert_eq!(fs.write_count(BlobKind::Addressing), 1);
    }

    #[test]
    fn test_initialize_keeps_existing_blobs() {
        let (_, fs) = setup(3);
        let addressing = fs.get_blob(BlobKind::Addressing).unwrap();

        let mut reopened = DeniableStorage::with_rng(fs.clone(), config(), ChaCha20Rng::seed_from_u64(99));
        reopened.initialize().unwrap();
        assert_eq!(fs.get_blob(BlobKind::Addressing).unwrap(), addressing);
    }

    #[test]
    fn test_initialize_rejects_malformed_addressing_blob() {
        let mut fs = InMemoryStorage::new();
        fs.write_addressing_blob(&[0u8; 100]).unwrap();
        let mut storage = DeniableStorage::with_rng(fs, config(), ChaCha20Rng::seed_from_u64(4));
        assert!(matches!(storage.initialize(), Err(StorageError::InvalidBlob(_))));
        assert!(!storage.is_initialized());
    }

    #[test]
    fn test_operations_require_initialization() {
        let mut storage = DeniableStorage::with_rng(InMemoryStorage::new(), config(), ChaCha20Rng::seed_from_u64(5));
        assert!(matches!(storage.create_session("pw", b"x"), Err(StorageError::NotInitialized)));
        assert!(matches!(storage.unlock_session("pw"), Err(StorageError::NotInitialized)));
        assert!(matches!(storage.update_session("pw", b"x"), Err(StorageError::NotInitialized)));
        assert!(matches!(storage.delete_session("pw"), Err(StorageError::NotInitialized)));
    }

    #[test]
    fn test_session_lifecycle() {
        let (mut storage, _) = setup(6);
        storage.create_session("correct-password", &[1, 2, 3]).unwrap();

        let session = storage.unlock_session("correct-password").unwrap().unwrap();
        assert_eq!(session.data, vec![1, 2, 3]);
        assert_eq!(session.created_at, session.updated_at);

        assert!(storage.unlock_session("wrong-password").unwrap().is_none());
    }

    #[test]
    fn test_input_validation() {
        let (mut storage, _) = setup(7);
        assert!(matches!(storage.create_session("", b"x"), Err(StorageError::InvalidPassword(_))));
        assert!(matches!(
            storage.unlock_session(&"a".repeat(1001)),
            Err(StorageError::InvalidPassword(_))
        ));
        // 1000 multi-byte characters are within the limit
        storage.create_session(&"é".repeat(1000), b"ok").unwrap();

        let small = StorageConfig::with_padding(PaddingValues::TEST)
            .with_kdf(KdfParams::TEST)
            .with_limits(Limits {
                max_password_chars: 1000,
                max_payload_bytes: 4,
            });
        let mut limited = DeniableStorage::with_rng(InMemoryStorage::new(), small, ChaCha20Rng::seed_from_u64(8));
        limited.initialize().unwrap();
        assert!(matches!(
            limited.create_session("pw", &[0u8; 5]),
            Err(StorageError::PayloadTooLarge { size: 5, max: 4 })
        ));
        limited.create_session("pw", &[0u8; 4]).unwrap();
    }

    #[test]
    fn test_empty_payload() {
        let (mut storage, _) = setup(9);
        storage.create_session("pw", &[]).unwrap();
        assert!(storage.unlock_session("pw").unwrap().unwrap().data.is_empty());
    }

    #[test]
    fn test_update_and_delete_missing_session() {
        let (mut storage, _) = setup(10);
        assert!(matches!(storage.update_session("nobody", b"x"), Err(StorageError::SessionNotFound)));
        assert!(matches!(storage.delete_session("nobody"), Err(StorageError::SessionNotFound)));
    }

    #[test]
    fn test_update_keeps_provenance_and_old_block() {
        let (mut storage, fs) = setup(11);
        storage.create_session("pw", b"v1").unwrap();
        let before = storage.session_address("pw").unwrap().unwrap();
        let snapshot = fs.get_blob(BlobKind::Data).unwrap();

        storage.update_session("pw", b"version two").unwrap();

        let after = storage.session_address("pw").unwrap().unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.salt, before.salt);
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.offset, snapshot.len() as u64);

        // Append-only: everything written before the update is untouched
        let data = fs.get_blob(BlobKind::Data).unwrap();
        assert_eq!(&data[..snapshot.len()], &snapshot[..]);

        assert_eq!(storage.unlock_session("pw").unwrap().unwrap().data, b"version two");
    }

    #[test]
    fn test_delete_wipes_every_version() {
        let (mut storage, fs) = setup(12);
        storage.create_session("pw", b"first").unwrap();
        storage.update_session("pw", b"second").unwrap();
        storage.update_session("pw", b"third").unwrap();

        let keys = SessionKeys::derive("pw", &KdfParams::TEST).unwrap();
        let head = {
            let blob = storage.load_addressing_blob().unwrap();
            storage.resolve(&keys, &blob).unwrap().unwrap().block_ref()
        };

        storage.delete_session("pw").unwrap();
        assert!(storage.unlock_session("pw").unwrap().is_none());

        // No version of the session decrypts anywhere in the blob
        let data = fs.get_blob(BlobKind::Data).unwrap();
        let session_key = keys.session_key();
        for start in 0..data.len() {
            assert!(parse_data_blob(&data, start as u64, session_key).is_none());
        }
        assert!(head.block_start < data.len() as u64);
    }

    #[test]
    fn test_delete_leaves_other_sessions() {
        let (mut storage, _) = setup(13);
        storage.create_session("alice", b"a").unwrap();
        storage.create_session("bob", b"b").unwrap();

        storage.delete_session("alice").unwrap();
        assert!(storage.unlock_session("alice").unwrap().is_none());
        assert_eq!(storage.unlock_session("bob").unwrap().unwrap().data, b"b");
    }

    #[test]
    fn test_create_overwrites_existing_session() {
        let (mut storage, _) = setup(14);
        storage.create_session("pw", b"old").unwrap();
        storage.create_session("pw", b"new").unwrap();
        assert_eq!(storage.unlock_session("pw").unwrap().unwrap().data, b"new");
    }

    #[test]
    fn test_recreate_then_delete_leaves_nothing_decryptable() {
        let (mut storage, fs) = setup(20);
        storage.create_session("pw", b"first secret").unwrap();
        storage.update_session("pw", b"first secret v2").unwrap();
        storage.create_session("pw", b"second").unwrap();

        let keys = SessionKeys::derive("pw", &KdfParams::TEST).unwrap();
        let decryptable = |data: &[u8]| {
            (0..data.len())
                .filter_map(|start| parse_data_blob(data, start as u64, keys.session_key()))
                .map(|(_, payload)| payload)
                .collect::<Vec<_>>()
        };

        // Replacing destroys the old chain right away
        let data = fs.get_blob(BlobKind::Data).unwrap();
        assert_eq!(decryptable(&data), vec![b"second".to_vec()]);

        storage.delete_session("pw").unwrap();
        let data = fs.get_blob(BlobKind::Data).unwrap();
        assert!(decryptable(&data).is_empty());
    }

    #[test]
    fn test_payload_limit_capped_by_block_size() {
        let huge = StorageConfig::with_padding(PaddingValues::TEST)
            .with_kdf(KdfParams::TEST)
            .with_limits(Limits {
                max_password_chars: 1000,
                max_payload_bytes: 300 * 1024 * 1024,
            });
        let mut storage = DeniableStorage::with_rng(InMemoryStorage::new(), huge, ChaCha20Rng::seed_from_u64(19));
        storage.initialize().unwrap();

        let capacity = MAX_DATA_BLOCK_SIZE as usize - DATA_BLOCK_OVERHEAD - AEAD_TAG_SIZE - BLOCK_HEADER_SIZE;
        let payload = vec![0u8; capacity + 1];
        let err = storage.create_session("pw", &payload).unwrap_err();
        assert!(matches!(err, StorageError::PayloadTooLarge { size, max } if size == capacity + 1 && max == capacity));
        assert!(storage.unlock_session("pw").unwrap().is_none());
    }

    #[test]
    fn test_self_healing_only_corrupted_slots() {
        let (mut storage, mut fs) = setup(15);
        storage.create_session("password", b"heal me").unwrap();

        let keys = SessionKeys::derive("password", &KdfParams::TEST).unwrap();
        let corrupted_positions = [5usize, 17, 42];

        let mut addressing = fs.get_blob(BlobKind::Addressing).unwrap();
        for (i, &pos) in corrupted_positions.iter().enumerate() {
            let offset = usize::from(keys.indices[pos]) * SLOT_SIZE;
            let mut garbage = [0xFFu8; SLOT_SIZE];
            garbage[0] = i as u8;
            addressing[offset..offset + SLOT_SIZE].copy_from_slice(&garbage);
        }
        fs.write_addressing_blob(&addressing).unwrap();
        fs.reset_write_count(BlobKind::Addressing);

        let session = storage.unlock_session("password").unwrap().unwrap();
        assert_eq!(session.data, b"heal me");
        assert_eq!(fs.write_count(BlobKind::Addressing), 1);

        let healed = fs.get_blob(BlobKind::Addressing).unwrap();
        for slot in 0..crate::blob::SLOT_COUNT {
            let range = slot * SLOT_SIZE..(slot + 1) * SLOT_SIZE;
            let is_corrupted = corrupted_positions
                .iter()
                .any(|&pos| usize::from(keys.indices[pos]) == slot);
            if is_corrupted {
                assert_ne!(healed[range.clone()], addressing[range]);
            } else {
                assert_eq!(healed[range.clone()], addressing[range], "slot {} changed", slot);
            }
        }

        // Healthy now: a second unlock writes nothing
        fs.reset_write_count(BlobKind::Addressing);
        storage.unlock_session("password").unwrap().unwrap();
        assert_eq!(fs.write_count(BlobKind::Addressing), 0);
    }

    #[test]
    fn test_self_healing_detects_out_of_bounds_slot() {
        let (mut storage, mut fs) = setup(16);
        storage.create_session("password", b"data").unwrap();

        let keys = SessionKeys::derive("password", &KdfParams::TEST).unwrap();
        let mut blob = AddressingBlob::from_bytes(fs.get_blob(BlobKind::Addressing).unwrap()).unwrap();
        let (index, key) = keys.get_slot_info(0).unwrap();
        let bogus = SlotContent::new(u64::MAX / 2, 1024);
        blob.write_slot(usize::from(index), &bogus, key, &mut ChaCha20Rng::seed_from_u64(0))
            .unwrap();
        fs.write_addressing_blob(blob.as_bytes()).unwrap();
        fs.reset_write_count(BlobKind::Addressing);

        assert_eq!(storage.unlock_session("password").unwrap().unwrap().data, b"data");
        assert_eq!(fs.write_count(BlobKind::Addressing), 1);

        let healed = AddressingBlob::from_bytes(fs.get_blob(BlobKind::Addressing).unwrap()).unwrap();
        let slot = healed.read_slot(usize::from(index), key).unwrap().unwrap();
        assert_ne!(slot.offset, bogus.offset);
    }

    #[test]
    fn test_wrong_password_does_not_write() {
        let (mut storage, fs) = setup(17);
        storage.create_session("password", b"data").unwrap();
        fs.reset_write_count(BlobKind::Addressing);
        fs.reset_write_count(BlobKind::Data);

        assert!(storage.unlock_session("not-it").unwrap().is_none());
        assert_eq!(fs.write_count(BlobKind::Addressing), 0);
        assert_eq!(fs.write_count(BlobKind::Data), 0);
    }

    #[test]
    fn test_secure_wipe_all_resets() {
        let (mut storage, fs) = setup(18);
        storage.create_session("pw", b"data").unwrap();

        storage.secure_wipe_all().unwrap();
        assert!(!storage.is_initialized());
        assert!(fs.get_blob(BlobKind::Addressing).is_none());
        assert!(matches!(storage.unlock_session("pw"), Err(StorageError::NotInitialized)));

        storage.initialize().unwrap();
        assert!(storage.unlock_session("pw").unwrap().is_none());
    }

    #[test]
    fn test_unlocked_session_debug_hides_data() {
        let session = UnlockedSession {
            data: b"secret".to_vec(),
            created_at: 1,
            updated_at: 2,
        };
        let shown = format!("{:?}", session);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("6 bytes"));
    }
}
