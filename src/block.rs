//! Block structures for encrypted storage.
//!
//! - AllocationEntry: 56 bytes, maps a logical range to a physical block
//! - RootBlock: versioned allocation table, kept sorted by logical address
//! - DataBlock: on-disk framing `size ‖ nonce ‖ ciphertext`
//!
//! # Security Properties
//!
//! - **Random block IDs**: each block has a random 32-byte ID used for
//!   per-block key derivation
//! - **Bound framing**: the size header is authenticated as associated data,
//!   together with a domain label separating root blocks from session blocks
//! - **Garbage tolerant**: parsing and decryption return `None` on any
//!   malformed input, never panic

use rand::RngCore;

use crate::crypto::{aead_decrypt, aead_encrypt, CryptoError, SessionAeadKey, AEAD_TAG_SIZE, NONCE_SIZE};

// ============================================================
// CONSTANTS
// ============================================================

/// Size of a block ID (random identifier for key derivation)
pub const BLOCK_ID_SIZE: usize = 32;

/// Size of each allocation entry in bytes
pub const ALLOCATION_ENTRY_SIZE: usize = 56;

/// Root block header: version, entry_count, total_data_size
pub const ROOT_BLOCK_HEADER_SIZE: usize = 16;

/// Current root block format version
pub const ROOT_BLOCK_VERSION: u32 = 1;

/// Data block framing: 4-byte size + 16-byte nonce
pub const DATA_BLOCK_OVERHEAD: usize = 4 + NONCE_SIZE;

/// Smallest size header a block can carry (framing + at least one byte)
pub const MIN_DATA_BLOCK_SIZE: u32 = DATA_BLOCK_OVERHEAD as u32 + 1;

/// Largest size header accepted when scanning for blocks (256 MiB)
pub const MAX_DATA_BLOCK_SIZE: u32 = 256 * 1024 * 1024;

/// Associated-data label for root blocks
pub(crate) const ROOT_BLOCK_DOMAIN: &[u8] = b"root";

// ============================================================
// BLOCK ID
// ============================================================

/// Random 32-byte identifier for a block (used for key derivation)
pub type BlockId = [u8; BLOCK_ID_SIZE];

/// Generate a random block ID
#[must_use]
pub fn generate_block_id<R: RngCore + ?Sized>(rng: &mut R) -> BlockId {
    let mut id = [0u8; BLOCK_ID_SIZE];
    rng.fill_bytes(&mut id);
    id
}

// ============================================================
// ALLOCATION ENTRY
// ============================================================

/// Single entry in the allocation table (56 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationEntry {
    /// Physical byte offset of the block in the data blob
    pub offset: u64,
    /// Logical length covered by this block
    pub length: u32,
    /// Logical address where this block's range starts
    pub logical_address: u64,
    /// Serialized size of the block on disk
    pub block_size: u32,
    /// Random identifier for key derivation
    pub block_id: BlockId,
}

impl AllocationEntry {
    pub const SIZE: usize = ALLOCATION_ENTRY_SIZE;

    pub fn new(offset: u64, length: u32, logical_address: u64, block_size: u32, block_id: BlockId) -> Self {
        Self {
            offset,
            length,
            logical_address,
            block_size,
            block_id,
        }
    }

    /// Serialize to bytes (big-endian)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.offset.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_be_bytes());
        bytes[12..20].copy_from_slice(&self.logical_address.to_be_bytes());
        bytes[20..24].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[24..56].copy_from_slice(&self.block_id);
        bytes
    }

    /// Deserialize from bytes (big-endian)
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            offset: u64::from_be_bytes(bytes[0..8].try_into().ok()?),
            length: u32::from_be_bytes(bytes[8..12].try_into().ok()?),
            logical_address: u64::from_be_bytes(bytes[12..20].try_into().ok()?),
            block_size: u32::from_be_bytes(bytes[20..24].try_into().ok()?),
            block_id: bytes[24..56].try_into().ok()?,
        })
    }

    /// End of the logical range (exclusive), saturating
    #[must_use]
    pub fn end_address(&self) -> u64 {
        self.logical_address.saturating_add(u64::from(self.length))
    }

    /// Check if this entry covers the given logical address
    #[must_use]
    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.logical_address && address < self.end_address()
    }
}

// ============================================================
// ROOT BLOCK
// ============================================================

/// Reasons a root block fails validation
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RootBlockError {
    #[error("Unsupported root block version {0}")]
    UnsupportedVersion(u32),
    #[error("Entry count {declared} does not match {actual} entries")]
    EntryCountMismatch { declared: u32, actual: usize },
    #[error("Entry {0} is not in ascending logical order")]
    Unsorted(usize),
    #[error("Entry {0} overlaps the previous entry")]
    Overlap(usize),
    #[error("Total data size {total} is smaller than entry end {end}")]
    TotalSizeTooSmall { total: u64, end: u64 },
}

/// Allocation table stored in a root block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootBlock {
    pub version: u32,
    pub entry_count: u32,
    /// Highest logical end address covered by any entry
    pub total_data_size: u64,
    entries: Vec<AllocationEntry>,
}

impl RootBlock {
    /// Empty root block at the current version
    pub fn new() -> Self {
        Self {
            version: ROOT_BLOCK_VERSION,
            entry_count: 0,
            total_data_size: 0,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[AllocationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry at its sorted position
    pub fn add_entry(&mut self, entry: AllocationEntry) {
        let position = self
            .entries
            .partition_point(|e| e.logical_address < entry.logical_address);
        self.entries.insert(position, entry);
        self.entry_count = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.total_data_size = self.total_data_size.max(entry.end_address());
    }

    /// Entry whose logical range contains `address`
    pub fn find_entry_by_address(&self, address: u64) -> Option<&AllocationEntry> {
        let position = self.entries.partition_point(|e| e.logical_address <= address);
        let candidate = self.entries.get(position.checked_sub(1)?)?;
        candidate.contains_address(address).then_some(candidate)
    }

    /// Entries overlapping `[start, start + length)`, ascending
    pub fn entries_in_range(&self, start: u64, length: u64) -> Vec<&AllocationEntry> {
        let end = start.saturating_add(length);
        if end == start {
            return Vec::new();
        }
        self.entries
            .iter()
            .take_while(|e| e.logical_address < end)
            .filter(|e| e.end_address() > start)
            .collect()
    }

    /// Check version, count, ordering and overlaps
    pub fn validate(&self) -> Result<(), RootBlockError> {
        if self.version != ROOT_BLOCK_VERSION {
            return Err(RootBlockError::UnsupportedVersion(self.version));
        }
        if self.entry_count as usize != self.entries.len() {
            return Err(RootBlockError::EntryCountMismatch {
                declared: self.entry_count,
                actual: self.entries.len(),
            });
        }
        for (i, pair) in self.entries.windows(2).enumerate() {
            if pair[1].logical_address <= pair[0].logical_address {
                return Err(RootBlockError::Unsorted(i + 1));
            }
            if pair[0].end_address() > pair[1].logical_address {
                return Err(RootBlockError::Overlap(i + 1));
            }
        }
        if let Some(end) = self.entries.iter().map(AllocationEntry::end_address).max() {
            if end > self.total_data_size {
                return Err(RootBlockError::TotalSizeTooSmall {
                    total: self.total_data_size,
                    end,
                });
            }
        }
        Ok(())
    }

    /// Serialize: 16-byte header then 56-byte entries (big-endian)
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.extend_from_slice(&self.version.to_be_bytes());
        bytes.extend_from_slice(&self.entry_count.to_be_bytes());
        bytes.extend_from_slice(&self.total_data_size.to_be_bytes());
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.to_bytes());
        }
        bytes
    }

    /// Deserialize; the length must match the declared entry count exactly
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ROOT_BLOCK_HEADER_SIZE {
            return None;
        }
        let version = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if version != ROOT_BLOCK_VERSION {
            return None;
        }
        let entry_count = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
        let total_data_size = u64::from_be_bytes(bytes[8..16].try_into().ok()?);

        let body = &bytes[ROOT_BLOCK_HEADER_SIZE..];
        let needed = (entry_count as usize).checked_mul(ALLOCATION_ENTRY_SIZE)?;
        if body.len() != needed {
            return None;
        }
        let entries = body
            .chunks_exact(ALLOCATION_ENTRY_SIZE)
            .map(AllocationEntry::from_bytes)
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            version,
            entry_count,
            total_data_size,
            entries,
        })
    }

    /// Size of the serialized form
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        ROOT_BLOCK_HEADER_SIZE + self.entries.len() * ALLOCATION_ENTRY_SIZE
    }
}

impl Default for RootBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// DATA BLOCK
// ============================================================

/// Encrypted block as stored in the data blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlock {
    /// Total serialized size: 4 + 16 + ciphertext length
    pub size: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

fn block_aad(domain: &[u8], size: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(domain.len() + 4);
    aad.extend_from_slice(domain);
    aad.extend_from_slice(&size.to_be_bytes());
    aad
}

impl DataBlock {
    /// Encrypt `plaintext` under a fresh random nonce
    pub fn seal<R: RngCore + ?Sized>(
        plaintext: &[u8],
        key: &SessionAeadKey,
        domain: &[u8],
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let total = DATA_BLOCK_OVERHEAD + AEAD_TAG_SIZE + plaintext.len();
        let size = u32::try_from(total).map_err(|_| CryptoError::InvalidLength)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let ciphertext = aead_encrypt(key.as_bytes(), &nonce, plaintext, &block_aad(domain, size))?;

        Ok(Self {
            size,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt; `None` if it does not authenticate under `key` and `domain`
    #[must_use]
    pub fn open(&self, key: &SessionAeadKey, domain: &[u8]) -> Option<Vec<u8>> {
        aead_decrypt(key.as_bytes(), &self.nonce, &self.ciphertext, &block_aad(domain, self.size))
    }

    /// Serialize as `size BE ‖ nonce ‖ ciphertext`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DATA_BLOCK_OVERHEAD + self.ciphertext.len());
        bytes.extend_from_slice(&self.size.to_be_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the block starting at `offset` in `data`
    ///
    /// Returns `None` if the size header is out of range or the block
    /// would run past the end of `data`.
    #[must_use]
    pub fn parse(data: &[u8], offset: u64) -> Option<Self> {
        let start = usize::try_from(offset).ok()?;
        let size = read_size_header(data, start)?;
        if !(MIN_DATA_BLOCK_SIZE..=MAX_DATA_BLOCK_SIZE).contains(&size) {
            return None;
        }
        let end = start.checked_add(size as usize)?;
        if end > data.len() {
            return None;
        }
        let nonce = data[start + 4..start + DATA_BLOCK_OVERHEAD].try_into().ok()?;
        Some(Self {
            size,
            nonce,
            ciphertext: data[start + DATA_BLOCK_OVERHEAD..end].to_vec(),
        })
    }
}

/// Big-endian u32 at `position`, if there are four bytes left
pub(crate) fn read_size_header(data: &[u8], position: usize) -> Option<u32> {
    let bytes = data.get(position..position.checked_add(4)?)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Encrypt a root block with the session key
pub fn encrypt_root_block<R: RngCore + ?Sized>(
    root: &RootBlock,
    session_key: &SessionAeadKey,
    rng: &mut R,
) -> Result<DataBlock, CryptoError> {
    DataBlock::seal(&root.to_bytes(), session_key, ROOT_BLOCK_DOMAIN, rng)
}

/// Read, decrypt, deserialize and validate the root block at `offset`
///
/// Any failure (bad header, out of bounds, failed tag, malformed or
/// invalid table) yields `None`.
#[must_use]
pub fn decrypt_root_block(data_blob: &[u8], offset: u64, session_key: &SessionAeadKey) -> Option<RootBlock> {
    let block = DataBlock::parse(data_blob, offset)?;
    let plaintext = block.open(session_key, ROOT_BLOCK_DOMAIN)?;
    let root = RootBlock::from_bytes(&plaintext)?;
    root.validate().ok()?;
    Some(root)
}

// ============================================================
// TESTS
// ============================================================
