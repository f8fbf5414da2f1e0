//! Session blocks inside the append-only data blob.
//!
//! Every write appends `padding ‖ block`. The padding is CSPRNG noise with a
//! Pareto-distributed length, the block is a [`DataBlock`] whose encrypted
//! plaintext is `BlockHeader ‖ payload ‖ random fill`. Slots only record where
//! the padding starts and how large the block is; the block itself is found
//! by scanning forward for its size header.

use std::io;

use rand::RngCore;
use zeroize::Zeroize;

use crate::block::{read_size_header, DataBlock, DATA_BLOCK_OVERHEAD, MAX_DATA_BLOCK_SIZE, MIN_DATA_BLOCK_SIZE};
use crate::config::PaddingValues;
use crate::crypto::{CryptoError, SessionAeadKey, AEAD_TAG_SIZE};
use crate::distribution::{draw_block_size, generate_padding_size};
use crate::fs::StorageAdapter;

/// Associated-data label for session blocks
pub(crate) const SESSION_BLOCK_DOMAIN: &[u8] = b"data";

/// Size of the serialized block header
pub const BLOCK_HEADER_SIZE: usize = 48;

/// Random padding is written in chunks of this size
const PADDING_CHUNK_SIZE: usize = 64 * 1024;

/// Sentinel for "no previous block"
const NO_PREVIOUS: u64 = u64::MAX;

/// Location of an earlier version of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    /// Offset of the block's size header in the data blob
    pub block_start: u64,
    pub block_size: u32,
}

/// Encrypted prefix of every session block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload bytes following the header; the rest is fill
    pub used_length: u32,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
    /// Random per-session value, kept across updates
    pub salt: [u8; 16],
    /// The block this one superseded
    pub previous: Option<BlockRef>,
}

impl BlockHeader {
    /// Serialize to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let (prev_start, prev_size) = match self.previous {
            Some(prev) => (prev.block_start, prev.block_size),
            None => (NO_PREVIOUS, 0),
        };
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.used_length.to_be_bytes());
        bytes[4..12].copy_from_slice(&self.created_at.to_be_bytes());
        bytes[12..20].copy_from_slice(&self.updated_at.to_be_bytes());
        bytes[20..36].copy_from_slice(&self.salt);
        bytes[36..44].copy_from_slice(&prev_start.to_be_bytes());
        bytes[44..48].copy_from_slice(&prev_size.to_be_bytes());
        bytes
    }

    /// Deserialize from bytes (big-endian)
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return None;
        }
        let prev_start = u64::from_be_bytes(bytes[36..44].try_into().ok()?);
        let prev_size = u32::from_be_bytes(bytes[44..48].try_into().ok()?);
        let previous = (prev_start != NO_PREVIOUS).then_some(BlockRef {
            block_start: prev_start,
            block_size: prev_size,
        });

        Some(Self {
            used_length: u32::from_be_bytes(bytes[0..4].try_into().ok()?),
            created_at: u64::from_be_bytes(bytes[4..12].try_into().ok()?),
            updated_at: u64::from_be_bytes(bytes[12..20].try_into().ok()?),
            salt: bytes[20..36].try_into().ok()?,
            previous,
        })
    }
}

/// Where an append landed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendedBlock {
    /// Data blob length before the append; stored in the slots
    pub padding_start: u64,
    /// Offset of the block's size header
    pub block_start: u64,
}

/// Build an encrypted session block
///
/// The plaintext is padded with random fill up to a capacity drawn from the
/// block size distribution, so the block size says nothing about `data.len()`.
/// `header.used_length` is overwritten with `data.len()`.
pub fn create_data_block<R: RngCore + ?Sized>(
    header: &BlockHeader,
    data: &[u8],
    session_key: &SessionAeadKey,
    rng: &mut R,
    padding: &PaddingValues,
) -> Result<DataBlock, CryptoError> {
    let used_length = u32::try_from(data.len()).map_err(|_| CryptoError::InvalidLength)?;
    let min_size = u32::try_from(DATA_BLOCK_OVERHEAD + AEAD_TAG_SIZE + BLOCK_HEADER_SIZE + data.len())
        .map_err(|_| CryptoError::InvalidLength)?;
    let block_size = draw_block_size(rng, min_size, padding) as usize;
    let plaintext_len = block_size - DATA_BLOCK_OVERHEAD - AEAD_TAG_SIZE;

    let header = BlockHeader {
        used_length,
        ..*header
    };
    let mut plaintext = Vec::with_capacity(plaintext_len);
    plaintext.extend_from_slice(&header.to_bytes());
    plaintext.extend_from_slice(data);
    let filled = plaintext.len();
    plaintext.resize(plaintext_len, 0);
    rng.fill_bytes(&mut plaintext[filled..]);

    let block = DataBlock::seal(&plaintext, session_key, SESSION_BLOCK_DOMAIN, rng);
    plaintext.zeroize();
    block
}

/// CSPRNG bytes for padding
pub fn generate_padding<R: RngCore + ?Sized>(rng: &mut R, size: usize) -> Vec<u8> {
    let mut padding = vec![0u8; size];
    rng.fill_bytes(&mut padding);
    padding
}

/// Append `size` random bytes to the data blob in fixed-size chunks
pub fn append_random_padding<S, R>(storage: &mut S, size: u64, rng: &mut R) -> io::Result<()>
where
    S: StorageAdapter + ?Sized,
    R: RngCore + ?Sized,
{
    let mut chunk = vec![0u8; PADDING_CHUNK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let len = remaining.min(PADDING_CHUNK_SIZE as u64) as usize;
        rng.fill_bytes(&mut chunk[..len]);
        storage.append_data(&chunk[..len])?;
        remaining -= len as u64;
    }
    Ok(())
}

/// Append `padding ‖ block` to the data blob
pub fn append_block<S, R>(
    storage: &mut S,
    block: &DataBlock,
    rng: &mut R,
    padding: &PaddingValues,
) -> io::Result<AppendedBlock>
where
    S: StorageAdapter + ?Sized,
    R: RngCore + ?Sized,
{
    let padding_start = storage.data_blob_size()?;
    let padding_size = generate_padding_size(rng, padding);
    append_random_padding(storage, u64::from(padding_size), rng)?;
    let block_start = storage.append_data(&block.to_bytes())?;

    Ok(AppendedBlock {
        padding_start,
        block_start,
    })
}

/// Decrypt the session block starting at `block_start`
///
/// Returns the header and the payload (fill stripped), or `None` if the
/// block is malformed or does not authenticate.
pub fn parse_data_blob(
    data_blob: &[u8],
    block_start: u64,
    session_key: &SessionAeadKey,
) -> Option<(BlockHeader, Vec<u8>)> {
    let block = DataBlock::parse(data_blob, block_start)?;
    let mut plaintext = block.open(session_key, SESSION_BLOCK_DOMAIN)?;

    let parsed = BlockHeader::from_bytes(&plaintext).and_then(|header| {
        let end = BLOCK_HEADER_SIZE.checked_add(header.used_length as usize)?;
        let payload = plaintext.get(BLOCK_HEADER_SIZE..end)?.to_vec();
        Some((header, payload))
    });
    plaintext.zeroize();
    parsed
}

/// Every position in `[start, start + max_padding]` carrying `expected_size`
/// as a big-endian size header
///
/// Positions are indices into `data`, ascending. Yields nothing when
/// `expected_size` is outside the valid block size range.
pub fn block_candidates(
    data: &[u8],
    start: u64,
    expected_size: u32,
    max_padding: u32,
) -> impl Iterator<Item = u64> + '_ {
    let valid = (MIN_DATA_BLOCK_SIZE..=MAX_DATA_BLOCK_SIZE).contains(&expected_size);
    let first = usize::try_from(start).unwrap_or(usize::MAX);
    let last = first.saturating_add(max_padding as usize);

    (first..=last)
        .take_while(move |&position| valid && position.saturating_add(4) <= data.len())
        .filter(move |&position| read_size_header(data, position) == Some(expected_size))
        .map(|position| position as u64)
}

/// First candidate block start after `offset`
pub fn locate_block(data_blob: &[u8], offset: u64, expected_size: u32, padding: &PaddingValues) -> Option<u64> {
    block_candidates(data_blob, offset, expected_size, padding.pareto_max).next()
}

// ============================================================
// TESTS
// ============================================================
