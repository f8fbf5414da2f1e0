//! Deniable Storage - Plausibly deniable multi-session encrypted storage
//!
//! Many independent sessions share two opaque blobs, each protected by its
//! own password. Without a password nothing reveals how many sessions exist,
//! where they live, or whether the blobs hold anything but noise. It uses:
//! - Fixed-size addressing blob (2MB, 65,536 slots × 32 bytes)
//! - Append-only data blob with Pareto padding and encrypted blocks
//! - 46 redundant slots per session, always scanned in full
//! - Memory safety with zeroize on drop
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     ↓ create / unlock / update / delete (password, bytes)
//! DeniableStorage (session.rs)
//!     ├── SessionKeys: Argon2id → HKDF (slot indices, slot keys, AEAD key)
//!     ├── AddressingBlob: 46 AES-SIV slots → (offset, block size)
//!     └── Data blocks: header ‖ payload ‖ fill, AES-SIV
//!     ↓ whole-blob and range I/O
//! StorageAdapter (in-memory, files, JS imports)
//!     ↓
//! addressing.bin: [slot 0][slot 1] ... [slot 65535]
//! data.bin:       [Pareto][Block A1][Pareto][Block B1][Pareto][Block A2]...
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod blob;
pub mod block;
pub mod config;
pub mod crypto;
pub mod data_blob;
pub mod distribution;
pub mod fs;
pub mod session;

pub use blob::{
    AddressingBlob, AddressingError, SlotContent, UnlockResult, ADDRESSING_BLOB_SIZE, SLOTS_PER_SESSION,
    SLOT_COUNT, SLOT_SIZE,
};
pub use block::{
    decrypt_root_block, encrypt_root_block, generate_block_id, AllocationEntry, BlockId, DataBlock, RootBlock,
    RootBlockError, ALLOCATION_ENTRY_SIZE, BLOCK_ID_SIZE, DATA_BLOCK_OVERHEAD, MAX_DATA_BLOCK_SIZE,
    MIN_DATA_BLOCK_SIZE, ROOT_BLOCK_VERSION,
};
pub use config::{KdfParams, Limits, PaddingValues, StorageConfig};
pub use crypto::{
    aead_decrypt, aead_encrypt, decrypt_slot, derive_block_key, derive_master_key, derive_session_aead_key,
    derive_slot_indices, derive_slot_key, encrypt_slot, BlockKey, CryptoError, MasterKey, SessionAeadKey,
    SessionKeys, SlotKey, AEAD_TAG_SIZE, KEY_SIZE, NONCE_SIZE,
};
pub use data_blob::{
    append_block, append_random_padding, block_candidates, create_data_block, generate_padding, locate_block,
    parse_data_blob, AppendedBlock, BlockHeader, BlockRef, BLOCK_HEADER_SIZE,
};
pub use distribution::{draw_block_size, generate_block_size, generate_padding_size};
pub use fs::{BlobKind, FileStorage, InMemoryStorage, StorageAdapter};
pub use session::{DeniableStorage, SessionAddress, StorageError, StorageStats, UnlockedSession};

#[cfg(feature = "wasm")]
mod wasm;

#[cfg(feature = "wasm")]
pub use wasm::*;
