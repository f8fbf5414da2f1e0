//! WASM bindings for browser environment
//!
//! This module provides:
//! - `StorageAdapter` implementation backed by JavaScript storage imports
//! - The session API exposed to JavaScript

use std::cell::RefCell;
use std::io;

use wasm_bindgen::prelude::*;

use crate::fs::StorageAdapter;
use crate::session::{DeniableStorage, StorageError};

/// Blob identifiers passed to the JS imports
const BLOB_ADDRESSING: u32 = 0;
const BLOB_DATA: u32 = 1;

// ============================================================
// JS STORAGE ADAPTER
// ============================================================

// Provided by the host page before WASM initialization
#[wasm_bindgen]
extern "C" {
    /// Whether a blob exists
    #[wasm_bindgen(js_name = "storageExists")]
    fn js_exists(blob_id: u32) -> bool;

    /// Read bytes from a blob at the given offset
    #[wasm_bindgen(js_name = "storageRead")]
    fn js_read(blob_id: u32, offset: u64, len: u32) -> Vec<u8>;

    /// Write bytes to a blob at the given offset, extending it if needed
    #[wasm_bindgen(js_name = "storageWrite")]
    fn js_write(blob_id: u32, offset: u64, data: &[u8]);

    /// Replace a blob's contents (creates it if absent)
    #[wasm_bindgen(js_name = "storageReplace")]
    fn js_replace(blob_id: u32, data: &[u8]);

    /// Current size of a blob, 0 if absent
    #[wasm_bindgen(js_name = "storageGetSize")]
    fn js_get_size(blob_id: u32) -> u64;

    /// Overwrite and delete every blob
    #[wasm_bindgen(js_name = "storageWipe")]
    fn js_wipe();

    /// Log to console (for debugging)
    #[wasm_bindgen(js_namespace = console, js_name = "log")]
    fn js_log(s: &str);
}

/// Public log function for debugging from other modules
pub fn log(s: &str) {
    js_log(s);
}

fn require(blob_id: u32) -> io::Result<()> {
    if js_exists(blob_id) {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::NotFound, format!("blob {} does not exist", blob_id)))
    }
}

fn read_all(blob_id: u32) -> io::Result<Vec<u8>> {
    require(blob_id)?;
    let size = js_get_size(blob_id);
    let len = u32::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "blob too large"))?;
    Ok(js_read(blob_id, 0, len))
}

/// Storage adapter using JS imports
#[derive(Clone, Copy, Default)]
pub struct JsStorage;

impl StorageAdapter for JsStorage {
    fn has_addressing_blob(&self) -> io::Result<bool> {
        Ok(js_exists(BLOB_ADDRESSING))
    }

    fn read_addressing_blob(&self) -> io::Result<Vec<u8>> {
        read_all(BLOB_ADDRESSING)
    }

    fn write_addressing_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        js_replace(BLOB_ADDRESSING, bytes);
        Ok(())
    }

    fn has_data_blob(&self) -> io::Result<bool> {
        Ok(js_exists(BLOB_DATA))
    }

    fn read_data_blob(&self) -> io::Result<Vec<u8>> {
        read_all(BLOB_DATA)
    }

    fn write_data_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        js_replace(BLOB_DATA, bytes);
        Ok(())
    }

    fn data_blob_size(&self) -> io::Result<u64> {
        Ok(js_get_size(BLOB_DATA))
    }

    fn secure_wipe(&mut self) -> io::Result<()> {
        js_wipe();
        Ok(())
    }

    fn append_data(&mut self, bytes: &[u8]) -> io::Result<u64> {
        require(BLOB_DATA)?;
        let start = js_get_size(BLOB_DATA);
        js_write(BLOB_DATA, start, bytes);
        Ok(start)
    }

    fn read_data_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        require(BLOB_DATA)?;
        let size = js_get_size(BLOB_DATA);
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "range exceeds data blob"));
        }
        let len = u32::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;
        Ok(js_read(BLOB_DATA, offset, len))
    }

    fn write_data_range(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        require(BLOB_DATA)?;
        let size = js_get_size(BLOB_DATA);
        if offset.checked_add(bytes.len() as u64).map_or(true, |end| end > size) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "range exceeds data blob"));
        }
        js_write(BLOB_DATA, offset, bytes);
        Ok(())
    }
}

// ============================================================
// GLOBAL STORAGE
// ============================================================

thread_local! {
    static STORAGE: RefCell<DeniableStorage<JsStorage>> = RefCell::new(DeniableStorage::new(JsStorage));
}

fn with_storage<T>(op: &str, f: impl FnOnce(&mut DeniableStorage<JsStorage>) -> Result<T, StorageError>) -> Option<T> {
    STORAGE.with(|cell| match f(&mut cell.borrow_mut()) {
        Ok(value) => Some(value),
        Err(e) => {
            log(&format!("[WASM] {} failed: {}", op, e));
            None
        }
    })
}

// ============================================================
// WASM EXPORTS - SESSION API
// ============================================================

/// Initialize panic hook for better error messages
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Create or open both blobs; must be called before any session operation
#[wasm_bindgen(js_name = "initStorage")]
pub fn init_storage() -> bool {
    let ok = with_storage("initStorage", |s| s.initialize()).is_some();
    if ok {
        log("[WASM] Storage initialized");
    }
    ok
}

#[wasm_bindgen(js_name = "createSession")]
pub fn create_session(password: &str, data: &[u8]) -> bool {
    with_storage("createSession", |s| s.create_session(password, data)).is_some()
}

/// Returns the payload, or `undefined` for a wrong password or an error
#[wasm_bindgen(js_name = "unlockSession")]
pub fn unlock_session(password: &str) -> Option<Vec<u8>> {
    with_storage("unlockSession", |s| s.unlock_session(password))
        .flatten()
        .map(|mut session| session.take_data())
}

#[wasm_bindgen(js_name = "updateSession")]
pub fn update_session(password: &str, data: &[u8]) -> bool {
    with_storage("updateSession", |s| s.update_session(password, data)).is_some()
}

#[wasm_bindgen(js_name = "deleteSession")]
pub fn delete_session(password: &str) -> bool {
    with_storage("deleteSession", |s| s.delete_session(password)).is_some()
}

/// Blob sizes as seen by JavaScript
#[wasm_bindgen]
#[derive(Clone, Copy)]
pub struct WasmStats {
    #[wasm_bindgen(js_name = "addressingBlobSize")]
    pub addressing_blob_size: u64,
    #[wasm_bindgen(js_name = "dataBlobSize")]
    pub data_blob_size: u64,
}

/// Returns `undefined` if the adapter fails
#[wasm_bindgen(js_name = "getStats")]
pub fn get_stats() -> Option<WasmStats> {
    with_storage("getStats", |s| s.stats()).map(|stats| WasmStats {
        addressing_blob_size: stats.addressing_blob_size,
        data_blob_size: stats.data_blob_size,
    })
}

#[wasm_bindgen(js_name = "getDataBlobSize")]
pub fn get_data_blob_size() -> u64 {
    with_storage("getDataBlobSize", |s| s.stats())
        .map(|stats| stats.data_blob_size)
        .unwrap_or(0)
}

#[wasm_bindgen(js_name = "secureWipeAll")]
pub fn secure_wipe_all() -> bool {
    with_storage("secureWipeAll", |s| s.secure_wipe_all()).is_some()
}

/// Get WASM module version
#[wasm_bindgen(js_name = "getWasmVersion")]
pub fn get_wasm_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
