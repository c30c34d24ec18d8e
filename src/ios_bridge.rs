// Sunkfin Core - offline downloads for the Sunkfin media client
// Copyright (C) 2025 Sunkfin contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! C FFI bridge for iOS
//!
//! Exposes the download manager to the Swift app shell.
//!
//! # Architecture
//! SwiftUI views → Swift `DownloadStore` → C FFI → Rust `DownloadManager`
//!
//! # Design Patterns
//! 1. **JSON Communication**: configs, items, snapshots and reports cross the
//!    boundary as JSON strings
//! 2. **Error Handling**: every error comes back as a JSON error response
//! 3. **Async Runtime**: one process-wide Tokio runtime drives all managers
//! 4. **No Panics**: panics are caught before they reach Swift
//! 5. **Handles**: managers are referred to by an opaque `u64` handle
//!
//! # Response Format
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```
//!
//! # Memory Management
//! **CRITICAL**: every string returned from these functions MUST be freed
//! with `rust_free_string()`.
//!
//! ```swift
//! let resultPtr = rust_get_download_snapshot(handle)
//! defer { rust_free_string(resultPtr) }
//! let jsonString = String(cString: resultPtr)
//! ```

use crate::download::{DownloadConfig, DownloadManager};
use crate::error::{Result, SunkfinError};
use crate::logging::{self, LogConfig, LogGuard};
use crate::media::MediaItem;
use crate::server::{Credential, ServerEndpoint};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

lazy_static::lazy_static! {
    static ref RUNTIME: std::result::Result<tokio::runtime::Runtime, String> =
        tokio::runtime::Runtime::new().map_err(|e| e.to_string());
    static ref MANAGERS: Mutex<HashMap<u64, DownloadManager>> = Mutex::new(HashMap::new());
    static ref LOG_GUARD: Mutex<Option<LogGuard>> = Mutex::new(None);
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Called with the snapshot JSON after every state change
///
/// The string is only valid for the duration of the call.
pub type SnapshotCallback = extern "C" fn(context: *mut c_void, snapshot_json: *const c_char);

/// Opaque Swift-side context handed back to the callback
struct CallbackContext(*mut c_void);

// The Swift side guarantees the context outlives the subscription and may be
// used from any thread
unsafe impl Send for CallbackContext {}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn runtime() -> Result<&'static tokio::runtime::Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| SunkfinError::internal(format!("Failed to create Tokio runtime: {}", e)))
}

/// Safely convert C string pointer to Rust String
///
/// # Safety
/// Caller must ensure ptr is a valid null-terminated C string
fn c_str_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(SunkfinError::InvalidInput("Null pointer received".to_string()));
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| SunkfinError::InvalidInput(format!("Invalid UTF-8: {}", e)))
    }
}

/// Convert Rust string to C string pointer
///
/// # Safety
/// Caller MUST free the returned pointer using `rust_free_string()`
fn string_to_c_str(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => CString::new(error_response("String contains null bytes"))
            .unwrap_or_default()
            .into_raw(),
    }
}

/// Create success response JSON
fn success_response<T: Serialize>(data: T) -> String {
    serde_json::json!({
        "success": true,
        "data": data
    })
    .to_string()
}

/// Create error response JSON
fn error_response(error: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Wrap a function call with panic catching
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> Result<String> + panic::UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => error_response(&e.to_string()),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

fn manager(handle: u64) -> Result<DownloadManager> {
    MANAGERS
        .lock()
        .get(&handle)
        .cloned()
        .ok_or_else(|| SunkfinError::invalid_input(format!("Unknown download manager handle: {}", handle)))
}

// ============================================================================
// SETUP
// ============================================================================

/// Install logging
///
/// # Arguments
/// * `config_json` - `LogConfig` as JSON, e.g. `{"level":"debug","log_dir":"/.../Logs"}`
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_init_logging(config_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let config: LogConfig = serde_json::from_str(&c_str_to_string(config_json)?)?;
        let guard = logging::init(&config)?;
        *LOG_GUARD.lock() = Some(guard);
        Ok(success_response(serde_json::json!({
            "log_file": config.log_file(),
        })))
    });

    string_to_c_str(response)
}

/// Create a download manager and load persisted downloads
///
/// # Arguments
/// * `config_json` - `DownloadConfig` as JSON; at least `storage_dir`
///
/// # Returns
/// ```json
/// { "success": true, "data": { "handle": 1, "snapshot": { "active": {}, "persisted": { ... } } } }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_download_manager_create(config_json: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let config = DownloadConfig::from_json(&c_str_to_string(config_json)?)?;
        let manager = runtime()?.block_on(DownloadManager::new(config))?;
        let snapshot = manager.snapshot();

        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        MANAGERS.lock().insert(handle, manager);
        debug!(handle, "download manager created");

        Ok(success_response(serde_json::json!({
            "handle": handle,
            "snapshot": snapshot,
        })))
    });

    string_to_c_str(response)
}

/// Cancel all transfers and release the manager
///
/// Persisted downloads are kept on disk.
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_download_manager_destroy(handle: u64) -> *mut c_char {
    let response = catch_panic(|| {
        let manager = MANAGERS
            .lock()
            .remove(&handle)
            .ok_or_else(|| SunkfinError::invalid_input(format!("Unknown download manager handle: {}", handle)))?;
        runtime()?.block_on(manager.shutdown());
        Ok(success_response(serde_json::Value::Null))
    });

    string_to_c_str(response)
}

// ============================================================================
// DOWNLOAD FUNCTIONS
// ============================================================================

/// Start downloading an item
///
/// # Arguments
/// * `handle` - Manager handle
/// * `item_json` - The item's metadata as returned by the server (PascalCase)
/// * `server_url` - e.g. `https://media.example.com`
/// * `access_token` - Session token, sent as `api_key`
///
/// # Returns
/// ```json
/// { "success": true, "data": { "outcome": "started" } }
/// ```
/// `outcome` is one of `started`, `already_active`, `already_downloaded`.
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_start_download(
    handle: u64,
    item_json: *const c_char,
    server_url: *const c_char,
    access_token: *const c_char,
) -> *mut c_char {
    let response = catch_panic(|| {
        let item: MediaItem = serde_json::from_str(&c_str_to_string(item_json)?)?;
        let endpoint = ServerEndpoint::parse(&c_str_to_string(server_url)?)?;
        let credential = Credential::new(c_str_to_string(access_token)?);

        let outcome = manager(handle)?.start_download(item, endpoint, credential)?;
        Ok(success_response(serde_json::json!({ "outcome": outcome })))
    });

    string_to_c_str(response)
}

/// Cancel an active download
///
/// # Returns
/// ```json
/// { "success": true, "data": { "cancelled": true } }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_cancel_download(handle: u64, item_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let item_id = c_str_to_string(item_id)?;
        let manager = manager(handle)?;
        let cancelled = runtime()?.block_on(manager.cancel_download(&item_id));
        Ok(success_response(serde_json::json!({ "cancelled": cancelled })))
    });

    string_to_c_str(response)
}

/// Delete a downloaded item's files
///
/// # Returns
/// The deletion report; `failures` lists files that could not be removed.
/// ```json
/// { "success": true, "data": { "id": "abc", "failures": [] } }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_delete_downloaded_item(handle: u64, item_id: *const c_char) -> *mut c_char {
    let response = catch_panic(|| {
        let item_id = c_str_to_string(item_id)?;
        let manager = manager(handle)?;
        let report = runtime()?.block_on(manager.delete_downloaded_item(&item_id));
        Ok(success_response(report))
    });

    string_to_c_str(response)
}

/// Cancel every transfer and delete every download (logout)
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_remove_all_downloads(handle: u64) -> *mut c_char {
    let response = catch_panic(|| {
        let manager = manager(handle)?;
        let reports = runtime()?.block_on(manager.remove_all_downloads());
        Ok(success_response(reports))
    });

    string_to_c_str(response)
}

/// Current active and persisted downloads
///
/// # Returns
/// ```json
/// {
///   "success": true,
///   "data": {
///     "snapshot": { "active": { ... }, "persisted": { ... } },
///     "has_active_downloads": false,
///     "total_persisted_bytes": 123456
///   }
/// }
/// ```
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_get_download_snapshot(handle: u64) -> *mut c_char {
    let response = catch_panic(|| {
        let snapshot = manager(handle)?.snapshot();
        Ok(success_response(serde_json::json!({
            "has_active_downloads": snapshot.has_active_downloads(),
            "total_persisted_bytes": snapshot.total_persisted_bytes(),
            "snapshot": snapshot,
        })))
    });

    string_to_c_str(response)
}

/// Push every new snapshot to `callback`
///
/// The callback runs on a runtime worker thread, once immediately with the
/// current state and then after every change, until the manager is destroyed.
///
/// # Safety
/// `context` must stay valid until the manager is destroyed. Caller must
/// free the returned string with `rust_free_string()`.
#[no_mangle]
pub extern "C" fn rust_subscribe_downloads(
    handle: u64,
    callback: SnapshotCallback,
    context: *mut c_void,
) -> *mut c_char {
    let context = CallbackContext(context);
    let response = catch_panic(panic::AssertUnwindSafe(move || {
        let mut rx = manager(handle)?.subscribe();

        runtime()?.spawn(async move {
            let context = context;
            loop {
                let json = {
                    let snapshot = rx.borrow_and_update();
                    serde_json::to_string(&*snapshot)
                };
                match json.map(CString::new) {
                    Ok(Ok(json)) => callback(context.0, json.as_ptr()),
                    Ok(Err(e)) => warn!(error = %e, "snapshot contained a NUL byte"),
                    Err(e) => warn!(error = %e, "could not encode snapshot"),
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            debug!(handle, "snapshot subscription ended");
        });

        Ok(success_response(serde_json::Value::Null))
    }));

    string_to_c_str(response)
}

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

/// Format a byte count for display ("1.50 KB")
///
/// # Safety
/// Caller must free the returned string with `rust_free_string()`
#[no_mangle]
pub extern "C" fn rust_format_bytes(bytes: u64) -> *mut c_char {
    string_to_c_str(success_response(crate::download::format_bytes(bytes)))
}

/// Free a string allocated by Rust
///
/// # Safety
/// This function MUST be called exactly once for each string returned by
/// any other Rust function. Calling it multiple times on the same pointer
/// will cause a double-free error.
#[no_mangle]
pub extern "C" fn rust_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            // Take ownership and drop the CString
            let _ = CString::from_raw(ptr);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn take_json(ptr: *mut c_char) -> serde_json::Value {
        let json = c_str_to_string(ptr).unwrap();
        rust_free_string(ptr);
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_error_response() {
        let response = error_response("Test error");
        assert!(response.contains("\"success\":false"));
        assert!(response.contains("Test error"));
    }

    #[test]
    fn test_catch_panic_with_panic() {
        let result = catch_panic(|| -> Result<String> {
            panic!("test panic");
        });
        assert!(result.contains("\"success\":false"));
        assert!(result.contains("test panic"));
    }

    #[test]
    fn test_null_pointer_handling() {
        assert!(c_str_to_string(std::ptr::null()).is_err());
        let response = take_json(rust_cancel_download(1, std::ptr::null()));
        assert_eq!(response["success"], false);
    }

    #[test]
    fn test_format_bytes() {
        let response = take_json(rust_format_bytes(1536));
        assert_eq!(response["data"], "1.50 KB");
    }

    #[test]
    fn test_unknown_handle() {
        let response = take_json(rust_get_download_snapshot(u64::MAX));
        assert_eq!(response["success"], false);
    }

    #[test]
    fn test_manager_lifecycle() {
        let dir = TempDir::new().unwrap();
        let config = serde_json::json!({ "storage_dir": dir.path() }).to_string();
        let config = CString::new(config).unwrap();

        let created = take_json(rust_download_manager_create(config.as_ptr()));
        assert_eq!(created["success"], true, "{}", created);
        let handle = created["data"]["handle"].as_u64().unwrap();

        let snapshot = take_json(rust_get_download_snapshot(handle));
        assert_eq!(snapshot["data"]["has_active_downloads"], false);
        assert_eq!(snapshot["data"]["total_persisted_bytes"], 0);

        let item = CString::new(r#"{"Name":"No id"}"#).unwrap();
        let server = CString::new("http://localhost:8096").unwrap();
        let token = CString::new("token").unwrap();
        let started = take_json(rust_start_download(
            handle,
            item.as_ptr(),
            server.as_ptr(),
            token.as_ptr(),
        ));
        assert_eq!(started["success"], false);

        let removed = take_json(rust_remove_all_downloads(handle));
        assert_eq!(removed["data"], serde_json::json!([]));

        let destroyed = take_json(rust_download_manager_destroy(handle));
        assert_eq!(destroyed["success"], true);
        let again = take_json(rust_download_manager_destroy(handle));
        assert_eq!(again["success"], false);
    }
}
