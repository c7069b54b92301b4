//! FFI layer for native app shells.
//!
//! Exposes the pure decision functions (choice validation and merging,
//! conflict resolution, reconnect backoff) as C-compatible functions. All
//! structured data crosses the boundary as JSON strings.
//!
//! # Memory Management
//!
//! - Strings returned by `quill_*` functions are allocated by Rust
//! - Caller must free them with `quill_string_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure

use crate::choice::default_contract;
use crate::resolve::{check_identity, resolve_conflict, Strategy};
use crate::{ConflictStrategy, Error, Provenance, VersionedRecord};
use serde::Deserialize;
use std::ffi::{c_char, CStr, CString};

/// Result wrapper for FFI responses.
#[derive(serde::Serialize)]
#[serde(untagged)]
enum FfiResult<T: serde::Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: serde::Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn err(message: impl Into<String>) -> Self {
        FfiResult::Err {
            error: message.into(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e))
    }
}

fn error_json(message: impl Into<String>) -> *mut c_char {
    to_c_string(FfiResult::<()>::err(message).to_json())
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `quill_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => {
            // JSON never contains raw NULs, only a caller-supplied value could
            CString::from(c"{\"error\":\"string contained null bytes\"}").into_raw()
        }
    }
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> Result<T, Error> {
    serde_json::from_str(json).map_err(|e| Error::InvalidPayload(format!("{what}: {e}")))
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `quill_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn quill_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Content Integrity
// ============================================================================

/// Validate a choice set against the default contract.
///
/// # Arguments
/// - `story_text`: segment text the choices belong to
/// - `choices_json`: JSON value of the `choices` field
///
/// # Returns
/// JSON string: `{"ok": ContractReport}` or `{"error": "message"}`
///
/// # Safety
/// - Both arguments must be valid null-terminated C strings or null
/// - Caller must free the returned string with `quill_string_free`
#[no_mangle]
pub unsafe extern "C" fn quill_validate_choices(
    story_text: *const c_char,
    choices_json: *const c_char,
) -> *mut c_char {
    let Some(story_text) = from_c_string(story_text) else {
        return error_json("invalid story text");
    };
    let Some(choices_json) = from_c_string(choices_json) else {
        return error_json("invalid choices JSON");
    };

    let choices: serde_json::Value = match parse_json("choices", &choices_json) {
        Ok(v) => v,
        Err(e) => return error_json(e.to_string()),
    };

    let report = default_contract().validate(&story_text, Some(&choices));
    to_c_string(FfiResult::ok(report).to_json())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeChoicesRequest {
    segment_id: String,
    story_text: String,
    #[serde(default)]
    existing: Option<serde_json::Value>,
    #[serde(default = "default_provenance")]
    existing_provenance: Provenance,
    incoming: serde_json::Value,
}

fn default_provenance() -> Provenance {
    Provenance::Local
}

/// Decide whether an incoming choice set may replace the existing one.
///
/// # Arguments
/// - `request_json`: `{"segmentId", "storyText", "existing"?, "existingProvenance"?, "incoming"}`
///
/// # Returns
/// JSON string: `{"ok": ChoiceMerge}` or `{"error": "message"}`
///
/// # Safety
/// - `request_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `quill_string_free`
#[no_mangle]
pub unsafe extern "C" fn quill_merge_choices(request_json: *const c_char) -> *mut c_char {
    let Some(request_json) = from_c_string(request_json) else {
        return error_json("invalid request JSON");
    };

    let request: MergeChoicesRequest = match parse_json("merge request", &request_json) {
        Ok(r) => r,
        Err(e) => return error_json(e.to_string()),
    };

    let merge = default_contract().merge(
        &request.segment_id,
        &request.story_text,
        request.existing.as_ref(),
        request.existing_provenance,
        &request.incoming,
    );
    to_c_string(FfiResult::ok(merge).to_json())
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Resolve a conflict between two versions of a record.
///
/// Manual resolution cannot call back across the boundary, so it resolves
/// as if no callback were registered (client wins, with a fallback reason).
///
/// # Arguments
/// - `server_json`, `client_json`: JSON of `VersionedRecord`
/// - `strategy`: strategy name, e.g. `server_wins` or `timestamp_based`
///
/// # Returns
/// JSON string: `{"ok": Resolution}` or `{"error": "message"}`
///
/// # Safety
/// - All arguments must be valid null-terminated C strings or null
/// - Caller must free the returned string with `quill_string_free`
#[no_mangle]
pub unsafe extern "C" fn quill_resolve_conflict(
    server_json: *const c_char,
    client_json: *const c_char,
    strategy: *const c_char,
) -> *mut c_char {
    let (Some(server_json), Some(client_json)) =
        (from_c_string(server_json), from_c_string(client_json))
    else {
        return error_json("invalid record JSON");
    };
    let Some(strategy) = from_c_string(strategy) else {
        return error_json("invalid strategy");
    };

    let configured: ConflictStrategy = match strategy.parse() {
        Ok(s) => s,
        Err(e) => return error_json(e),
    };

    let records = parse_json::<VersionedRecord>("server record", &server_json).and_then(|server| {
        let client = parse_json::<VersionedRecord>("client record", &client_json)?;
        check_identity(&server, &client)?;
        Ok((server, client))
    });

    match records {
        Ok((server, client)) => {
            let resolution = resolve_conflict(&server, &client, &Strategy::bind(configured, None));
            to_c_string(FfiResult::ok(resolution).to_json())
        }
        Err(e) => error_json(e.to_string()),
    }
}

// ============================================================================
// Utility
// ============================================================================

/// Reconnect delay in milliseconds for the given attempt number.
///
/// `min(base * 2^attempt, cap)`, saturating on overflow.
#[no_mangle]
pub extern "C" fn quill_reconnect_delay(base_delay_ms: u64, max_delay_ms: u64, attempt: u32) -> u64 {
    crate::operation::exponential_delay(base_delay_ms, max_delay_ms, attempt)
}

/// Get the engine version.
///
/// # Returns
/// Static string pointer (do not free)
#[no_mangle]
pub extern "C" fn quill_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

/// Get the snapshot format version.
#[no_mangle]
pub extern "C" fn quill_snapshot_format_version() -> u32 {
    crate::SNAPSHOT_FORMAT_VERSION
}
