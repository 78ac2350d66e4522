//! State Normalizer: raw SDCP `Status` object → canonical [`PrinterStatus`].
//!
//! The normalizer is a pure function.  It never mutates the previous status;
//! it either returns a complete new snapshot or an error, in which case the
//! caller keeps the previous snapshot untouched.  There is no field-by-field
//! merging: a payload missing `PrintInfo` is rejected rather than producing a
//! snapshot with stale layer counts from the last frame.
//!
//! # Tolerated vs rejected input
//!
//! | Input                                   | Result                          |
//! |-----------------------------------------|---------------------------------|
//! | unknown machine / print status code     | `Unknown(code)` variant         |
//! | extra fields                            | ignored                         |
//! | `Status` not an object                  | [`NormalizationError::NotAnObject`] |
//! | missing `CurrentStatus` / `PrintInfo`   | [`NormalizationError::MissingField`] |
//! | wrong type (e.g. `"TotalLayer": "ten"`) | [`NormalizationError::InvalidField`] |
//! | sequence not newer than previous        | [`NormalizationError::Stale`]   |
//!
//! # Example
//!
//! ```rust
//! use chitu_core::{normalize, PrintStatus};
//! use serde_json::json;
//!
//! let raw = json!({
//!     "CurrentStatus": [1],
//!     "PrintInfo": {"Status": 3, "CurrentLayer": 50, "TotalLayer": 200, "Filename": "a.ctb"}
//! });
//! let status = normalize(&raw, None, 1).unwrap();
//! assert_eq!(status.print_status, PrintStatus::Exposing);
//! assert_eq!(status.progress, 25);
//! ```

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::status::{MachineStatus, PrintStatus, PrinterStatus};

#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("status payload is not a JSON object")]
    NotAnObject,

    #[error("status payload is missing {0}")]
    MissingField(&'static str),

    #[error("status field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Arrived after a newer snapshot was already accepted.
    #[error("stale status: sequence {sequence} is not newer than {latest}")]
    Stale { sequence: u64, latest: u64 },
}

/// Builds a new canonical status from `raw`.
///
/// `sequence` becomes the snapshot's `updated_at` and must be strictly
/// greater than `previous.updated_at`.
///
/// # Errors
///
/// See the module table; on error the caller must keep `previous`.
pub fn normalize(
    raw: &Value,
    previous: Option<&PrinterStatus>,
    sequence: u64,
) -> Result<PrinterStatus, NormalizationError> {
    if let Some(prev) = previous {
        if sequence <= prev.updated_at {
            return Err(NormalizationError::Stale {
                sequence,
                latest: prev.updated_at,
            });
        }
    }

    let obj = raw.as_object().ok_or(NormalizationError::NotAnObject)?;
    let machine_code = current_status_code(obj)?;
    let info = obj
        .get("PrintInfo")
        .ok_or(NormalizationError::MissingField("PrintInfo"))?
        .as_object()
        .ok_or_else(|| invalid("PrintInfo", "expected an object"))?;

    let print_code = required_int(info, "Status")?;
    let print_status = print_status_from_code(print_code);
    let machine_status = machine_status_from_code(machine_code, print_status);

    let current_layer = optional_u32(info, "CurrentLayer")?;
    let total_layer = optional_u32(info, "TotalLayer")?;
    let progress = match info.get("Progress") {
        Some(v) if !v.is_null() => {
            let p = v
                .as_f64()
                .ok_or_else(|| invalid("Progress", "expected a number"))?;
            p.clamp(0.0, 100.0) as u8
        }
        _ => layer_progress(current_layer, total_layer),
    };

    let current_file = match info.get("Filename") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(invalid("Filename", "expected a string")),
    };

    let error_code = match info.get("ErrorNumber") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(0) => None,
            Some(code) => Some(code),
            None => return Err(invalid("ErrorNumber", "expected an integer")),
        },
    };

    Ok(PrinterStatus {
        machine_status,
        print_status,
        current_layer,
        total_layer,
        progress,
        current_file,
        error_code,
        updated_at: sequence,
    })
}

/// Like [`normalize`] but returns `Ok(None)` when the new snapshot describes
/// the same state as `previous`, so the caller can skip publishing it.
///
/// # Errors
///
/// Same as [`normalize`].
pub fn normalize_update(
    raw: &Value,
    previous: Option<&PrinterStatus>,
    sequence: u64,
) -> Result<Option<PrinterStatus>, NormalizationError> {
    let next = normalize(raw, previous, sequence)?;
    match previous {
        Some(prev) if prev.same_state(&next) => Ok(None),
        _ => Ok(Some(next)),
    }
}

// ── Code tables ───────────────────────────────────────────────────────────────

/// SDCP `PrintInfo.Status` codes.
pub fn print_status_from_code(code: i64) -> PrintStatus {
    match code {
        0 => PrintStatus::Idle,
        1 => PrintStatus::Homing,
        2 => PrintStatus::Dropping,
        3 => PrintStatus::Exposing,
        4 => PrintStatus::Lifting,
        // 5 = pausing, 6 = paused
        5 | 6 => PrintStatus::Paused,
        // 7 = stopping, 8 = stopped
        7 | 8 => PrintStatus::Stopped,
        9 => PrintStatus::Complete,
        other => PrintStatus::Unknown(other),
    }
}

/// SDCP `CurrentStatus` codes.  A printing machine whose job is homing is
/// reported as `Homing`.
pub fn machine_status_from_code(code: i64, print_status: PrintStatus) -> MachineStatus {
    match code {
        0 => MachineStatus::Idle,
        1 if print_status == PrintStatus::Homing => MachineStatus::Homing,
        1 => MachineStatus::Printing,
        2 => MachineStatus::FileTransferring,
        // 3 = exposure test, 4 = devices self-test
        3 | 4 => MachineStatus::Testing,
        other => MachineStatus::Unknown(other),
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

/// `CurrentStatus` is an array on V3 firmware and a bare integer on some
/// older builds.  With several active states, the first non-idle wins.
fn current_status_code(obj: &Map<String, Value>) -> Result<i64, NormalizationError> {
    match obj.get("CurrentStatus") {
        None => Err(NormalizationError::MissingField("CurrentStatus")),
        Some(Value::Array(codes)) => {
            let mut first = None;
            for v in codes {
                let code = v
                    .as_i64()
                    .ok_or_else(|| invalid("CurrentStatus", "expected integer codes"))?;
                if code != 0 {
                    return Ok(code);
                }
                first.get_or_insert(code);
            }
            Ok(first.unwrap_or(0))
        }
        Some(v) => v
            .as_i64()
            .ok_or_else(|| invalid("CurrentStatus", "expected an integer or array")),
    }
}

fn required_int(obj: &Map<String, Value>, field: &'static str) -> Result<i64, NormalizationError> {
    obj.get(field)
        .ok_or(NormalizationError::MissingField(field))?
        .as_i64()
        .ok_or_else(|| invalid(field, "expected an integer"))
}

fn optional_u32(obj: &Map<String, Value>, field: &'static str) -> Result<u32, NormalizationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| invalid(field, "expected a non-negative integer")),
    }
}

fn layer_progress(current: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u64::from(current.min(total)) * 100 / u64::from(total);
    pct as u8
}

fn invalid(field: &'static str, reason: &str) -> NormalizationError {
    NormalizationError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn printing(layer: u32) -> Value {
        json!({
            "CurrentStatus": [1],
            "PrintInfo": {
                "Status": 3,
                "CurrentLayer": layer,
                "TotalLayer": 400,
                "Filename": "benchy.ctb",
                "ErrorNumber": 0
            }
        })
    }

    #[test]
    fn test_normalize_printing_frame() {
        // Arrange / Act
        let s = normalize(&printing(100), None, 1).unwrap();

        // Assert
        assert_eq!(s.machine_status, MachineStatus::Printing);
        assert_eq!(s.print_status, PrintStatus::Exposing);
        assert_eq!(s.current_layer, 100);
        assert_eq!(s.total_layer, 400);
        assert_eq!(s.progress, 25);
        assert_eq!(s.current_file.as_deref(), Some("benchy.ctb"));
        assert_eq!(s.error_code, None);
        assert_eq!(s.updated_at, 1);
    }

    #[test]
    fn test_unknown_codes_map_to_unknown_variants() {
        let raw = json!({"CurrentStatus": [42], "PrintInfo": {"Status": 77}});
        let s = normalize(&raw, None, 1).unwrap();
        assert_eq!(s.machine_status, MachineStatus::Unknown(42));
        assert_eq!(s.print_status, PrintStatus::Unknown(77));
    }

    #[test]
    fn test_homing_job_reports_homing_machine() {
        let raw = json!({"CurrentStatus": [1], "PrintInfo": {"Status": 1}});
        let s = normalize(&raw, None, 1).unwrap();
        assert_eq!(s.machine_status, MachineStatus::Homing);
        assert_eq!(s.print_status, PrintStatus::Homing);
    }

    #[test]
    fn test_transitional_codes_collapse() {
        assert_eq!(print_status_from_code(5), PrintStatus::Paused);
        assert_eq!(print_status_from_code(7), PrintStatus::Stopped);
        assert_eq!(machine_status_from_code(4, PrintStatus::Idle), MachineStatus::Testing);
    }

    #[test]
    fn test_scalar_current_status_is_accepted() {
        let raw = json!({"CurrentStatus": 2, "PrintInfo": {"Status": 0}});
        let s = normalize(&raw, None, 1).unwrap();
        assert_eq!(s.machine_status, MachineStatus::FileTransferring);
    }

    #[test]
    fn test_first_non_idle_code_wins() {
        let raw = json!({"CurrentStatus": [0, 1], "PrintInfo": {"Status": 2}});
        let s = normalize(&raw, None, 1).unwrap();
        assert_eq!(s.machine_status, MachineStatus::Printing);
    }

    #[test]
    fn test_explicit_progress_is_clamped() {
        let raw = json!({"CurrentStatus": [1], "PrintInfo": {"Status": 3, "Progress": 140.5}});
        assert_eq!(normalize(&raw, None, 1).unwrap().progress, 100);
    }

    #[test]
    fn test_error_number_is_kept() {
        let raw = json!({"CurrentStatus": [0], "PrintInfo": {"Status": 8, "ErrorNumber": 3}});
        assert_eq!(normalize(&raw, None, 1).unwrap().error_code, Some(3));
    }

    #[test]
    fn test_missing_print_info_is_rejected() {
        let raw = json!({"CurrentStatus": [1]});
        assert_eq!(
            normalize(&raw, None, 1),
            Err(NormalizationError::MissingField("PrintInfo"))
        );
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let raw = json!({"CurrentStatus": [1], "PrintInfo": {"Status": 3, "TotalLayer": "ten"}});
        assert!(matches!(
            normalize(&raw, None, 1),
            Err(NormalizationError::InvalidField { field: "TotalLayer", .. })
        ));
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert_eq!(
            normalize(&json!([1, 2]), None, 1),
            Err(NormalizationError::NotAnObject)
        );
    }

    #[test]
    fn test_stale_sequence_is_rejected() {
        // Arrange
        let prev = normalize(&printing(10), None, 5).unwrap();

        // Act
        let same = normalize(&printing(11), Some(&prev), 5);
        let older = normalize(&printing(11), Some(&prev), 4);

        // Assert
        assert_eq!(same, Err(NormalizationError::Stale { sequence: 5, latest: 5 }));
        assert!(matches!(older, Err(NormalizationError::Stale { .. })));
    }

    #[test]
    fn test_update_without_change_returns_none() {
        let prev = normalize(&printing(10), None, 1).unwrap();
        assert_eq!(normalize_update(&printing(10), Some(&prev), 2), Ok(None));
    }

    #[test]
    fn test_update_with_change_returns_full_snapshot() {
        let prev = normalize(&printing(10), None, 1).unwrap();
        let next = normalize_update(&printing(11), Some(&prev), 2).unwrap().unwrap();
        assert_eq!(next.current_layer, 11);
        assert_eq!(next.updated_at, 2);
    }
}
