//! Shadow documents and inbound message decoding.
//!
//! Inbound payloads are decoded in a single fail-closed step: either every
//! recognised field is valid and a typed value comes back, or the whole
//! payload is rejected with a [`PayloadError`] and nothing is applied.
//!
//! # Example
//!
//! ```
//! use turbine_sync::brake::{BrakeAction, BrakePosition};
//! use turbine_sync::messages::{parse_brake_command, parse_delta, DeltaChange};
//!
//! let changes = parse_delta(br#"{"state": {"brake_status": "ON", "color": "blue"}}"#).unwrap();
//! assert_eq!(changes, vec![DeltaChange::BrakeStatus(BrakeAction::On)]);
//!
//! let cmd = parse_brake_command(br#"{"brake_pct": 50, "duration_sec": 2, "return_to_off": "true"}"#).unwrap();
//! assert_eq!(cmd.position, BrakePosition::Percent(50.0));
//! assert_eq!(cmd.duration_secs, 2.0);
//! assert!(cmd.return_to_off);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::brake::{BrakeAction, BrakePosition};
use crate::device::PublishMode;

/// Why an inbound payload was discarded.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Not JSON.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON, but not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,
    /// Delta without a `state` object.
    #[error("delta has no `state` object")]
    MissingState,
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field has the wrong type or is out of range.
    #[error("invalid value for `{field}`: {value}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Offending value as received.
        value: String,
    },
    /// Two mutually exclusive fields were both given.
    #[error("fields `{0}` and `{1}` are mutually exclusive")]
    Conflict(&'static str, &'static str),
    /// Command topic suffix with no handler.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
}

// ============================================================================
// Shadow Update
// ============================================================================

/// Which half of the shadow document an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowTarget {
    /// Requested but not yet applied intent.
    Desired,
    /// Confirmed local state.
    Reported,
}

impl ShadowTarget {
    /// Key inside `state`.
    pub fn as_str(self) -> &'static str {
        match self {
            ShadowTarget::Desired => "desired",
            ShadowTarget::Reported => "reported",
        }
    }
}

/// Build `{"state": {"<target>": {"<param>": value}}}`.
///
/// ```
/// use serde_json::json;
/// use turbine_sync::messages::{shadow_update_payload, ShadowTarget};
///
/// let doc = shadow_update_payload("vibe_limit", json!(4.5), ShadowTarget::Reported);
/// assert_eq!(doc, json!({"state": {"reported": {"vibe_limit": 4.5}}}));
/// ```
pub fn shadow_update_payload(param: &str, value: Value, target: ShadowTarget) -> Value {
    let mut inner = Map::new();
    inner.insert(param.to_string(), value);
    let mut state = Map::new();
    state.insert(target.as_str().to_string(), Value::Object(inner));
    json!({ "state": state })
}

/// Body of an `update/rejected` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RejectedResponse {
    /// Broker error code.
    #[serde(default)]
    pub code: Option<u16>,
    /// Broker error message.
    #[serde(default)]
    pub message: Option<String>,
    /// Client token echoed back.
    #[serde(default, rename = "clientToken")]
    pub client_token: Option<String>,
}

// ============================================================================
// Delta
// ============================================================================

/// One recognised change from a shadow delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaChange {
    /// `brake_status`.
    BrakeStatus(BrakeAction),
    /// `data_path`.
    DataPath(PublishMode),
    /// `data_fast_interval` (seconds).
    DataFastInterval(u32),
    /// `vibe_limit`.
    VibeLimit(f32),
    /// `brake_on_pwm`.
    BrakeOnPwm(f32),
    /// `brake_off_pwm`.
    BrakeOffPwm(f32),
}

impl DeltaChange {
    /// Shadow parameter name.
    pub fn param(&self) -> &'static str {
        match self {
            DeltaChange::BrakeStatus(_) => "brake_status",
            DeltaChange::DataPath(_) => "data_path",
            DeltaChange::DataFastInterval(_) => "data_fast_interval",
            DeltaChange::VibeLimit(_) => "vibe_limit",
            DeltaChange::BrakeOnPwm(_) => "brake_on_pwm",
            DeltaChange::BrakeOffPwm(_) => "brake_off_pwm",
        }
    }

    /// Value acknowledged into `reported` once applied.
    pub fn reported_value(&self) -> Value {
        match *self {
            DeltaChange::BrakeStatus(action) => json!(action.as_str()),
            DeltaChange::DataPath(mode) => json!(mode.as_str()),
            DeltaChange::DataFastInterval(secs) => json!(secs),
            DeltaChange::VibeLimit(limit) => json!(limit),
            DeltaChange::BrakeOnPwm(duty) | DeltaChange::BrakeOffPwm(duty) => json!(duty),
        }
    }
}

/// Decode a delta into changes, in application order.
///
/// Unknown keys are ignored. Any recognised key with a bad value rejects the
/// whole delta.
pub fn parse_delta(payload: &[u8]) -> Result<Vec<DeltaChange>, PayloadError> {
    let root = parse_object(payload)?;
    let state = root
        .get("state")
        .and_then(Value::as_object)
        .ok_or(PayloadError::MissingState)?;

    let mut changes = Vec::new();
    if let Some(v) = state.get("brake_status") {
        let action = v
            .as_str()
            .and_then(BrakeAction::from_text)
            .ok_or_else(|| invalid("brake_status", v))?;
        changes.push(DeltaChange::BrakeStatus(action));
    }
    if let Some(v) = state.get("data_path") {
        let mode = v
            .as_str()
            .and_then(PublishMode::from_text)
            .ok_or_else(|| invalid("data_path", v))?;
        changes.push(DeltaChange::DataPath(mode));
    }
    if let Some(v) = state.get("data_fast_interval") {
        let secs = positive_int("data_fast_interval", v)?;
        changes.push(DeltaChange::DataFastInterval(secs));
    }
    if let Some(v) = state.get("vibe_limit") {
        changes.push(DeltaChange::VibeLimit(positive_float("vibe_limit", v)?));
    }
    if let Some(v) = state.get("brake_on_pwm") {
        changes.push(DeltaChange::BrakeOnPwm(positive_float("brake_on_pwm", v)?));
    }
    if let Some(v) = state.get("brake_off_pwm") {
        changes.push(DeltaChange::BrakeOffPwm(positive_float("brake_off_pwm", v)?));
    }
    Ok(changes)
}

// ============================================================================
// Brake Command
// ============================================================================

/// Decoded `cmd/.../brake` payload.
///
/// # JSON Examples
///
/// Raw duty cycle, one second, then back to off:
/// ```json
/// {"pwm_value": 7.0}
/// ```
///
/// Half-way for two seconds, then release in place:
/// ```json
/// {"brake_pct": 50, "duration_sec": 2, "return_to_off": "false"}
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrakeCommand {
    /// Target position.
    pub position: BrakePosition,
    /// Hold time in seconds.
    pub duration_secs: f32,
    /// Return to the off-position after holding.
    pub return_to_off: bool,
}

/// Hold time when `duration_sec` is absent.
pub const DEFAULT_HOLD_SECS: f32 = 1.0;

/// Decode a brake command.
pub fn parse_brake_command(payload: &[u8]) -> Result<BrakeCommand, PayloadError> {
    let root = parse_object(payload)?;

    let position = match (root.get("pwm_value"), root.get("brake_pct")) {
        (Some(_), Some(_)) => return Err(PayloadError::Conflict("pwm_value", "brake_pct")),
        (Some(v), None) => BrakePosition::Duty(number("pwm_value", v)?),
        (None, Some(v)) => BrakePosition::Percent(number("brake_pct", v)?),
        (None, None) => return Err(PayloadError::MissingField("pwm_value")),
    };

    let duration_secs = match root.get("duration_sec") {
        Some(v) => {
            let secs = number("duration_sec", v)?;
            if secs < 0.0 {
                return Err(invalid("duration_sec", v));
            }
            secs
        }
        None => DEFAULT_HOLD_SECS,
    };

    let return_to_off = match root.get("return_to_off") {
        Some(v) => truthy("return_to_off", v)?,
        None => true,
    };

    Ok(BrakeCommand {
        position,
        duration_secs,
        return_to_off,
    })
}

// ============================================================================
// Value coercion
// ============================================================================

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(PayloadError::NotAnObject),
    }
}

fn invalid(field: &'static str, value: &Value) -> PayloadError {
    PayloadError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

/// A finite number, or a string holding one.
fn number(field: &'static str, value: &Value) -> Result<f32, PayloadError> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
        .map(|n| n as f32)
        .ok_or_else(|| invalid(field, value))
}

fn positive_float(field: &'static str, value: &Value) -> Result<f32, PayloadError> {
    let n = number(field, value)?;
    if n > 0.0 {
        Ok(n)
    } else {
        Err(invalid(field, value))
    }
}

/// A positive whole number, or a string holding one.
fn positive_int(field: &'static str, value: &Value) -> Result<u32, PayloadError> {
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    n.filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(field, value))
}

/// A boolean, 0/1, or one of the usual yes/no spellings.
fn truthy(field: &'static str, value: &Value) -> Result<bool, PayloadError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(field, value)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
            "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
            _ => Err(invalid(field, value)),
        },
        _ => Err(invalid(field, value)),
    }
}
