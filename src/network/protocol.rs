//! Wire types of the RPC surface and the WebSocket event stream.
//!
//! Requests arrive as HTTP POST bodies, JSON by default; a content type of
//! `application/octet-stream` selects the compact binary codec (bincode).
//! Responses mirror the request's `Accept` header. Request types that opt
//! into the binary codec round-trip symmetrically through both encodings.

use crate::auth::LoginUser;
use crate::error::{MediatorError, Result};
use crate::history::{BoundingMethod, ModifyMode, QualityFilter};
use crate::modules::{ConfigPatch, FailedVariable, VariableInfo};
use crate::values::{
    AlarmOrEvent, HistoryChange, ObjectRef, Severity, Timestamp, VariableRef, VariableValue, VTQ,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Request/response encoding negotiated per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Binary,
}

impl Codec {
    pub fn from_content_type(content_type: Option<&str>) -> Codec {
        match content_type {
            Some(ct) if ct.starts_with(CONTENT_TYPE_BINARY) => Codec::Binary,
            _ => Codec::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::Binary => CONTENT_TYPE_BINARY,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json => serde_json::to_vec(value)
                .map_err(|e| MediatorError::internal(format!("response encode: {e}"))),
            Codec::Binary => bincode::serialize(value)
                .map_err(|e| MediatorError::internal(format!("response encode: {e}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => serde_json::from_slice(bytes)
                .map_err(|e| MediatorError::request(format!("invalid request body: {e}"))),
            Codec::Binary => bincode::deserialize(bytes)
                .map_err(|e| MediatorError::request(format!("invalid request body: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Request parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginParams {
    pub login: String,
    #[serde(default)]
    pub is_module: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateParams {
    pub session: String,
    pub hash: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParams {
    pub session: String,
    pub module_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeParams {
    pub session: String,
    pub module_id: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectsParams {
    pub session: String,
    pub objects: Vec<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectParams {
    pub session: String,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberValuesParams {
    pub session: String,
    pub object: ObjectRef,
    /// Empty list browses all members.
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadParams {
    pub session: String,
    pub variables: Vec<VariableRef>,
    /// Timeout for the sync flavours; the async reads ignore it.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteParams {
    pub session: String,
    pub values: Vec<VariableValue>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianReadRawParams {
    pub session: String,
    pub variable: VariableRef,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub max_values: usize,
    pub bounding: BoundingMethod,
    pub filter: QualityFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianCountParams {
    pub session: String,
    pub variable: VariableRef,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub filter: QualityFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianModifyParams {
    pub session: String,
    pub variable: VariableRef,
    pub mode: ModifyMode,
    pub data: Vec<VTQ>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianDeleteIntervalParams {
    pub session: String,
    pub variable: VariableRef,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianDeleteVariablesParams {
    pub session: String,
    pub variables: Vec<VariableRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianVariableParams {
    pub session: String,
    pub variable: VariableRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigParams {
    pub session: String,
    pub module_id: String,
    #[serde(flatten)]
    pub patch: ConfigPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableAlarmsParams {
    pub session: String,
    pub min_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableConfigChangedParams {
    pub session: String,
    pub objects: Vec<ObjectRef>,
}

/// Delivery options of a variable-value subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubOptions {
    /// Keep only the newest value per variable while a frame is pending.
    #[serde(default = "default_true")]
    pub coalesce: bool,
    /// Enqueue the current values immediately on subscribe.
    #[serde(default)]
    pub send_initial: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SubOptions {
    fn default() -> Self {
        SubOptions {
            coalesce: true,
            send_initial: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableVarValueParams {
    pub session: String,
    #[serde(default)]
    pub options: SubOptions,
    /// Explicit variable list; may be combined with tree roots.
    #[serde(default)]
    pub variables: Vec<VariableRef>,
    /// Object-tree roots: every variable under a root matches.
    #[serde(default)]
    pub roots: Vec<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableChangeEventsParams {
    pub session: String,
    #[serde(default)]
    pub variables: bool,
    #[serde(default)]
    pub history: bool,
    #[serde(default)]
    pub config: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMethodParams {
    pub session: String,
    pub module_id: String,
    pub method_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session: String,
    pub challenge: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub user: LoginUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Per-type metadata of a module (`GetMetaInfos`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaInfos {
    pub module_id: String,
    pub types: Vec<TypeMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMeta {
    pub type_name: String,
    pub variables: Vec<VariableInfo>,
}

/// Object with its current variable values (`GetObjectValuesByID`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub object: ObjectRef,
    pub values: Vec<VariableValue>,
}

/// Member name/value pairs (`GetMemberValues`, `BrowseObjectMemberValues`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberValue {
    pub member: String,
    pub value: crate::values::DataValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub failed: Vec<FailedVariable>,
}

/// Error body of every failed request: `{ "error": "<message>" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// WebSocket event frames
// ---------------------------------------------------------------------------

/// One push frame on a session's WebSocket. Always JSON; each frame is
/// acknowledged by the client with the literal text `"OK"` before the next
/// one is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventFrame {
    OnVariableValueChanged { values: Vec<VariableValue> },
    OnVariableHistoryChanged { changes: Vec<HistoryChange> },
    OnConfigChanged { objects: Vec<ObjectRef> },
    OnAlarmOrEvent { events: Vec<AlarmOrEvent> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Quality;
    use serde_json::json;

    #[test]
    fn codec_selection_from_content_type() {
        assert_eq!(Codec::from_content_type(None), Codec::Json);
        assert_eq!(
            Codec::from_content_type(Some("application/json")),
            Codec::Json
        );
        assert_eq!(
            Codec::from_content_type(Some("application/octet-stream")),
            Codec::Binary
        );
    }

    #[test]
    fn json_roundtrip_of_request_types() {
        let params = WriteParams {
            session: "s".to_string(),
            values: vec![VariableValue::new(
                ObjectRef::new("io", "dev").variable("V"),
                VTQ::good(json!(42.0), Timestamp::from_millis(7)),
            )],
            timeout_ms: Some(500),
        };
        let bytes = Codec::Json.encode(&params).unwrap();
        let back: WriteParams = Codec::Json.decode(&bytes).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn binary_roundtrip_is_identity_and_stable() {
        let params = HistorianReadRawParams {
            session: "s".to_string(),
            variable: ObjectRef::new("io", "dev").variable("V"),
            start_time: Timestamp::EMPTY,
            end_time: Timestamp::MAX,
            max_values: 100,
            bounding: BoundingMethod::CompressToN,
            filter: QualityFilter::ExcludeBad,
        };
        let bytes = Codec::Binary.encode(&params).unwrap();
        let back: HistorianReadRawParams = Codec::Binary.decode(&bytes).unwrap();
        assert_eq!(back, params);
        assert_eq!(bytes, Codec::Binary.encode(&params).unwrap());
    }

    #[test]
    fn binary_roundtrip_of_value_batch() {
        let params = HistorianModifyParams {
            session: "s".to_string(),
            variable: ObjectRef::new("io", "dev").variable("V"),
            mode: ModifyMode::Upsert,
            data: vec![
                VTQ::new(json!({"nested": [1, 2]}), Timestamp::from_millis(1), Quality::Uncertain),
                VTQ::good(json!("text"), Timestamp::from_millis(2)),
            ],
        };
        let bytes = Codec::Binary.encode(&params).unwrap();
        let back: HistorianModifyParams = Codec::Binary.decode(&bytes).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn event_frames_carry_event_tag() {
        let frame = EventFrame::OnVariableValueChanged {
            values: vec![VariableValue::new(
                ObjectRef::new("io", "dev").variable("V"),
                VTQ::good(json!(1), Timestamp::from_millis(5)),
            )],
        };
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["event"], json!("OnVariableValueChanged"));

        let back: EventFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn malformed_body_is_a_request_error() {
        let err = Codec::Json.decode::<LoginParams>(b"{ not json").unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn sub_options_default_to_coalescing() {
        let params: EnableVarValueParams =
            serde_json::from_str(r#"{ "session": "s" }"#).unwrap();
        assert!(params.options.coalesce);
        assert!(!params.options.send_initial);
        assert!(params.variables.is_empty());
        assert!(params.roots.is_empty());
    }
}
