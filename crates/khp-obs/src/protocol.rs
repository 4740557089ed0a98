//! obs-websocket 5.x message shapes.
//!
//! Every message on the wire is `{"op": <opcode>, "d": {...}}`. Incoming
//! messages are decoded exactly once into a [`Frame`]; outgoing messages are
//! built with the encoder functions at the bottom of this module.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ObsError;

/// The only RPC version this client speaks.
pub const RPC_VERSION: u32 = 1;

/// Message opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Server greeting, first message after connect.
    Hello = 0,
    /// Client identification, reply to Hello.
    Identify = 1,
    /// Server accepted the identification.
    Identified = 2,
    /// Client updates its session parameters.
    Reidentify = 3,
    /// Asynchronous event from the server.
    Event = 5,
    /// Single request.
    Request = 6,
    /// Response to a single request.
    RequestResponse = 7,
    /// Batch of requests under one id.
    RequestBatch = 8,
    /// Response to a batch.
    RequestBatchResponse = 9,
}

impl OpCode {
    /// Map a raw wire opcode.
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Hello,
            1 => Self::Identify,
            2 => Self::Identified,
            3 => Self::Reidentify,
            5 => Self::Event,
            6 => Self::Request,
            7 => Self::RequestResponse,
            8 => Self::RequestBatch,
            9 => Self::RequestBatchResponse,
            _ => return None,
        })
    }
}

/// Raw opcode of a message, if it has one.
pub fn opcode_of(message: &Value) -> Option<u64> {
    message.get("op").and_then(Value::as_u64)
}

/// `requestId` of a raw `op 7` or `op 9` message, read without decoding the
/// rest of it.
pub fn reply_request_id(message: &Value) -> Option<&str> {
    let op = opcode_of(message)?;
    if op != OpCode::RequestResponse as u64 && op != OpCode::RequestBatchResponse as u64 {
        return None;
    }
    message.get("d")?.get("requestId")?.as_str()
}

/// `RequestStatus` codes.
pub mod status {
    /// Unknown status, should never be returned.
    pub const UNKNOWN: u16 = 0;
    /// Request succeeded.
    pub const SUCCESS: u16 = 100;
    /// `requestType` field is missing.
    pub const MISSING_REQUEST_TYPE: u16 = 203;
    /// The request type is not known to the server.
    pub const UNKNOWN_REQUEST_TYPE: u16 = 204;
    /// Generic error.
    pub const GENERIC_ERROR: u16 = 205;
    /// Unsupported batch `executionType`.
    pub const UNSUPPORTED_BATCH_EXECUTION_TYPE: u16 = 206;
    /// The server is not ready to handle the request.
    pub const NOT_READY: u16 = 207;
    /// A required request field is missing.
    pub const MISSING_REQUEST_FIELD: u16 = 300;
    /// The request has no data.
    pub const MISSING_REQUEST_DATA: u16 = 301;
    /// A request field has an invalid value.
    pub const INVALID_REQUEST_FIELD: u16 = 400;
    /// A request field has the wrong type.
    pub const INVALID_REQUEST_FIELD_TYPE: u16 = 401;
    /// Output is running.
    pub const OUTPUT_RUNNING: u16 = 500;
    /// Output is not running.
    pub const OUTPUT_NOT_RUNNING: u16 = 501;
    /// Studio mode is active.
    pub const STUDIO_MODE_ACTIVE: u16 = 505;
    /// Studio mode is not active.
    pub const STUDIO_MODE_NOT_ACTIVE: u16 = 506;
    /// The named resource does not exist.
    pub const RESOURCE_NOT_FOUND: u16 = 600;
    /// A resource by that name already exists.
    pub const RESOURCE_ALREADY_EXISTS: u16 = 601;
    /// The resource has the wrong type.
    pub const INVALID_RESOURCE_TYPE: u16 = 602;
    /// The input kind is not known.
    pub const INVALID_INPUT_KIND: u16 = 605;
    /// Creating the resource failed.
    pub const RESOURCE_CREATION_FAILED: u16 = 700;
    /// An action on the resource failed.
    pub const RESOURCE_ACTION_FAILED: u16 = 701;
    /// Processing the request failed.
    pub const REQUEST_PROCESSING_FAILED: u16 = 702;
    /// The server cannot act on the request.
    pub const CANNOT_ACT: u16 = 703;
}

/// `eventSubscriptions` bits sent in `Identify`.
pub mod subscription {
    /// No events.
    pub const NONE: u32 = 0;
    /// General events.
    pub const GENERAL: u32 = 1 << 0;
    /// Config (profile, scene collection) events.
    pub const CONFIG: u32 = 1 << 1;
    /// Scene events.
    pub const SCENES: u32 = 1 << 2;
    /// Input events.
    pub const INPUTS: u32 = 1 << 3;
    /// Transition events.
    pub const TRANSITIONS: u32 = 1 << 4;
    /// Filter events.
    pub const FILTERS: u32 = 1 << 5;
    /// Output events.
    pub const OUTPUTS: u32 = 1 << 6;
    /// Scene item events.
    pub const SCENE_ITEMS: u32 = 1 << 7;
    /// Media input events.
    pub const MEDIA_INPUTS: u32 = 1 << 8;
    /// Vendor events.
    pub const VENDORS: u32 = 1 << 9;
    /// UI events.
    pub const UI: u32 = 1 << 10;
    /// Every non high-volume category.
    pub const ALL: u32 = GENERAL
        | CONFIG
        | SCENES
        | INPUTS
        | TRANSITIONS
        | FILTERS
        | OUTPUTS
        | SCENE_ITEMS
        | MEDIA_INPUTS
        | VENDORS
        | UI;
    /// High-volume: input volume meters.
    pub const INPUT_VOLUME_METERS: u32 = 1 << 16;
    /// High-volume: input active state changes.
    pub const INPUT_ACTIVE_STATE_CHANGED: u32 = 1 << 17;
    /// High-volume: input show state changes.
    pub const INPUT_SHOW_STATE_CHANGED: u32 = 1 << 18;
    /// High-volume: scene item transform changes.
    pub const SCENE_ITEM_TRANSFORM_CHANGED: u32 = 1 << 19;

    /// Category names and their bits.
    pub const CATEGORIES: &[(&str, u32)] = &[
        ("General", GENERAL),
        ("Config", CONFIG),
        ("Scenes", SCENES),
        ("Inputs", INPUTS),
        ("Transitions", TRANSITIONS),
        ("Filters", FILTERS),
        ("Outputs", OUTPUTS),
        ("SceneItems", SCENE_ITEMS),
        ("MediaInputs", MEDIA_INPUTS),
        ("Vendors", VENDORS),
        ("Ui", UI),
        ("InputVolumeMeters", INPUT_VOLUME_METERS),
        ("InputActiveStateChanged", INPUT_ACTIVE_STATE_CHANGED),
        ("InputShowStateChanged", INPUT_SHOW_STATE_CHANGED),
        ("SceneItemTransformChanged", SCENE_ITEM_TRANSFORM_CHANGED),
    ];

    /// Category name for an `eventIntent`, lowest named bit first.
    pub fn category_name(intent: u32) -> Option<&'static str> {
        CATEGORIES
            .iter()
            .find(|(_, bit)| intent & bit != 0)
            .map(|(name, _)| *name)
    }

    /// Bit for a category name (case-sensitive).
    pub fn category_bit(name: &str) -> Option<u32> {
        CATEGORIES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bit)| *bit)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Incoming
// ─────────────────────────────────────────────────────────────────────────────

/// `op 0` body.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Plugin version string.
    #[serde(default)]
    pub obs_web_socket_version: Option<String>,
    /// Server RPC version.
    pub rpc_version: u32,
    /// Present when the server requires a password.
    #[serde(default)]
    pub authentication: Option<AuthChallenge>,
}

/// Salt and challenge for the password proof.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthChallenge {
    /// Per-session challenge.
    pub challenge: String,
    /// Password salt.
    pub salt: String,
}

/// `op 2` body.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    /// RPC version both sides agreed on.
    pub negotiated_rpc_version: u32,
}

/// `op 5` body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// e.g. `CurrentProgramSceneChanged`.
    pub event_type: String,
    /// Subscription bit(s) the event belongs to.
    #[serde(default)]
    pub event_intent: u32,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

impl Event {
    /// Subscription category name derived from `eventIntent`.
    pub fn category(&self) -> Option<&'static str> {
        subscription::category_name(self.event_intent)
    }
}

/// Outcome of one request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequestStatus {
    /// `true` on success.
    pub result: bool,
    /// See [`status`]. Absent on some replies; reads as [`status::UNKNOWN`].
    #[serde(default)]
    pub code: u16,
    /// Server explanation on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// `op 7` body, also used for each entry of a batch response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    /// Echo of the request type.
    pub request_type: String,
    /// Echo of the request id (the item index inside a batch, if given).
    #[serde(default)]
    pub request_id: String,
    /// Outcome.
    pub request_status: RequestStatus,
    /// Response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

impl RequestResponse {
    /// Whether the server reported success.
    pub fn is_success(&self) -> bool {
        self.request_status.result
    }

    /// Turn a failed status into [`ObsError::Remote`].
    pub fn into_result(self) -> Result<Self, ObsError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ObsError::Remote {
                request_type: self.request_type,
                code: self.request_status.code,
                comment: self.request_status.comment,
            })
        }
    }
}

/// `op 9` body.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Echo of the batch id.
    pub request_id: String,
    /// One entry per executed item.
    #[serde(default)]
    pub results: Vec<RequestResponse>,
}

/// A decoded incoming message.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `op 0`.
    Greeting(Hello),
    /// `op 2`.
    IdentifyAck(Identified),
    /// `op 5`.
    Event(Event),
    /// `op 7`.
    Response(RequestResponse),
    /// `op 9`.
    BatchResponse(BatchResponse),
}

impl Frame {
    /// Decode a raw message.
    ///
    /// Anything that is not one of the server-to-client shapes is a
    /// [`ObsError::Protocol`] error.
    pub fn decode(message: Value) -> Result<Self, ObsError> {
        let Value::Object(mut map) = message else {
            return Err(ObsError::Protocol("message is not a JSON object".into()));
        };
        let raw = map
            .get("op")
            .and_then(Value::as_u64)
            .ok_or_else(|| ObsError::Protocol("message has no opcode".into()))?;
        let body = map
            .remove("d")
            .ok_or_else(|| ObsError::Protocol(format!("op {raw} message has no body")))?;

        match OpCode::from_raw(raw) {
            Some(OpCode::Hello) => body_of(body, "Hello").map(Self::Greeting),
            Some(OpCode::Identified) => body_of(body, "Identified").map(Self::IdentifyAck),
            Some(OpCode::Event) => body_of(body, "Event").map(Self::Event),
            Some(OpCode::RequestResponse) => body_of(body, "RequestResponse").map(Self::Response),
            Some(OpCode::RequestBatchResponse) => {
                body_of(body, "RequestBatchResponse").map(Self::BatchResponse)
            }
            _ => Err(ObsError::Protocol(format!("unexpected opcode {raw}"))),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Greeting(_) => "Hello",
            Self::IdentifyAck(_) => "Identified",
            Self::Event(_) => "Event",
            Self::Response(_) => "RequestResponse",
            Self::BatchResponse(_) => "RequestBatchResponse",
        }
    }
}

fn body_of<T: serde::de::DeserializeOwned>(body: Value, what: &str) -> Result<T, ObsError> {
    serde_json::from_value(body).map_err(|e| ObsError::Protocol(format!("malformed {what}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Outgoing
// ─────────────────────────────────────────────────────────────────────────────

/// `op 1`.
pub fn identify(authentication: Option<&str>, event_subscriptions: u32) -> Value {
    let mut d = json!({
        "rpcVersion": RPC_VERSION,
        "eventSubscriptions": event_subscriptions,
    });
    if let Some(auth) = authentication {
        d["authentication"] = Value::String(auth.to_owned());
    }
    json!({ "op": OpCode::Identify as u8, "d": d })
}

/// `op 6`. A `Null` payload is omitted.
pub fn request(request_id: &str, request_type: &str, request_data: Value) -> Value {
    let mut d = json!({
        "requestType": request_type,
        "requestId": request_id,
    });
    if !request_data.is_null() {
        d["requestData"] = request_data;
    }
    json!({ "op": OpCode::Request as u8, "d": d })
}

/// `op 8`. `requests` are already-shaped batch items.
pub fn request_batch(
    request_id: &str,
    halt_on_failure: bool,
    execution_type: i8,
    requests: Vec<Value>,
) -> Value {
    json!({
        "op": OpCode::RequestBatch as u8,
        "d": {
            "requestId": request_id,
            "haltOnFailure": halt_on_failure,
            "executionType": execution_type,
            "requests": requests,
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn status_without_code_decodes_as_unknown() {
        let frame = Frame::decode(json!({
            "op": 7,
            "d": {"requestType": "CreateScene", "requestId": "3", "requestStatus": {"result": true}}
        }))
        .unwrap();
        let Frame::Response(response) = frame else {
            panic!("expected Response, got {frame:?}");
        };
        assert!(response.is_success());
        assert_eq!(response.request_status.code, status::UNKNOWN);
    }

    #[test]
    fn reply_request_id_only_for_responses() {
        assert_eq!(
            reply_request_id(&json!({"op": 7, "d": {"requestId": "12"}})),
            Some("12")
        );
        assert_eq!(
            reply_request_id(&json!({"op": 9, "d": {"requestId": "4", "results": 1}})),
            Some("4")
        );
        assert_eq!(reply_request_id(&json!({"op": 5, "d": {"requestId": "12"}})), None);
        assert_eq!(reply_request_id(&json!({"op": 7, "d": {}})), None);
        assert_eq!(reply_request_id(&Value::Null), None);
    }

    #[test]
    fn decode_hello_with_auth() {
        let frame = Frame::decode(json!({
            "op": 0,
            "d": {
                "obsWebSocketVersion": "5.1.0",
                "rpcVersion": 1,
                "authentication": {"challenge": "c", "salt": "s"}
            }
        }))
        .unwrap();
        let Frame::Greeting(hello) = frame else {
            panic!("expected Greeting, got {frame:?}");
        };
        assert_eq!(hello.rpc_version, 1);
        assert_eq!(hello.obs_web_socket_version.as_deref(), Some("5.1.0"));
        assert_eq!(
            hello.authentication,
            Some(AuthChallenge {
                challenge: "c".into(),
                salt: "s".into()
            })
        );
    }

    #[test]
    fn decode_hello_without_auth() {
        let frame = Frame::decode(json!({"op": 0, "d": {"rpcVersion": 1}})).unwrap();
        assert_matches!(frame, Frame::Greeting(Hello { authentication: None, .. }));
    }

    #[test]
    fn decode_response_keeps_every_field() {
        let frame = Frame::decode(json!({
            "op": 7,
            "d": {
                "requestType": "GetSceneList",
                "requestId": "12",
                "requestStatus": {"result": true, "code": 100},
                "responseData": {"scenes": []}
            }
        }))
        .unwrap();
        let Frame::Response(resp) = frame else {
            panic!("expected Response");
        };
        assert_eq!(resp.request_type, "GetSceneList");
        assert_eq!(resp.request_id, "12");
        assert!(resp.is_success());
        assert_eq!(resp.response_data, Some(json!({"scenes": []})));
    }

    #[test]
    fn decode_event_without_data() {
        let frame = Frame::decode(json!({
            "op": 5,
            "d": {"eventType": "ExitStarted", "eventIntent": 1}
        }))
        .unwrap();
        let Frame::Event(event) = frame else {
            panic!("expected Event");
        };
        assert_eq!(event.event_type, "ExitStarted");
        assert_eq!(event.category(), Some("General"));
        assert!(event.event_data.is_none());
    }

    #[test]
    fn decode_batch_response() {
        let frame = Frame::decode(json!({
            "op": 9,
            "d": {
                "requestId": "3",
                "results": [
                    {"requestType": "A", "requestId": "0", "requestStatus": {"result": true, "code": 100}}
                ]
            }
        }))
        .unwrap();
        let Frame::BatchResponse(batch) = frame else {
            panic!("expected BatchResponse");
        };
        assert_eq!(batch.request_id, "3");
        assert_eq!(batch.results.len(), 1);
    }

    #[test]
    fn decode_rejects_non_object() {
        assert_matches!(Frame::decode(Value::Null), Err(ObsError::Protocol(_)));
        assert_matches!(Frame::decode(json!([1, 2])), Err(ObsError::Protocol(_)));
    }

    #[test]
    fn decode_rejects_missing_opcode_or_body() {
        assert_matches!(Frame::decode(json!({"d": {}})), Err(ObsError::Protocol(_)));
        assert_matches!(Frame::decode(json!({"op": 7})), Err(ObsError::Protocol(_)));
    }

    #[test]
    fn decode_rejects_client_opcodes() {
        let err = Frame::decode(json!({"op": 6, "d": {}})).unwrap_err();
        assert!(err.to_string().contains("unexpected opcode 6"));
    }

    #[test]
    fn decode_rejects_malformed_body() {
        let err = Frame::decode(json!({"op": 7, "d": {"requestType": 5}})).unwrap_err();
        assert!(err.to_string().contains("malformed RequestResponse"));
    }

    #[test]
    fn failed_status_into_remote_error() {
        let resp = RequestResponse {
            request_type: "CreateScene".into(),
            request_id: "1".into(),
            request_status: RequestStatus {
                result: false,
                code: status::RESOURCE_ALREADY_EXISTS,
                comment: Some("exists".into()),
            },
            response_data: None,
        };
        let err = resp.into_result().unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn encode_identify() {
        let msg = identify(Some("proof"), subscription::ALL);
        assert_eq!(msg["op"], 1);
        assert_eq!(msg["d"]["rpcVersion"], 1);
        assert_eq!(msg["d"]["eventSubscriptions"], 0x7FF);
        assert_eq!(msg["d"]["authentication"], "proof");

        let msg = identify(None, subscription::NONE);
        assert!(msg["d"].get("authentication").is_none());
    }

    #[test]
    fn encode_request_omits_null_data() {
        let msg = request("4", "GetVersion", Value::Null);
        assert_eq!(msg["op"], 6);
        assert_eq!(msg["d"]["requestId"], "4");
        assert!(msg["d"].get("requestData").is_none());

        let msg = request("5", "CreateScene", json!({"sceneName": "Song"}));
        assert_eq!(msg["d"]["requestData"]["sceneName"], "Song");
    }

    #[test]
    fn encode_request_batch() {
        let msg = request_batch("9", true, 0, vec![json!({"requestType": "A"})]);
        assert_eq!(msg["op"], 8);
        assert_eq!(msg["d"]["haltOnFailure"], true);
        assert_eq!(msg["d"]["executionType"], 0);
        assert_eq!(msg["d"]["requests"][0]["requestType"], "A");
    }

    #[test]
    fn all_is_0x7ff() {
        assert_eq!(subscription::ALL, 0x7FF);
    }

    #[test]
    fn category_names() {
        assert_eq!(subscription::category_name(subscription::SCENES), Some("Scenes"));
        assert_eq!(subscription::category_name(subscription::UI), Some("Ui"));
        assert_eq!(subscription::category_name(0), None);
        assert_eq!(subscription::category_bit("Outputs"), Some(1 << 6));
        assert_eq!(subscription::category_bit("outputs"), None);
    }

    #[test]
    fn opcode_round_trip() {
        for raw in [0_u64, 1, 2, 3, 5, 6, 7, 8, 9] {
            let op = OpCode::from_raw(raw).unwrap();
            assert_eq!(op as u64, raw);
        }
        assert_eq!(OpCode::from_raw(4), None);
        assert_eq!(opcode_of(&json!({"op": 2})), Some(2));
        assert_eq!(opcode_of(&Value::Null), None);
    }
}
