//! Daemon protocol — JSON-RPC 2.0 messages, one JSON value per line.
//!
//! A [`Request`] without an `id` is a notification and never gets a
//! [`Response`]. A response carries exactly one of `result` or `error`;
//! `result` may be `null`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::error::{BazelleError, Result};
use crate::incremental::ChangeSet;

pub const JSONRPC_VERSION: &str = "2.0";

// ─── Error codes ────────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// ─── Methods ────────────────────────────────────────────────────

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_WATCH_START: &str = "watch/start";
pub const METHOD_WATCH_STOP: &str = "watch/stop";
pub const METHOD_WATCH_STATUS: &str = "watch/status";
/// Server to client only.
pub const METHOD_WATCH_EVENT: &str = "watch/event";
pub const METHOD_UPDATE_RUN: &str = "update/run";
pub const METHOD_STATUS_GET: &str = "status/get";

// ─── Status strings ─────────────────────────────────────────────

pub const STATUS_STARTED: &str = "started";
pub const STATUS_ALREADY_WATCHING: &str = "already_watching";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_NOT_WATCHING: &str = "not_watching";
pub const STATUS_UP_TO_DATE: &str = "up_to_date";
pub const STATUS_UPDATED: &str = "updated";

pub const EVENT_UPDATE: &str = "update";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_SHUTDOWN: &str = "shutdown";

// ─── Envelopes ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Missing versions deserialize as `""` so they fail the version check
    /// instead of the parse.
    #[serde(default)]
    pub jsonrpc: String,
    /// `None` (absent or `null`) marks a notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }

    /// Decode `params`; absent or `null` params yield `T::default()`.
    pub fn parse_params<T>(&self) -> std::result::Result<T, RpcError>
    where
        T: DeserializeOwned + Default,
    {
        match &self.params {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| RpcError::invalid_params(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new<T: Serialize>(method: impl Into<String>, params: &T) -> Result<Self> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(serde_json::to_value(params)?),
        })
    }

    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T> {
        let params = self.params.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(params)?)
    }
}

/// Exactly one of these is on every response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct Response {
    pub jsonrpc: String,
    /// `None` only for errors about a request whose id could not be read.
    pub id: Option<i64>,
    pub payload: Payload,
}

impl Response {
    pub fn success(id: Option<i64>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: Payload::Result(result),
        }
    }

    pub fn failure(id: Option<i64>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: Payload::Error(error),
        }
    }

    /// Serialize `result`; a failure to do so becomes an `InternalError` response.
    pub fn ok<T: Serialize>(id: Option<i64>, result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::failure(id, RpcError::internal_error(e.to_string())),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Result(v) => Some(v),
            Payload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.payload {
            Payload::Result(_) => None,
            Payload::Error(e) => Some(e),
        }
    }

    /// The result value, or the error as [`BazelleError::Rpc`].
    pub fn into_result(self) -> Result<Value> {
        match self.payload {
            Payload::Result(v) => Ok(v),
            Payload::Error(e) => Err(BazelleError::Rpc {
                code: e.code,
                message: e.message,
            }),
        }
    }
}

/// Wire shape of a response. `result: null` deserializes to `Some(Null)`,
/// a missing `result` to `None`.
#[derive(Serialize, Deserialize)]
struct RawResponse {
    jsonrpc: String,
    #[serde(default)]
    id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn present<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

impl TryFrom<RawResponse> for Response {
    type Error = String;

    fn try_from(raw: RawResponse) -> std::result::Result<Self, Self::Error> {
        let payload = match (raw.result, raw.error) {
            (Some(v), None) => Payload::Result(v),
            (None, Some(e)) => Payload::Error(e),
            (Some(_), Some(_)) => return Err("response has both result and error".into()),
            (None, None) => return Err("response has neither result nor error".into()),
        };
        Ok(Self {
            jsonrpc: raw.jsonrpc,
            id: raw.id,
            payload,
        })
    }
}

impl From<Response> for RawResponse {
    fn from(r: Response) -> Self {
        let (result, error) = match r.payload {
            Payload::Result(v) => (Some(v), None),
            Payload::Error(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: r.jsonrpc,
            id: r.id,
            result,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(Value::String(detail.into()))
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Anything the client can read off the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

impl Incoming {
    /// Messages with a `method` are notifications; everything else must be a response.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(line)?;
        if value.get("method").is_some() {
            Ok(Incoming::Notification(serde_json::from_value(value)?))
        } else {
            Ok(Incoming::Response(serde_json::from_value(value)?))
        }
    }
}

// ─── Request ids ────────────────────────────────────────────────

/// Hands out 1, 2, 3, ... and is safe to share between threads.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ─── Typed params and results ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
    pub version: String,
    pub uptime: String,
    pub start_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchStartParams {
    pub paths: Vec<String>,
    pub languages: Vec<String>,
    /// Values of 0 or below select the default window.
    pub debounce_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchStartResult {
    pub status: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchStopResult {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchStatusResult {
    pub watching: bool,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchEventParams {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WatchEventParams {
    pub fn update(changes: &ChangeSet) -> Self {
        Self {
            event_type: EVENT_UPDATE.to_string(),
            dirs: changes.affected_dirs(),
            targets: changes.as_targets(),
            added: changes.added.clone(),
            modified: changes.modified.clone(),
            deleted: changes.deleted.clone(),
            time: now_rfc3339(),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: EVENT_ERROR.to_string(),
            time: now_rfc3339(),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn shutdown() -> Self {
        Self {
            event_type: EVENT_SHUTDOWN.to_string(),
            time: now_rfc3339(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRunParams {
    pub languages: Vec<String>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRunResult {
    pub status: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub changes: ChangeSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusGetParams {
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusGetResult {
    pub stale: bool,
    pub has_baseline: bool,
    #[serde(flatten)]
    pub changes: ChangeSet,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `1h2m3s` style; sub-minute values keep one decimal (`4.2s`).
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_round_trip() {
        for id in [0, -7, i64::MAX, i64::MIN] {
            let req = Request::new(id, METHOD_WATCH_START, Some(json!({"paths": ["src"]})));
            let text = serde_json::to_string(&req).unwrap();
            let back: Request = serde_json::from_str(&text).unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn test_missing_or_null_id_is_notification() {
        let absent: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        let null: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(absent.is_notification());
        assert!(null.is_notification());

        let text = serde_json::to_string(&absent).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn test_missing_version_fails_version_check() {
        let req: Request = serde_json::from_str(r#"{"id":1,"method":"ping"}"#).unwrap();
        assert!(!req.has_valid_version());
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap();
        assert!(!req.has_valid_version());
    }

    #[test]
    fn test_response_null_result_is_kept() {
        let resp = Response::success(Some(3), Value::Null);
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":3,"result":null}"#);
        let back: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_error_response_with_null_id() {
        let resp = Response::failure(None, RpcError::parse_error("eof"));
        let text = serde_json::to_string(&resp).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["id"], Value::Null);
        assert_eq!(v["error"]["code"], PARSE_ERROR);
        assert!(v.get("result").is_none());

        let back: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_response_needs_exactly_one_payload() {
        let both = r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#;
        let neither = r#"{"jsonrpc":"2.0","id":1}"#;
        assert!(serde_json::from_str::<Response>(both).is_err());
        assert!(serde_json::from_str::<Response>(neither).is_err());
    }

    #[test]
    fn test_into_result_maps_rpc_error() {
        let resp = Response::failure(Some(1), RpcError::method_not_found("nope"));
        match resp.into_result().unwrap_err() {
            BazelleError::Rpc { code, message } => {
                assert_eq!(code, METHOD_NOT_FOUND);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_incoming_distinguishes_notifications() {
        let note = Notification::new(METHOD_WATCH_EVENT, &WatchEventParams::shutdown()).unwrap();
        let line = serde_json::to_vec(&note).unwrap();
        match Incoming::parse(&line).unwrap() {
            Incoming::Notification(n) => {
                let params: WatchEventParams = n.parse_params().unwrap();
                assert_eq!(params.event_type, EVENT_SHUTDOWN);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let resp = serde_json::to_vec(&Response::success(Some(9), json!({"ok": true}))).unwrap();
        assert!(matches!(Incoming::parse(&resp).unwrap(), Incoming::Response(r) if r.id == Some(9)));
    }

    #[test]
    fn test_parse_params_defaults_and_errors() {
        let req = Request::new(1, METHOD_WATCH_START, None);
        let params: WatchStartParams = req.parse_params().unwrap();
        assert_eq!(params, WatchStartParams::default());

        let bad = Request::new(1, METHOD_WATCH_START, Some(json!({"paths": 5})));
        let err = bad.parse_params::<WatchStartParams>().unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn test_status_result_is_flat() {
        let result = StatusGetResult {
            stale: true,
            has_baseline: true,
            changes: ChangeSet {
                added: vec!["a.go".into()],
                ..ChangeSet::default()
            },
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["added"], json!(["a.go"]));
        assert_eq!(v["stale"], json!(true));
    }

    #[test]
    fn test_id_generator_sequential() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_id_generator_unique_across_threads() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..500).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_millis(4200)), "4.2s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h2m3s");
    }
}
