use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum identity length for validation
pub const MAX_IDENTITY_LENGTH: usize = 64;

/// Maximum display name length for validation
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;

/// Characters allowed in identity strings besides ASCII alphanumerics
const IDENTITY_EXTRA_CHARS: &[char] = &['-', '_', '.', ':'];

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

/// Outcome reported by the client for a single probe challenge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Content was served from the client's cache
    Hit,
    /// Content was not cached (the fetch failed)
    Miss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    /// Tracker counters (sessions, identities, fingerprints)
    Status,
    /// A client identity connected; starts the detection round
    SessionStart { identity: String, display_name: String },
    /// A client identity disconnected; discards any incomplete session
    SessionEnd { identity: String },
    /// A probe challenge resolved on the client
    ProbeResult { identity: String, probe_id: u32, outcome: ProbeStatus },
    /// Accounts sharing a recorded fingerprint with `identity`
    GetAlts { identity: String },
    /// Smallest identifier among `identity` and its alts
    GetCanonical { identity: String },
    /// Identities whose last known display name matches `name`
    FindByName { name: String },
}

impl Request {
    /// Validate request parameters before dispatch
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping | Request::Version | Request::Status => Ok(()),

            Request::SessionStart { identity, display_name } => {
                validate_identity(identity)?;
                validate_display_name(display_name)?;
                Ok(())
            }

            // Probe ids are range-checked by the tracker, which ignores
            // out-of-range ids instead of rejecting them.
            Request::SessionEnd { identity }
            | Request::ProbeResult { identity, .. }
            | Request::GetAlts { identity }
            | Request::GetCanonical { identity } => validate_identity(identity),

            Request::FindByName { name } => validate_display_name(name),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::Status => "Status",
            Request::SessionStart { .. } => "SessionStart",
            Request::SessionEnd { .. } => "SessionEnd",
            Request::ProbeResult { .. } => "ProbeResult",
            Request::GetAlts { .. } => "GetAlts",
            Request::GetCanonical { .. } => "GetCanonical",
            Request::FindByName { .. } => "FindByName",
        }
    }

    /// Whether this request comes from the transport bridge (as opposed to an admin query)
    pub fn is_transport_event(&self) -> bool {
        matches!(
            self,
            Request::SessionStart { .. } | Request::SessionEnd { .. } | Request::ProbeResult { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data - each request fills in only the field it needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alts: Option<Vec<AltInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker: Option<TrackerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeAck>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn alt_list(a: Vec<AltInfo>) -> Self { Self { alts: Some(a), ..Self::default() } }
    pub fn canonical(c: String) -> Self { Self { canonical: Some(c), ..Self::default() } }
    pub fn identity_list(i: Vec<String>) -> Self { Self { identities: Some(i), ..Self::default() } }
    pub fn status(s: TrackerStatus) -> Self { Self { tracker: Some(s), ..Self::default() } }
    pub fn probe_ack(p: ProbeAck) -> Self { Self { probe: Some(p), ..Self::default() } }
}

/// One correlated account as reported to admins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltInfo {
    pub identity: String,
    pub display_name: String,
    /// Milliseconds since the Unix epoch
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub version: String,
    pub probe_count: usize,
    pub active_sessions: usize,
    pub identities: usize,
    pub fingerprints: usize,
}

/// Where a session stands after a probe result was applied
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    /// No active session or a duplicate/out-of-range probe
    Ignored,
    /// Waiting for more results
    Pending,
    /// Detection found an existing fingerprint
    Returning,
    /// Unseen device; a marking round was issued
    Marked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAck {
    pub state: ProbeState,
    pub resolved: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u64>,
}

/// A probe challenge pushed to the transport bridge
///
/// The bridge forwards it to the client as a content download request. A
/// challenge for probe `probe_id` always carries the same `probe_uuid` and
/// `hash`; only `url` and `force_refetch` differ between rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMessage {
    pub identity: String,
    pub probe_id: u32,
    pub probe_uuid: String,
    pub url: String,
    pub hash: String,
    pub force_refetch: bool,
}

/// Anything the daemon writes to a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response(ResponseEnvelope),
    Challenge(ChallengeMessage),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s.into()))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }
}

pub fn validate_identity(identity: &str) -> Result<(), String> {
    if identity.is_empty() {
        return Err("Identity cannot be empty".into());
    }

    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err(format!(
            "Identity too long: {} > {} chars",
            identity.len(),
            MAX_IDENTITY_LENGTH
        ));
    }

    for c in identity.chars() {
        if !c.is_ascii_alphanumeric() && !IDENTITY_EXTRA_CHARS.contains(&c) {
            return Err(format!("Identity contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

pub fn validate_display_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Display name cannot be empty".into());
    }

    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(format!(
            "Display name too long (maximum {} chars)",
            MAX_DISPLAY_NAME_LENGTH
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err("Display name contains control characters".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let envelope = RequestEnvelope::with_id(
            Request::ProbeResult {
                identity: "a1b2".into(),
                probe_id: 3,
                outcome: ProbeStatus::Hit,
            },
            42,
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["cmd"], "ProbeResult");
        assert_eq!(json["data"]["probe_id"], 3);
        assert_eq!(json["data"]["outcome"], "hit");
    }

    #[test]
    fn test_parse_bridge_session_start() {
        let line = r#"{"id":7,"cmd":"SessionStart","data":{"identity":"069a79f4-44e9-4726-a5be-fca90e38aaf5","display_name":"Notch"}}"#;
        let envelope: RequestEnvelope = serde_json::from_str(line).unwrap();
        assert_eq!(envelope.id, 7);
        assert!(envelope.request.validate().is_ok());
        assert!(envelope.request.is_transport_event());
        match envelope.request {
            Request::SessionStart { display_name, .. } => assert_eq!(display_name, "Notch"),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_unit_request_without_data() {
        let envelope: RequestEnvelope = serde_json::from_str(r#"{"id":1,"cmd":"Ping"}"#).unwrap();
        assert!(matches!(envelope.request, Request::Ping));
        assert!(!envelope.request.is_transport_event());
    }

    #[test]
    fn test_outbound_tagging() {
        let challenge = Outbound::Challenge(ChallengeMessage {
            identity: "p1".into(),
            probe_id: 0,
            probe_uuid: "u0".into(),
            url: "http://127.0.0.1:0".into(),
            hash: "abc".into(),
            force_refetch: false,
        });
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["type"], "challenge");
        assert_eq!(json["force_refetch"], false);

        let response = Outbound::Response(ResponseEnvelope::new(9, Response::ok_string("pong")));
        let text = serde_json::to_string(&response).unwrap();
        let back: Outbound = serde_json::from_str(&text).unwrap();
        match back {
            Outbound::Response(env) => {
                assert_eq!(env.id, 9);
                match env.response {
                    Response::Ok(data) => assert_eq!(data.value.as_deref(), Some("pong")),
                    Response::Error { message } => panic!("unexpected error {}", message),
                }
            }
            Outbound::Challenge(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let json = serde_json::to_value(ResponseEnvelope::new(3, Response::error("nope"))).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "nope");
    }

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("069a79f4-44e9-4726-a5be-fca90e38aaf5").is_ok());
        assert!(validate_identity("steam:7656119").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("a b").is_err());
        assert!(validate_identity("../etc").is_err());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Steve").is_ok());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name("bad\nname").is_err());
        assert!(validate_display_name(&"n".repeat(MAX_DISPLAY_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_find_by_name_validation() {
        assert!(Request::FindByName { name: "Alex".into() }.validate().is_ok());
        assert!(Request::FindByName { name: String::new() }.validate().is_err());
    }
}
