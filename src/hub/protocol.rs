use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on one signaling frame; anything larger is answered with
/// an error before parsing.
pub const MAX_FRAME_BYTES: usize = 65536;

/// Frames a browser peer may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Register {
        username: String,
    },
    CallRequest {
        to: String,
        #[serde(default)]
        sdp: Option<Value>,
        #[serde(default)]
        data: Option<Value>,
    },
    CallResponse {
        #[serde(default)]
        to: Option<String>,
        accepted: bool,
        #[serde(default, rename = "call-id")]
        call_id: Option<String>,
    },
    Offer {
        to: String,
        data: Value,
    },
    Answer {
        #[serde(default)]
        to: Option<String>,
        data: Value,
    },
    IceCandidate {
        to: String,
        data: Value,
    },
    #[serde(alias = "hangup")]
    HangUp {
        #[serde(default, rename = "call-id")]
        call_id: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    Reject {
        #[serde(default, rename = "call-id")]
        call_id: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
}

/// Frames the hub sends to browser peers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Connected,
    Registered {
        username: String,
    },
    UserList {
        users: Vec<String>,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    IncomingCall {
        from: String,
        #[serde(rename = "call-id")]
        call_id: String,
        sdp: String,
    },
    CallRinging {
        #[serde(rename = "call-id")]
        call_id: String,
    },
    CallAnswered {
        #[serde(rename = "call-id")]
        call_id: String,
        sdp: String,
    },
    CallFailed {
        #[serde(rename = "call-id")]
        call_id: String,
        reason: String,
    },
    CallEnded {
        #[serde(rename = "call-id")]
        call_id: String,
        reason: String,
    },
    CallRejected {
        from: String,
    },
    MediaRenegotiation {
        #[serde(rename = "call-id")]
        call_id: String,
        sdp: String,
    },
    Dtmf {
        #[serde(rename = "call-id")]
        call_id: String,
        digit: char,
        duration: u32,
    },
    Error {
        message: String,
    },
}

/// Registered names are 3 to 32 word characters.
pub fn valid_username(name: &str) -> bool {
    (3..=32).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
