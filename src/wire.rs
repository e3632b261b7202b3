// src/wire.rs
// Frame and envelope grammar for the mixnet websocket link

use serde::{Deserialize, Serialize};

/// Frames written to the nym client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    /// Ask the client for our own mix address.
    SelfAddress,
    /// Reply down a previously observed return path.
    #[serde(rename_all = "camelCase")]
    Reply { message: String, sender_tag: String },
}

/// Frames the nym client delivers. Anything else is logged and dropped at
/// the transport.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Received { message: String, sender_tag: String },
    SelfAddress { address: String },
    Error { message: String },
}

/// Inner client request, parsed once at the router boundary. Fields are
/// optional so a missing one surfaces as the protocol's `error: missing …`
/// string instead of a parse reject.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Register {
        usernym: Option<String>,
        public_key: Option<String>,
    },
    RegistrationResponse {
        signature: Option<String>,
    },
    Login {
        usernym: Option<String>,
    },
    LoginResponse {
        signature: Option<String>,
    },
    Query {
        username: Option<String>,
    },
    Send {
        content: Option<String>,
        signature: Option<String>,
    },
}

/// Server reply actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Challenge,
    ChallengeResponse,
    QueryResponse,
    SendResponse,
    IncomingMessage,
}

impl ReplyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyAction::Challenge => "challenge",
            ReplyAction::ChallengeResponse => "challengeResponse",
            ReplyAction::QueryResponse => "queryResponse",
            ReplyAction::SendResponse => "sendResponse",
            ReplyAction::IncomingMessage => "incomingMessage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyContext {
    Registration,
    Login,
    Query,
    Chat,
}

impl ReplyContext {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyContext::Registration => "registration",
            ReplyContext::Login => "login",
            ReplyContext::Query => "query",
            ReplyContext::Chat => "chat",
        }
    }
}

/// The signed inner reply. `signature` covers the UTF-8 bytes of `content`
/// exactly as serialized here, so clients verify the string they read, not
/// the surrounding JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    pub content: String,
    pub context: String,
    pub signature: String,
}

/// Body of a `send` request's `content` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContent {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub body: Option<serde_json::Value>,
    pub sender_public_key: Option<String>,
}

/// What the recipient sees. The relay strips routing metadata; the sender
/// key rides along only when the sender included it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload {
    pub sender: String,
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
}

/// Challenge content: `{"nonce": <hex>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
}

/// Query hit: username and public key, nothing else. Reachability metadata
/// never leaves the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub public_key: String,
}
