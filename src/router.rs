// src/router.rs
// Inbound action dispatch: authentication handshakes, discovery, relay

use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::crypto::{self, CryptoManager};
use crate::db::{Database, DbError, UserField};
use crate::notify::{self, NotifyBus, EVENTS_CHANNEL};
use crate::session::{ChallengeKind, SessionLedger};
use crate::wire::{
    Challenge, ChatContent, ClientRequest, Envelope, ForwardPayload, OutboundFrame, ReplyAction,
    ReplyContext, UserInfo,
};

/// Routes every frame the transport delivers. Owns the challenge ledger;
/// shares the directory and crypto with the rest of the process. Replies
/// leave through the outbound channel, which the transport drains in order.
pub struct MessageRouter {
    db: Arc<Database>,
    crypto: Arc<CryptoManager>,
    ledger: SessionLedger,
    outbound: mpsc::Sender<OutboundFrame>,
    notify: Option<Arc<NotifyBus>>,
    server_id: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl MessageRouter {
    pub fn new(
        db: Arc<Database>,
        crypto: Arc<CryptoManager>,
        outbound: mpsc::Sender<OutboundFrame>,
        notify: Option<Arc<NotifyBus>>,
        server_id: String,
    ) -> Self {
        MessageRouter {
            db,
            crypto,
            ledger: SessionLedger::new(),
            outbound,
            notify,
            server_id,
        }
    }

    /// Entry point for one `received` frame. Never panics out; protocol
    /// problems become `error: …` replies, everything else is logged and
    /// dropped.
    pub async fn handle_received(&self, message: &str, sender_tag: &str) {
        let request: ClientRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                error!("router: dropping undecodable message: {}", e);
                return;
            }
        };

        match request {
            ClientRequest::Register { usernym, public_key } => {
                self.handle_register(usernym, public_key, sender_tag).await
            }
            ClientRequest::RegistrationResponse { signature } => {
                self.handle_registration_response(signature, sender_tag).await
            }
            ClientRequest::Login { usernym } => self.handle_login(usernym, sender_tag).await,
            ClientRequest::LoginResponse { signature } => {
                self.handle_login_response(signature, sender_tag).await
            }
            ClientRequest::Query { username } => self.handle_query(username, sender_tag).await,
            ClientRequest::Send { content, signature } => {
                self.handle_send(content, signature, sender_tag).await
            }
        }
    }

    // ---- registration ----------------------------------------------------

    async fn handle_register(
        &self,
        usernym: Option<String>,
        public_key: Option<String>,
        sender_tag: &str,
    ) {
        let (username, public_key) = match (non_empty(usernym), non_empty(public_key)) {
            (Some(u), Some(k)) => (u, k),
            _ => {
                self.send_reply(
                    sender_tag,
                    "error: missing username or public key",
                    ReplyAction::ChallengeResponse,
                    ReplyContext::Registration,
                )
                .await;
                return;
            }
        };

        if !is_valid_username(&username) {
            self.send_reply(
                sender_tag,
                "error: invalid username format",
                ReplyAction::ChallengeResponse,
                ReplyContext::Registration,
            )
            .await;
            return;
        }

        match self.db.get_user_by_username(&username) {
            Ok(Some(_)) => {
                self.send_reply(
                    sender_tag,
                    "error: username already in use",
                    ReplyAction::ChallengeResponse,
                    ReplyContext::Registration,
                )
                .await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("router: directory lookup failed: {}", e);
                self.send_internal_error(sender_tag, ReplyContext::Registration).await;
                return;
            }
        }

        let nonce = crypto::generate_nonce();
        let challenge = match serde_json::to_string(&Challenge { nonce: nonce.clone() }) {
            Ok(json) => json,
            Err(e) => {
                error!("router: challenge serialization failed: {}", e);
                return;
            }
        };
        self.ledger
            .insert(ChallengeKind::Registration, sender_tag, username, public_key, nonce);

        info!("router: registration challenge issued");
        self.send_reply(
            sender_tag,
            challenge,
            ReplyAction::Challenge,
            ReplyContext::Registration,
        )
        .await;
    }

    async fn handle_registration_response(&self, signature: Option<String>, sender_tag: &str) {
        let Some(pending) = self.ledger.take(ChallengeKind::Registration, sender_tag) else {
            warn!("router: registration response without a pending challenge");
            self.send_reply(
                sender_tag,
                "error: no pending registration for sender",
                ReplyAction::ChallengeResponse,
                ReplyContext::Registration,
            )
            .await;
            return;
        };

        let verified = signature
            .as_deref()
            .map(|sig| CryptoManager::verify(&pending.public_key, pending.nonce.as_bytes(), sig))
            .unwrap_or(false);

        if !verified {
            // One-shot challenge: `take` already consumed it.
            warn!("router: registration signature check failed");
            self.send_reply(
                sender_tag,
                "error: signature verification failed",
                ReplyAction::ChallengeResponse,
                ReplyContext::Registration,
            )
            .await;
            return;
        }

        match self.db.add_user(&pending.username, &pending.public_key, sender_tag) {
            Ok(()) => {
                info!("router: registered '{}'", pending.username);
                self.send_reply(
                    sender_tag,
                    "success",
                    ReplyAction::ChallengeResponse,
                    ReplyContext::Registration,
                )
                .await;
                if let Some(bus) = &self.notify {
                    bus.set_presence(&pending.username, true).await;
                    bus.publish(EVENTS_CHANNEL, notify::event("userRegistered", &pending.username))
                        .await;
                }
            }
            Err(DbError::DuplicateUser) => {
                self.send_reply(
                    sender_tag,
                    "error: username already in use",
                    ReplyAction::ChallengeResponse,
                    ReplyContext::Registration,
                )
                .await;
            }
            Err(e) => {
                error!("router: user insert failed: {}", e);
                self.send_internal_error(sender_tag, ReplyContext::Registration).await;
            }
        }
    }

    // ---- login -----------------------------------------------------------

    async fn handle_login(&self, usernym: Option<String>, sender_tag: &str) {
        let Some(username) = non_empty(usernym) else {
            self.send_reply(
                sender_tag,
                "error: missing username",
                ReplyAction::ChallengeResponse,
                ReplyContext::Login,
            )
            .await;
            return;
        };

        let record = match self.db.get_user_by_username(&username) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.send_reply(
                    sender_tag,
                    "error: user not found",
                    ReplyAction::ChallengeResponse,
                    ReplyContext::Login,
                )
                .await;
                return;
            }
            Err(e) => {
                error!("router: directory lookup failed: {}", e);
                self.send_internal_error(sender_tag, ReplyContext::Login).await;
                return;
            }
        };

        let nonce = crypto::generate_nonce();
        let challenge = match serde_json::to_string(&Challenge { nonce: nonce.clone() }) {
            Ok(json) => json,
            Err(e) => {
                error!("router: challenge serialization failed: {}", e);
                return;
            }
        };
        self.ledger
            .insert(ChallengeKind::Login, sender_tag, username, record.public_key, nonce);

        info!("router: login challenge issued");
        self.send_reply(sender_tag, challenge, ReplyAction::Challenge, ReplyContext::Login)
            .await;
    }

    async fn handle_login_response(&self, signature: Option<String>, sender_tag: &str) {
        let Some(pending) = self.ledger.take(ChallengeKind::Login, sender_tag) else {
            warn!("router: login response without a pending challenge");
            self.send_reply(
                sender_tag,
                "error: no pending login for sender",
                ReplyAction::ChallengeResponse,
                ReplyContext::Login,
            )
            .await;
            return;
        };

        let verified = signature
            .as_deref()
            .map(|sig| CryptoManager::verify(&pending.public_key, pending.nonce.as_bytes(), sig))
            .unwrap_or(false);

        if !verified {
            warn!("router: login signature check failed");
            self.send_reply(
                sender_tag,
                "error: invalid signature",
                ReplyAction::ChallengeResponse,
                ReplyContext::Login,
            )
            .await;
            return;
        }

        // The signed login is proof that whoever owns the username's key is
        // now reachable here; move the return path if it changed.
        match self.db.get_user_by_username(&pending.username) {
            Ok(Some(record)) if record.sender_tag != sender_tag => {
                if let Err(e) =
                    self.db
                        .update_user_field(&pending.username, UserField::SenderTag, sender_tag)
                {
                    error!("router: sender tag rebind for '{}' failed: {}", pending.username, e);
                }
            }
            Ok(_) => {}
            Err(e) => error!("router: directory lookup failed: {}", e),
        }

        info!("router: '{}' logged in", pending.username);
        self.send_reply(
            sender_tag,
            "success",
            ReplyAction::ChallengeResponse,
            ReplyContext::Login,
        )
        .await;

        if let Some(bus) = &self.notify {
            bus.set_presence(&pending.username, true).await;
            bus.publish(EVENTS_CHANNEL, notify::event("userLogin", &pending.username))
                .await;
        }
    }

    // ---- discovery ---------------------------------------------------------

    async fn handle_query(&self, username: Option<String>, sender_tag: &str) {
        let Some(username) = non_empty(username) else {
            self.send_reply(
                sender_tag,
                "error: missing 'username' field",
                ReplyAction::QueryResponse,
                ReplyContext::Query,
            )
            .await;
            return;
        };

        match self.db.get_user_by_username(&username) {
            Ok(Some(record)) => {
                // Username and public key are public by design. The sender
                // tag never leaves the directory.
                let info = UserInfo {
                    username: record.username,
                    public_key: record.public_key,
                };
                match serde_json::to_string(&info) {
                    Ok(json) => {
                        self.send_reply(
                            sender_tag,
                            json,
                            ReplyAction::QueryResponse,
                            ReplyContext::Query,
                        )
                        .await;
                    }
                    Err(e) => {
                        error!("router: query serialization failed: {}", e);
                        self.send_internal_error(sender_tag, ReplyContext::Query).await;
                    }
                }
            }
            Ok(None) => {
                self.send_reply(
                    sender_tag,
                    "No user found",
                    ReplyAction::QueryResponse,
                    ReplyContext::Query,
                )
                .await;
            }
            Err(e) => {
                error!("router: directory lookup failed: {}", e);
                self.send_internal_error(sender_tag, ReplyContext::Query).await;
            }
        }
    }

    // ---- relay -------------------------------------------------------------

    async fn handle_send(&self, content: Option<String>, signature: Option<String>, sender_tag: &str) {
        let (content, signature) = match (non_empty(content), non_empty(signature)) {
            (Some(c), Some(s)) => (c, s),
            _ => {
                warn!("router: send without content or signature");
                self.send_reply(
                    sender_tag,
                    "error: missing 'content' or 'signature'",
                    ReplyAction::SendResponse,
                    ReplyContext::Chat,
                )
                .await;
                return;
            }
        };

        let chat: ChatContent = match serde_json::from_str(&content) {
            Ok(chat) => chat,
            Err(_) => {
                warn!("router: send content is not valid JSON");
                self.send_reply(
                    sender_tag,
                    "error: invalid JSON in content",
                    ReplyAction::SendResponse,
                    ReplyContext::Chat,
                )
                .await;
                return;
            }
        };

        let (sender, recipient) = match (non_empty(chat.sender), non_empty(chat.recipient)) {
            (Some(s), Some(r)) => (s, r),
            _ => {
                self.send_reply(
                    sender_tag,
                    "error: missing 'sender' or 'recipient' field",
                    ReplyAction::SendResponse,
                    ReplyContext::Chat,
                )
                .await;
                return;
            }
        };

        let sender_record = match self.db.get_user_by_username(&sender) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("router: send from unregistered username");
                self.send_reply(
                    sender_tag,
                    "error: unrecognized sender username",
                    ReplyAction::SendResponse,
                    ReplyContext::Chat,
                )
                .await;
                return;
            }
            Err(e) => {
                error!("router: directory lookup failed: {}", e);
                self.send_internal_error_chat(sender_tag).await;
                return;
            }
        };

        // The signature covers the content string byte-for-byte as received.
        if !CryptoManager::verify(&sender_record.public_key, content.as_bytes(), &signature) {
            warn!("router: send signature check failed for '{}'", sender);
            self.send_reply(
                sender_tag,
                "error: invalid signature",
                ReplyAction::SendResponse,
                ReplyContext::Chat,
            )
            .await;
            return;
        }

        // A valid signature by the claimed sender is sufficient authority
        // to move the stored return path.
        if sender_record.sender_tag != sender_tag {
            if let Err(e) = self.db.update_user_field(&sender, UserField::SenderTag, sender_tag) {
                error!("router: sender tag rebind for '{}' failed: {}", sender, e);
            }
        }

        let recipient_record = match self.db.get_user_by_username(&recipient) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.send_reply(
                    sender_tag,
                    "error: recipient not found",
                    ReplyAction::SendResponse,
                    ReplyContext::Chat,
                )
                .await;
                return;
            }
            Err(e) => {
                error!("router: directory lookup failed: {}", e);
                self.send_internal_error_chat(sender_tag).await;
                return;
            }
        };

        let payload = ForwardPayload {
            sender: sender.clone(),
            body: chat.body,
            sender_public_key: chat.sender_public_key,
        };
        let payload_json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                error!("router: forward serialization failed: {}", e);
                self.send_internal_error_chat(sender_tag).await;
                return;
            }
        };

        // At-most-once: hand the forward to the transport and confirm. If
        // the recipient's return path is stale, recovery is the mixnet's
        // problem, not ours.
        self.send_reply(
            &recipient_record.sender_tag,
            payload_json,
            ReplyAction::IncomingMessage,
            ReplyContext::Chat,
        )
        .await;
        self.send_reply(sender_tag, "success", ReplyAction::SendResponse, ReplyContext::Chat)
            .await;

        info!("router: relayed message from '{}' to '{}'", sender, recipient);
        if let Some(bus) = &self.notify {
            bus.set_presence(&sender, true).await;
            bus.publish(EVENTS_CHANNEL, notify::event("messageDelivered", &recipient))
                .await;
        }
    }

    // ---- replies -----------------------------------------------------------

    async fn send_internal_error(&self, sender_tag: &str, context: ReplyContext) {
        let action = match context {
            ReplyContext::Query => ReplyAction::QueryResponse,
            ReplyContext::Chat => ReplyAction::SendResponse,
            _ => ReplyAction::ChallengeResponse,
        };
        self.send_reply(sender_tag, "error: internal", action, context).await;
    }

    async fn send_internal_error_chat(&self, sender_tag: &str) {
        self.send_internal_error(sender_tag, ReplyContext::Chat).await;
    }

    /// Wrap `content` in the signed inner envelope and queue the outer
    /// reply frame for the transport.
    async fn send_reply(
        &self,
        recipient_tag: &str,
        content: impl Into<String>,
        action: ReplyAction,
        context: ReplyContext,
    ) {
        let content = content.into();
        let signature = match self.crypto.sign(&self.server_id, content.as_bytes()) {
            Ok(signature) => signature,
            Err(e) => {
                error!("router: failed to sign reply: {}", e);
                return;
            }
        };

        let envelope = Envelope {
            action: action.as_str().to_string(),
            content,
            context: context.as_str().to_string(),
            signature,
        };
        let message = match serde_json::to_string(&envelope) {
            Ok(message) => message,
            Err(e) => {
                error!("router: envelope serialization failed: {}", e);
                return;
            }
        };

        let frame = OutboundFrame::Reply {
            message,
            sender_tag: recipient_tag.to_string(),
        };
        if self.outbound.send(frame).await.is_err() {
            warn!("router: outbound channel closed, reply dropped");
        }
    }
}
