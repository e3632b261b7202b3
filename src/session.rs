// src/session.rs
// In-memory challenge ledger for the registration and login handshakes

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Challenges left unanswered this long are treated as never issued.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Registration,
    Login,
}

#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub username: String,
    pub public_key: String,
    pub nonce: String,
    issued_at: Instant,
}

/// Pending challenges keyed by the sender tag that triggered them. Purely
/// in-process: a restart forgets every half-finished handshake, which is
/// what keeps half-registered users out of the directory.
pub struct SessionLedger {
    registrations: Mutex<HashMap<String, PendingChallenge>>,
    logins: Mutex<HashMap<String, PendingChallenge>>,
}

impl SessionLedger {
    pub fn new() -> Self {
        SessionLedger {
            registrations: Mutex::new(HashMap::new()),
            logins: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self, kind: ChallengeKind) -> &Mutex<HashMap<String, PendingChallenge>> {
        match kind {
            ChallengeKind::Registration => &self.registrations,
            ChallengeKind::Login => &self.logins,
        }
    }

    /// A second challenge from the same tag replaces the outstanding one.
    pub fn insert(
        &self,
        kind: ChallengeKind,
        sender_tag: &str,
        username: String,
        public_key: String,
        nonce: String,
    ) {
        self.map(kind).lock().unwrap().insert(
            sender_tag.to_string(),
            PendingChallenge {
                username,
                public_key,
                nonce,
                issued_at: Instant::now(),
            },
        );
    }

    /// Consuming read: the challenge is single-use whatever the outcome.
    pub fn take(&self, kind: ChallengeKind, sender_tag: &str) -> Option<PendingChallenge> {
        self.take_with_ttl(kind, sender_tag, CHALLENGE_TTL)
    }

    fn take_with_ttl(
        &self,
        kind: ChallengeKind,
        sender_tag: &str,
        ttl: Duration,
    ) -> Option<PendingChallenge> {
        let entry = self.map(kind).lock().unwrap().remove(sender_tag)?;
        if entry.issued_at.elapsed() > ttl {
            return None;
        }
        Some(entry)
    }

    pub fn discard(&self, kind: ChallengeKind, sender_tag: &str) {
        self.map(kind).lock().unwrap().remove(sender_tag);
    }
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new()
    }
}
