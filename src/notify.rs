// src/notify.rs
// Optional presence / notification bus over Redis pub-sub

use log::{info, warn};
use redis::AsyncCommands;
use tokio::sync::Mutex;

/// Channel the server publishes lifecycle events on.
pub const EVENTS_CHANNEL: &str = "system_events";

/// Presence keys expire on their own if the user goes quiet.
const PRESENCE_TTL_SECS: usize = 300;

/// Best-effort bus. Every failure degrades to a warning; protocol replies
/// never depend on it.
pub struct NotifyBus {
    conn: Mutex<redis::aio::Connection>,
}

impl NotifyBus {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        info!("notify: connected to redis at {}", url);
        Ok(NotifyBus {
            conn: Mutex::new(conn),
        })
    }

    pub async fn publish(&self, channel: &str, payload: serde_json::Value) {
        let message = payload.to_string();
        let mut conn = self.conn.lock().await;
        if let Err(e) = conn.publish::<_, _, ()>(channel, message).await {
            warn!("notify: publish to '{}' failed: {}", channel, e);
        }
    }

    pub async fn set_presence(&self, username: &str, online: bool) {
        let key = format!("presence:{}", username);
        let mut conn = self.conn.lock().await;
        let result = if online {
            conn.set_ex::<_, _, ()>(key, "online", PRESENCE_TTL_SECS).await
        } else {
            conn.del::<_, ()>(key).await
        };
        if let Err(e) = result {
            warn!("notify: presence update for '{}' failed: {}", username, e);
        }
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut conn = self.conn.lock().await;
        match conn.keys::<_, Vec<String>>("presence:*").await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|key| key.split_once(':').map(|(_, name)| name.to_string()))
                .collect(),
            Err(e) => {
                warn!("notify: presence scan failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Event payload for `EVENTS_CHANNEL`.
pub fn event(kind: &str, username: &str) -> serde_json::Value {
    serde_json::json!({
        "event": kind,
        "username": username,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}
