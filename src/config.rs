// src/config.rs
// Environment-driven configuration and the operator secret

use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Operator password. Never printed, zeroized on drop; the raw bytes are
/// only reachable through `expose()`.
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: String) -> Self {
        Secret(Zeroizing::new(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Deployment configuration. Everything comes from the environment; the
/// defaults match a local single-node setup.
#[derive(Debug, Clone)]
pub struct Config {
    pub websocket_url: String,
    pub client_id: String,
    pub database_path: PathBuf,
    pub keys_dir: PathBuf,
    pub shared_dir: PathBuf,
    pub secret_path: PathBuf,
    pub redis_url: Option<String>,
    pub client_binary: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let host = env_or("NYM_CLIENT_HOST", "127.0.0.1");
        let port = env_or("NYM_CLIENT_PORT", "1977");
        let websocket_url = env::var("WEBSOCKET_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("ws://{}:{}", host, port));

        Config {
            websocket_url,
            client_id: env_or("NYM_CLIENT_ID", "nym-directory"),
            database_path: PathBuf::from(env_or("DATABASE_PATH", "storage/nym_server.db")),
            keys_dir: PathBuf::from(env_or("KEYS_DIR", "storage/keys")),
            shared_dir: PathBuf::from(env_or("SHARED_DIR", "storage/shared")),
            secret_path: PathBuf::from(env_or("SECRET_PATH", "storage/secret")),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            client_binary: PathBuf::from(env_or("NYM_CLIENT_BINARY", "./nym-client")),
        }
    }

    /// Where the transport publishes the server's mix address.
    pub fn address_file(&self) -> PathBuf {
        self.shared_dir.join("nym_address.txt")
    }

    /// Read the operator password: first line of `SECRET_PATH`, trimmed.
    /// A missing or empty secret is a startup abort, not a recoverable error.
    pub fn read_password(&self) -> Result<Secret, String> {
        let raw = fs::read_to_string(&self.secret_path)
            .map_err(|e| format!("cannot read secret at {}: {}", self.secret_path.display(), e))?;
        let password = raw.lines().next().unwrap_or("").trim().to_string();
        if password.is_empty() {
            return Err(format!("secret file {} is empty", self.secret_path.display()));
        }
        Ok(Secret::new(password))
    }
}
