// src/db.rs
// Encrypted-at-rest user directory backed by SQLite

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use crate::crypto::{CryptoError, CryptoManager};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("username already in use")]
    DuplicateUser,
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub username: String,
    pub public_key: String,
    pub sender_tag: String,
}

/// Closed set of writable columns. The column name in the UPDATE statement
/// comes from here, never from request data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    PublicKey,
    SenderTag,
}

impl UserField {
    fn column(self) -> &'static str {
        match self {
            UserField::PublicKey => "publicKey",
            UserField::SenderTag => "senderTag",
        }
    }
}

/// Single process-wide directory. `publicKey` and `senderTag` are stored
/// as AES-GCM ciphertext; `username` is the clear primary key. Because
/// every ciphertext carries a fresh salt, tag lookups go through an
/// in-memory plaintext-tag index that is rebuilt once at open.
pub struct Database {
    conn: Mutex<Connection>,
    crypto: Arc<CryptoManager>,
    tag_index: RwLock<HashMap<String, String>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, crypto: Arc<CryptoManager>) -> Result<Self, DbError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(CryptoError::Io)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Database {
            conn: Mutex::new(conn),
            crypto,
            tag_index: RwLock::new(HashMap::new()),
        };
        db.run_migrations()?;
        db.rebuild_tag_index()?;
        Ok(db)
    }

    pub fn open_in_memory(crypto: Arc<CryptoManager>) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Mutex::new(conn),
            crypto,
            tag_index: RwLock::new(HashMap::new()),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                publicKey BLOB NOT NULL,
                senderTag BLOB NOT NULL
            )",
            [],
        )?;

        // Reserved for group chat; no accessors yet.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS groups (
                groupID TEXT PRIMARY KEY,
                userList BLOB NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// One decrypt-scan over the table to recover plaintext tags for the
    /// lookup index. Runs once at open; after that the index is maintained
    /// incrementally.
    fn rebuild_tag_index(&self) -> Result<(), DbError> {
        let mut map = HashMap::new();
        {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT username, senderTag FROM users")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (username, enc_tag) = row?;
                let tag = decrypt_text(&self.crypto, &enc_tag)?;
                map.insert(tag, username);
            }
        }
        *self.tag_index.write().unwrap() = map;
        Ok(())
    }

    /// Atomic: a duplicate username fails before any side effect.
    pub fn add_user(
        &self,
        username: &str,
        public_key: &str,
        sender_tag: &str,
    ) -> Result<(), DbError> {
        let enc_key = self.crypto.encrypt_field(public_key.as_bytes())?;
        let enc_tag = self.crypto.encrypt_field(sender_tag.as_bytes())?;

        {
            let conn = self.conn.lock().unwrap();
            match conn.execute(
                "INSERT INTO users (username, publicKey, senderTag) VALUES (?1, ?2, ?3)",
                params![username, enc_key, enc_tag],
            ) {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(DbError::DuplicateUser);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.tag_index
            .write()
            .unwrap()
            .insert(sender_tag.to_string(), username.to_string());
        Ok(())
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT username, publicKey, senderTag FROM users WHERE username = ?1")?;
        let mut rows = stmt.query(params![username])?;

        match rows.next()? {
            Some(row) => {
                let username: String = row.get(0)?;
                let enc_key: Vec<u8> = row.get(1)?;
                let enc_tag: Vec<u8> = row.get(2)?;
                Ok(Some(UserRecord {
                    username,
                    public_key: decrypt_text(&self.crypto, &enc_key)?,
                    sender_tag: decrypt_text(&self.crypto, &enc_tag)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn get_user_by_sender_tag(&self, sender_tag: &str) -> Result<Option<UserRecord>, DbError> {
        let username = match self.tag_index.read().unwrap().get(sender_tag) {
            Some(name) => name.clone(),
            None => return Ok(None),
        };
        self.get_user_by_username(&username)
    }

    /// Update one of the writable columns. A sender-tag update also moves
    /// the index entry. Unknown usernames are a no-op, matching INSERTless
    /// UPDATE semantics.
    pub fn update_user_field(
        &self,
        username: &str,
        field: UserField,
        value: &str,
    ) -> Result<(), DbError> {
        let encrypted = self.crypto.encrypt_field(value.as_bytes())?;

        let changed = {
            let conn = self.conn.lock().unwrap();
            let sql = format!("UPDATE users SET {} = ?1 WHERE username = ?2", field.column());
            conn.execute(&sql, params![encrypted, username])?
        };

        if field == UserField::SenderTag && changed > 0 {
            let mut index = self.tag_index.write().unwrap();
            index.retain(|_, name| name != username);
            index.insert(value.to_string(), username.to_string());
        }
        Ok(())
    }

    pub fn user_count(&self) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn decrypt_text(crypto: &CryptoManager, data: &[u8]) -> Result<String, CryptoError> {
    String::from_utf8(crypto.decrypt_field(data)?).map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn test_db() -> Database {
        let dir = std::env::temp_dir()
            .join(format!("nym-directory-db-{:016x}", rand::random::<u64>()));
        let crypto =
            Arc::new(CryptoManager::new(dir, Secret::new("test password".to_string())).unwrap());
        Database::open_in_memory(crypto).unwrap()
    }

    #[test]
    fn add_and_get_round_trips() {
        let db = test_db();
        db.add_user("alice", "PEM-A", "tag-1").unwrap();

        let user = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.public_key, "PEM-A");
        assert_eq!(user.sender_tag, "tag-1");
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let db = test_db();
        db.add_user("alice", "PEM-A", "tag-1").unwrap();
        assert!(matches!(
            db.add_user("alice", "PEM-B", "tag-2"),
            Err(DbError::DuplicateUser)
        ));
        // Original row untouched.
        let user = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(user.public_key, "PEM-A");
        assert_eq!(db.user_count().unwrap(), 1);
    }

    #[test]
    fn missing_user_is_none() {
        let db = test_db();
        assert!(db.get_user_by_username("ghost").unwrap().is_none());
        assert!(db.get_user_by_sender_tag("no-such-tag").unwrap().is_none());
    }

    #[test]
    fn sender_tag_lookup_follows_rebinds() {
        let db = test_db();
        db.add_user("alice", "PEM-A", "tag-1").unwrap();

        let user = db.get_user_by_sender_tag("tag-1").unwrap().unwrap();
        assert_eq!(user.username, "alice");

        db.update_user_field("alice", UserField::SenderTag, "tag-2")
            .unwrap();
        assert!(db.get_user_by_sender_tag("tag-1").unwrap().is_none());
        let user = db.get_user_by_sender_tag("tag-2").unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.sender_tag, "tag-2");
    }

    #[test]
    fn stored_columns_never_contain_plaintext() {
        let db = test_db();
        db.add_user("alice", "PEM-PUBLIC-KEY-ALICE", "tag-alice-42")
            .unwrap();

        let conn = db.conn.lock().unwrap();
        let (enc_key, enc_tag): (Vec<u8>, Vec<u8>) = conn
            .query_row(
                "SELECT publicKey, senderTag FROM users WHERE username = 'alice'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        let contains = |haystack: &[u8], needle: &[u8]| {
            haystack.windows(needle.len()).any(|w| w == needle)
        };
        assert!(!contains(&enc_key, b"PEM-PUBLIC-KEY-ALICE"));
        assert!(!contains(&enc_tag, b"tag-alice-42"));
    }

    #[test]
    fn tag_index_rebuilds_from_disk() {
        let dir = std::env::temp_dir()
            .join(format!("nym-directory-db-{:016x}", rand::random::<u64>()));
        let db_path = dir.join("directory.db");
        let crypto = Arc::new(
            CryptoManager::new(dir.join("keys"), Secret::new("test password".to_string()))
                .unwrap(),
        );

        {
            let db = Database::open(&db_path, crypto.clone()).unwrap();
            db.add_user("alice", "PEM-A", "tag-1").unwrap();
            db.add_user("bob", "PEM-B", "tag-2").unwrap();
        }

        let db = Database::open(&db_path, crypto).unwrap();
        assert_eq!(
            db.get_user_by_sender_tag("tag-1").unwrap().unwrap().username,
            "alice"
        );
        assert_eq!(
            db.get_user_by_sender_tag("tag-2").unwrap().unwrap().username,
            "bob"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn update_unknown_user_is_a_noop() {
        let db = test_db();
        db.update_user_field("ghost", UserField::SenderTag, "tag-x")
            .unwrap();
        assert!(db.get_user_by_sender_tag("tag-x").unwrap().is_none());
    }

    #[test]
    fn public_key_update_round_trips() {
        let db = test_db();
        db.add_user("alice", "PEM-A", "tag-1").unwrap();
        db.update_user_field("alice", UserField::PublicKey, "PEM-A2")
            .unwrap();
        let user = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(user.public_key, "PEM-A2");
        assert_eq!(user.sender_tag, "tag-1");
    }
}
