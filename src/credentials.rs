//! Credential Store
//!
//! Persists one salted SHA-256 password hash per user in a single JSON
//! table (`users.json`). The table is small, so every operation reads it
//! whole; registrations rewrite it whole through a temporary file and an
//! atomic rename, so a crash never leaves a half-written table behind.
//!
//! All access goes through one async mutex, which serializes concurrent
//! registrations from different sessions.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::protocol::validate_name;

/// Random salt length in bytes
pub const SALT_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("username and password must not be empty")]
    EmptyCredentials,

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("user {0:?} already exists")]
    UserExists(String),

    #[error("credential table IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt credential table: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("corrupt record for user {0:?}")]
    CorruptRecord(String),
}

/// Stored form of one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Hex-encoded salt
    pub salt: String,
    /// Hex-encoded SHA-256(salt || password)
    pub salted_hash: String,
}

/// Salted hash handed back on successful authentication
///
/// The client reuses it as its file-encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct UserSecret(Vec<u8>);

impl UserSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for UserSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for UserSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserSecret([REDACTED])")
    }
}

/// SHA-256 over `salt || password`
pub fn salted_hash(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

type Table = BTreeMap<String, UserRecord>;

/// Shared, file-backed user table
pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    /// Open the store backed by `path`. The file is created on first
    /// registration.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a user. Existing users are never overwritten.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        if username.is_empty() || password.is_empty() {
            return Err(CredentialError::EmptyCredentials);
        }
        validate_name(username).map_err(|e| CredentialError::InvalidUsername(e.to_string()))?;

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let hash = salted_hash(&salt, password);

        let _guard = self.lock.lock().await;

        let mut table = self.load().await?;
        if table.contains_key(username) {
            return Err(CredentialError::UserExists(username.to_string()));
        }

        table.insert(
            username.to_string(),
            UserRecord {
                salt: hex::encode(salt),
                salted_hash: hex::encode(hash),
            },
        );
        self.store(&table).await?;

        info!("👤 Registered user {}", username);
        Ok(())
    }

    /// Check a password. Returns the salted hash when it matches, `None`
    /// for unknown users and wrong passwords alike.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserSecret>, CredentialError> {
        let record = {
            let _guard = self.lock.lock().await;
            match self.load().await?.remove(username) {
                Some(record) => record,
                None => {
                    debug!("Authentication for unknown user {}", username);
                    return Ok(None);
                }
            }
        };

        let salt = hex::decode(&record.salt)
            .map_err(|_| CredentialError::CorruptRecord(username.to_string()))?;
        let stored = hex::decode(&record.salted_hash)
            .map_err(|_| CredentialError::CorruptRecord(username.to_string()))?;

        let candidate = salted_hash(&salt, password);
        if bool::from(candidate.ct_eq(&stored)) {
            Ok(Some(UserSecret(candidate)))
        } else {
            debug!("Wrong password for user {}", username);
            Ok(None)
        }
    }

    /// Read the whole table; a missing file is an empty table
    async fn load(&self) -> Result<Table, CredentialError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Table::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Table::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the table atomically
    async fn store(&self, table: &Table) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("users.json"))
    }

    #[tokio::test]
    async fn test_register_then_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.register("alice", "secret123").await.unwrap();

        let secret = store.authenticate("alice", "secret123").await.unwrap();
        let secret = secret.expect("correct password must authenticate");
        assert_eq!(secret.as_bytes().len(), 32);

        assert!(store.authenticate("alice", "wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secret_is_stable_across_logins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register("alice", "secret123").await.unwrap();

        let first = store.authenticate("alice", "secret123").await.unwrap().unwrap();
        let second = store.authenticate("alice", "secret123").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_user_and_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.authenticate("nobody", "pw").await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(matches!(
            store.register("", "pw").await,
            Err(CredentialError::EmptyCredentials)
        ));
        assert!(matches!(
            store.register("bob", "").await,
            Err(CredentialError::EmptyCredentials)
        ));

        store.register("bob", "first").await.unwrap();
        assert!(matches!(
            store.register("bob", "second").await,
            Err(CredentialError::UserExists(_))
        ));

        // The first password still works
        assert!(store.authenticate("bob", "first").await.unwrap().is_some());
        assert!(store.authenticate("bob", "second").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_path_like_usernames() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(matches!(
            store.register("../root", "pw").await,
            Err(CredentialError::InvalidUsername(_))
        ));
    }

    #[tokio::test]
    async fn test_table_never_stores_plain_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register("alice", "secret123").await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("alice"));
        assert!(!raw.contains("secret123"));

        let table: Table = serde_json::from_str(&raw).unwrap();
        assert_eq!(table["alice"].salt.len(), SALT_SIZE * 2);
    }

    #[tokio::test]
    async fn test_same_password_different_salt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register("bob", "hunter2").await.unwrap();
        store.register("carol", "hunter2").await.unwrap();

        let bob = store.authenticate("bob", "hunter2").await.unwrap().unwrap();
        let carol = store.authenticate("carol", "hunter2").await.unwrap().unwrap();
        assert_ne!(bob, carol);
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.register(&format!("user{}", i), "pw").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for i in 0..16 {
            let name = format!("user{}", i);
            assert!(store.authenticate(&name, "pw").await.unwrap().is_some());
        }
    }
}
