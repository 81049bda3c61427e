//! Per-user storage area
//!
//! Every user owns one directory under the storage root. File contents are
//! opaque to the server: uploads arrive already encrypted by the client and
//! are stored and returned byte for byte.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::protocol::{validate_name, ProtocolError};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    InvalidName(#[from] ProtocolError),

    #[error("storage IO error: {0}")]
    Io(#[from] io::Error),
}

/// Root directory holding one sub-directory per user
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Storage area of one (already authenticated) user
    pub fn user_area(&self, username: &str) -> Result<UserArea, StorageError> {
        let username = validate_name(username)?;
        Ok(UserArea {
            dir: self.root.join(username),
        })
    }
}

/// One user's directory
#[derive(Debug, Clone)]
pub struct UserArea {
    dir: PathBuf,
}

impl UserArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.dir.join(validate_name(name)?))
    }

    /// Create the directory if this is the user's first command
    pub async fn ensure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Store `data` under `name`, replacing any previous content
    pub async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.file_path(name)?;
        self.ensure().await?;
        fs::write(&path, data).await?;
        debug!("Stored {} bytes at {:?}", data.len(), path);
        Ok(())
    }

    /// Read `name`; `Ok(None)` when no such file exists
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.file_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `name`. Returns whether a file was actually removed; a
    /// missing file is not an error.
    pub async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.file_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Sorted names of the regular files in the area
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(dir: &tempfile::TempDir) -> UserArea {
        StorageRoot::new(dir.path()).user_area("alice").unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let area = area(&dir);

        area.put("notes.txt", b"\x00\x01opaque").await.unwrap();
        assert_eq!(
            area.get("notes.txt").await.unwrap().as_deref(),
            Some(&b"\x00\x01opaque"[..])
        );
        assert!(dir.path().join("alice").join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(area(&dir).get("never.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let area = area(&dir);
        area.put("keep.txt", b"k").await.unwrap();

        assert!(!area.delete("ghost.txt").await.unwrap());
        assert_eq!(area.list().await.unwrap(), vec!["keep.txt".to_string()]);

        assert!(area.delete("keep.txt").await.unwrap());
        assert!(area.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted_and_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let area = area(&dir);
        assert!(area.list().await.unwrap().is_empty());

        area.put("b.txt", b"").await.unwrap();
        area.put("a.txt", b"").await.unwrap();
        std::fs::create_dir(area.path().join("subdir")).unwrap();

        assert_eq!(area.list().await.unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let area = area(&dir);

        assert!(matches!(
            area.put("../escape.txt", b"x").await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(StorageRoot::new(dir.path()).user_area("..").is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }
}
