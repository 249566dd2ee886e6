//! File-based credential storage

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::CredentialStore;
use crate::error::RsspError;
use crate::types::Credential;

/// One JSON file per credential, named after the hex-encoded owner and alias.
pub struct FileCredentialStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RsspError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| RsspError::StorageError(e.to_string()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn owner_prefix(owner: &str) -> String {
        format!("{}.", hex::encode(owner))
    }

    fn path(&self, owner: &str, alias: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}.json",
            Self::owner_prefix(owner),
            hex::encode(alias)
        ))
    }

    fn read(path: &std::path::Path) -> Result<Credential, RsspError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| RsspError::StorageError(e.to_string()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(path: &std::path::Path, credential: &Credential) -> Result<(), RsspError> {
        let contents = serde_json::to_string_pretty(credential)?;
        let mut file =
            std::fs::File::create(path).map_err(|e| RsspError::StorageError(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| RsspError::StorageError(e.to_string()))?;
        file.sync_all()
            .map_err(|e| RsspError::StorageError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn find(&self, owner: &str, alias: &str) -> Result<Option<Credential>, RsspError> {
        let path = self.path(owner, alias);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    async fn list(&self, owner: &str) -> Result<Vec<Credential>, RsspError> {
        let prefix = Self::owner_prefix(owner);
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| RsspError::StorageError(e.to_string()))?;

        let mut credentials = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RsspError::StorageError(e.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                credentials.push(Self::read(&entry.path())?);
            }
        }
        credentials.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(credentials)
    }

    async fn save(&self, credential: Credential) -> Result<(), RsspError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(&credential.owner, &credential.alias);
        if path.exists() {
            return Err(RsspError::CredentialAliasAlreadyExists(credential.alias));
        }
        Self::write(&path, &credential)
    }

    async fn set_enabled(&self, owner: &str, alias: &str, enabled: bool) -> Result<(), RsspError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(owner, alias);
        if !path.exists() {
            return Err(RsspError::CredentialNotFound);
        }
        let mut credential = Self::read(&path)?;
        credential.enabled = enabled;
        Self::write(&path, &credential)
    }

    async fn delete(&self, owner: &str, alias: &str) -> Result<(), RsspError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(owner, alias);
        if !path.exists() {
            return Err(RsspError::CredentialNotFound);
        }
        std::fs::remove_file(&path).map_err(|e| RsspError::StorageError(e.to_string()))
    }
}
