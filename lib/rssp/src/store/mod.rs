//! Credential storage
//!
//! The signing pipeline only needs lookup by `(owner, alias)`, listing an
//! owner's credentials, and save. Everything else about persistence is up
//! to the implementation.

mod file;

pub use file::FileCredentialStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RsspError;
use crate::types::Credential;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find(&self, owner: &str, alias: &str) -> Result<Option<Credential>, RsspError>;

    /// All credentials of `owner`, ordered by alias.
    async fn list(&self, owner: &str) -> Result<Vec<Credential>, RsspError>;

    /// Store a new credential. Fails if `(owner, alias)` is taken.
    async fn save(&self, credential: Credential) -> Result<(), RsspError>;

    async fn set_enabled(&self, owner: &str, alias: &str, enabled: bool)
    -> Result<(), RsspError>;

    async fn delete(&self, owner: &str, alias: &str) -> Result<(), RsspError>;
}

/// In-memory credential store for tests and development
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<(String, String), Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(owner: &str, alias: &str) -> (String, String) {
    (owner.to_string(), alias.to_string())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(&self, owner: &str, alias: &str) -> Result<Option<Credential>, RsspError> {
        Ok(self.credentials.read().await.get(&key(owner, alias)).cloned())
    }

    async fn list(&self, owner: &str) -> Result<Vec<Credential>, RsspError> {
        let mut credentials: Vec<Credential> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        credentials.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(credentials)
    }

    async fn save(&self, credential: Credential) -> Result<(), RsspError> {
        let mut credentials = self.credentials.write().await;
        let k = key(&credential.owner, &credential.alias);
        if credentials.contains_key(&k) {
            return Err(RsspError::CredentialAliasAlreadyExists(credential.alias));
        }
        credentials.insert(k, credential);
        Ok(())
    }

    async fn set_enabled(&self, owner: &str, alias: &str, enabled: bool) -> Result<(), RsspError> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(&key(owner, alias))
            .ok_or(RsspError::CredentialNotFound)?;
        credential.enabled = enabled;
        Ok(())
    }

    async fn delete(&self, owner: &str, alias: &str) -> Result<(), RsspError> {
        self.credentials
            .write()
            .await
            .remove(&key(owner, alias))
            .map(|_| ())
            .ok_or(RsspError::CredentialNotFound)
    }
}
