//! In-process remote store and authenticator.
//!
//! Used by tests and by embedders that want backups without a network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{AccessToken, FileMeta, RemoteAuthenticator, RemoteStore};
use crate::errors::{CredVaultError, Result};

#[derive(Debug)]
struct StoredFile {
    name: String,
    parent_id: String,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    folders: BTreeMap<String, String>,
    files: BTreeMap<String, StoredFile>,
}

impl State {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// A remote store kept in memory.
///
/// `set_offline(true)` makes every call fail with `NetworkFailure`.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<State>,
    offline: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful `create_file` and `update_file` calls.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Content of the first file named `file_name` in a folder named
    /// `folder_name`, if any.
    pub fn file_content(&self, folder_name: &str, file_name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().ok()?;
        let folder_id = state
            .folders
            .iter()
            .find(|(_, name)| name.as_str() == folder_name)
            .map(|(id, _)| id.clone())?;
        state
            .files
            .values()
            .find(|f| f.parent_id == folder_id && f.name == file_name)
            .map(|f| f.content.clone())
    }

    fn check(&self, token: &AccessToken) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CredVaultError::NetworkFailure(
                "remote store unreachable".into(),
            ));
        }
        if token.bearer().is_empty() || token.is_expired(Utc::now()) {
            return Err(CredVaultError::NotAuthenticated);
        }
        Ok(())
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CredVaultError::StorageError("remote state lock poisoned".into()))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn list_folders(&self, token: &AccessToken, name: &str) -> Result<Vec<String>> {
        self.check(token)?;
        Ok(self
            .state()?
            .folders
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_folder(&self, token: &AccessToken, name: &str) -> Result<String> {
        self.check(token)?;
        let mut state = self.state()?;
        let id = state.allocate_id("folder");
        state.folders.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn list_files(
        &self,
        token: &AccessToken,
        name: &str,
        parent_id: &str,
    ) -> Result<Vec<String>> {
        self.check(token)?;
        Ok(self
            .state()?
            .files
            .iter()
            .filter(|(_, f)| f.name == name && f.parent_id == parent_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_file(
        &self,
        token: &AccessToken,
        meta: &FileMeta,
        content: &[u8],
    ) -> Result<String> {
        self.check(token)?;
        let mut state = self.state()?;
        if !state.folders.contains_key(&meta.parent_id) {
            return Err(CredVaultError::StorageError(format!(
                "folder {} does not exist",
                meta.parent_id
            )));
        }
        let id = state.allocate_id("file");
        state.files.insert(
            id.clone(),
            StoredFile {
                name: meta.name.clone(),
                parent_id: meta.parent_id.clone(),
                content: content.to_vec(),
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update_file(&self, token: &AccessToken, file_id: &str, content: &[u8]) -> Result<()> {
        self.check(token)?;
        let mut state = self.state()?;
        let file = state
            .files
            .get_mut(file_id)
            .ok_or_else(|| CredVaultError::StorageError(format!("file {file_id} does not exist")))?;
        file.content = content.to_vec();
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_file_content(&self, token: &AccessToken, file_id: &str) -> Result<Vec<u8>> {
        self.check(token)?;
        self.state()?
            .files
            .get(file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| CredVaultError::StorageError(format!("file {file_id} does not exist")))
    }
}

/// Authenticator that hands out a fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenAuthenticator {
    token: String,
    lifetime: Option<Duration>,
}

impl StaticTokenAuthenticator {
    /// `lifetime` of `None` gives tokens that never expire.
    pub fn new(token: impl Into<String>, lifetime: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            lifetime,
        }
    }
}

#[async_trait]
impl RemoteAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self) -> Result<AccessToken> {
        if self.token.is_empty() {
            return Err(CredVaultError::NotAuthenticated);
        }
        let expires_at = self.lifetime.map(|lifetime| Utc::now() + lifetime);
        Ok(AccessToken::new(self.token.clone(), expires_at))
    }
}
