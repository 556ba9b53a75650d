//! Remote blob store seam used for cloud backups.
//!
//! The store itself (a cloud drive API) and the OAuth-style sign-in that
//! yields a bearer token live outside this crate.  They plug in through
//! `RemoteStore` and `RemoteAuthenticator`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::crypto::cipher::duplicate_secret;
use crate::errors::Result;

pub use memory::{MemoryRemoteStore, StaticTokenAuthenticator};

/// A bearer token for the remote store.
pub struct AccessToken {
    token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    /// The raw token, for an `Authorization: Bearer` header.
    pub fn bearer(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl Clone for AccessToken {
    fn clone(&self) -> Self {
        Self {
            token: duplicate_secret(&self.token),
            expires_at: self.expires_at,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Metadata for a new remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub parent_id: String,
    pub mime_type: String,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_id: parent_id.into(),
            mime_type: "application/octet-stream".to_string(),
        }
    }
}

/// Folder and file operations of the remote blob store.
///
/// Transport failures are `NetworkFailure`; a rejected or expired token
/// is `NotAuthenticated`.  Implementations do not retry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Ids of folders named `name`.
    async fn list_folders(&self, token: &AccessToken, name: &str) -> Result<Vec<String>>;

    /// Create a folder and return its id.
    async fn create_folder(&self, token: &AccessToken, name: &str) -> Result<String>;

    /// Ids of files named `name` inside folder `parent_id`.
    async fn list_files(
        &self,
        token: &AccessToken,
        name: &str,
        parent_id: &str,
    ) -> Result<Vec<String>>;

    /// Create a file and return its id.
    async fn create_file(
        &self,
        token: &AccessToken,
        meta: &FileMeta,
        content: &[u8],
    ) -> Result<String>;

    /// Replace the content of an existing file.
    async fn update_file(&self, token: &AccessToken, file_id: &str, content: &[u8]) -> Result<()>;

    async fn get_file_content(&self, token: &AccessToken, file_id: &str) -> Result<Vec<u8>>;
}

/// Interactive sign-in to the remote store.
#[async_trait]
pub trait RemoteAuthenticator: Send + Sync {
    /// Run the consent flow and return a token.
    async fn authenticate(&self) -> Result<AccessToken>;

    /// Invalidate a token on sign-out.  Best effort.
    async fn revoke(&self, _token: &AccessToken) -> Result<()> {
        Ok(())
    }
}
