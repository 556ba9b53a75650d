//! The in-memory session.
//!
//! Only the auth gate can change a `Session`; everything else gets a
//! `SessionHandle`, which hands out read guards.

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::crypto::cipher::duplicate_secret;
use crate::remote::AccessToken;

/// Unlock state, master password and remote link of the running process.
///
/// Never persisted.  `Debug` does not print the secret or the token.
#[derive(Default)]
pub struct Session {
    unlocked: bool,
    secret: Option<SecretString>,
    remote: Option<AccessToken>,
    /// Bumped every time the session is locked.
    epoch: u64,
    /// Bumped every time the master password changes.
    key_generation: u64,
}

impl Session {
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn secret(&self) -> Option<&SecretString> {
        self.secret.as_ref()
    }

    /// A copy of the secret for work that outlives the read guard.
    pub fn secret_copy(&self) -> Option<SecretString> {
        self.secret.as_ref().map(duplicate_secret)
    }

    pub fn remote_token(&self) -> Option<&AccessToken> {
        self.remote.as_ref()
    }

    /// True when linked to the remote store with a token that has not expired.
    pub fn remote_linked(&self) -> bool {
        self.remote
            .as_ref()
            .is_some_and(|token| !token.is_expired(Utc::now()))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Identifies which master password `secret()` holds.  Anything
    /// encrypted under an older generation is stale.
    pub fn key_generation(&self) -> u64 {
        self.key_generation
    }

    pub(crate) fn unlock(&mut self, secret: SecretString) {
        self.unlocked = true;
        self.secret = Some(secret);
    }

    pub(crate) fn replace_secret(&mut self, secret: SecretString) {
        self.secret = Some(secret);
        self.key_generation += 1;
    }

    /// Clear the secret and the remote link, and start a new epoch.
    pub(crate) fn lock(&mut self) -> Option<AccessToken> {
        self.unlocked = false;
        self.secret = None;
        self.epoch += 1;
        self.remote.take()
    }

    pub(crate) fn link_remote(&mut self, token: AccessToken) {
        self.remote = Some(token);
    }

    pub(crate) fn unlink_remote(&mut self) -> Option<AccessToken> {
        self.remote.take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("unlocked", &self.unlocked)
            .field("has_secret", &self.secret.is_some())
            .field("remote_linked", &self.remote.is_some())
            .field("epoch", &self.epoch)
            .field("key_generation", &self.key_generation)
            .finish()
    }
}

/// Read-only access to the shared session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<Session>>,
}

impl SessionHandle {
    pub(crate) fn new(inner: Arc<RwLock<Session>>) -> Self {
        Self { inner }
    }

    /// Hold this guard for the whole of an operation that must not
    /// interleave with a lock or password change.
    pub async fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.inner.read().await
    }

    pub async fn is_unlocked(&self) -> bool {
        self.inner.read().await.is_unlocked()
    }

    pub async fn epoch(&self) -> u64 {
        self.inner.read().await.epoch()
    }

    pub async fn key_generation(&self) -> u64 {
        self.inner.read().await.key_generation()
    }

    pub async fn remote_linked(&self) -> bool {
        self.inner.read().await.remote_linked()
    }
}
