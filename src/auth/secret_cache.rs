//! Cached master password for second-factor-only unlock.
//!
//! When a second factor is registered, the master password is cached
//! here.  A later successful second-factor ceremony unlocks the vault
//! with the cached password; the gate still proves it by decrypting.
//!
//! Backends:
//! - `MemorySecretCache`: process memory only
//! - `NoSecretCache`: never caches, so the second factor always falls
//!   through to password entry
//! - `KeyringSecretCache` (feature `keyring-store`): the OS credential
//!   store (Keychain, Credential Manager, Secret Service)

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::Mutex;

use crate::crypto::cipher::duplicate_secret;
use crate::errors::Result;

#[async_trait]
pub trait SecretCache: Send + Sync {
    async fn store(&self, secret: &SecretString) -> Result<()>;

    /// The cached secret, or `None` if nothing is cached.
    async fn fetch(&self) -> Result<Option<SecretString>>;

    /// Removing a missing entry is not an error.
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySecretCache {
    secret: Mutex<Option<SecretString>>,
}

impl MemorySecretCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemorySecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemorySecretCache([REDACTED])")
    }
}

#[async_trait]
impl SecretCache for MemorySecretCache {
    async fn store(&self, secret: &SecretString) -> Result<()> {
        *self.secret.lock().await = Some(duplicate_secret(secret));
        Ok(())
    }

    async fn fetch(&self) -> Result<Option<SecretString>> {
        Ok(self.secret.lock().await.as_ref().map(duplicate_secret))
    }

    async fn clear(&self) -> Result<()> {
        *self.secret.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecretCache;

#[async_trait]
impl SecretCache for NoSecretCache {
    async fn store(&self, _secret: &SecretString) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self) -> Result<Option<SecretString>> {
        Ok(None)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "keyring-store")]
pub use self::os_keyring::KeyringSecretCache;

#[cfg(feature = "keyring-store")]
mod os_keyring {
    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};

    use super::SecretCache;
    use crate::errors::{CredVaultError, Result};

    /// Service name used in the OS keyring.
    const SERVICE_NAME: &str = "credvault";

    /// Master password cached in the OS keyring, one entry per vault slot.
    #[derive(Debug, Clone)]
    pub struct KeyringSecretCache {
        account: String,
    }

    impl KeyringSecretCache {
        /// `slot_id` identifies the vault, e.g. the slot file path.
        pub fn new(slot_id: &str) -> Self {
            Self {
                account: format!("vault:{slot_id}"),
            }
        }

        fn entry(account: &str) -> Result<keyring::Entry> {
            keyring::Entry::new(SERVICE_NAME, account).map_err(|e| {
                CredVaultError::SecretCacheError(format!("failed to create keyring entry: {e}"))
            })
        }

        async fn blocking<T, F>(&self, task: F) -> Result<T>
        where
            F: FnOnce(String) -> Result<T> + Send + 'static,
            T: Send + 'static,
        {
            let account = self.account.clone();
            tokio::task::spawn_blocking(move || task(account))
                .await
                .map_err(|e| CredVaultError::SecretCacheError(format!("keyring task failed: {e}")))?
        }
    }

    #[async_trait]
    impl SecretCache for KeyringSecretCache {
        async fn store(&self, secret: &SecretString) -> Result<()> {
            let secret = super::duplicate_secret(secret);
            self.blocking(move |account| {
                Self::entry(&account)?
                    .set_password(secret.expose_secret())
                    .map_err(|e| {
                        CredVaultError::SecretCacheError(format!(
                            "failed to store password in keyring: {e}"
                        ))
                    })
            })
            .await
        }

        async fn fetch(&self) -> Result<Option<SecretString>> {
            self.blocking(|account| match Self::entry(&account)?.get_password() {
                Ok(password) => Ok(Some(SecretString::from(password))),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(CredVaultError::SecretCacheError(format!(
                    "failed to read from keyring: {e}"
                ))),
            })
            .await
        }

        async fn clear(&self) -> Result<()> {
            self.blocking(|account| match Self::entry(&account)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(CredVaultError::SecretCacheError(format!(
                    "failed to delete from keyring: {e}"
                ))),
            })
            .await
        }
    }
}
