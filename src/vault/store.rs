//! Encrypted persistence of the vault in a local slot.
//!
//! `VaultStore` ties a `Slot` to a `Cipher`.  Saves are serialized by an
//! internal lock so two quick edits can never interleave their writes.

use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Settings;
use crate::crypto::{Cipher, EncryptedBlob};
use crate::errors::Result;

use super::data::Vault;
use super::slot::{FileSlot, Slot};

/// The encrypted vault in its local slot.
pub struct VaultStore {
    slot: Arc<dyn Slot>,
    cipher: Cipher,
    /// Held for the whole encrypt-and-write of a save.
    write_lock: Mutex<()>,
}

impl VaultStore {
    pub fn new(slot: Arc<dyn Slot>, cipher: Cipher) -> Self {
        Self {
            slot,
            cipher,
            write_lock: Mutex::new(()),
        }
    }

    /// File-backed store at `<base_dir>/<data_dir>/<slot_name>`.
    pub fn from_settings(base_dir: &Path, settings: &Settings) -> Result<Self> {
        let cipher = Cipher::new(settings.kdf_params())?;
        let slot = FileSlot::new(&settings.data_path(base_dir), &settings.slot_name);
        Ok(Self::new(Arc::new(slot), cipher))
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// True once a vault has been saved (first run vs. returning user).
    pub async fn exists(&self) -> Result<bool> {
        self.slot.exists().await
    }

    /// Decrypt the stored vault.
    ///
    /// Returns an empty vault when nothing was saved yet.  A wrong password
    /// surfaces as `WrongPasswordOrCorrupt`, unchanged from the cipher.
    pub async fn load(&self, password: &SecretString) -> Result<Vault> {
        let Some(content) = self.slot.read().await? else {
            debug!("no vault slot yet, starting empty");
            return Ok(Vault::default());
        };

        let blob = EncryptedBlob::new(content);
        let vault = self.cipher.decrypt_async(&blob, password).await?;
        debug!(credentials = vault.len(), "vault loaded");
        Ok(vault)
    }

    /// Encrypt `vault` and replace the slot content.
    pub async fn save(&self, vault: &Vault, password: &SecretString) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let blob = self.cipher.encrypt_async(vault, password).await?;
        self.slot.write(blob.as_str()).await?;
        debug!(credentials = vault.len(), "vault saved");
        Ok(())
    }

    /// Delete the stored vault.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.slot.remove().await
    }
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}
