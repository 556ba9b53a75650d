//! Second-factor gating through a platform authenticator.
//!
//! Registration yields an opaque credential reference that is stored in a
//! local slot (base64).  Its absence means the second factor is off.
//! Verification asks the authenticator to sign a fresh random challenge
//! with that credential.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::{CredVaultError, Result};
use crate::vault::{FileSlot, Slot};

const CHALLENGE_LEN: usize = 32;

/// Opaque id of a credential held by the platform authenticator.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialReference(Vec<u8>);

impl CredentialReference {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded.trim())
            .map(Self)
            .map_err(|e| CredVaultError::StorageError(format!("bad second-factor reference: {e}")))
    }
}

impl std::fmt::Debug for CredentialReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialReference({} bytes)", self.0.len())
    }
}

/// What the authenticator returns for a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// The credential that signed.
    pub credential: CredentialReference,
    /// The challenge as the authenticator saw it.
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The platform authenticator (biometrics, passkey, security key).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Create a device-bound credential for `user`.
    async fn register(&self, user: &str) -> Result<CredentialReference>;

    /// Run the user ceremony and sign `challenge`.
    ///
    /// A user who declines is `SecondFactorFailed`; no usable authenticator
    /// is `SecondFactorUnavailable`.
    async fn assert(&self, credential: &CredentialReference, challenge: &[u8])
        -> Result<Assertion>;
}

/// Registered second factor and the slot that remembers it.
pub struct SecondFactorRegistry {
    slot: Arc<dyn Slot>,
    authenticator: Arc<dyn Authenticator>,
}

impl SecondFactorRegistry {
    pub fn new(slot: Arc<dyn Slot>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            slot,
            authenticator,
        }
    }

    /// Registry whose reference lives in the `second_factor_slot` file
    /// under the data directory.
    pub fn from_settings(
        base_dir: &Path,
        settings: &Settings,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let slot = FileSlot::new(&settings.data_path(base_dir), &settings.second_factor_slot);
        Self::new(Arc::new(slot), authenticator)
    }

    pub async fn reference(&self) -> Result<Option<CredentialReference>> {
        match self.slot.read().await? {
            Some(encoded) => CredentialReference::from_base64(&encoded).map(Some),
            None => Ok(None),
        }
    }

    pub async fn is_registered(&self) -> Result<bool> {
        self.slot.exists().await
    }

    /// Create a credential and remember it, replacing any earlier one.
    pub async fn register(&self, user: &str) -> Result<CredentialReference> {
        let reference = self.authenticator.register(user).await?;
        self.slot.write(&reference.to_base64()).await?;
        debug!("second factor registered");
        Ok(reference)
    }

    pub async fn remove(&self) -> Result<()> {
        self.slot.remove().await?;
        debug!("second factor removed");
        Ok(())
    }

    /// Run the ceremony against the registered credential.
    pub async fn verify(&self) -> Result<()> {
        let reference = self
            .reference()
            .await?
            .ok_or(CredVaultError::SecondFactorUnavailable)?;

        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rng().fill_bytes(&mut challenge);

        let assertion = self.authenticator.assert(&reference, &challenge).await?;

        let same_credential = assertion.credential == reference;
        let same_challenge: bool = assertion.challenge.ct_eq(&challenge).into();
        if !same_credential || !same_challenge || assertion.signature.is_empty() {
            warn!("second-factor assertion did not match the challenge");
            return Err(CredVaultError::SecondFactorFailed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SecondFactorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondFactorRegistry").finish_non_exhaustive()
    }
}

/// Software authenticator that approves or declines on command.
///
/// Stands in for a platform authenticator in tests and headless setups.
#[derive(Debug)]
pub struct SoftwareAuthenticator {
    available: AtomicBool,
    approve: AtomicBool,
}

impl Default for SoftwareAuthenticator {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            approve: AtomicBool::new(true),
        }
    }
}

impl SoftwareAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the simulated user accepts the next ceremonies.
    pub fn set_approve(&self, approve: bool) {
        self.approve.store(approve, Ordering::SeqCst);
    }
}

#[async_trait]
impl Authenticator for SoftwareAuthenticator {
    async fn register(&self, user: &str) -> Result<CredentialReference> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CredVaultError::SecondFactorUnavailable);
        }
        let mut id = user.as_bytes().to_vec();
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);
        id.extend_from_slice(&nonce);
        Ok(CredentialReference::new(id))
    }

    async fn assert(
        &self,
        credential: &CredentialReference,
        challenge: &[u8],
    ) -> Result<Assertion> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CredVaultError::SecondFactorUnavailable);
        }
        if !self.approve.load(Ordering::SeqCst) {
            return Err(CredVaultError::SecondFactorFailed);
        }
        Ok(Assertion {
            credential: credential.clone(),
            challenge: challenge.to_vec(),
            signature: vec![1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemorySlot;

    fn registry(auth: Arc<SoftwareAuthenticator>) -> SecondFactorRegistry {
        SecondFactorRegistry::new(Arc::new(MemorySlot::new()), auth)
    }

    #[tokio::test]
    async fn register_verify_remove() {
        let auth = Arc::new(SoftwareAuthenticator::new());
        let registry = registry(auth);

        assert!(!registry.is_registered().await.unwrap());
        assert!(matches!(
            registry.verify().await,
            Err(CredVaultError::SecondFactorUnavailable)
        ));

        let reference = registry.register("me").await.unwrap();
        assert!(registry.is_registered().await.unwrap());
        assert_eq!(registry.reference().await.unwrap(), Some(reference));
        registry.verify().await.unwrap();

        registry.remove().await.unwrap();
        assert!(!registry.is_registered().await.unwrap());
    }

    #[tokio::test]
    async fn declined_ceremony_fails() {
        let auth = Arc::new(SoftwareAuthenticator::new());
        let registry = registry(auth.clone());
        registry.register("me").await.unwrap();

        auth.set_approve(false);
        assert!(matches!(
            registry.verify().await,
            Err(CredVaultError::SecondFactorFailed)
        ));
    }

    struct WrongChallenge;

    #[async_trait]
    impl Authenticator for WrongChallenge {
        async fn register(&self, _user: &str) -> Result<CredentialReference> {
            Ok(CredentialReference::new(vec![9; 8]))
        }

        async fn assert(
            &self,
            credential: &CredentialReference,
            _challenge: &[u8],
        ) -> Result<Assertion> {
            Ok(Assertion {
                credential: credential.clone(),
                challenge: vec![0; CHALLENGE_LEN],
                signature: vec![1],
            })
        }
    }

    #[tokio::test]
    async fn replayed_assertion_is_rejected() {
        let registry = SecondFactorRegistry::new(Arc::new(MemorySlot::new()), Arc::new(WrongChallenge));
        registry.register("me").await.unwrap();
        assert!(matches!(
            registry.verify().await,
            Err(CredVaultError::SecondFactorFailed)
        ));
    }

    #[test]
    fn reference_base64_round_trip() {
        let reference = CredentialReference::new(vec![0, 1, 2, 250]);
        let decoded = CredentialReference::from_base64(&reference.to_base64()).unwrap();
        assert_eq!(decoded, reference);
        assert!(CredentialReference::from_base64("***").is_err());
    }
}
