//! The auth gate: the state machine between "app started" and "vault
//! unlocked".
//!
//! ```text
//! NoVault ──begin_setup──▶ Setup ──complete_setup──▶ Unlocked
//! HasVault ──begin_unlock──▶ AwaitingSecondFactor ──ok──▶ Unlocked
//!                 │                    │ declined / no cached secret
//!                 └──(no 2FA)──▶ AwaitingPassword ──correct──▶ Unlocked
//! Unlocked ──logout──▶ HasVault | NoVault
//! ```
//!
//! `Unlocked` is entered only after the vault was actually decrypted
//! with the secret being installed, so the session secret is always the
//! real master password.

use std::path::Path;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::second_factor::{Authenticator, SecondFactorRegistry};
use super::secret_cache::{NoSecretCache, SecretCache};
use super::session::{Session, SessionHandle};
use crate::config::{Settings, DEFAULT_MIN_PASSWORD_LEN};
use crate::crypto::cipher::duplicate_secret;
use crate::errors::{CredVaultError, Result};
use crate::remote::RemoteAuthenticator;
use crate::vault::{Vault, VaultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// First run: nothing saved yet.
    NoVault,
    /// Collecting a new master password.
    Setup,
    /// A vault exists and is locked.
    HasVault,
    AwaitingSecondFactor,
    AwaitingPassword,
    Unlocked,
}

impl AuthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoVault => "no vault exists",
            Self::Setup => "setting up",
            Self::HasVault => "locked",
            Self::AwaitingSecondFactor => "awaiting second factor",
            Self::AwaitingPassword => "awaiting password",
            Self::Unlocked => "unlocked",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a second-factor attempt.
#[derive(Debug)]
pub enum SecondFactorOutcome {
    /// Ceremony passed and the cached secret opened the vault.
    Unlocked(Vault),
    /// Ceremony declined, failed or unavailable.
    Declined,
    /// Ceremony passed but no secret is cached.
    NoCachedSecret,
    /// Ceremony passed but the cached secret no longer opens the vault.
    CachedSecretRejected,
}

pub struct AuthGate {
    state: AuthState,
    session: Arc<RwLock<Session>>,
    store: Arc<VaultStore>,
    second_factor: Option<SecondFactorRegistry>,
    secret_cache: Arc<dyn SecretCache>,
    remote_auth: Option<Arc<dyn RemoteAuthenticator>>,
    min_password_len: usize,
}

impl AuthGate {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self {
            state: AuthState::NoVault,
            session: Arc::new(RwLock::new(Session::default())),
            store,
            second_factor: None,
            secret_cache: Arc::new(NoSecretCache),
            remote_auth: None,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
        }
    }

    /// A gate using the configured minimum password length.  With an
    /// authenticator, the second factor is remembered in the configured
    /// slot under the data directory.
    pub fn from_settings(
        store: Arc<VaultStore>,
        base_dir: &Path,
        settings: &Settings,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let gate = Self::new(store).with_min_password_len(settings.min_password_len);
        match authenticator {
            Some(auth) => {
                gate.with_second_factor(SecondFactorRegistry::from_settings(base_dir, settings, auth))
            }
            None => gate,
        }
    }

    pub fn with_second_factor(mut self, registry: SecondFactorRegistry) -> Self {
        self.second_factor = Some(registry);
        self
    }

    pub fn with_secret_cache(mut self, cache: Arc<dyn SecretCache>) -> Self {
        self.secret_cache = cache;
        self
    }

    pub fn with_remote_authenticator(mut self, auth: Arc<dyn RemoteAuthenticator>) -> Self {
        self.remote_auth = Some(auth);
        self
    }

    pub fn with_min_password_len(mut self, len: usize) -> Self {
        self.min_password_len = len;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Read-only view of the session for other components.
    pub fn session(&self) -> SessionHandle {
        SessionHandle::new(self.session.clone())
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    fn expect_state(&self, expected: AuthState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CredVaultError::InvalidTransition {
                state: self.state.as_str(),
                action,
            })
        }
    }

    async fn locked_state(&self) -> Result<AuthState> {
        Ok(if self.store.exists().await? {
            AuthState::HasVault
        } else {
            AuthState::NoVault
        })
    }

    /// Decide between first run and returning user.
    pub async fn start(&mut self) -> Result<AuthState> {
        if self.state == AuthState::Unlocked {
            return Err(CredVaultError::InvalidTransition {
                state: self.state.as_str(),
                action: "restart authentication",
            });
        }
        self.state = self.locked_state().await?;
        debug!(state = %self.state, "auth gate started");
        Ok(self.state)
    }

    // ── Setup ────────────────────────────────────────────────────────

    pub fn begin_setup(&mut self) -> Result<()> {
        self.expect_state(AuthState::NoVault, "set up a vault")?;
        self.state = AuthState::Setup;
        Ok(())
    }

    pub fn cancel_setup(&mut self) -> Result<()> {
        self.expect_state(AuthState::Setup, "cancel setup")?;
        self.state = AuthState::NoVault;
        Ok(())
    }

    /// Create the vault under `password` and unlock it.
    pub async fn complete_setup(
        &mut self,
        password: SecretString,
        confirmation: SecretString,
    ) -> Result<Vault> {
        self.expect_state(AuthState::Setup, "complete setup")?;
        self.check_new_password(&password, &confirmation)?;

        if self.store.exists().await? {
            self.state = AuthState::HasVault;
            return Err(CredVaultError::InvalidTransition {
                state: AuthState::HasVault.as_str(),
                action: "create a second vault",
            });
        }

        let vault = Vault::default();
        self.store.save(&vault, &password).await?;
        self.enter_unlocked(password).await;
        info!("vault created");
        Ok(vault)
    }

    fn check_new_password(&self, password: &SecretString, confirmation: &SecretString) -> Result<()> {
        let a = password.expose_secret().as_bytes();
        let b = confirmation.expose_secret().as_bytes();
        if !bool::from(a.ct_eq(b)) {
            return Err(CredVaultError::PasswordMismatch);
        }
        if password.expose_secret().chars().count() < self.min_password_len {
            return Err(CredVaultError::WeakPassword(self.min_password_len));
        }
        Ok(())
    }

    // ── Unlock ───────────────────────────────────────────────────────

    /// Move from `HasVault` to the first unlock step.
    pub async fn begin_unlock(&mut self) -> Result<AuthState> {
        self.expect_state(AuthState::HasVault, "unlock")?;
        self.state = if self.has_second_factor().await? {
            AuthState::AwaitingSecondFactor
        } else {
            AuthState::AwaitingPassword
        };
        Ok(self.state)
    }

    pub async fn has_second_factor(&self) -> Result<bool> {
        match &self.second_factor {
            Some(registry) => registry.is_registered().await,
            None => Ok(false),
        }
    }

    /// Run the second-factor ceremony.
    ///
    /// Unlocks only when a cached master password exists and opens the
    /// vault.  Every other outcome moves to `AwaitingPassword`.
    pub async fn verify_second_factor(&mut self) -> Result<SecondFactorOutcome> {
        self.expect_state(AuthState::AwaitingSecondFactor, "verify the second factor")?;
        self.state = AuthState::AwaitingPassword;

        let Some(registry) = &self.second_factor else {
            return Ok(SecondFactorOutcome::Declined);
        };
        if let Err(e) = registry.verify().await {
            warn!(error = %e, "second factor not verified");
            return Ok(SecondFactorOutcome::Declined);
        }

        let cached = match self.secret_cache.fetch().await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "secret cache unavailable");
                None
            }
        };
        let Some(secret) = cached else {
            return Ok(SecondFactorOutcome::NoCachedSecret);
        };

        match self.store.load(&secret).await {
            Ok(vault) => {
                self.enter_unlocked(secret).await;
                info!("vault unlocked with second factor");
                Ok(SecondFactorOutcome::Unlocked(vault))
            }
            Err(CredVaultError::WrongPasswordOrCorrupt) => {
                warn!("cached secret no longer opens the vault; clearing it");
                if let Err(e) = self.secret_cache.clear().await {
                    warn!(error = %e, "failed to clear secret cache");
                }
                Ok(SecondFactorOutcome::CachedSecretRejected)
            }
            Err(e) => Err(e),
        }
    }

    pub fn skip_second_factor(&mut self) -> Result<()> {
        self.expect_state(AuthState::AwaitingSecondFactor, "skip the second factor")?;
        self.state = AuthState::AwaitingPassword;
        Ok(())
    }

    /// Try `password`.  On failure the gate stays in `AwaitingPassword`.
    pub async fn submit_password(&mut self, password: SecretString) -> Result<Vault> {
        self.expect_state(AuthState::AwaitingPassword, "submit a password")?;

        let vault = self.store.load(&password).await?;
        self.enter_unlocked(password).await;
        info!(credentials = vault.len(), "vault unlocked");
        Ok(vault)
    }

    async fn enter_unlocked(&mut self, secret: SecretString) {
        self.session.write().await.unlock(secret);
        self.state = AuthState::Unlocked;
    }

    // ── Unlocked ─────────────────────────────────────────────────────

    /// Forget the password and remote token.
    pub async fn logout(&mut self) -> Result<AuthState> {
        self.expect_state(AuthState::Unlocked, "log out")?;

        let token = self.session.write().await.lock();
        if let (Some(token), Some(auth)) = (token, &self.remote_auth) {
            if let Err(e) = auth.revoke(&token).await {
                warn!(error = %e, "failed to revoke remote token");
            }
        }

        self.state = self.locked_state().await?;
        info!("logged out");
        Ok(self.state)
    }

    /// Re-encrypt the vault under a new master password.
    ///
    /// With remote backups configured, go through
    /// `CredentialService::change_password`, which also re-uploads the
    /// backup under the new password.
    ///
    /// `current` is proven by decrypting the stored vault.  Holds the
    /// session write lock throughout so no save with the old password can
    /// land after the re-encryption.
    pub async fn change_password(
        &mut self,
        current: SecretString,
        new: SecretString,
        confirmation: SecretString,
    ) -> Result<()> {
        self.expect_state(AuthState::Unlocked, "change the password")?;
        self.check_new_password(&new, &confirmation)?;

        let mut session = self.session.write().await;
        let vault = self.store.load(&current).await?;
        self.store.save(&vault, &new).await?;

        match self.secret_cache.fetch().await {
            Ok(Some(_)) => {
                if let Err(e) = self.secret_cache.store(&new).await {
                    warn!(error = %e, "failed to refresh cached secret");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "secret cache unavailable"),
        }

        session.replace_secret(new);
        info!("master password changed");
        Ok(())
    }

    /// Sign in to the remote store and keep the token in the session.
    pub async fn link_remote(&mut self) -> Result<()> {
        self.expect_state(AuthState::Unlocked, "link remote storage")?;
        let auth = self
            .remote_auth
            .as_ref()
            .ok_or(CredVaultError::NotAuthenticated)?;
        let token = auth.authenticate().await?;
        self.session.write().await.link_remote(token);
        info!("remote storage linked");
        Ok(())
    }

    pub async fn unlink_remote(&mut self) -> Result<()> {
        self.expect_state(AuthState::Unlocked, "unlink remote storage")?;
        let token = self.session.write().await.unlink_remote();
        if let (Some(token), Some(auth)) = (token, &self.remote_auth) {
            if let Err(e) = auth.revoke(&token).await {
                warn!(error = %e, "failed to revoke remote token");
            }
        }
        info!("remote storage unlinked");
        Ok(())
    }

    /// Register a second factor and cache the master password for it.
    pub async fn register_second_factor(&mut self, user: &str) -> Result<()> {
        self.expect_state(AuthState::Unlocked, "register a second factor")?;
        let registry = self
            .second_factor
            .as_ref()
            .ok_or(CredVaultError::SecondFactorUnavailable)?;

        let secret = self
            .session
            .read()
            .await
            .secret()
            .map(duplicate_secret)
            .ok_or(CredVaultError::SessionLocked)?;

        registry.register(user).await?;
        self.secret_cache.store(&secret).await?;
        info!("second factor enabled");
        Ok(())
    }

    pub async fn remove_second_factor(&mut self) -> Result<()> {
        self.expect_state(AuthState::Unlocked, "remove the second factor")?;
        let registry = self
            .second_factor
            .as_ref()
            .ok_or(CredVaultError::SecondFactorUnavailable)?;

        registry.remove().await?;
        self.secret_cache.clear().await?;
        info!("second factor disabled");
        Ok(())
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("state", &self.state)
            .field("min_password_len", &self.min_password_len)
            .finish_non_exhaustive()
    }
}
