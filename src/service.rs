//! Application state: the unlocked vault and everything that edits it.
//!
//! `CredentialService` keeps the decrypted vault for the current session
//! epoch and funnels every change through one lock, so saves happen one
//! at a time and each edit sees the previous one.  After a change is
//! saved locally it may queue an automatic backup; the backup outcome
//! never affects the local change.
//!
//! Lock order is session read guard first, then the vault lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "audit-log")]
use crate::audit::AuditLog;
use crate::auth::{AuthGate, Session, SessionHandle};
use crate::backup::{AutoBackup, BackupJob, BackupObserver, BackupOrchestrator, BackupTarget};
use crate::config::{Settings, DEFAULT_BACKUP_STALE_DAYS};
use crate::errors::{CredVaultError, Result};
use crate::merge::{merge_into, MergeReport};
use crate::remote::RemoteStore;
use crate::transfer;
use crate::vault::credential::now_millis;
use crate::vault::{Credential, CredentialFilter, NewCredential, Vault, VaultStore};

/// User preferences that gate exports and remote sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncToggles {
    pub auto_backup: bool,
    pub allow_export: bool,
    pub enable_remote_sync: bool,
}

impl Default for SyncToggles {
    fn default() -> Self {
        Self {
            auto_backup: true,
            allow_export: true,
            enable_remote_sync: true,
        }
    }
}

struct LoadedVault {
    epoch: u64,
    vault: Vault,
}

struct Shared {
    store: Arc<VaultStore>,
    session: SessionHandle,
    loaded: Mutex<Option<LoadedVault>>,
}

impl Shared {
    /// Store the new `last_backup` if the session that took the snapshot
    /// is still the current one and the backup was encrypted under the
    /// current master password.
    async fn record_backup(&self, epoch: u64, key_generation: u64, at: DateTime<Utc>) -> Result<()> {
        let session = self.session.read().await;
        if !session.is_unlocked()
            || session.epoch() != epoch
            || session.key_generation() != key_generation
        {
            debug!(epoch, key_generation, "backup is stale; not recording it");
            return Ok(());
        }
        let secret = session.secret().ok_or(CredVaultError::SessionLocked)?;

        let mut loaded = self.loaded.lock().await;
        let Some(entry) = loaded.as_mut().filter(|l| l.epoch == epoch) else {
            return Ok(());
        };
        let mut next = entry.vault.clone();
        next.last_backup = Some(at);
        self.store.save(&next, secret).await?;
        entry.vault = next;
        Ok(())
    }
}

/// Records successful automatic backups in the vault.
struct RecordingObserver {
    shared: Arc<Shared>,
}

#[async_trait]
impl BackupObserver for RecordingObserver {
    /// Drops jobs from an ended session.  A job queued before a password
    /// change is re-keyed under the current password.
    async fn prepare(&self, job: Arc<BackupJob>) -> Option<Arc<BackupJob>> {
        let session = self.shared.session.read().await;
        if !session.is_unlocked() || session.epoch() != job.epoch {
            return None;
        }
        if session.key_generation() == job.key_generation {
            return Some(job);
        }
        debug!(epoch = job.epoch, "re-keying queued backup after password change");
        Some(Arc::new(BackupJob {
            vault: job.vault.clone(),
            password: session.secret_copy()?,
            token: session.remote_token().cloned()?,
            epoch: job.epoch,
            key_generation: session.key_generation(),
        }))
    }

    async fn backup_completed(&self, job: &BackupJob, at: DateTime<Utc>) {
        info!(epoch = job.epoch, at = %at, "automatic backup completed");
        if let Err(e) = self
            .shared
            .record_backup(job.epoch, job.key_generation, at)
            .await
        {
            warn!(error = %e, "failed to record backup time");
        }
    }

    async fn backup_failed(&self, job: &BackupJob, error: &CredVaultError) {
        warn!(
            epoch = job.epoch,
            error = %error,
            retryable = error.is_retryable(),
            "automatic backup failed"
        );
    }
}

struct RemoteBackup {
    orchestrator: Arc<BackupOrchestrator>,
    auto: AutoBackup,
}

/// The unlocked vault and its operations.
pub struct CredentialService {
    shared: Arc<Shared>,
    toggles: RwLock<SyncToggles>,
    remote: Option<RemoteBackup>,
    stale_days: u32,
    #[cfg(feature = "audit-log")]
    audit: Option<Arc<AuditLog>>,
}

impl CredentialService {
    pub fn new(store: Arc<VaultStore>, session: SessionHandle) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                session,
                loaded: Mutex::new(None),
            }),
            toggles: RwLock::new(SyncToggles::default()),
            remote: None,
            stale_days: DEFAULT_BACKUP_STALE_DAYS,
            #[cfg(feature = "audit-log")]
            audit: None,
        }
    }

    /// Enable remote backups.  Starts the auto-backup worker, so this must
    /// run inside a tokio runtime.
    pub fn with_remote(
        mut self,
        remote: Arc<dyn RemoteStore>,
        target: BackupTarget,
        debounce: Duration,
    ) -> Self {
        let orchestrator = Arc::new(BackupOrchestrator::new(
            remote,
            *self.shared.store.cipher(),
            target,
        ));
        let observer = Arc::new(RecordingObserver {
            shared: self.shared.clone(),
        });
        let auto = AutoBackup::spawn(orchestrator.clone(), observer, debounce);
        self.remote = Some(RemoteBackup { orchestrator, auto });
        self
    }

    /// A service using the configured backup staleness.
    pub fn from_settings(store: Arc<VaultStore>, session: SessionHandle, settings: &Settings) -> Self {
        Self::new(store, session).with_stale_days(settings.backup_stale_days)
    }

    /// `with_remote` using the configured backup folder, file name and
    /// auto-backup debounce.
    pub fn with_remote_settings(self, remote: Arc<dyn RemoteStore>, settings: &Settings) -> Self {
        self.with_remote(remote, settings.backup_target(), settings.auto_backup_debounce())
    }

    pub fn with_toggles(self, toggles: SyncToggles) -> Self {
        self.set_toggles(toggles);
        self
    }

    pub fn with_stale_days(mut self, days: u32) -> Self {
        self.stale_days = days;
        self
    }

    /// Record operations in `<data_dir>/audit.db`.  Silently does nothing
    /// if the database cannot be opened.
    #[cfg(feature = "audit-log")]
    pub fn with_audit_dir(mut self, data_dir: &Path) -> Self {
        self.audit = AuditLog::open(data_dir).map(Arc::new);
        self
    }

    #[cfg(feature = "audit-log")]
    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_deref()
    }

    /// SQLite writes block, so they run on the blocking pool.
    #[cfg(feature = "audit-log")]
    async fn audit(&self, operation: &'static str, credential_id: Option<&str>, details: Option<String>) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let credential_id = credential_id.map(str::to_owned);
        let logged = tokio::task::spawn_blocking(move || {
            audit.log(operation, credential_id.as_deref(), details.as_deref());
        })
        .await;
        if let Err(e) = logged {
            warn!(error = %e, operation, "audit task failed");
        }
    }

    #[cfg(not(feature = "audit-log"))]
    async fn audit(&self, _operation: &'static str, _credential_id: Option<&str>, _details: Option<String>) {}

    pub fn toggles(&self) -> SyncToggles {
        self.toggles
            .read()
            .map(|t| *t)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn set_toggles(&self, toggles: SyncToggles) {
        match self.toggles.write() {
            Ok(mut current) => *current = toggles,
            Err(poisoned) => *poisoned.into_inner() = toggles,
        }
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Decrypt the stored vault with the session secret and keep it.
    pub async fn load(&self) -> Result<Vault> {
        let session = self.shared.session.read().await;
        let secret = unlocked_secret(&session)?;
        let vault = self.shared.store.load(secret).await?;
        self.keep(&session, vault.clone()).await;
        Ok(vault)
    }

    /// Keep a vault that the auth gate already decrypted.
    pub async fn attach(&self, vault: Vault) -> Result<()> {
        let session = self.shared.session.read().await;
        unlocked_secret(&session)?;
        self.keep(&session, vault).await;
        Ok(())
    }

    async fn keep(&self, session: &Session, vault: Vault) {
        debug!(credentials = vault.len(), epoch = session.epoch(), "vault attached");
        *self.shared.loaded.lock().await = Some(LoadedVault {
            epoch: session.epoch(),
            vault,
        });
    }

    /// Drop the decrypted vault and any backup that has not started.
    pub async fn lock(&self) {
        *self.shared.loaded.lock().await = None;
        if let Some(remote) = &self.remote {
            remote.auto.cancel_pending();
        }
    }

    // ── Reading ──────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> Result<Vault> {
        let session = self.shared.session.read().await;
        let mut loaded = self.shared.loaded.lock().await;
        Ok(current(&mut loaded, &session)?.vault.clone())
    }

    pub async fn list(&self, filter: &CredentialFilter) -> Result<Vec<Credential>> {
        let session = self.shared.session.read().await;
        let mut loaded = self.shared.loaded.lock().await;
        let vault = &current(&mut loaded, &session)?.vault;
        Ok(vault.filter(filter).cloned().collect())
    }

    pub async fn get(&self, id: &str) -> Result<Credential> {
        let session = self.shared.session.read().await;
        let mut loaded = self.shared.loaded.lock().await;
        current(&mut loaded, &session)?
            .vault
            .get(id)
            .cloned()
            .ok_or_else(|| CredVaultError::CredentialNotFound(id.to_string()))
    }

    /// True if the vault was never backed up or the last backup is stale.
    pub async fn needs_backup(&self) -> Result<bool> {
        let vault = self.snapshot().await?;
        Ok(vault.needs_backup(Utc::now(), self.stale_days))
    }

    // ── Editing ──────────────────────────────────────────────────────

    pub async fn add(&self, fields: NewCredential) -> Result<Credential> {
        let created = self.mutate(|vault| vault.add(fields).cloned()).await?;
        info!(id = %created.id, kind = %created.kind, "credential added");
        self.audit("add", Some(&created.id), None).await;
        Ok(created)
    }

    pub async fn update(&self, id: &str, fields: NewCredential) -> Result<Credential> {
        let updated = self
            .mutate(|vault| vault.update(id, fields).cloned())
            .await?;
        info!(id = %updated.id, "credential updated");
        self.audit("update", Some(id), None).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<Credential> {
        let removed = self.mutate(|vault| vault.remove(id)).await?;
        info!(id = %removed.id, "credential deleted");
        self.audit("delete", Some(id), None).await;
        Ok(removed)
    }

    /// Apply `change` to a copy of the vault, save it, then keep it.
    ///
    /// A failed save leaves the kept vault untouched.
    async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Vault) -> Result<T>,
    {
        self.mutate_in(None, change).await
    }

    /// `mutate`, but `Cancelled` unless the session is still in `epoch`.
    async fn mutate_in<T, F>(&self, epoch: Option<u64>, change: F) -> Result<T>
    where
        F: FnOnce(&mut Vault) -> Result<T>,
    {
        let session = self.shared.session.read().await;
        if epoch.is_some_and(|e| e != session.epoch() || !session.is_unlocked()) {
            return Err(CredVaultError::Cancelled);
        }
        let secret = unlocked_secret(&session)?;
        let mut loaded = self.shared.loaded.lock().await;
        let entry = current(&mut loaded, &session)?;

        let mut next = entry.vault.clone();
        let output = change(&mut next)?;
        self.shared.store.save(&next, secret).await?;
        entry.vault = next;

        self.schedule_backup(&session, &entry.vault);
        Ok(output)
    }

    fn schedule_backup(&self, session: &Session, vault: &Vault) {
        let Some(remote) = &self.remote else {
            return;
        };
        let toggles = self.toggles();
        if !toggles.auto_backup || !toggles.enable_remote_sync || vault.is_empty() {
            return;
        }
        if !session.is_unlocked() || !session.remote_linked() {
            return;
        }
        let (Some(password), Some(token)) = (session.secret_copy(), session.remote_token().cloned())
        else {
            return;
        };

        debug!(credentials = vault.len(), "automatic backup queued");
        remote.auto.schedule(BackupJob {
            vault: vault.clone(),
            password,
            token,
            epoch: session.epoch(),
            key_generation: session.key_generation(),
        });
    }

    // ── Import / export ──────────────────────────────────────────────

    /// Decrypt an export file with `password` and merge it in.
    pub async fn import_file(&self, path: &Path, password: &SecretString) -> Result<MergeReport> {
        let incoming = transfer::import_from_file(path, password, self.shared.store.cipher()).await?;
        let report = self
            .mutate(move |vault| Ok(merge_into(vault, incoming.credentials)))
            .await?;
        info!(
            added = report.added,
            updated = report.updated,
            "export file imported"
        );
        let details = format!("added={} updated={}", report.added, report.updated);
        self.audit("import", None, Some(details)).await;
        Ok(report)
    }

    /// Write the vault, encrypted with `password`, into `dir`.
    pub async fn export_file(&self, dir: &Path, password: &SecretString) -> Result<PathBuf> {
        if !self.toggles().allow_export {
            return Err(CredVaultError::ExportDisabled);
        }
        let vault = self.snapshot().await?;
        let path = transfer::export_to_dir(
            &vault,
            password,
            self.shared.store.cipher(),
            dir,
            Utc::now().date_naive(),
        )
        .await?;
        self.audit("export", None, Some(format!("credentials={}", vault.len())))
            .await;
        Ok(path)
    }

    // ── Remote backup ────────────────────────────────────────────────

    fn orchestrator(&self) -> Result<&Arc<BackupOrchestrator>> {
        self.remote
            .as_ref()
            .map(|r| &r.orchestrator)
            .ok_or(CredVaultError::NotAuthenticated)
    }

    /// Back up now and record the time.
    pub async fn backup_now(&self) -> Result<DateTime<Utc>> {
        let orchestrator = self.orchestrator()?;
        let (epoch, key_generation, password, token) = {
            let session = self.shared.session.read().await;
            let password = session.secret_copy().filter(|_| session.is_unlocked());
            let token = session.remote_token().cloned();
            (
                session.epoch(),
                session.key_generation(),
                password.ok_or(CredVaultError::SessionLocked)?,
                token,
            )
        };
        let vault = self.snapshot().await?;

        let at = orchestrator.backup(&vault, &password, token.as_ref()).await?;
        self.shared.record_backup(epoch, key_generation, at).await?;
        self.audit("backup", None, Some(format!("credentials={}", vault.len())))
            .await;
        Ok(at)
    }

    /// Download the remote backup and merge it in.
    ///
    /// If the session ends while the download runs, the downloaded data
    /// is dropped and `Cancelled` is returned.
    pub async fn restore_from_remote(&self) -> Result<MergeReport> {
        let orchestrator = self.orchestrator()?;
        let (epoch, password, token) = {
            let session = self.shared.session.read().await;
            let password = session.secret_copy().filter(|_| session.is_unlocked());
            let token = session.remote_token().cloned();
            (session.epoch(), password.ok_or(CredVaultError::SessionLocked)?, token)
        };

        let restored = orchestrator.restore(&password, token.as_ref()).await?;

        let report = self
            .mutate_in(Some(epoch), move |vault| {
                let report = merge_into(vault, restored.credentials);
                vault.last_backup = Some(now_millis());
                Ok(report)
            })
            .await
            .inspect_err(|e| {
                if matches!(e, CredVaultError::Cancelled) {
                    debug!("session ended during restore; download discarded");
                }
            })?;
        info!(
            added = report.added,
            updated = report.updated,
            "remote backup restored"
        );
        self.audit(
            "restore",
            None,
            Some(format!("added={} updated={}", report.added, report.updated)),
        )
        .await;
        Ok(report)
    }

    // ── Master password ──────────────────────────────────────────────

    /// Change the master password through `gate`, which must own this
    /// service's session, then queue a backup under the new password so
    /// the remote copy opens with the same password as the local slot.
    pub async fn change_password(
        &self,
        gate: &mut AuthGate,
        old_password: SecretString,
        new_password: SecretString,
        confirmation: SecretString,
    ) -> Result<()> {
        gate.change_password(old_password, new_password, confirmation)
            .await?;
        {
            let session = self.shared.session.read().await;
            let mut loaded = self.shared.loaded.lock().await;
            if let Ok(entry) = current(&mut loaded, &session) {
                self.schedule_backup(&session, &entry.vault);
            }
        }
        self.audit("change_password", None, None).await;
        Ok(())
    }

    /// Wait until queued automatic backups have run.
    pub async fn flush_backups(&self) {
        if let Some(remote) = &self.remote {
            remote.auto.flush().await;
        }
    }

    /// Finish queued backups and stop the worker.
    pub async fn shutdown(&self) {
        if let Some(remote) = &self.remote {
            remote.auto.shutdown().await;
        }
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService")
            .field("toggles", &self.toggles())
            .field("remote", &self.remote.is_some())
            .field("stale_days", &self.stale_days)
            .finish_non_exhaustive()
    }
}

fn unlocked_secret(session: &Session) -> Result<&SecretString> {
    if !session.is_unlocked() {
        return Err(CredVaultError::SessionLocked);
    }
    session.secret().ok_or(CredVaultError::SessionLocked)
}

/// The kept vault, if it belongs to the current session epoch.  A vault
/// from an earlier epoch is dropped.
fn current<'a>(
    loaded: &'a mut Option<LoadedVault>,
    session: &Session,
) -> Result<&'a mut LoadedVault> {
    let fresh = session.is_unlocked()
        && loaded
            .as_ref()
            .is_some_and(|l| l.epoch == session.epoch());
    if !fresh {
        *loaded = None;
        return Err(CredVaultError::SessionLocked);
    }
    loaded.as_mut().ok_or(CredVaultError::SessionLocked)
}
