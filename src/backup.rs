//! Remote backup and restore of the encrypted vault.
//!
//! The remote payload is the same `EncryptedBlob` that sits in the local
//! slot, encrypted with the session password, so the remote store never
//! sees plaintext.  The backup file lives in a well-known folder and is
//! overwritten on every backup.
//!
//! `AutoBackup` runs backups triggered by vault edits on one worker task.
//! A newer snapshot replaces an older one that has not started yet, and
//! a backup never starts while another is running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{Cipher, EncryptedBlob};
use crate::errors::{CredVaultError, Result};
use crate::remote::{AccessToken, FileMeta, RemoteStore};
use crate::transfer::validate_import;
use crate::vault::credential::now_millis;
use crate::vault::Vault;

/// Folder and file name of the remote backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub folder_name: String,
    pub file_name: String,
}

impl BackupTarget {
    pub fn new(folder_name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            folder_name: folder_name.into(),
            file_name: file_name.into(),
        }
    }
}

impl Default for BackupTarget {
    fn default() -> Self {
        Self::new("OSFM Credentials Manager", "osfm-creds-backup.osfmdb")
    }
}

fn require_token(token: Option<&AccessToken>) -> Result<&AccessToken> {
    match token {
        Some(token) if !token.is_expired(Utc::now()) => Ok(token),
        _ => Err(CredVaultError::NotAuthenticated),
    }
}

/// Uploads and downloads vault backups.
pub struct BackupOrchestrator {
    remote: Arc<dyn RemoteStore>,
    cipher: Cipher,
    target: BackupTarget,
    /// One backup or restore at a time.
    run_lock: Mutex<()>,
}

impl BackupOrchestrator {
    pub fn new(remote: Arc<dyn RemoteStore>, cipher: Cipher, target: BackupTarget) -> Self {
        Self {
            remote,
            cipher,
            target,
            run_lock: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &BackupTarget {
        &self.target
    }

    /// Encrypt `vault` and upload it, creating the folder and file if
    /// needed.  Returns the new `last_backup` marker.
    pub async fn backup(
        &self,
        vault: &Vault,
        password: &SecretString,
        token: Option<&AccessToken>,
    ) -> Result<DateTime<Utc>> {
        let token = require_token(token)?;
        let _guard = self.run_lock.lock().await;

        let blob = self.cipher.encrypt_async(vault, password).await?;
        let folder_id = self.find_or_create_folder(token).await?;

        let existing = self
            .remote
            .list_files(token, &self.target.file_name, &folder_id)
            .await?;
        match existing.first() {
            Some(file_id) => {
                self.remote
                    .update_file(token, file_id, blob.as_bytes())
                    .await?;
            }
            None => {
                let meta = FileMeta::new(&self.target.file_name, &folder_id);
                self.remote
                    .create_file(token, &meta, blob.as_bytes())
                    .await?;
            }
        }

        let at = now_millis();
        info!(credentials = vault.len(), at = %at, "remote backup uploaded");
        Ok(at)
    }

    /// Download and decrypt the remote backup.
    ///
    /// The returned vault has not been merged or persisted.
    pub async fn restore(
        &self,
        password: &SecretString,
        token: Option<&AccessToken>,
    ) -> Result<Vault> {
        let token = require_token(token)?;
        let _guard = self.run_lock.lock().await;

        let file_id = self.find_backup_file(token).await?;
        let content = self.remote.get_file_content(token, &file_id).await?;

        let text = String::from_utf8(content)
            .map_err(|_| CredVaultError::CorruptBackup("backup is not text".into()))?;
        let blob = EncryptedBlob::new(text);
        if !blob.is_well_formed() {
            return Err(CredVaultError::CorruptBackup(
                "backup is not an encrypted vault".into(),
            ));
        }

        let payload = self.cipher.open_payload_async(&blob, password).await?;
        let vault = validate_import(&payload).map_err(|e| match e {
            CredVaultError::ValidationError(detail) => CredVaultError::CorruptBackup(detail),
            other => other,
        })?;

        info!(credentials = vault.len(), "remote backup downloaded");
        Ok(vault)
    }

    async fn find_or_create_folder(&self, token: &AccessToken) -> Result<String> {
        let folders = self
            .remote
            .list_folders(token, &self.target.folder_name)
            .await?;
        if let Some(id) = folders.into_iter().next() {
            return Ok(id);
        }
        debug!(folder = %self.target.folder_name, "creating backup folder");
        self.remote
            .create_folder(token, &self.target.folder_name)
            .await
    }

    async fn find_backup_file(&self, token: &AccessToken) -> Result<String> {
        let folders = self
            .remote
            .list_folders(token, &self.target.folder_name)
            .await?;
        for folder_id in &folders {
            let files = self
                .remote
                .list_files(token, &self.target.file_name, folder_id)
                .await?;
            if let Some(id) = files.into_iter().next() {
                return Ok(id);
            }
        }
        Err(CredVaultError::NoBackupFound)
    }
}

impl std::fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

// ── Automatic backups ────────────────────────────────────────────────

/// A vault snapshot waiting to be backed up.
pub struct BackupJob {
    pub vault: Vault,
    pub password: SecretString,
    pub token: AccessToken,
    /// Session epoch the snapshot was taken in.
    pub epoch: u64,
    /// Key generation of `password` within that epoch.
    pub key_generation: u64,
}

impl std::fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupJob")
            .field("credentials", &self.vault.len())
            .field("epoch", &self.epoch)
            .field("key_generation", &self.key_generation)
            .finish_non_exhaustive()
    }
}

/// Hook for the outcome of automatic backups.
#[async_trait]
pub trait BackupObserver: Send + Sync {
    /// Called right before a job runs.  Returns the job to run, which may
    /// be a re-keyed copy, or `None` to drop it.
    async fn prepare(&self, job: Arc<BackupJob>) -> Option<Arc<BackupJob>> {
        Some(job)
    }

    async fn backup_completed(&self, job: &BackupJob, at: DateTime<Utc>);

    async fn backup_failed(&self, job: &BackupJob, error: &CredVaultError);
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl BackupObserver for TracingObserver {
    async fn backup_completed(&self, job: &BackupJob, at: DateTime<Utc>) {
        info!(epoch = job.epoch, at = %at, "automatic backup completed");
    }

    async fn backup_failed(&self, job: &BackupJob, error: &CredVaultError) {
        warn!(epoch = job.epoch, error = %error, "automatic backup failed");
    }
}

/// Sequence number plus the job, `None` once cancelled.
type Queued = (u64, Option<Arc<BackupJob>>);

/// Serialized, coalescing background backups.
pub struct AutoBackup {
    sender: std::sync::Mutex<Option<watch::Sender<Queued>>>,
    next_seq: AtomicU64,
    done: watch::Receiver<u64>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AutoBackup {
    /// Start the worker.  Must be called inside a tokio runtime.
    pub fn spawn(
        orchestrator: Arc<BackupOrchestrator>,
        observer: Arc<dyn BackupObserver>,
        debounce: Duration,
    ) -> Self {
        let (sender, jobs) = watch::channel::<Queued>((0, None));
        let (done_tx, done) = watch::channel(0u64);

        let worker = tokio::spawn(run_worker(orchestrator, observer, debounce, jobs, done_tx));

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            next_seq: AtomicU64::new(0),
            done,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queue `job`, replacing any job that has not started yet.
    pub fn schedule(&self, job: BackupJob) {
        self.send(Some(Arc::new(job)));
    }

    /// Drop the queued job, if it has not started.
    pub fn cancel_pending(&self) {
        self.send(None);
    }

    fn send(&self, job: Option<Arc<BackupJob>>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                sender.send_replace((seq, job));
                return;
            }
        }
        debug!("auto-backup worker stopped; job dropped");
    }

    /// Wait until everything queued so far has been handled.
    pub async fn flush(&self) {
        let target = self.next_seq.load(Ordering::SeqCst);
        let mut done = self.done.clone();
        // Err means the worker exited; nothing left to wait for.
        let _ = done.wait_for(|finished| *finished >= target).await;
    }

    /// Finish queued work and stop the worker.
    pub async fn shutdown(&self) {
        self.flush().await;
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        drop(sender);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for AutoBackup {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for AutoBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoBackup")
            .field("next_seq", &self.next_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    orchestrator: Arc<BackupOrchestrator>,
    observer: Arc<dyn BackupObserver>,
    debounce: Duration,
    mut jobs: watch::Receiver<Queued>,
    done: watch::Sender<u64>,
) {
    while jobs.changed().await.is_ok() {
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }

        let (seq, job) = jobs.borrow_and_update().clone();
        if let Some(queued) = job {
            let epoch = queued.epoch;
            match observer.prepare(queued).await {
                Some(job) => {
                    match orchestrator
                        .backup(&job.vault, &job.password, Some(&job.token))
                        .await
                    {
                        Ok(at) => observer.backup_completed(&job, at).await,
                        Err(e) => observer.backup_failed(&job, &e).await,
                    }
                }
                None => debug!(epoch, "backup dropped before it started"),
            }
        }

        done.send_replace(seq);
    }
    debug!("auto-backup worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::remote::MemoryRemoteStore;
    use crate::vault::{CredentialType, NewCredential};

    fn cipher() -> Cipher {
        Cipher::new(KdfParams::new(8_192, 1, 1)).unwrap()
    }

    fn pw() -> SecretString {
        SecretString::from("master-pw".to_string())
    }

    fn token() -> AccessToken {
        AccessToken::new("token", None)
    }

    fn vault_with(n: usize) -> Vault {
        let mut vault = Vault::new();
        for i in 0..n {
            vault
                .add(NewCredential::new(format!("c{i}"), CredentialType::Api, "v"))
                .unwrap();
        }
        vault
    }

    fn orchestrator(remote: Arc<MemoryRemoteStore>) -> BackupOrchestrator {
        BackupOrchestrator::new(remote, cipher(), BackupTarget::default())
    }

    #[tokio::test]
    async fn backup_requires_valid_token() {
        let orch = orchestrator(Arc::new(MemoryRemoteStore::new()));
        let expired = AccessToken::new("t", Some(Utc::now() - chrono::Duration::seconds(5)));

        assert!(matches!(
            orch.backup(&Vault::new(), &pw(), None).await,
            Err(CredVaultError::NotAuthenticated)
        ));
        assert!(matches!(
            orch.restore(&pw(), Some(&expired)).await,
            Err(CredVaultError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn backup_overwrites_single_encrypted_file() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let orch = orchestrator(remote.clone());

        orch.backup(&vault_with(1), &pw(), Some(&token())).await.unwrap();
        orch.backup(&vault_with(2), &pw(), Some(&token())).await.unwrap();

        let t = token();
        let folders = remote.list_folders(&t, "OSFM Credentials Manager").await.unwrap();
        assert_eq!(folders.len(), 1);
        let files = remote
            .list_files(&t, "osfm-creds-backup.osfmdb", &folders[0])
            .await
            .unwrap();
        assert_eq!(files.len(), 1);

        let content = remote
            .file_content("OSFM Credentials Manager", "osfm-creds-backup.osfmdb")
            .unwrap();
        let text = String::from_utf8(content).unwrap();
        assert!(!text.contains("credentials"));
        assert!(EncryptedBlob::new(text).is_well_formed());

        let restored = orch.restore(&pw(), Some(&token())).await.unwrap();
        assert_eq!(restored.len(), 2);
    }

    #[tokio::test]
    async fn restore_without_backup_is_no_backup_found() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let orch = orchestrator(remote.clone());
        assert!(matches!(
            orch.restore(&pw(), Some(&token())).await,
            Err(CredVaultError::NoBackupFound)
        ));

        // Folder present, file missing.
        remote.create_folder(&token(), "OSFM Credentials Manager").await.unwrap();
        assert!(matches!(
            orch.restore(&pw(), Some(&token())).await,
            Err(CredVaultError::NoBackupFound)
        ));
    }

    #[tokio::test]
    async fn malformed_remote_content_is_corrupt_backup() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let orch = orchestrator(remote.clone());
        let t = token();
        let folder = remote.create_folder(&t, "OSFM Credentials Manager").await.unwrap();
        remote
            .create_file(
                &t,
                &FileMeta::new("osfm-creds-backup.osfmdb", &folder),
                br#"{"credentials": []}"#,
            )
            .await
            .unwrap();

        assert!(matches!(
            orch.restore(&pw(), Some(&t)).await,
            Err(CredVaultError::CorruptBackup(_))
        ));
    }

    #[tokio::test]
    async fn restore_with_other_password_is_wrong_password() {
        let orch = orchestrator(Arc::new(MemoryRemoteStore::new()));
        orch.backup(&vault_with(1), &pw(), Some(&token())).await.unwrap();
        let other = SecretString::from("different".to_string());
        assert!(matches!(
            orch.restore(&other, Some(&token())).await,
            Err(CredVaultError::WrongPasswordOrCorrupt)
        ));
    }

    #[derive(Default)]
    struct Recorder {
        completed: std::sync::Mutex<Vec<u64>>,
        failed: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BackupObserver for Recorder {
        async fn backup_completed(&self, job: &BackupJob, _at: DateTime<Utc>) {
            self.completed.lock().unwrap().push(job.epoch);
        }

        async fn backup_failed(&self, job: &BackupJob, _error: &CredVaultError) {
            self.failed.lock().unwrap().push(job.epoch);
        }
    }

    fn job(n: usize, epoch: u64) -> BackupJob {
        BackupJob {
            vault: vault_with(n),
            password: pw(),
            token: token(),
            epoch,
            key_generation: 0,
        }
    }

    #[tokio::test]
    async fn auto_backup_coalesces_queued_snapshots() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let orch = Arc::new(orchestrator(remote.clone()));
        let recorder = Arc::new(Recorder::default());
        let auto = AutoBackup::spawn(orch.clone(), recorder.clone(), Duration::from_millis(50));

        for n in 1..=5 {
            auto.schedule(job(n, 1));
        }
        auto.flush().await;

        // The debounce window swallowed the intermediate snapshots.
        assert_eq!(remote.upload_count(), 1);
        assert_eq!(*recorder.completed.lock().unwrap(), vec![1]);
        assert_eq!(orch.restore(&pw(), Some(&token())).await.unwrap().len(), 5);

        auto.shutdown().await;
    }

    #[tokio::test]
    async fn auto_backup_failure_goes_to_observer() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_offline(true);
        let recorder = Arc::new(Recorder::default());
        let auto = AutoBackup::spawn(
            Arc::new(orchestrator(remote.clone())),
            recorder.clone(),
            Duration::ZERO,
        );

        auto.schedule(job(1, 7));
        auto.flush().await;

        assert_eq!(*recorder.failed.lock().unwrap(), vec![7]);
        assert!(recorder.completed.lock().unwrap().is_empty());
        auto.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_job_never_uploads() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auto = AutoBackup::spawn(
            Arc::new(orchestrator(remote.clone())),
            Arc::new(TracingObserver),
            Duration::from_millis(50),
        );

        auto.schedule(job(1, 1));
        auto.cancel_pending();
        auto.flush().await;

        assert_eq!(remote.upload_count(), 0);
        auto.shutdown().await;
    }
}
