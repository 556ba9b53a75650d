//! Integration tests for remote backup and restore.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credvault::backup::{AutoBackup, BackupJob, BackupObserver, BackupOrchestrator, BackupTarget};
use credvault::crypto::{Cipher, KdfParams};
use credvault::remote::{AccessToken, FileMeta, MemoryRemoteStore, RemoteStore};
use credvault::vault::{CredentialType, NewCredential, Vault};
use credvault::CredVaultError;
use secrecy::SecretString;

fn password(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

fn token() -> AccessToken {
    AccessToken::new("access-token", None)
}

fn cipher() -> Cipher {
    Cipher::new(KdfParams::new(8_192, 1, 1)).unwrap()
}

fn vault_of(names: &[&str]) -> Vault {
    let mut vault = Vault::new();
    for name in names {
        vault
            .add(NewCredential::new(*name, CredentialType::Password, format!("{name}-secret")))
            .unwrap();
    }
    vault
}

fn orchestrator(remote: Arc<MemoryRemoteStore>) -> BackupOrchestrator {
    BackupOrchestrator::new(remote, cipher(), BackupTarget::default())
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_backup_creates_folder_and_file() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = orchestrator(remote.clone());

    orch.backup(&vault_of(&["a", "b"]), &password("pw"), Some(&token()))
        .await
        .unwrap();

    let t = token();
    assert_eq!(remote.list_folders(&t, "OSFM Credentials Manager").await.unwrap().len(), 1);
    let stored = remote
        .file_content("OSFM Credentials Manager", "osfm-creds-backup.osfmdb")
        .unwrap();
    let text = String::from_utf8(stored).unwrap();
    assert!(!text.contains("a-secret"));
}

#[tokio::test]
async fn second_backup_overwrites_same_file() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = orchestrator(remote.clone());

    orch.backup(&vault_of(&["a"]), &password("pw"), Some(&token()))
        .await
        .unwrap();
    orch.backup(&vault_of(&["a", "b", "c"]), &password("pw"), Some(&token()))
        .await
        .unwrap();

    let t = token();
    let folder = remote
        .list_folders(&t, "OSFM Credentials Manager")
        .await
        .unwrap()
        .remove(0);
    let files = remote
        .list_files(&t, "osfm-creds-backup.osfmdb", &folder)
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(remote.upload_count(), 2);

    let restored = orch.restore(&password("pw"), Some(&t)).await.unwrap();
    assert_eq!(restored.len(), 3);
}

#[tokio::test]
async fn backup_returns_millisecond_timestamp() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let before = Utc::now() - chrono::Duration::seconds(1);
    let at = orchestrator(remote)
        .backup(&vault_of(&["a"]), &password("pw"), Some(&token()))
        .await
        .unwrap();
    assert!(at > before);
    assert_eq!(at.timestamp_subsec_nanos() % 1_000_000, 0);
}

#[tokio::test]
async fn backup_without_token_is_not_authenticated() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let result = orchestrator(remote.clone())
        .backup(&vault_of(&["a"]), &password("pw"), None)
        .await;
    assert!(matches!(result, Err(CredVaultError::NotAuthenticated)));
    assert_eq!(remote.upload_count(), 0);
}

#[tokio::test]
async fn restore_without_backup_is_no_backup_found() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let result = orchestrator(remote).restore(&password("pw"), Some(&token())).await;
    assert!(matches!(result, Err(CredVaultError::NoBackupFound)));
}

#[tokio::test]
async fn restore_with_wrong_password_fails() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = orchestrator(remote);
    orch.backup(&vault_of(&["a"]), &password("right"), Some(&token()))
        .await
        .unwrap();

    let result = orch.restore(&password("wrong"), Some(&token())).await;
    assert!(matches!(result, Err(CredVaultError::WrongPasswordOrCorrupt)));
}

#[tokio::test]
async fn restore_of_garbage_is_corrupt_backup() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let t = token();
    let folder = remote
        .create_folder(&t, "OSFM Credentials Manager")
        .await
        .unwrap();
    remote
        .create_file(
            &t,
            &FileMeta::new("osfm-creds-backup.osfmdb", &folder),
            b"{\"credentials\": []}",
        )
        .await
        .unwrap();

    let result = orchestrator(remote).restore(&password("pw"), Some(&t)).await;
    assert!(matches!(result, Err(CredVaultError::CorruptBackup(_))));
}

#[tokio::test]
async fn offline_remote_is_retryable_network_failure() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_offline(true);
    let err = orchestrator(remote)
        .backup(&vault_of(&["a"]), &password("pw"), Some(&token()))
        .await
        .unwrap_err();
    assert!(matches!(err, CredVaultError::NetworkFailure(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn custom_target_names_are_used() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = BackupOrchestrator::new(
        remote.clone(),
        cipher(),
        BackupTarget::new("Team Vault", "team.osfmdb"),
    );
    orch.backup(&vault_of(&["a"]), &password("pw"), Some(&token()))
        .await
        .unwrap();
    assert!(remote.file_content("Team Vault", "team.osfmdb").is_some());
    assert!(remote
        .file_content("OSFM Credentials Manager", "osfm-creds-backup.osfmdb")
        .is_none());
}

// ---------------------------------------------------------------------------
// Automatic backups
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counting {
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[async_trait]
impl BackupObserver for Counting {
    async fn backup_completed(&self, _job: &BackupJob, _at: DateTime<Utc>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn backup_failed(&self, _job: &BackupJob, _error: &CredVaultError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

fn job(vault: Vault, epoch: u64) -> BackupJob {
    BackupJob {
        vault,
        password: password("pw"),
        token: token(),
        epoch,
        key_generation: 0,
    }
}

#[tokio::test]
async fn burst_of_changes_uploads_latest_snapshot_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = Arc::new(orchestrator(remote.clone()));
    let observer = Arc::new(Counting::default());
    let auto = AutoBackup::spawn(orch.clone(), observer.clone(), Duration::from_millis(50));

    auto.schedule(job(vault_of(&["a"]), 1));
    auto.schedule(job(vault_of(&["a", "b"]), 1));
    auto.schedule(job(vault_of(&["a", "b", "c"]), 1));
    auto.flush().await;

    assert_eq!(remote.upload_count(), 1);
    assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
    let restored = orch.restore(&password("pw"), Some(&token())).await.unwrap();
    assert_eq!(restored.len(), 3);

    auto.shutdown().await;
}

#[tokio::test]
async fn failures_are_reported_and_later_jobs_still_run() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = Arc::new(orchestrator(remote.clone()));
    let observer = Arc::new(Counting::default());
    let auto = AutoBackup::spawn(orch, observer.clone(), Duration::ZERO);

    remote.set_offline(true);
    auto.schedule(job(vault_of(&["a"]), 1));
    auto.flush().await;
    assert_eq!(observer.failed.load(Ordering::SeqCst), 1);

    remote.set_offline(false);
    auto.schedule(job(vault_of(&["a"]), 1));
    auto.flush().await;
    assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
    assert_eq!(remote.upload_count(), 1);

    auto.shutdown().await;
}

/// Re-encrypts every job under a fixed newer password.
struct Rekey;

#[async_trait]
impl BackupObserver for Rekey {
    async fn prepare(&self, job: Arc<BackupJob>) -> Option<Arc<BackupJob>> {
        Some(Arc::new(BackupJob {
            vault: job.vault.clone(),
            password: password("rotated"),
            token: job.token.clone(),
            epoch: job.epoch,
            key_generation: job.key_generation + 1,
        }))
    }

    async fn backup_completed(&self, _job: &BackupJob, _at: DateTime<Utc>) {}

    async fn backup_failed(&self, _job: &BackupJob, _error: &CredVaultError) {}
}

#[tokio::test]
async fn observer_can_rekey_a_queued_job() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let orch = Arc::new(orchestrator(remote));
    let auto = AutoBackup::spawn(orch.clone(), Arc::new(Rekey), Duration::ZERO);

    auto.schedule(job(vault_of(&["a"]), 1));
    auto.flush().await;

    assert!(orch.restore(&password("pw"), Some(&token())).await.is_err());
    assert_eq!(
        orch.restore(&password("rotated"), Some(&token())).await.unwrap().len(),
        1
    );
    auto.shutdown().await;
}
