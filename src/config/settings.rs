use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::BackupTarget;
use crate::crypto::KdfParams;
use crate::errors::{CredVaultError, Result};

/// Vault configuration, loaded from `credvault.toml`.
///
/// Every field has a sensible default so CredVault works out-of-the-box
/// without any config file at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory (relative to the base dir) holding the local slots.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Slot holding the encrypted vault.
    #[serde(default = "default_slot_name")]
    pub slot_name: String,

    /// Slot holding the registered second-factor reference.
    #[serde(default = "default_second_factor_slot")]
    pub second_factor_slot: String,

    /// Argon2 memory cost in KiB (default: 64 MB).
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,

    /// Argon2 iteration count (default: 3).
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,

    /// Argon2 parallelism degree (default: 4).
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,

    /// Remote folder that holds the backup file.
    #[serde(default = "default_backup_folder_name")]
    pub backup_folder_name: String,

    /// Remote backup file name, overwritten on every backup.
    #[serde(default = "default_backup_file_name")]
    pub backup_file_name: String,

    /// Quiet period before an automatic backup starts.
    #[serde(default = "default_auto_backup_debounce_ms")]
    pub auto_backup_debounce_ms: u64,

    /// A vault whose last backup is older than this needs a new one.
    #[serde(default = "default_backup_stale_days")]
    pub backup_stale_days: u32,

    /// Minimum master password length in characters.
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
}

/// Days after which a backup counts as stale.
pub const DEFAULT_BACKUP_STALE_DAYS: u32 = 7;

/// Shortest master password accepted, in characters.
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 8;

// ── Serde default helpers ────────────────────────────────────────────

fn default_data_dir() -> String {
    ".credvault".to_string()
}

fn default_slot_name() -> String {
    "osfm-creds-encrypted".to_string()
}

fn default_second_factor_slot() -> String {
    "osfm-2fa-credentialId".to_string()
}

fn default_argon2_memory_kib() -> u32 {
    65_536 // 64 MB
}

fn default_argon2_iterations() -> u32 {
    3
}

fn default_argon2_parallelism() -> u32 {
    4
}

fn default_backup_folder_name() -> String {
    "OSFM Credentials Manager".to_string()
}

fn default_backup_file_name() -> String {
    "osfm-creds-backup.osfmdb".to_string()
}

fn default_auto_backup_debounce_ms() -> u64 {
    1_500
}

fn default_backup_stale_days() -> u32 {
    DEFAULT_BACKUP_STALE_DAYS
}

fn default_min_password_len() -> usize {
    DEFAULT_MIN_PASSWORD_LEN
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            slot_name: default_slot_name(),
            second_factor_slot: default_second_factor_slot(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            argon2_parallelism: default_argon2_parallelism(),
            backup_folder_name: default_backup_folder_name(),
            backup_file_name: default_backup_file_name(),
            auto_backup_debounce_ms: default_auto_backup_debounce_ms(),
            backup_stale_days: default_backup_stale_days(),
            min_password_len: default_min_password_len(),
        }
    }
}

impl Settings {
    /// Name of the config file we look for in the base directory.
    pub const FILE_NAME: &'static str = "credvault.toml";

    /// Load settings from `<base_dir>/credvault.toml`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let config_path = base_dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            CredVaultError::ConfigError(format!("Failed to parse {}: {e}", config_path.display()))
        })?;

        settings.kdf_params().validate().map_err(|e| {
            CredVaultError::ConfigError(format!("{}: {e}", config_path.display()))
        })?;

        Ok(settings)
    }

    /// Directory holding the local slots.
    ///
    /// Example: `base_dir/.credvault`
    pub fn data_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.data_dir)
    }

    /// Convert the Argon2 settings into crypto-layer params.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::new(
            self.argon2_memory_kib,
            self.argon2_iterations,
            self.argon2_parallelism,
        )
    }

    /// Where remote backups live.
    pub fn backup_target(&self) -> BackupTarget {
        BackupTarget::new(&self.backup_folder_name, &self.backup_file_name)
    }

    pub fn auto_backup_debounce(&self) -> Duration {
        Duration::from_millis(self.auto_backup_debounce_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
