use thiserror::Error;

/// All errors that can occur in CredVault.
///
/// `Display` output never contains a password, a session secret, an
/// access token, or a credential value.
#[derive(Debug, Error)]
pub enum CredVaultError {
    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: wrong password or corrupted data")]
    WrongPasswordOrCorrupt,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // --- Vault errors ---
    #[error("Credential '{0}' not found")]
    CredentialNotFound(String),

    #[error("Credential '{0}' already exists")]
    DuplicateCredential(String),

    #[error("Invalid vault data: {0}")]
    ValidationError(String),

    #[error("Local storage error: {0}")]
    StorageError(String),

    // --- Remote backup errors ---
    #[error("No backup found in remote storage")]
    NoBackupFound,

    #[error("Not authenticated with remote storage")]
    NotAuthenticated,

    #[error("Remote backup is corrupted: {0}")]
    CorruptBackup(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    // --- Auth errors ---
    #[error("Vault is locked")]
    SessionLocked,

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("Password mismatch: passwords do not match")]
    PasswordMismatch,

    #[error("Password must be at least {0} characters long")]
    WeakPassword(usize),

    #[error("Second-factor authentication failed")]
    SecondFactorFailed,

    #[error("No second factor is registered")]
    SecondFactorUnavailable,

    #[error("Secret cache error: {0}")]
    SecretCacheError(String),

    // --- Transfer errors ---
    #[error("Export is disabled in settings")]
    ExportDisabled,

    #[error("Operation cancelled: the session ended before it completed")]
    Cancelled,

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Audit error: {0}")]
    AuditError(String),
}

/// The user-facing bucket an error falls into.
///
/// Every error maps to exactly one category, and each category has one
/// human-readable message. Raw error detail is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    WrongPassword,
    NoBackup,
    RemoteSignIn,
    CorruptBackup,
    InvalidData,
    Network,
    Locked,
    Password,
    SecondFactor,
    ExportDisabled,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    /// The single message shown to the end user for this category.
    pub fn message(self) -> &'static str {
        match self {
            Self::WrongPassword => "Invalid password or corrupted data.",
            Self::NoBackup => "No backup was found in remote storage.",
            Self::RemoteSignIn => "Connect to remote storage to continue.",
            Self::CorruptBackup => "The remote backup could not be read.",
            Self::InvalidData => "The data is not a valid credential vault.",
            Self::Network => "Remote storage could not be reached. Try again.",
            Self::Locked => "Unlock the vault to continue.",
            Self::Password => "The password does not meet the requirements.",
            Self::SecondFactor => "Device authentication failed. Enter your master password.",
            Self::ExportDisabled => "Exports are disabled in settings.",
            Self::Cancelled => "The operation was cancelled.",
            Self::Internal => "Something went wrong. Please try again.",
        }
    }
}

impl CredVaultError {
    /// Map this error to its user-facing category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::WrongPasswordOrCorrupt => ErrorCategory::WrongPassword,
            Self::NoBackupFound => ErrorCategory::NoBackup,
            Self::NotAuthenticated => ErrorCategory::RemoteSignIn,
            Self::CorruptBackup(_) => ErrorCategory::CorruptBackup,
            Self::ValidationError(_)
            | Self::CredentialNotFound(_)
            | Self::DuplicateCredential(_) => ErrorCategory::InvalidData,
            Self::NetworkFailure(_) => ErrorCategory::Network,
            Self::SessionLocked | Self::InvalidTransition { .. } => ErrorCategory::Locked,
            Self::PasswordMismatch | Self::WeakPassword(_) => ErrorCategory::Password,
            Self::SecondFactorFailed | Self::SecondFactorUnavailable => {
                ErrorCategory::SecondFactor
            }
            Self::ExportDisabled => ErrorCategory::ExportDisabled,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::EncryptionFailed(_)
            | Self::KeyDerivationFailed(_)
            | Self::StorageError(_)
            | Self::SecretCacheError(_)
            | Self::ConfigError(_)
            | Self::Io(_)
            | Self::SerializationError(_)
            | Self::AuditError(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    ///
    /// The core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }
}

/// Convenience type alias for CredVault results.
pub type Result<T> = std::result::Result<T, CredVaultError>;
