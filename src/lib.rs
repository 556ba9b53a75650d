#[cfg(feature = "audit-log")]
pub mod audit;
pub mod auth;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod merge;
pub mod remote;
pub mod service;
pub mod transfer;
pub mod vault;

pub use auth::{AuthGate, AuthState, SessionHandle};
pub use backup::{BackupOrchestrator, BackupTarget};
pub use config::Settings;
pub use crypto::{Cipher, EncryptedBlob, KdfParams};
pub use errors::{CredVaultError, ErrorCategory, Result};
pub use merge::{merge_credentials, MergeReport};
pub use service::{CredentialService, SyncToggles};
pub use vault::{Credential, CredentialFilter, CredentialType, NewCredential, Vault, VaultStore};
