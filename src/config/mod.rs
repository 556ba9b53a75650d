//! Configuration loaded from `credvault.toml`.

pub mod settings;

pub use settings::{Settings, DEFAULT_BACKUP_STALE_DAYS, DEFAULT_MIN_PASSWORD_LEN};
