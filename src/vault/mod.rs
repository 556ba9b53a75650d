//! Vault module: the credential data model and its encrypted storage.
//!
//! This module provides:
//! - `Credential`, `CredentialType` and `NewCredential` (`credential`)
//! - The `Vault` value with CRUD, search and backup staleness (`data`)
//! - Local persisted slots (`slot`)
//! - `VaultStore` for saving and loading the encrypted vault (`store`)

pub mod credential;
pub mod data;
pub mod slot;
pub mod store;

// Re-export the most commonly used items.
pub use credential::{mask_value, Credential, CredentialFilter, CredentialType, NewCredential};
pub use data::Vault;
pub use slot::{FileSlot, MemorySlot, MemorySlots, NamedMemorySlot, Slot};
pub use store::VaultStore;
