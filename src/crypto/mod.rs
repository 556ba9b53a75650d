//! Cryptographic primitives for CredVault.
//!
//! This module provides:
//! - AES-256-GCM encryption and decryption (`encryption`)
//! - Argon2id password-based key derivation (`kdf`)
//! - HKDF-based sub-key derivation (`keys`)
//! - The password-to-blob `Cipher` used for the local slot, export
//!   files and remote backups (`cipher`)

pub mod cipher;
pub mod encryption;
pub mod kdf;
pub mod keys;

// Re-export the most commonly used items so callers can write:
//   use crate::crypto::{Cipher, EncryptedBlob, KdfParams};
pub use cipher::{Cipher, EncryptedBlob};
pub use kdf::{derive_master_key, generate_salt, KdfParams};
pub use keys::MasterKey;
