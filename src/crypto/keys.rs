//! Sub-key derivation using HKDF-SHA256.
//!
//! The Argon2id output is never used as an encryption key directly;
//! instead HKDF expands it with a context string so the same master key
//! could later feed other purposes without key reuse.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::kdf::{derive_master_key, KdfParams, KEY_LEN};
use crate::errors::{CredVaultError, Result};

/// HKDF `info` for the key that encrypts a vault blob.
const BLOB_KEY_INFO: &[u8] = b"credvault-blob-v1";

/// Run HKDF-SHA256 expand with the given `info`.
///
/// The master key already has high entropy (it came from Argon2id), so
/// no extraction salt is used.
fn hkdf_derive(ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(None, ikm);

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| CredVaultError::KeyDerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(okm)
}

/// A 32-byte master key that zeroes its memory when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Stretch a password into a master key with Argon2id.
    pub fn derive(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<Self> {
        let derived = derive_master_key(password, salt, params)?;
        Ok(Self::new(*derived))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Derive the AES-256-GCM key used for vault blobs.
    pub fn blob_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        hkdf_derive(&self.bytes, BLOB_KEY_INFO)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}
