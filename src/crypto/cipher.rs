//! Password-based encryption of a whole `Vault` into one opaque string.
//!
//! An `EncryptedBlob` is standard base64 of:
//!
//! ```text
//! [OSFM: 4 bytes][version: 1 byte][m_kib u32 LE][t u32 LE][p u32 LE][salt: 16 bytes][nonce: 12 bytes][ciphertext + tag]
//! ```
//!
//! The header (everything before the nonce) is fed to AES-GCM as
//! associated data, so editing the KDF parameters or salt is detected
//! the same way as editing the ciphertext.
//!
//! Every decryption failure is `WrongPasswordOrCorrupt`.  Malformed
//! envelopes still pay for one key derivation before failing so the
//! time taken does not reveal whether the password or the data was bad.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::encryption::{self, NONCE_LEN, TAG_LEN};
use super::kdf::{generate_salt, KdfParams, SALT_LEN};
use super::keys::MasterKey;
use crate::errors::{CredVaultError, Result};
use crate::vault::Vault;

/// Magic bytes at the start of every decoded blob.
const MAGIC: &[u8; 4] = b"OSFM";

/// Current envelope version.
pub const BLOB_VERSION: u8 = 1;

/// 4 (magic) + 1 (version) + 12 (KDF params) + 16 (salt).
const HEADER_LEN: usize = 4 + 1 + 12 + SALT_LEN;

/// Opaque authenticated ciphertext representing an encrypted vault.
///
/// Everything needed to decrypt it (except the password) is inside
/// the single string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// True if the string decodes to a framed envelope with acceptable
    /// KDF parameters.  Says nothing about the password.
    pub fn is_well_formed(&self) -> bool {
        BASE64
            .decode(self.0.trim())
            .is_ok_and(|raw| Envelope::parse(&raw).is_some())
    }
}

impl From<String> for EncryptedBlob {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Parsed view of a decoded blob.
struct Envelope<'a> {
    params: KdfParams,
    salt: &'a [u8],
    header: &'a [u8],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            return None;
        }
        if &raw[0..4] != MAGIC || raw[4] != BLOB_VERSION {
            return None;
        }

        let read_u32 = |at: usize| -> Option<u32> {
            raw.get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
        };
        let params = KdfParams::new(read_u32(5)?, read_u32(9)?, read_u32(13)?);
        params.validate().ok()?;

        let (header, sealed) = raw.split_at(HEADER_LEN);
        Some(Self {
            params,
            salt: &header[17..HEADER_LEN],
            header,
            sealed,
        })
    }
}

fn build_header(params: &KdfParams, salt: &[u8; SALT_LEN]) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(BLOB_VERSION);
    header.extend_from_slice(&params.memory_kib.to_le_bytes());
    header.extend_from_slice(&params.iterations.to_le_bytes());
    header.extend_from_slice(&params.parallelism.to_le_bytes());
    header.extend_from_slice(salt);
    header
}

/// Copy a secret into a new owned `SecretString`.
///
/// Needed when a secret has to move into a blocking task.
pub(crate) fn duplicate_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// Encrypts and decrypts vaults with a password.
///
/// Holds the KDF parameters used for *new* blobs; decryption always
/// uses the parameters recorded in the blob itself.
#[derive(Debug, Clone, Copy)]
pub struct Cipher {
    params: KdfParams,
}

impl Default for Cipher {
    fn default() -> Self {
        Self {
            params: KdfParams::default(),
        }
    }
}

impl Cipher {
    pub fn new(params: KdfParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Serialize and encrypt a vault.  Repeated calls with the same
    /// input produce different output (fresh salt and nonce each time).
    pub fn encrypt(&self, vault: &Vault, password: &SecretString) -> Result<EncryptedBlob> {
        let payload = Zeroizing::new(
            serde_json::to_vec(vault)
                .map_err(|e| CredVaultError::SerializationError(format!("vault: {e}")))?,
        );
        self.seal_payload(&payload, password)
    }

    /// Decrypt a blob and check that it holds a well-formed vault.
    pub fn decrypt(&self, blob: &EncryptedBlob, password: &SecretString) -> Result<Vault> {
        let plaintext = self.open_payload(blob, password)?;
        let vault: Vault = serde_json::from_slice(&plaintext)
            .map_err(|_| CredVaultError::WrongPasswordOrCorrupt)?;
        vault
            .validate()
            .map_err(|_| CredVaultError::WrongPasswordOrCorrupt)?;
        Ok(vault)
    }

    /// Encrypt raw bytes into a blob.
    pub fn seal_payload(&self, payload: &[u8], password: &SecretString) -> Result<EncryptedBlob> {
        let salt = generate_salt();
        let header = build_header(&self.params, &salt);

        let master = MasterKey::derive(password.expose_secret().as_bytes(), &salt, &self.params)?;
        let key = master.blob_key()?;
        let sealed = encryption::encrypt(&key[..], payload, &header)?;

        let mut raw = header;
        raw.extend_from_slice(&sealed);
        Ok(EncryptedBlob(BASE64.encode(raw)))
    }

    /// Decrypt a blob into the raw serialized bytes, without checking
    /// their shape.  Import uses this so it can report shape problems
    /// as validation errors.
    pub fn open_payload(
        &self,
        blob: &EncryptedBlob,
        password: &SecretString,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let raw = BASE64.decode(blob.as_str().trim()).unwrap_or_default();
        let password = password.expose_secret().as_bytes();

        match Envelope::parse(&raw) {
            Some(envelope) => {
                let master = MasterKey::derive(password, envelope.salt, &envelope.params)
                    .map_err(|_| CredVaultError::WrongPasswordOrCorrupt)?;
                let key = master
                    .blob_key()
                    .map_err(|_| CredVaultError::WrongPasswordOrCorrupt)?;
                encryption::decrypt(&key[..], envelope.sealed, envelope.header)
                    .map(Zeroizing::new)
            }
            None => {
                let _ = MasterKey::derive(password, &[0u8; SALT_LEN], &self.params);
                Err(CredVaultError::WrongPasswordOrCorrupt)
            }
        }
    }

    /// `encrypt` on the blocking pool so slow key derivation does not
    /// stall the caller's executor.
    pub async fn encrypt_async(
        &self,
        vault: &Vault,
        password: &SecretString,
    ) -> Result<EncryptedBlob> {
        let cipher = *self;
        let vault = vault.clone();
        let password = duplicate_secret(password);
        run_blocking(move || cipher.encrypt(&vault, &password)).await
    }

    /// `decrypt` on the blocking pool.
    pub async fn decrypt_async(
        &self,
        blob: &EncryptedBlob,
        password: &SecretString,
    ) -> Result<Vault> {
        let cipher = *self;
        let blob = blob.clone();
        let password = duplicate_secret(password);
        run_blocking(move || cipher.decrypt(&blob, &password)).await
    }

    /// `open_payload` on the blocking pool.
    pub async fn open_payload_async(
        &self,
        blob: &EncryptedBlob,
        password: &SecretString,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = *self;
        let blob = blob.clone();
        let password = duplicate_secret(password);
        run_blocking(move || cipher.open_payload(&blob, &password)).await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CredVaultError::EncryptionFailed(format!("crypto task failed: {e}")))?
}
