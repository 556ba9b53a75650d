//! Export and import of encrypted vault files.
//!
//! An export file holds exactly one `EncryptedBlob`, encrypted with an
//! export password that may differ from the master password.  Importing
//! checks the decrypted JSON shape before any credential reaches a merge.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, info};

use crate::crypto::{Cipher, EncryptedBlob};
use crate::errors::{CredVaultError, Result};
use crate::vault::Vault;

/// Extension of export files.
pub const EXPORT_EXTENSION: &str = "osfmdb";

const EXPORT_PREFIX: &str = "osfm-creds-backup";

/// `osfm-creds-backup-YYYY-MM-DD.osfmdb`
pub fn export_file_name(date: NaiveDate) -> String {
    format!("{EXPORT_PREFIX}-{}.{EXPORT_EXTENSION}", date.format("%Y-%m-%d"))
}

/// Encrypt `vault` with `password` and write it to `path`.
pub async fn write_export(
    vault: &Vault,
    password: &SecretString,
    cipher: &Cipher,
    path: &Path,
) -> Result<()> {
    if vault.is_empty() {
        return Err(CredVaultError::ValidationError(
            "nothing to export: the vault is empty".into(),
        ));
    }

    let blob = cipher.encrypt_async(vault, password).await?;
    tokio::fs::write(path, blob.as_str()).await?;
    info!(credentials = vault.len(), path = %path.display(), "vault exported");
    Ok(())
}

/// Export into `dir` under the dated file name and return the full path.
pub async fn export_to_dir(
    vault: &Vault,
    password: &SecretString,
    cipher: &Cipher,
    dir: &Path,
    date: NaiveDate,
) -> Result<PathBuf> {
    let path = dir.join(export_file_name(date));
    write_export(vault, password, cipher, &path).await?;
    Ok(path)
}

/// Read and decrypt an export file.
///
/// A wrong password or damaged file is `WrongPasswordOrCorrupt`; a file
/// that decrypts but does not hold a vault is `ValidationError`.
pub async fn import_from_file(
    path: &Path,
    password: &SecretString,
    cipher: &Cipher,
) -> Result<Vault> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            CredVaultError::WrongPasswordOrCorrupt
        } else {
            CredVaultError::Io(e)
        }
    })?;

    let payload = cipher
        .open_payload_async(&EncryptedBlob::new(content), password)
        .await?;
    let vault = validate_import(&payload)?;
    debug!(credentials = vault.len(), path = %path.display(), "import file decoded");
    Ok(vault)
}

/// Check that decrypted bytes describe a vault and build it.
pub fn validate_import(payload: &[u8]) -> Result<Vault> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| CredVaultError::ValidationError(format!("not valid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| CredVaultError::ValidationError("top level must be an object".into()))?;

    let credentials = object
        .get("credentials")
        .ok_or_else(|| CredVaultError::ValidationError("missing 'credentials'".into()))?;
    let items = credentials
        .as_array()
        .ok_or_else(|| CredVaultError::ValidationError("'credentials' must be an array".into()))?;

    for (index, item) in items.iter().enumerate() {
        if !item.is_object() {
            return Err(CredVaultError::ValidationError(format!(
                "credential #{index} is not an object"
            )));
        }
    }

    let vault: Vault = serde_json::from_value(value)
        .map_err(|e| CredVaultError::ValidationError(format!("invalid credential data: {e}")))?;
    vault.validate()?;
    Ok(vault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::vault::{CredentialType, NewCredential};
    use tempfile::TempDir;

    fn cipher() -> Cipher {
        Cipher::new(KdfParams::new(8_192, 1, 1)).unwrap()
    }

    fn pw(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn file_name_is_dated() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(export_file_name(date), "osfm-creds-backup-2024-03-09.osfmdb");
    }

    #[test]
    fn validate_rejects_wrong_shapes() {
        let cases: [&[u8]; 6] = [
            b"[]",
            br#"{"items": []}"#,
            br#"{"credentials": {}}"#,
            br#"{"credentials": [1, 2]}"#,
            br#"{"credentials": [{"id": "a"}]}"#,
            b"garbage",
        ];
        for bad in cases {
            assert!(
                matches!(validate_import(bad), Err(CredVaultError::ValidationError(_))),
                "accepted {}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn validate_accepts_minimal_vault() {
        let vault = validate_import(br#"{"credentials": []}"#).unwrap();
        assert!(vault.is_empty());
    }

    #[tokio::test]
    async fn empty_vault_is_not_exported() {
        let dir = TempDir::new().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let result = export_to_dir(&Vault::new(), &pw("pw"), &cipher(), dir.path(), date).await;
        assert!(matches!(result, Err(CredVaultError::ValidationError(_))));
    }

    #[tokio::test]
    async fn import_with_wrong_password_fails() {
        let dir = TempDir::new().unwrap();
        let mut vault = Vault::new();
        vault
            .add(NewCredential::new("k", CredentialType::Api, "v"))
            .unwrap();
        let path = dir.path().join("x.osfmdb");
        write_export(&vault, &pw("right"), &cipher(), &path).await.unwrap();

        assert!(matches!(
            import_from_file(&path, &pw("wrong"), &cipher()).await,
            Err(CredVaultError::WrongPasswordOrCorrupt)
        ));
    }

    #[tokio::test]
    async fn authenticated_but_invalid_payload_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.osfmdb");
        let blob = cipher()
            .seal_payload(br#"{"credentials": "nope"}"#, &pw("pw"))
            .unwrap();
        std::fs::write(&path, blob.as_str()).unwrap();

        assert!(matches!(
            import_from_file(&path, &pw("pw"), &cipher()).await,
            Err(CredVaultError::ValidationError(_))
        ));
    }
}
