//! Credential types stored inside a vault.
//!
//! Field names and timestamp encoding (epoch milliseconds) match the
//! JSON written by earlier releases, so old export files and backups
//! still deserialize.

use std::collections::BTreeSet;

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{CredVaultError, Result};

/// Length of generated credential ids.
const ID_LEN: usize = 26;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// What kind of secret a credential holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Api,
    Ssh,
    Gpg,
    Password,
    Other,
}

impl CredentialType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Ssh => "ssh",
            Self::Gpg => "gpg",
            Self::Password => "password",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single credential stored in the vault.
///
/// `id` never changes once assigned.  `Debug` output masks `value`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,

    pub name: String,

    #[serde(rename = "type")]
    pub kind: CredentialType,

    /// The secret itself (API key, private key, password, ...).
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential with a fresh id and both timestamps set to now.
    pub fn create(fields: NewCredential) -> Result<Self> {
        fields.validate()?;
        let now = now_millis();
        Ok(Self {
            id: generate_id(),
            name: fields.name,
            kind: fields.kind,
            value: fields.value,
            description: fields.description,
            tags: fields.tags,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the editable fields, keeping `id` and `created_at`.
    ///
    /// `updated_at` always moves forward, even if the wall clock went
    /// backwards, so a merge treats the edit as newer.
    pub fn apply(&mut self, fields: NewCredential) -> Result<()> {
        fields.validate()?;
        let now = now_millis();
        let floor = self
            .updated_at
            .checked_add_signed(chrono::Duration::milliseconds(1))
            .ok_or_else(|| {
                CredVaultError::ValidationError(format!(
                    "credential '{}' has an updatedAt too far in the future to edit",
                    self.id
                ))
            })?;

        self.name = fields.name;
        self.kind = fields.kind;
        self.value = fields.value;
        self.description = fields.description;
        self.tags = fields.tags;
        self.updated_at = now.max(floor);
        Ok(())
    }

    /// The value with everything but the edges hidden, for display.
    pub fn masked_value(&self) -> String {
        mask_value(&self.value)
    }

    /// Case-insensitive match on name or description.
    pub fn matches_search(&self, term: &str) -> bool {
        if term.is_empty() {
            return true;
        }
        let term = term.to_lowercase();
        self.name.to_lowercase().contains(&term)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&term))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &"[REDACTED]")
            .field("description", &self.description)
            .field("tags", &self.tags)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// The user-editable fields of a credential.
#[derive(Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub name: String,
    pub kind: CredentialType,
    pub value: String,
    pub description: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

impl NewCredential {
    pub fn new(name: impl Into<String>, kind: CredentialType, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
            description: None,
            tags: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CredVaultError::ValidationError(
                "credential name cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewCredential")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Which credentials to show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFilter {
    /// Substring searched in name and description (case-insensitive).
    pub search: String,
    /// `None` means all types.
    pub kind: Option<CredentialType>,
}

impl CredentialFilter {
    pub fn matches(&self, credential: &Credential) -> bool {
        credential.matches_search(&self.search)
            && self.kind.map_or(true, |kind| credential.kind == kind)
    }
}

/// Current time truncated to milliseconds, the precision stored on disk.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Generate a random credential id of lowercase letters and digits.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())]))
        .collect()
}

/// Mask a secret value for display: `"sk-...xyz"` style.
///
/// Short values are fully masked.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}...{tail}")
}
