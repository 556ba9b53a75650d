//! The `Vault` value: the unit that gets encrypted, saved, exported and
//! backed up.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential::{Credential, CredentialFilter, NewCredential};
use crate::errors::{CredVaultError, Result};

/// All credentials plus backup bookkeeping.
///
/// `credentials` keeps insertion order and never holds two entries with
/// the same id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub credentials: Vec<Credential>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_backup: Option<DateTime<Utc>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Vec<Credential>) -> Result<Self> {
        let vault = Self {
            credentials,
            last_backup: None,
        };
        vault.validate()?;
        Ok(vault)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Create a credential from `fields` and append it.
    pub fn add(&mut self, fields: NewCredential) -> Result<&Credential> {
        let mut credential = Credential::create(fields)?;
        // 36^26 ids; a clash means the RNG is broken, but keep the invariant anyway.
        while self.contains(&credential.id) {
            credential.id = super::credential::generate_id();
        }
        let index = self.credentials.len();
        self.credentials.push(credential);
        Ok(&self.credentials[index])
    }

    /// Append an existing credential, keeping its id.
    pub fn insert(&mut self, credential: Credential) -> Result<()> {
        if self.contains(&credential.id) {
            return Err(CredVaultError::DuplicateCredential(credential.id));
        }
        self.credentials.push(credential);
        Ok(())
    }

    /// Replace the editable fields of credential `id`.
    pub fn update(&mut self, id: &str, fields: NewCredential) -> Result<&Credential> {
        let credential = self
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CredVaultError::CredentialNotFound(id.to_string()))?;
        credential.apply(fields)?;
        Ok(&*credential)
    }

    /// Remove credential `id` and return it.
    pub fn remove(&mut self, id: &str) -> Result<Credential> {
        let index = self
            .credentials
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| CredVaultError::CredentialNotFound(id.to_string()))?;
        Ok(self.credentials.remove(index))
    }

    /// Credentials matching `filter`, in vault order.
    pub fn filter<'a>(&'a self, filter: &'a CredentialFilter) -> impl Iterator<Item = &'a Credential> {
        self.credentials.iter().filter(move |c| filter.matches(c))
    }

    /// Whole days since the last backup, or `None` if there never was one.
    pub fn days_since_backup(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_backup
            .map(|last| (now - last).num_days().max(0))
    }

    /// True if there never was a backup or the last one is more than
    /// `stale_days` old.
    pub fn needs_backup(&self, now: DateTime<Utc>, stale_days: u32) -> bool {
        match self.days_since_backup(now) {
            Some(days) => days > i64::from(stale_days),
            None => true,
        }
    }

    /// Check the structural invariants: unique non-empty ids and
    /// `updated_at >= created_at`.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.credentials.len());
        for (index, credential) in self.credentials.iter().enumerate() {
            if credential.id.is_empty() {
                return Err(CredVaultError::ValidationError(format!(
                    "credential #{index} has an empty id"
                )));
            }
            if !seen.insert(credential.id.as_str()) {
                return Err(CredVaultError::ValidationError(format!(
                    "duplicate credential id '{}'",
                    credential.id
                )));
            }
            if credential.updated_at < credential.created_at {
                return Err(CredVaultError::ValidationError(format!(
                    "credential '{}' was updated before it was created",
                    credential.id
                )));
            }
        }
        Ok(())
    }
}
