//! Reconciling two credential collections.
//!
//! Used by import and remote restore.  The rule is union by id with
//! last-write-wins on `updated_at`:
//!
//! - `local` is the base and keeps its order.
//! - An incoming credential whose id is new is appended, in incoming order.
//! - An incoming credential whose id exists replaces the local one only if
//!   its `updated_at` is strictly greater.  Ties keep the local entry.
//!
//! Deletions are not tracked, so a credential removed locally but still
//! present in an older backup comes back after a restore.

use std::collections::HashMap;

use tracing::debug;

use crate::vault::{Credential, Vault};

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Incoming credentials whose id was not present locally.
    pub added: usize,
    /// Local credentials replaced by a newer incoming version.
    pub updated: usize,
    /// Incoming credentials ignored because the local one was as new or newer.
    pub unchanged: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0
    }
}

/// Merge `incoming` into a copy of `local`.
pub fn merge_credentials(local: &[Credential], incoming: &[Credential]) -> Vec<Credential> {
    let mut merged = local.to_vec();
    merge_in_place(&mut merged, incoming.iter().cloned());
    merged
}

/// Merge `incoming` into `vault.credentials`, leaving `last_backup` alone.
pub fn merge_into(vault: &mut Vault, incoming: Vec<Credential>) -> MergeReport {
    let report = merge_in_place(&mut vault.credentials, incoming);
    debug!(
        added = report.added,
        updated = report.updated,
        unchanged = report.unchanged,
        "merged credentials"
    );
    report
}

fn merge_in_place<I>(base: &mut Vec<Credential>, incoming: I) -> MergeReport
where
    I: IntoIterator<Item = Credential>,
{
    let mut index: HashMap<String, usize> = base
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();
    let mut report = MergeReport::default();

    for candidate in incoming {
        match index.get(&candidate.id) {
            Some(&at) => {
                if candidate.updated_at > base[at].updated_at {
                    base[at] = candidate;
                    report.updated += 1;
                } else {
                    report.unchanged += 1;
                }
            }
            None => {
                index.insert(candidate.id.clone(), base.len());
                base.push(candidate);
                report.added += 1;
            }
        }
    }

    report
}
