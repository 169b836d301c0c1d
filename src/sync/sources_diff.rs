//! # Source-Membership Differ
//!
//! Computes the minimal set of service-membership edits that turns a repo's
//! stored sources into its reconciled sources.

use std::collections::{BTreeMap, HashMap};

use crate::sync::diff::Diff;
use crate::types::{Repo, RepoId, SourceInfo};

/// Membership edits keyed by repo ID.
pub type SourcesByRepo = BTreeMap<RepoId, Vec<SourceInfo>>;

/// Membership edits for a single repo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceChanges {
    pub added: Vec<SourceInfo>,
    pub modified: Vec<SourceInfo>,
    pub deleted: Vec<SourceInfo>,
}

impl SourceChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Membership edits for a whole diff, ready for the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcesDiff {
    pub added: SourcesByRepo,
    pub modified: SourcesByRepo,
    pub deleted: SourcesByRepo,
}

impl SourcesDiff {
    fn record(&mut self, repo_id: RepoId, changes: SourceChanges) {
        if !changes.added.is_empty() {
            self.added.entry(repo_id).or_default().extend(changes.added);
        }
        if !changes.modified.is_empty() {
            self.modified.entry(repo_id).or_default().extend(changes.modified);
        }
        if !changes.deleted.is_empty() {
            self.deleted.entry(repo_id).or_default().extend(changes.deleted);
        }
    }
}

/// Diffs two membership maps keyed by service URN.
pub fn diff_sources(
    old: &BTreeMap<String, SourceInfo>,
    new: &BTreeMap<String, SourceInfo>,
) -> SourceChanges {
    let mut changes = SourceChanges::default();

    for (urn, info) in old {
        match new.get(urn) {
            None => changes.deleted.push(info.clone()),
            Some(updated) if updated.clone_url != info.clone_url => {
                changes.modified.push(updated.clone())
            }
            Some(_) => {}
        }
    }

    for (urn, info) in new {
        if !old.contains_key(urn) {
            changes.added.push(info.clone());
        }
    }

    changes
}

/// Collects the membership edits implied by `diff`.
///
/// `previous` holds the stored state of every repo the diff may touch. Added
/// repos contribute all their sources; modified and deleted repos are diffed
/// against their stored counterpart. Repos without an ID are skipped.
pub fn sources_upserts(diff: &Diff, previous: &[Repo]) -> SourcesDiff {
    let by_id: HashMap<RepoId, &Repo> = previous
        .iter()
        .filter(|repo| repo.id != 0)
        .map(|repo| (repo.id, repo))
        .collect();
    let empty = BTreeMap::new();
    let mut out = SourcesDiff::default();

    for repo in diff.added.iter().filter(|repo| repo.id != 0) {
        let old = by_id.get(&repo.id).map_or(&empty, |stored| &stored.sources);
        out.record(repo.id, diff_sources(old, &repo.sources));
    }

    for repo in diff.modified.iter().chain(diff.deleted.iter()) {
        if repo.id == 0 {
            continue;
        }
        if let Some(stored) = by_id.get(&repo.id) {
            out.record(repo.id, diff_sources(&stored.sources, &repo.sources));
        }
    }

    out
}
