//! # Diff Engine
//!
//! Partitions sourced and stored repositories into added, modified, deleted and
//! unmodified buckets, resolving case-insensitive name collisions in favour of
//! the repository with the smaller [`ExternalRepoSpec`].

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{ExternalRepoSpec, ExternalService, Repo};

/// Result of one reconciliation pass. The four buckets never overlap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub added: Vec<Repo>,
    pub deleted: Vec<Repo>,
    pub modified: Vec<Repo>,
    pub unmodified: Vec<Repo>,
}

impl Diff {
    /// Sorts every bucket by ID, then name, then external spec.
    pub fn sort(&mut self) {
        for bucket in [
            &mut self.added,
            &mut self.deleted,
            &mut self.modified,
            &mut self.unmodified,
        ] {
            bucket.sort_by(Repo::sort_cmp);
        }
    }

    /// Iterates over the repos of all buckets.
    pub fn repos(&self) -> impl Iterator<Item = &Repo> {
        self.added
            .iter()
            .chain(self.deleted.iter())
            .chain(self.modified.iter())
            .chain(self.unmodified.iter())
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len() + self.unmodified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the pass added, modified or deleted anything.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
    }
}

/// Returns `(keep, discard)` for two repos sharing a name.
fn pick(a: Repo, b: Repo) -> (Repo, Repo) {
    if a.external_repo < b.external_repo {
        (a, b)
    } else {
        (b, a)
    }
}

/// Folds the memberships of a duplicate sourced entry into the first one seen.
fn merge_sources(into: &mut Repo, from: Repo) {
    for (urn, info) in from.sources {
        into.sources.entry(urn).or_insert(info);
    }
}

fn cleared(mut repo: Repo) -> Repo {
    repo.sources.clear();
    repo
}

/// Computes the diff between `sourced` and `stored`.
///
/// When `svc` is given the call is scoped to that service: a stored repo that
/// is no longer sourced only loses that service's membership. Unscoped calls
/// clear the deleted repo's memberships entirely.
pub fn new_diff(svc: Option<&ExternalService>, mut sourced: Vec<Repo>, stored: Vec<Repo>) -> Diff {
    sourced.sort_by(Repo::sort_cmp);

    let mut by_spec: BTreeMap<ExternalRepoSpec, Repo> = BTreeMap::new();
    for repo in sourced {
        match by_spec.entry(repo.external_repo.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(repo);
            }
            Entry::Occupied(mut entry) => merge_sources(entry.get_mut(), repo),
        }
    }

    // Name collisions among the sourced set. A loser only surfaces in the
    // diff if it was already stored.
    let mut discarded: BTreeMap<ExternalRepoSpec, Repo> = BTreeMap::new();
    let mut by_name: HashMap<String, Repo> = HashMap::new();
    for (_, repo) in std::mem::take(&mut by_spec) {
        match by_name.remove(&repo.lower_name()) {
            None => {
                by_name.insert(repo.lower_name(), repo);
            }
            Some(existing) => {
                let (keep, discard) = pick(existing, repo);
                discarded.insert(discard.external_repo.clone(), cleared(discard));
                by_name.insert(keep.lower_name(), keep);
            }
        }
    }
    let mut by_spec: BTreeMap<ExternalRepoSpec, Repo> = by_name
        .into_values()
        .map(|repo| (repo.external_repo.clone(), repo))
        .collect();

    let svc_urn = svc.map(ExternalService::urn);
    let mut diff = Diff::default();

    for old in stored {
        if let Some(src) = by_spec.remove(&old.external_repo) {
            let mut repo = old;
            if repo.update(&src) {
                diff.modified.push(repo);
            } else {
                diff.unmodified.push(repo);
            }
        } else if discarded.remove(&old.external_repo).is_some() {
            diff.deleted.push(cleared(old));
        } else {
            let mut repo = old;
            match &svc_urn {
                Some(urn) => {
                    repo.sources.remove(urn);
                }
                None => repo.sources.clear(),
            }
            diff.deleted.push(repo);
        }
    }

    diff.added.extend(by_spec.into_values());
    diff
}

/// Resolves name collisions between the diff's added and modified repos and
/// `conflicting` repos already stored under a different identity.
///
/// The repo with the smaller spec keeps the name. A losing stored repo is
/// appended to `deleted` with its memberships cleared, as is a losing modified
/// repo. A losing added repo was never stored and is dropped.
pub fn resolve_name_conflicts(diff: &mut Diff, conflicting: &[Repo]) {
    let mut by_name: HashMap<String, Vec<&Repo>> = HashMap::new();
    for repo in conflicting {
        by_name.entry(repo.lower_name()).or_default().push(repo);
    }

    let mut deleted_specs: HashSet<ExternalRepoSpec> = diff
        .deleted
        .iter()
        .map(|repo| repo.external_repo.clone())
        .collect();
    let mut to_delete = Vec::new();

    let mut filter = |repos: Vec<Repo>, to_delete: &mut Vec<Repo>| -> Vec<Repo> {
        let mut kept = Vec::with_capacity(repos.len());
        for repo in repos {
            let mut wins = true;
            for stored in by_name.get(&repo.lower_name()).into_iter().flatten() {
                if stored.external_repo == repo.external_repo {
                    continue;
                }
                if stored.external_repo < repo.external_repo {
                    wins = false;
                    break;
                }
                if deleted_specs.insert(stored.external_repo.clone()) {
                    to_delete.push(cleared((*stored).clone()));
                }
            }
            if wins {
                kept.push(repo);
            } else if repo.id != 0 && deleted_specs.insert(repo.external_repo.clone()) {
                to_delete.push(cleared(repo));
            }
        }
        kept
    };

    diff.added = filter(std::mem::take(&mut diff.added), &mut to_delete);
    diff.modified = filter(std::mem::take(&mut diff.modified), &mut to_delete);
    diff.deleted.extend(to_delete);
}
