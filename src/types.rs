//! # Domain Types
//!
//! Repository, external service and membership types shared by the
//! reconciliation engine, the sources and the store.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RepoId = i32;
pub type ExternalServiceId = i32;
pub type UserId = i32;

/// Globally unique identity of a repository on its code host.
///
/// The derived ordering is lexicographic by service type, then service ID,
/// then repository ID. Name conflicts are resolved in favour of the smaller
/// spec under this ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalRepoSpec {
    pub service_type: String,
    pub service_id: String,
    pub id: String,
}

impl ExternalRepoSpec {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            id: id.into(),
        }
    }

    /// Three-way comparison returning -1, 0 or 1.
    pub fn compare(&self, other: &Self) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.service_type.is_empty() && self.service_id.is_empty() && self.id.is_empty()
    }
}

impl fmt::Display for ExternalRepoSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_type, self.service_id, self.id)
    }
}

/// One external service's claim on a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// URN of the claiming service, see [`external_service_urn`]
    pub id: String,
    pub clone_url: String,
}

impl SourceInfo {
    pub fn new(id: impl Into<String>, clone_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            clone_url: clone_url.into(),
        }
    }

    /// Parses the service ID out of the URN.
    pub fn external_service_id(&self) -> Option<ExternalServiceId> {
        parse_external_service_urn(&self.id).map(|(_, id)| id)
    }
}

/// Builds the URN identifying an external service in a repo's sources map.
pub fn external_service_urn(kind: ExternalServiceKind, id: ExternalServiceId) -> String {
    format!("extsvc:{}:{}", kind.as_str().to_lowercase(), id)
}

/// Splits `extsvc:<kind>:<id>` into its parts.
pub fn parse_external_service_urn(urn: &str) -> Option<(String, ExternalServiceId)> {
    let mut parts = urn.splitn(3, ':');
    if parts.next()? != "extsvc" {
        return None;
    }
    let kind = parts.next()?.to_string();
    let id = parts.next()?.parse().ok()?;
    Some((kind, id))
}

/// A repository as sourced from a code host or stored in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Catalog ID, zero until the repo is first persisted
    pub id: RepoId,
    pub name: String,
    pub uri: String,
    pub description: String,
    pub fork: bool,
    pub archived: bool,
    pub private: bool,
    pub external_repo: ExternalRepoSpec,
    /// Service-memberships keyed by service URN
    pub sources: BTreeMap<String, SourceInfo>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Repo {
    /// Case-folded name used for uniqueness checks.
    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Copies the sourced attributes of `n` onto `self`, returning whether
    /// anything changed. A soft-deleted repo is revived.
    pub fn update(&mut self, n: &Repo) -> bool {
        let mut modified = false;

        if self.name != n.name {
            self.name = n.name.clone();
            modified = true;
        }
        if self.uri != n.uri {
            self.uri = n.uri.clone();
            modified = true;
        }
        if self.description != n.description {
            self.description = n.description.clone();
            modified = true;
        }
        if self.fork != n.fork {
            self.fork = n.fork;
            modified = true;
        }
        if self.archived != n.archived {
            self.archived = n.archived;
            modified = true;
        }
        if self.private != n.private {
            self.private = n.private;
            modified = true;
        }
        if !n.external_repo.is_empty() && self.external_repo != n.external_repo {
            self.external_repo = n.external_repo.clone();
            modified = true;
        }
        if self.sources != n.sources {
            self.sources = n.sources.clone();
            modified = true;
        }
        if self.deleted_at.is_some() && n.deleted_at.is_none() {
            self.deleted_at = None;
            modified = true;
        }

        modified
    }

    /// Ordering used to make diff buckets deterministic.
    pub fn sort_cmp(&self, other: &Repo) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.external_repo.cmp(&other.external_repo))
    }
}

/// Supported code host kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalServiceKind {
    GitHub,
    GitLab,
    BitbucketCloud,
    Other,
}

impl ExternalServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "GITHUB",
            Self::GitLab => "GITLAB",
            Self::BitbucketCloud => "BITBUCKETCLOUD",
            Self::Other => "OTHER",
        }
    }

    /// Service type recorded on the external repo specs this kind produces.
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::BitbucketCloud => "bitbucketCloud",
            Self::Other => "other",
        }
    }

    pub fn from_service_type(service_type: &str) -> Option<Self> {
        [Self::GitHub, Self::GitLab, Self::BitbucketCloud, Self::Other]
            .into_iter()
            .find(|kind| kind.service_type().eq_ignore_ascii_case(service_type))
    }
}

impl fmt::Display for ExternalServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExternalServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GITHUB" => Ok(Self::GitHub),
            "GITLAB" => Ok(Self::GitLab),
            "BITBUCKETCLOUD" => Ok(Self::BitbucketCloud),
            "OTHER" => Ok(Self::Other),
            other => Err(format!("unknown external service kind {other}")),
        }
    }
}

/// A configured connection to a code host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: ExternalServiceId,
    pub kind: ExternalServiceKind,
    pub display_name: String,
    pub config: serde_json::Value,
    /// Owning user; `None` marks a site-owned service
    pub namespace_user_id: Option<UserId>,
    pub cloud_default: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ExternalService {
    pub fn new(kind: ExternalServiceKind, display_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            display_name: display_name.into(),
            config: serde_json::Value::Object(Default::default()),
            namespace_user_id: None,
            cloud_default: false,
            last_sync_at: None,
            next_sync_at: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn urn(&self) -> String {
        external_service_urn(self.kind, self.id)
    }

    /// User-owned services are lower trust and subject to repo quotas.
    pub fn user_id(&self) -> Option<UserId> {
        self.namespace_user_id.filter(|id| *id > 0)
    }

    pub fn is_user_owned(&self) -> bool {
        self.user_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str) -> Repo {
        Repo {
            name: name.to_string(),
            external_repo: ExternalRepoSpec::new("github", "https://github.com/", name),
            ..Default::default()
        }
    }

    #[test]
    fn spec_ordering_is_lexicographic_by_type_then_service_then_id() {
        let a = ExternalRepoSpec::new("github", "https://a/", "2");
        let b = ExternalRepoSpec::new("github", "https://b/", "1");
        let c = ExternalRepoSpec::new("gitlab", "https://a/", "0");

        assert_eq!(a.compare(&b), -1);
        assert_eq!(b.compare(&c), -1);
        assert_eq!(c.compare(&a), 1);
        assert_eq!(a.compare(&a.clone()), 0);
    }

    #[test]
    fn urn_round_trips_through_source_info() {
        let urn = external_service_urn(ExternalServiceKind::GitHub, 42);
        assert_eq!(urn, "extsvc:github:42");
        assert_eq!(SourceInfo::new(urn, "https://x").external_service_id(), Some(42));
        assert_eq!(parse_external_service_urn("svc:github:1"), None);
        assert_eq!(parse_external_service_urn("extsvc:github:abc"), None);
    }

    #[test]
    fn update_reports_changes_and_revives() {
        let mut stored = repo("a");
        stored.deleted_at = Some(Utc::now());
        let sourced = repo("a");

        assert!(stored.update(&sourced));
        assert!(stored.deleted_at.is_none());
        assert!(!stored.update(&sourced));

        let mut renamed = sourced.clone();
        renamed.name = "b".to_string();
        renamed.private = true;
        assert!(stored.update(&renamed));
        assert_eq!(stored.name, "b");
        assert!(stored.private);
    }

    #[test]
    fn user_ownership_requires_positive_id() {
        let mut svc = ExternalService::new(ExternalServiceKind::Other, "other");
        assert!(!svc.is_user_owned());
        svc.namespace_user_id = Some(0);
        assert!(!svc.is_user_owned());
        svc.namespace_user_id = Some(7);
        assert!(svc.is_user_owned());
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("github".parse::<ExternalServiceKind>(), Ok(ExternalServiceKind::GitHub));
        assert_eq!(
            ExternalServiceKind::from_service_type("other"),
            Some(ExternalServiceKind::Other)
        );
        assert!("svn".parse::<ExternalServiceKind>().is_err());
    }
}
