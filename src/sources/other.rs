//! Static source for `OTHER` external services.
//!
//! The service config names a base URL and a list of repository paths
//! relative to it:
//!
//! ```json
//! {"url": "https://git.example.com/scm/", "repos": ["team/app", "team/lib"]}
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::sources::{Source, SourceError, SourceResult, emit};
use crate::types::{ExternalRepoSpec, ExternalService, ExternalServiceKind, Repo, SourceInfo};

#[derive(Debug, Clone, Deserialize)]
pub struct OtherConfig {
    pub url: String,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OtherSource {
    urn: String,
    base: Url,
    repos: Vec<String>,
}

impl OtherSource {
    pub fn new(svc: &ExternalService) -> Result<Self, SourceError> {
        let config: OtherConfig =
            serde_json::from_value(svc.config.clone()).map_err(|e| SourceError::Configuration {
                details: format!("external service {}: {e}", svc.id),
            })?;

        let mut base = Url::parse(&config.url).map_err(|e| SourceError::Configuration {
            details: format!("invalid url {:?}: {e}", config.url),
        })?;
        if base.host_str().is_none() {
            return Err(SourceError::Configuration {
                details: format!("url {:?} has no host", config.url),
            });
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            urn: svc.urn(),
            base,
            repos: config.repos,
        })
    }

    /// Repository name prefix: host, optional port and base path.
    fn name_prefix(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        let port = self.base.port().map(|p| format!(":{p}")).unwrap_or_default();
        format!("{host}{port}{}", self.base.path().trim_end_matches('/'))
    }

    fn make_repo(&self, path: &str) -> Result<Repo, SourceError> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(SourceError::Configuration {
                details: "empty repository path".to_string(),
            });
        }
        let clone_url = self
            .base
            .join(path)
            .map_err(|e| SourceError::Configuration {
                details: format!("invalid repository path {path:?}: {e}"),
            })?;

        let name = format!("{}/{path}", self.name_prefix());
        let mut sources = BTreeMap::new();
        sources.insert(
            self.urn.clone(),
            SourceInfo::new(self.urn.clone(), clone_url.as_str()),
        );

        Ok(Repo {
            uri: name.clone(),
            name,
            external_repo: ExternalRepoSpec::new(
                ExternalServiceKind::Other.service_type(),
                self.base.as_str(),
                path,
            ),
            sources,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Source for OtherSource {
    async fn list_repos(&self, cancel: CancellationToken, results: mpsc::Sender<SourceResult>) {
        for path in &self.repos {
            if cancel.is_cancelled() {
                debug!(urn = %self.urn, "Listing cancelled");
                return;
            }
            if !emit(&results, &cancel, self.make_repo(path)).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(config: serde_json::Value) -> ExternalService {
        let mut svc = ExternalService::new(ExternalServiceKind::Other, "static");
        svc.id = 3;
        svc.config = config;
        svc
    }

    async fn collect(source: OtherSource) -> Vec<SourceResult> {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            source.list_repos(CancellationToken::new(), tx).await;
        });
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        handle.await.unwrap();
        out
    }

    #[tokio::test]
    async fn lists_configured_repos() {
        let source = OtherSource::new(&service(json!({
            "url": "https://git.example.com/scm",
            "repos": ["team/app", "/team/lib/"]
        })))
        .unwrap();

        let repos: Vec<Repo> = collect(source)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].name, "git.example.com/scm/team/app");
        assert_eq!(
            repos[0].external_repo,
            ExternalRepoSpec::new("other", "https://git.example.com/scm/", "team/app")
        );
        let info = &repos[1].sources["extsvc:other:3"];
        assert_eq!(info.clone_url, "https://git.example.com/scm/team/lib");
        assert!(!repos[1].private);
    }

    #[tokio::test]
    async fn bad_paths_are_reported_per_repo() {
        let source = OtherSource::new(&service(json!({
            "url": "https://git.example.com:8443/",
            "repos": ["ok", "/"]
        })))
        .unwrap();

        let results = collect(source).await;
        assert_eq!(results[0].as_ref().unwrap().name, "git.example.com:8443/ok");
        assert!(matches!(results[1], Err(SourceError::Configuration { .. })));
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            OtherSource::new(&service(json!({"repos": []}))),
            Err(SourceError::Configuration { .. })
        ));
        assert!(matches!(
            OtherSource::new(&service(json!({"url": "not a url"}))),
            Err(SourceError::Configuration { .. })
        ));
    }
}
