//! Source registry
//!
//! In-memory registry mapping external service kinds to source factories.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::sources::{OtherSource, Source, SourceError, Sourcer};
use crate::types::{ExternalService, ExternalServiceKind};

/// Builds a source for one external service.
pub type SourceFactory =
    Arc<dyn Fn(&ExternalService) -> Result<Arc<dyn Source>, SourceError> + Send + Sync>;

/// Registry that resolves services to sources by kind
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: HashMap<ExternalServiceKind, SourceFactory>,
}

impl SourceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            ExternalServiceKind::Other,
            Arc::new(|svc: &ExternalService| {
                OtherSource::new(svc).map(|source| Arc::new(source) as Arc<dyn Source>)
            }),
        );
        registry
    }

    /// Register a factory, replacing any previous one for `kind`
    pub fn register(&mut self, kind: ExternalServiceKind, factory: SourceFactory) {
        debug!(kind = %kind, "Registering source");
        self.factories.insert(kind, factory);
    }

    pub fn is_registered(&self, kind: ExternalServiceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Registered kinds, sorted for stable ordering
    pub fn kinds(&self) -> Vec<ExternalServiceKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

impl Sourcer for SourceRegistry {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError> {
        let factory = self
            .factories
            .get(&svc.kind)
            .ok_or_else(|| SourceError::Unsupported {
                kind: svc.kind.to_string(),
            })?;
        factory(svc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_resolve_other_services() {
        let registry = SourceRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec![ExternalServiceKind::Other]);

        let mut svc = ExternalService::new(ExternalServiceKind::Other, "static");
        svc.config = json!({"url": "https://git.example.com/", "repos": ["a"]});
        assert!(registry.source(&svc).is_ok());
    }

    #[test]
    fn unregistered_kind_is_unsupported() {
        let registry = SourceRegistry::with_defaults();
        let svc = ExternalService::new(ExternalServiceKind::GitHub, "github");

        let err = registry.source(&svc).err().expect("no github source");
        assert_eq!(
            err,
            SourceError::Unsupported {
                kind: "GITHUB".to_string()
            }
        );
    }
}
