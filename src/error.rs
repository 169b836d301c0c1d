//! # Error Types
//!
//! Errors surfaced by the store and by reconciliation passes. Credential
//! failures from a code host are kept distinguishable so callers can alert on
//! them after the pass has committed.

use std::fmt;

use sea_orm::DbErr;
use thiserror::Error;

use crate::sources::SourceError;
use crate::sync::quota::QuotaError;
use crate::types::ExternalServiceId;

/// Errors returned by [`crate::repositories::Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("external service {id} not found")]
    ExternalServiceNotFound { id: ExternalServiceId },
    #[error("no cloud default external service for service type {service_type}")]
    NoCloudDefault { service_type: String },
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

/// Errors returned by a reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("bad credentials")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("account suspended")]
    AccountSuspended,
    #[error("fetching from code host {service}: {source}")]
    Source {
        service: String,
        #[source]
        source: SourceError,
    },
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaError),
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl SyncError {
    pub fn source(service: impl Into<String>, source: SourceError) -> Self {
        Self::Source {
            service: service.into(),
            source,
        }
    }

    /// Adapter for `map_err` that attaches a store context.
    pub fn store(context: &'static str) -> impl FnOnce(StoreError) -> SyncError {
        move |source| SyncError::Store { context, source }
    }

    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized => true,
            Self::Source { source, .. } => source.is_unauthorized(),
            Self::Multi(errs) => errs.iter().any(SyncError::is_unauthorized),
            _ => false,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        match self {
            Self::Forbidden => true,
            Self::Source { source, .. } => source.is_forbidden(),
            Self::Multi(errs) => errs.iter().any(SyncError::is_forbidden),
            _ => false,
        }
    }

    pub fn is_account_suspended(&self) -> bool {
        match self {
            Self::AccountSuspended => true,
            Self::Source { source, .. } => source.is_account_suspended(),
            Self::Multi(errs) => errs.iter().any(SyncError::is_account_suspended),
            _ => false,
        }
    }

    /// The typed credential error this failure maps to, if any.
    pub fn credential_failure(&self) -> Option<SyncError> {
        if self.is_unauthorized() {
            Some(Self::Unauthorized)
        } else if self.is_forbidden() {
            Some(Self::Forbidden)
        } else if self.is_account_suspended() {
            Some(Self::AccountSuspended)
        } else {
            None
        }
    }

    pub fn is_quota(&self) -> bool {
        match self {
            Self::QuotaExceeded(_) => true,
            Self::Multi(errs) => errs.iter().any(SyncError::is_quota),
            _ => false,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(source: StoreError) -> Self {
        SyncError::Store {
            context: "store",
            source,
        }
    }
}

/// Aggregate of the independent failures collected during one pass.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<SyncError>,
}

impl MultiError {
    pub fn push(&mut self, err: SyncError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncError> {
        self.errors.iter()
    }

    /// `Ok` when nothing was collected.
    pub fn into_result(self) -> Result<(), SyncError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.errors.len() == 1 { "error" } else { "errors" };
        write!(f, "{} {} occurred:", self.errors.len(), noun)?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
