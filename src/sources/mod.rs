//! Sources module
//!
//! A [`Source`] enumerates the repositories visible to one external service.
//! It pushes results one at a time into a bounded channel from a background
//! task; the [`Sourcer`] picks the right source for a service.
//!
//! - [`list_all`] collects a whole listing for batch reconciliation
//! - [`SourceRegistry`] maps service kinds to source factories
//! - [`OtherSource`] serves a static list of repositories from configuration

pub mod other;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, dispatcher, warn};

use crate::error::SyncError;
use crate::types::{ExternalService, Repo};

pub use other::{OtherConfig, OtherSource};
pub use registry::SourceRegistry;

/// Errors a source can report, per repository or for the whole listing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("account suspended: {0}")]
    AccountSuspended(String),
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {details}")]
    Network { details: String },
    #[error("invalid configuration: {details}")]
    Configuration { details: String },
    #[error("no source available for external service kind {kind}")]
    Unsupported { kind: String },
    #[error("listing cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Http { status: 401, .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_) | Self::Http { status: 403, .. })
    }

    pub fn is_account_suspended(&self) -> bool {
        matches!(self, Self::AccountSuspended(_))
    }
}

/// One item of a listing: a repository or the error that replaced it.
pub type SourceResult = Result<Repo, SourceError>;

/// Enumerates the repositories of one external service.
#[async_trait]
pub trait Source: Send + Sync {
    /// Sends every repository on `results`. Returning drops the sender,
    /// which closes the stream. Implementations must return promptly once
    /// `cancel` fires.
    async fn list_repos(&self, cancel: CancellationToken, results: mpsc::Sender<SourceResult>);
}

/// Resolves the source for an external service.
pub trait Sourcer: Send + Sync {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError>;
}

/// Sends one result, giving up when the listing is cancelled or the consumer
/// has gone away. Returns whether the caller should keep producing.
pub async fn emit(
    results: &mpsc::Sender<SourceResult>,
    cancel: &CancellationToken,
    item: SourceResult,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = results.send(item) => sent.is_ok(),
    }
}

/// Starts `source` on a background task feeding a bounded channel.
///
/// The task runs under the caller's current dispatcher and span.
pub(crate) fn spawn_listing(
    source: Arc<dyn Source>,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<SourceResult>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dispatch = dispatcher::get_default(Dispatch::clone);
    let producer = tokio::spawn(
        async move { source.list_repos(cancel, tx).await }
            .in_current_span()
            .with_subscriber(dispatch),
    );
    (rx, producer)
}

/// Stops the producer, discards anything it already queued and waits for it
/// to exit.
pub(crate) async fn drain(
    cancel: &CancellationToken,
    mut rx: mpsc::Receiver<SourceResult>,
    producer: JoinHandle<()>,
) {
    cancel.cancel();
    rx.close();
    while rx.recv().await.is_some() {}
    if let Err(err) = producer.await {
        warn!(error = %err, "Source listing task did not exit cleanly");
    }
}

/// Everything a source produced in one listing.
#[derive(Debug, Default)]
pub struct Listing {
    pub repos: Vec<Repo>,
    pub errors: Vec<SourceError>,
}

/// Work done on each repository while a listing is still streaming in.
#[async_trait]
pub trait OnSourced: Send {
    /// An error stops the listing.
    async fn on_sourced(&mut self, repo: &Repo) -> Result<(), SyncError>;
}

/// Keeps every repository.
pub struct KeepAll;

#[async_trait]
impl OnSourced for KeepAll {
    async fn on_sourced(&mut self, _repo: &Repo) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Collects a complete listing from `source`.
///
/// `hook` sees every repository before it is kept; an error from it stops the
/// listing and is returned as is. Per-repository source errors are collected
/// in [`Listing::errors`].
pub async fn list_all<H>(
    source: Arc<dyn Source>,
    capacity: usize,
    cancel: &CancellationToken,
    hook: &mut H,
) -> Result<Listing, SyncError>
where
    H: OnSourced + ?Sized,
{
    let producer_cancel = cancel.child_token();
    let (mut rx, producer) = spawn_listing(source, capacity, producer_cancel.clone());

    let mut listing = Listing::default();
    let mut aborted = None;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                aborted = Some(SyncError::Cancelled);
                break;
            }
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        match item {
            Ok(repo) => {
                if let Err(err) = hook.on_sourced(&repo).await {
                    aborted = Some(err);
                    break;
                }
                listing.repos.push(repo);
            }
            Err(err) => listing.errors.push(err),
        }
    }

    drain(&producer_cancel, rx, producer).await;

    match aborted {
        Some(err) => Err(err),
        None => Ok(listing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExternalRepoSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Produces `count` repos, recording how many it managed to send.
    struct Counting {
        count: usize,
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source for Counting {
        async fn list_repos(&self, cancel: CancellationToken, results: mpsc::Sender<SourceResult>) {
            for i in 0..self.count {
                let repo = Repo {
                    name: format!("r{i}"),
                    external_repo: ExternalRepoSpec::new("other", "x", i.to_string()),
                    ..Default::default()
                };
                let item = if i == 1 {
                    Err(SourceError::Network {
                        details: "r1".to_string(),
                    })
                } else {
                    Ok(repo)
                };
                if !emit(&results, &cancel, item).await {
                    return;
                }
                self.sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct StopAfter(usize);

    #[async_trait]
    impl OnSourced for StopAfter {
        async fn on_sourced(&mut self, _repo: &Repo) -> Result<(), SyncError> {
            if self.0 == 0 {
                return Err(SyncError::Cancelled);
            }
            self.0 -= 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn collects_repos_and_errors() {
        let sent = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Counting {
            count: 4,
            sent: sent.clone(),
        });

        let listing = list_all(source, 1, &CancellationToken::new(), &mut KeepAll)
            .await
            .expect("listing succeeds");

        assert_eq!(listing.repos.len(), 3);
        assert_eq!(listing.errors.len(), 1);
        assert_eq!(sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn callback_error_stops_the_producer() {
        let sent = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Counting {
            count: 10_000,
            sent: sent.clone(),
        });

        let err = list_all(source, 2, &CancellationToken::new(), &mut StopAfter(2))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(sent.load(Ordering::SeqCst) < 10_000);
    }

    #[tokio::test]
    async fn cancellation_unwinds_both_sides() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = Arc::new(Counting {
            count: 10_000,
            sent: Arc::new(AtomicUsize::new(0)),
        });

        let err = list_all(source, 1, &cancel, &mut KeepAll).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
