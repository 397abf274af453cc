//! Where raw collection batches come from.

pub mod http;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::warn;

use crate::registry::CollectionKind;

pub use http::HttpSource;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemorySource;

/// Restricts a fetch to one business day; `None` fetches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchScope {
    pub date: Option<NaiveDate>,
}

impl FetchScope {
    pub fn day(date: NaiveDate) -> Self {
        Self { date: Some(date) }
    }

    pub fn everything() -> Self {
        Self { date: None }
    }
}

/// Backend access for raw collection documents.
pub trait CollectionSource: Send + Sync {
    /// Fetch one collection from the primary endpoint.
    fn fetch_collection(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Fetch one collection from the fallback endpoint.
    fn fetch_collection_fallback(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;
}

/// Which endpoint produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPath {
    Primary,
    Fallback,
}

impl FetchPath {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// Outcome of a primary-then-fallback fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched {
        path: FetchPath,
        values: Vec<Value>,
        elapsed: Duration,
    },
    /// Both endpoints failed.
    Failed { elapsed: Duration },
}

impl FetchOutcome {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Fetched { path, .. } => path.as_str(),
            Self::Failed { .. } => "failed",
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Fetched { elapsed, .. } | Self::Failed { elapsed } => *elapsed,
        }
    }
}

/// Tries the primary endpoint, then the fallback. Failures are logged and
/// reported as [`FetchOutcome::Failed`] rather than propagated.
pub async fn fetch_with_fallback<S: CollectionSource>(
    source: &S,
    kind: CollectionKind,
    scope: FetchScope,
) -> FetchOutcome {
    let start = Instant::now();

    let primary_err = match source.fetch_collection(kind, scope).await {
        Ok(values) => {
            return FetchOutcome::Fetched {
                path: FetchPath::Primary,
                values,
                elapsed: start.elapsed(),
            }
        }
        Err(e) => e,
    };

    warn!(collection = %kind, error = %primary_err, "primary fetch failed, trying fallback");

    match source.fetch_collection_fallback(kind, scope).await {
        Ok(values) => FetchOutcome::Fetched {
            path: FetchPath::Fallback,
            values,
            elapsed: start.elapsed(),
        },
        Err(e) => {
            warn!(collection = %kind, error = %e, "fallback fetch failed");
            FetchOutcome::Failed {
                elapsed: start.elapsed(),
            }
        }
    }
}
