use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde_json::Value;

use super::{CollectionSource, FetchScope};
use crate::registry::CollectionKind;

/// In-process [`CollectionSource`] backed by fixed batches.
///
/// Batches are stored per kind, optionally per day; a day-scoped fetch
/// falls back to the undated batch. Kinds can be made to fail on either
/// endpoint or to respond after a delay.
#[derive(Default)]
pub struct MemorySource {
    batches: RwLock<HashMap<(CollectionKind, Option<NaiveDate>), Vec<Value>>>,
    failing_primary: RwLock<HashSet<CollectionKind>>,
    failing_fallback: RwLock<HashSet<CollectionKind>>,
    delays: RwLock<HashMap<CollectionKind, Duration>>,
    calls: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: CollectionKind, values: Vec<Value>) {
        self.batches.write().insert((kind, None), values);
    }

    pub fn set_day(&self, kind: CollectionKind, date: NaiveDate, values: Vec<Value>) {
        self.batches.write().insert((kind, Some(date)), values);
    }

    /// Makes both endpoints fail for `kind` (or recover).
    pub fn set_failing(&self, kind: CollectionKind, failing: bool) {
        self.set_primary_failing(kind, failing);
        toggle(&mut self.failing_fallback.write(), kind, failing);
    }

    pub fn set_primary_failing(&self, kind: CollectionKind, failing: bool) {
        toggle(&mut self.failing_primary.write(), kind, failing);
    }

    pub fn set_delay(&self, kind: CollectionKind, delay: Option<Duration>) {
        let mut delays = self.delays.write();
        match delay {
            Some(d) => delays.insert(kind, d),
            None => delays.remove(&kind),
        };
    }

    /// Fetch calls served so far, fallback attempts included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn serve(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
        fallback: bool,
    ) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.read().get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = if fallback {
            self.failing_fallback.read().contains(&kind)
        } else {
            self.failing_primary.read().contains(&kind)
        };
        if failing {
            bail!("{kind} unavailable");
        }

        let batches = self.batches.read();
        Ok(batches
            .get(&(kind, scope.date))
            .or_else(|| batches.get(&(kind, None)))
            .cloned()
            .unwrap_or_default())
    }
}

fn toggle(set: &mut HashSet<CollectionKind>, kind: CollectionKind, on: bool) {
    if on {
        set.insert(kind);
    } else {
        set.remove(&kind);
    }
}

impl CollectionSource for MemorySource {
    async fn fetch_collection(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> Result<Vec<Value>> {
        self.serve(kind, scope, false).await
    }

    async fn fetch_collection_fallback(
        &self,
        kind: CollectionKind,
        scope: FetchScope,
    ) -> Result<Vec<Value>> {
        self.serve(kind, scope, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_day_batch_preferred() {
        let source = MemorySource::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        source.set(CollectionKind::SalesOrders, vec![json!({"n": 1})]);
        source.set_day(CollectionKind::SalesOrders, day, vec![json!({"n": 2})]);

        let dated = source
            .fetch_collection(CollectionKind::SalesOrders, FetchScope::day(day))
            .await
            .expect("fetch");
        assert_eq!(dated[0]["n"], 2);

        let other = NaiveDate::from_ymd_opt(2024, 3, 2).expect("date");
        let undated = source
            .fetch_collection(CollectionKind::SalesOrders, FetchScope::day(other))
            .await
            .expect("fetch");
        assert_eq!(undated[0]["n"], 1);
    }

    #[tokio::test]
    async fn test_failing_kind() {
        let source = MemorySource::new();
        source.set_primary_failing(CollectionKind::Estimations, true);

        assert!(source
            .fetch_collection(CollectionKind::Estimations, FetchScope::everything())
            .await
            .is_err());
        assert!(source
            .fetch_collection_fallback(CollectionKind::Estimations, FetchScope::everything())
            .await
            .is_ok());
        assert_eq!(source.calls(), 2);
    }
}
