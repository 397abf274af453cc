//! Per-kind folding of business records into snapshots.
//!
//! A [`KindLedger`] holds the accepted records of one kind keyed by document
//! code. Snapshots are always recomputed from the ledger in code order, so the
//! result does not depend on the order in which records or live updates
//! arrived, and re-applying the same record is a no-op.

pub mod ranking;
pub mod user_totals;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub use ranking::{generate_rankings, Accumulator, RankingEntry};
pub use user_totals::{UserTotals, UserTotalsRow, UserTotalsSnapshot};

use crate::identity::{Identity, IdentityDirectory};
use crate::registry::{
    self, descriptor, is_do_created, BusinessRecord, CollectionKind, Status,
};

/// One accepted record with its resolved creator and value.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub record: Arc<BusinessRecord>,
    pub identity: Identity,
    pub value: f64,
    pub status: Option<Status>,
}

/// Result of inserting a record into a ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted,
    /// A record with the same code was replaced.
    Replaced { previous: Identity },
}

/// Counters for one decoded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub accepted: usize,
    pub malformed: usize,
    pub mismatched: usize,
}

/// Accepted records of one kind, keyed by document code.
#[derive(Debug, Clone)]
pub struct KindLedger {
    kind: CollectionKind,
    entries: BTreeMap<String, LedgerEntry>,
}

/// Selling, cost and margin totals for opportunities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OpportunityFigures {
    pub selling: f64,
    pub cost: f64,
    pub profit: f64,
}

/// Aggregate view of one kind for one (date, identity) key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSnapshot {
    pub kind: CollectionKind,
    pub total: f64,
    pub open: u64,
    pub closed: u64,
    pub cancelled: u64,
    /// Sales orders whose delivery order has been raised.
    pub do_created: u64,
    pub count: u64,
    pub rankings: Vec<RankingEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opportunity: Option<OpportunityFigures>,
    /// Set when the latest fetch failed and this is the last known result.
    pub stale: bool,
}

impl CollectionSnapshot {
    pub fn empty(kind: CollectionKind) -> Self {
        Self {
            kind,
            total: 0.0,
            open: 0,
            closed: 0,
            cancelled: 0,
            do_created: 0,
            count: 0,
            rankings: Vec::new(),
            opportunity: (kind == CollectionKind::Opportunities)
                .then(OpportunityFigures::default),
            stale: false,
        }
    }
}

impl KindLedger {
    pub fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Decodes and folds a raw batch. Malformed documents and documents whose
    /// code lacks the kind's prefix are counted and dropped.
    pub fn from_values(
        kind: CollectionKind,
        values: Vec<Value>,
        directory: &IdentityDirectory,
    ) -> (Self, BatchStats) {
        let mut ledger = Self::new(kind);
        let mut stats = BatchStats::default();

        for value in values {
            match BusinessRecord::from_value(kind, value) {
                Ok(record) => {
                    if ledger.upsert(record, directory).is_some() {
                        stats.accepted += 1;
                    } else {
                        stats.mismatched += 1;
                    }
                }
                Err(e) => {
                    debug!(collection = %kind, error = %e, "skipping malformed record");
                    stats.malformed += 1;
                }
            }
        }

        if stats.malformed > 0 || stats.mismatched > 0 {
            debug!(
                collection = %kind,
                accepted = stats.accepted,
                malformed = stats.malformed,
                mismatched = stats.mismatched,
                "decoded batch with skipped records",
            );
        }

        (ledger, stats)
    }

    /// Inserts or replaces a record by code. Returns `None` when the record
    /// belongs to another kind or its code lacks this kind's prefix.
    pub fn upsert(
        &mut self,
        record: BusinessRecord,
        directory: &IdentityDirectory,
    ) -> Option<Upsert> {
        if registry::match_kind(&record) != Some(self.kind) {
            return None;
        }

        let entry = LedgerEntry {
            identity: directory.resolve(record.created_by()),
            value: registry::extract_value(&record, self.kind),
            status: registry::status_of(&record, self.kind),
            record: Arc::new(record),
        };

        match self.entries.insert(entry.record.code().to_string(), entry) {
            None => Some(Upsert::Inserted),
            Some(previous) => Some(Upsert::Replaced {
                previous: previous.identity,
            }),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&LedgerEntry> {
        self.entries.get(code)
    }

    /// Entries in code order.
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Folds the ledger into a snapshot. `filter` restricts rankings to one
    /// identity; totals and buckets always cover every record.
    pub fn snapshot(&self, filter: Option<&Identity>) -> CollectionSnapshot {
        let mut snap = CollectionSnapshot::empty(self.kind);
        let mut figures = OpportunityFigures::default();
        let mut per_identity: HashMap<&Identity, Accumulator> = HashMap::new();

        for entry in self.entries.values() {
            snap.count += 1;
            snap.total += entry.value;

            match entry.status {
                Some(Status::Open) => snap.open += 1,
                Some(Status::Closed) => snap.closed += 1,
                Some(Status::Cancelled) => snap.cancelled += 1,
                None => {}
            }

            if let BusinessRecord::SalesOrder(so) = entry.record.as_ref() {
                if so.status.as_deref().is_some_and(is_do_created) {
                    snap.do_created += 1;
                }
            }

            if let BusinessRecord::Opportunity(op) = entry.record.as_ref() {
                figures.selling += op.selling.map_or(0.0, |a| a.0);
                figures.cost += op.cost.map_or(0.0, |a| a.0);
            }

            if filter.is_some_and(|f| f.id != entry.identity.id) {
                continue;
            }
            per_identity
                .entry(&entry.identity)
                .or_default()
                .record(entry.value);
        }

        if self.kind == CollectionKind::Opportunities {
            figures.profit = figures.selling - figures.cost;
            snap.total = figures.profit;
            snap.opportunity = Some(figures);
        }

        if descriptor(self.kind).rankable {
            snap.rankings = generate_rankings(
                per_identity
                    .into_iter()
                    .map(|(identity, acc)| (identity.clone(), acc)),
                snap.count,
            );
        }

        snap
    }
}

/// Folds one kind's raw batch into a snapshot and counts every accepted
/// record into `user_totals`.
pub fn aggregate(
    kind: CollectionKind,
    values: Vec<Value>,
    directory: &IdentityDirectory,
    user_totals: &UserTotals,
    filter: Option<&Identity>,
) -> CollectionSnapshot {
    let (ledger, _) = KindLedger::from_values(kind, values, directory);
    user_totals.absorb_ledger(&ledger);
    ledger.snapshot(filter)
}
