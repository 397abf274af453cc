use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::KindLedger;
use crate::identity::{Identity, IdentityDirectory};
use crate::registry::{descriptor, CollectionKind, KIND_COUNT};

/// Per-identity, per-kind record counts shared by the concurrent per-kind
/// aggregation tasks of one cycle.
///
/// Rows are created on first touch and counters are bumped atomically, so
/// any number of kinds can fold into the same table without losing updates.
#[derive(Default)]
pub struct UserTotals {
    rows: DashMap<String, Tally>,
}

struct Tally {
    identity: Identity,
    per_kind: [AtomicU64; KIND_COUNT],
}

impl Tally {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            per_kind: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl UserTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with a zero row for every directory identity.
    pub fn seeded(directory: &IdentityDirectory) -> Self {
        let totals = Self::new();
        for identity in directory.identities() {
            totals
                .rows
                .insert(identity.id.clone(), Tally::new(identity));
        }
        totals
    }

    /// Adds `n` to the identity's counter for `kind`. The `Unknown` sentinel
    /// and non-rankable kinds are not tracked.
    pub fn add(&self, identity: &Identity, kind: CollectionKind, n: u64) {
        if identity.is_unknown() || !descriptor(kind).rankable || n == 0 {
            return;
        }
        self.rows
            .entry(identity.id.clone())
            .or_insert_with(|| Tally::new(identity.clone()))
            .per_kind[kind.index()]
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Counts every entry of a ledger against its creator.
    pub fn absorb_ledger(&self, ledger: &KindLedger) {
        for entry in ledger.entries() {
            self.add(&entry.identity, ledger.kind(), 1);
        }
    }

    /// Returns a point-in-time copy of all rows.
    pub fn snapshot(&self) -> UserTotalsSnapshot {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let counts: BTreeMap<CollectionKind, u64> = CollectionKind::all()
                    .iter()
                    .filter(|kind| descriptor(**kind).rankable)
                    .map(|&kind| (kind, row.per_kind[kind.index()].load(Ordering::Relaxed)))
                    .collect();
                (row.key().clone(), UserTotalsRow::new(row.identity.clone(), counts))
            })
            .collect();
        UserTotalsSnapshot { rows }
    }
}

/// Frozen per-identity counts for one published view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserTotalsSnapshot {
    rows: BTreeMap<String, UserTotalsRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTotalsRow {
    pub identity: Identity,
    pub counts: BTreeMap<CollectionKind, u64>,
    /// Sum of `counts`.
    pub total_count: u64,
}

impl UserTotalsRow {
    fn new(identity: Identity, counts: BTreeMap<CollectionKind, u64>) -> Self {
        let total_count = counts.values().sum();
        Self {
            identity,
            counts,
            total_count,
        }
    }
}

impl UserTotalsSnapshot {
    pub fn get(&self, identity_id: &str) -> Option<&UserTotalsRow> {
        self.rows.get(identity_id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &UserTotalsRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Applies a live delta for one record, clamping at zero.
    pub fn adjust(&mut self, identity: &Identity, kind: CollectionKind, delta: i64) {
        if identity.is_unknown() || !descriptor(kind).rankable || delta == 0 {
            return;
        }
        let row = self
            .rows
            .entry(identity.id.clone())
            .or_insert_with(|| UserTotalsRow::new(identity.clone(), BTreeMap::new()));
        let count = row.counts.entry(kind).or_insert(0);
        *count = count.saturating_add_signed(delta);
        row.total_count = row.counts.values().sum();
    }

    /// Rows ordered by total count (descending), then display name.
    pub fn leaderboard(&self) -> Vec<&UserTotalsRow> {
        let mut rows: Vec<&UserTotalsRow> = self.rows.values().collect();
        rows.sort_by(|a, b| {
            b.total_count
                .cmp(&a.total_count)
                .then_with(|| a.identity.display_name.cmp(&b.identity.display_name))
        });
        rows
    }
}
