use std::collections::BTreeMap;

use chrono::FixedOffset;
use serde::Serialize;

use super::cache::CacheKey;
use crate::aggregate::{CollectionSnapshot, KindLedger, Upsert, UserTotalsRow, UserTotalsSnapshot};
use crate::identity::{Identity, IdentityDirectory};
use crate::live::{activity_entry, approval_entry, Feed, LiveChannel, LiveEvent};
use crate::registry::CollectionKind;

#[derive(Debug, Clone)]
struct KindState {
    ledger: KindLedger,
    snapshot: CollectionSnapshot,
}

/// Result of applying a live event to a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { latest_changed: bool },
    /// The view does not aggregate this kind.
    NotTracked,
    /// The record's code lacks its kind's prefix.
    PrefixMismatch,
}

/// Everything a consumer renders for one (date, identity) key: per-kind
/// snapshots, combined user totals and both log feeds.
///
/// Views are immutable once published; live updates are applied to a clone
/// which then replaces the published one.
#[derive(Debug, Clone)]
pub struct AggregationView {
    pub key: CacheKey,
    pub generation: u64,
    filter: Option<Identity>,
    kinds: BTreeMap<CollectionKind, KindState>,
    user_totals: UserTotalsSnapshot,
    activity: Feed,
    approvals: Feed,
}

/// One kind's ledger as produced by a cycle.
#[derive(Debug)]
pub struct KindPart {
    pub ledger: KindLedger,
    /// The fetch failed and the ledger is the last known one.
    pub stale: bool,
}

impl AggregationView {
    pub fn empty(key: CacheKey, generation: u64, log_limit: usize, offset: FixedOffset) -> Self {
        Self {
            key,
            generation,
            filter: None,
            kinds: BTreeMap::new(),
            user_totals: UserTotalsSnapshot::default(),
            activity: Feed::new(LiveChannel::Activity, log_limit, offset),
            approvals: Feed::new(LiveChannel::Approval, log_limit, offset),
        }
    }

    /// Assembles a view from a finished cycle. Log lines render in `offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        key: CacheKey,
        generation: u64,
        filter: Option<Identity>,
        parts: Vec<KindPart>,
        user_totals: UserTotalsSnapshot,
        directory: &IdentityDirectory,
        log_limit: usize,
        offset: FixedOffset,
    ) -> Self {
        let mut activity = Vec::new();
        let mut approvals = Vec::new();
        let mut kinds = BTreeMap::new();

        for part in parts {
            for entry in part.ledger.entries() {
                activity.extend(activity_entry(
                    &entry.record,
                    directory,
                    filter.as_ref(),
                    offset,
                ));
                approvals.extend(approval_entry(&entry.record, directory, filter.as_ref()));
            }
            let mut snapshot = part.ledger.snapshot(filter.as_ref());
            snapshot.stale = part.stale;
            kinds.insert(
                part.ledger.kind(),
                KindState {
                    ledger: part.ledger,
                    snapshot,
                },
            );
        }

        Self {
            key,
            generation,
            filter,
            kinds,
            user_totals,
            activity: Feed::from_entries(LiveChannel::Activity, log_limit, offset, activity),
            approvals: Feed::from_entries(LiveChannel::Approval, log_limit, offset, approvals),
        }
    }

    /// Applies one pushed record: upserts it into the kind's ledger,
    /// recomputes that kind's snapshot, adjusts user totals and feeds the
    /// event's log channel.
    pub fn apply(&mut self, event: &LiveEvent, directory: &IdentityDirectory) -> ApplyOutcome {
        let kind = event.kind();
        let Some(state) = self.kinds.get_mut(&kind) else {
            return ApplyOutcome::NotTracked;
        };

        let identity = directory.resolve(event.record.created_by());
        let Some(upsert) = state.ledger.upsert(event.record.clone(), directory) else {
            return ApplyOutcome::PrefixMismatch;
        };

        match upsert {
            Upsert::Inserted => self.user_totals.adjust(&identity, kind, 1),
            Upsert::Replaced { previous } if previous != identity => {
                self.user_totals.adjust(&previous, kind, -1);
                self.user_totals.adjust(&identity, kind, 1);
            }
            Upsert::Replaced { .. } => {}
        }

        let stale = state.snapshot.stale;
        state.snapshot = state.ledger.snapshot(self.filter.as_ref());
        state.snapshot.stale = stale;

        let filter = self.filter.as_ref();
        let latest_changed = match event.channel {
            LiveChannel::Activity => {
                let offset = self.activity.offset();
                activity_entry(&event.record, directory, filter, offset)
                    .is_some_and(|entry| self.activity.absorb(entry))
            }
            LiveChannel::Approval => approval_entry(&event.record, directory, filter)
                .is_some_and(|entry| self.approvals.absorb(entry)),
        };

        ApplyOutcome::Applied { latest_changed }
    }

    pub fn filter(&self) -> Option<&Identity> {
        self.filter.as_ref()
    }

    pub fn snapshot(&self, kind: CollectionKind) -> Option<&CollectionSnapshot> {
        self.kinds.get(&kind).map(|state| &state.snapshot)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &CollectionSnapshot> {
        self.kinds.values().map(|state| &state.snapshot)
    }

    pub fn ledger(&self, kind: CollectionKind) -> Option<&KindLedger> {
        self.kinds.get(&kind).map(|state| &state.ledger)
    }

    pub fn user_totals(&self) -> &UserTotalsSnapshot {
        &self.user_totals
    }

    pub fn activity(&self) -> &Feed {
        &self.activity
    }

    pub fn approvals(&self) -> &Feed {
        &self.approvals
    }

    /// Serializable summary used by the CLI and the API.
    pub fn report(&self) -> ViewReport<'_> {
        ViewReport {
            date: self.key.date.format("%Y-%m-%d").to_string(),
            identity: self.filter.as_ref(),
            generation: self.generation,
            snapshots: self.snapshots().collect(),
            user_totals: self.user_totals.leaderboard(),
            latest_event: self.activity.latest_message(),
            latest_approval: self.approvals.latest_message(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ViewReport<'a> {
    pub date: String,
    pub identity: Option<&'a Identity>,
    pub generation: u64,
    pub snapshots: Vec<&'a CollectionSnapshot>,
    pub user_totals: Vec<&'a UserTotalsRow>,
    pub latest_event: String,
    pub latest_approval: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::UserTotals;
    use crate::registry::BusinessRecord;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    fn directory() -> IdentityDirectory {
        IdentityDirectory::new([
            ("A".to_string(), "Alice".to_string()),
            ("B".to_string(), "Bob".to_string()),
        ])
    }

    fn key() -> CacheKey {
        CacheKey::new(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"), None)
    }

    fn built() -> AggregationView {
        let dir = directory();
        let (ledger, _) = KindLedger::from_values(
            CollectionKind::PurchaseOrders,
            vec![
                json!({"POCode": "POIT1", "POStatus": "Open", "currentTotal": 100, "createdBy": "A", "PODate": "2024-03-01T09:00:00Z"}),
                json!({"POCode": "POIT2", "POStatus": "Closed", "currentTotal": 50, "createdBy": "B", "PODate": "2024-03-01T10:00:00Z"}),
            ],
            &dir,
        );
        let totals = UserTotals::seeded(&dir);
        totals.absorb_ledger(&ledger);
        AggregationView::build(
            key(),
            1,
            None,
            vec![KindPart {
                ledger,
                stale: false,
            }],
            totals.snapshot(),
            &dir,
            50,
            FixedOffset::east_opt(0).expect("offset"),
        )
    }

    fn event(value: serde_json::Value) -> LiveEvent {
        LiveEvent {
            channel: LiveChannel::Activity,
            record: BusinessRecord::from_value(CollectionKind::PurchaseOrders, value)
                .expect("record"),
            received_at: Utc
                .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
                .single()
                .expect("ts"),
        }
    }

    #[test]
    fn test_build_populates_feed_and_totals() {
        let view = built();
        let snap = view
            .snapshot(CollectionKind::PurchaseOrders)
            .expect("snapshot");
        assert_eq!(snap.total, 150.0);
        assert_eq!(view.activity().latest().expect("latest").code, "POIT2");
        assert_eq!(view.user_totals().get("A").expect("alice").total_count, 1);
        assert!(view.snapshot(CollectionKind::SalesOrders).is_none());
    }

    #[test]
    fn test_apply_new_record() {
        let mut view = built();
        let outcome = view.apply(
            &event(json!({"POCode": "POIT3", "POStatus": "Open", "currentTotal": 25, "createdBy": "A", "PODate": "2024-03-01T11:00:00Z"})),
            &directory(),
        );
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                latest_changed: true
            }
        );
        let snap = view
            .snapshot(CollectionKind::PurchaseOrders)
            .expect("snapshot");
        assert_eq!(snap.total, 175.0);
        assert_eq!(snap.open, 2);
        assert_eq!(view.user_totals().get("A").expect("alice").total_count, 2);
        assert_eq!(view.activity().latest().expect("latest").code, "POIT3");
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let dir = directory();
        let ev = event(json!({"POCode": "POIT3", "POStatus": "Open", "currentTotal": 25, "createdBy": "A", "PODate": "2024-03-01T11:00:00Z"}));
        let mut view = built();
        view.apply(&ev, &dir);
        let once_snap = view.snapshot(CollectionKind::PurchaseOrders).cloned();
        let once_totals = view.user_totals().clone();

        assert_eq!(
            view.apply(&ev, &dir),
            ApplyOutcome::Applied {
                latest_changed: false
            }
        );
        assert_eq!(view.snapshot(CollectionKind::PurchaseOrders).cloned(), once_snap);
        assert_eq!(view.user_totals(), &once_totals);
    }

    #[test]
    fn test_apply_reassigned_creator_moves_count() {
        let mut view = built();
        view.apply(
            &event(json!({"POCode": "POIT1", "POStatus": "Open", "currentTotal": 100, "createdBy": "B", "PODate": "2024-03-01T09:00:00Z"})),
            &directory(),
        );
        assert_eq!(view.user_totals().get("A").expect("alice").total_count, 0);
        assert_eq!(view.user_totals().get("B").expect("bob").total_count, 2);
    }

    #[test]
    fn test_apply_untracked_and_mismatched() {
        let mut view = built();
        let so = LiveEvent {
            channel: LiveChannel::Activity,
            record: BusinessRecord::from_value(
                CollectionKind::SalesOrders,
                json!({"salesOrderCode": "SOIT1"}),
            )
            .expect("record"),
            received_at: Utc::now(),
        };
        assert_eq!(view.apply(&so, &directory()), ApplyOutcome::NotTracked);
        assert_eq!(
            view.apply(&event(json!({"POCode": "XYZ1"})), &directory()),
            ApplyOutcome::PrefixMismatch
        );
    }

    #[test]
    fn test_report_serializes() {
        let view = built();
        let value = serde_json::to_value(view.report()).expect("serialize");
        assert_eq!(value["date"], "2024-03-01");
        assert_eq!(value["snapshots"][0]["kind"], "purchaseorders");
        assert_eq!(value["snapshots"][0]["rankings"][0]["percentage"], "50.00");
    }
}
