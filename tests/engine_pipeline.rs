use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};

use bizpulse::clock::ManualClock;
use bizpulse::engine::{
    AbsorbOutcome, CacheKey, CycleReport, CycleStatus, Engine, EngineSettings, IgnoreReason,
};
use bizpulse::identity::{Identity, IdentityDirectory, UNKNOWN};
use bizpulse::live::{LiveEvent, NO_LOGS};
use bizpulse::registry::CollectionKind;
use bizpulse::source::MemorySource;

const REFRESH: Duration = Duration::from_secs(30);

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .expect("time")
}

fn directory() -> Arc<IdentityDirectory> {
    Arc::new(IdentityDirectory::new([
        ("A".to_string(), "Alice".to_string()),
        ("B".to_string(), "Bob".to_string()),
        ("u1".to_string(), "Mostafa Sallam".to_string()),
    ]))
}

struct Harness {
    source: Arc<MemorySource>,
    clock: Arc<ManualClock>,
    directory: Arc<IdentityDirectory>,
    engine: Engine<MemorySource>,
}

fn harness(kinds: &[CollectionKind]) -> Harness {
    let source = Arc::new(MemorySource::new());
    let clock = Arc::new(ManualClock::new(noon()));
    let directory = directory();

    let settings = EngineSettings {
        name: "test".to_string(),
        kinds: kinds.to_vec(),
        refresh_interval: REFRESH,
        cache_entries: 16,
        log_limit: 50,
        replay_capacity: 64,
    };
    let engine = Engine::new(
        settings,
        Arc::clone(&source),
        clock.clone(),
        Arc::clone(&directory),
        None,
    );

    Harness {
        source,
        clock,
        directory,
        engine,
    }
}

async fn finish(status: CycleStatus) -> CycleReport {
    match status {
        CycleStatus::Started(handle) => handle.await.expect("join cycle"),
        CycleStatus::Cached => panic!("expected a new cycle, got a cache hit"),
    }
}

fn purchase_orders() -> Vec<Value> {
    vec![
        json!({"POCode": "POIT1", "POStatus": "Open", "currentTotal": "100", "createdBy": "A",
               "PODate": "2024-03-01T09:00:00Z"}),
        json!({"POCode": "POIT2", "POStatus": "Closed", "currentTotal": "50", "createdBy": "B",
               "PODate": "2024-03-01T10:00:00Z"}),
    ]
}

fn po_event(code: &str, created_by: &str, at: &str, total: u64) -> LiveEvent {
    let frame = json!({
        "event": "newLog",
        "log": {
            "collection": "purchaseorders",
            "POCode": code,
            "POStatus": "Open",
            "currentTotal": total,
            "createdBy": created_by,
            "PODate": at,
        }
    });
    LiveEvent::from_message(&frame.to_string(), noon()).expect("decode event")
}

#[tokio::test]
async fn test_purchase_order_scenario() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());

    let report = finish(h.engine.select(today(), None)).await;
    assert!(matches!(report, CycleReport::Published { failed_kinds: 0, .. }));

    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.total, 150.0);
    assert_eq!(snap.open, 1);
    assert_eq!(snap.closed, 1);
    assert_eq!(snap.cancelled, 0);
    assert_eq!(snap.count, 2);
    assert!(!snap.stale);

    let rankings: Vec<_> = snap
        .rankings
        .iter()
        .map(|r| (r.identity.display_name.as_str(), r.value, r.count, r.percentage.as_str()))
        .collect();
    assert_eq!(
        rankings,
        vec![("Alice", 100.0, 1, "50.00"), ("Bob", 50.0, 1, "50.00")]
    );

    let totals = h.engine.user_totals();
    let alice = totals.get("A").expect("alice row");
    assert_eq!(alice.counts.get(&CollectionKind::PurchaseOrders), Some(&1));
    assert_eq!(alice.total_count, 1);
}

#[tokio::test]
async fn test_unrecognized_status_counts_without_bucket() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    let mut records = purchase_orders();
    records.push(json!({"POCode": "POIT3", "POStatus": "Draft", "currentTotal": 25,
                        "createdBy": "A"}));
    h.source.set(CollectionKind::PurchaseOrders, records);

    finish(h.engine.select(today(), None)).await;

    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 3);
    assert!(snap.open + snap.closed + snap.cancelled < snap.count);
    assert_eq!(snap.total, 175.0);
}

#[tokio::test]
async fn test_prefix_mismatch_and_unknown_excluded() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    let mut records = purchase_orders();
    records.push(json!({"POCode": "XYZ1", "POStatus": "Open", "currentTotal": 999,
                        "createdBy": "A"}));
    records.push(json!({"POCode": "POIT9", "POStatus": "Open", "currentTotal": 10,
                        "createdBy": "nobody"}));
    records.push(json!({"POStatus": "Open", "currentTotal": 5}));
    h.source.set(CollectionKind::PurchaseOrders, records);

    finish(h.engine.select(today(), None)).await;

    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 3);
    assert_eq!(snap.total, 160.0);
    assert!(snap.rankings.iter().all(|r| !r.identity.is_unknown()));

    let totals = h.engine.user_totals();
    assert_eq!(totals.get("A").expect("alice").total_count, 1);
    assert!(totals.get(UNKNOWN).is_none());
}

#[tokio::test]
async fn test_fold_invariant_to_arrival_order() {
    let kinds = [CollectionKind::SalesOrders, CollectionKind::PurchaseOrders];
    let sales = vec![
        json!({"salesOrderCode": "SOIT1", "status": "open", "createdBy": "A",
               "accountDetailsTable": {"totalCalculation": {"netAmount": 300}}}),
        json!({"salesOrderCode": "SOIT2", "status": "closed", "createdBy": "B",
               "accountDetailsTable": {"totalCalculation": {"netAmount": "20.5"}}}),
    ];

    let mut results = Vec::new();
    for (slow, fast) in [(kinds[0], kinds[1]), (kinds[1], kinds[0])] {
        let h = harness(&kinds);
        h.source.set(CollectionKind::SalesOrders, sales.clone());
        h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
        h.source.set_delay(slow, Some(Duration::from_millis(40)));
        h.source.set_delay(fast, None);

        finish(h.engine.select(today(), None)).await;
        results.push((
            h.engine.snapshot(CollectionKind::SalesOrders).expect("so"),
            h.engine.snapshot(CollectionKind::PurchaseOrders).expect("po"),
            h.engine.user_totals(),
        ));
    }

    assert_eq!(results[0], results[1]);
    let totals = &results[0].2;
    assert_eq!(totals.get("A").expect("alice").total_count, 2);
    assert_eq!(totals.get("B").expect("bob").total_count, 2);
}

#[tokio::test]
async fn test_latest_event_ignores_arrival_order() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    finish(h.engine.select(today(), None)).await;
    assert_eq!(h.engine.latest_event_message(), NO_LOGS);

    let later = po_event("POIT2", "A", "2024-03-01T10:00:00Z", 20);
    let earlier = po_event("POIT1", "B", "2024-03-01T09:00:00Z", 10);

    assert_eq!(
        h.engine.absorb(&later),
        AbsorbOutcome::Applied {
            latest_changed: true
        }
    );
    assert_eq!(
        h.engine.absorb(&earlier),
        AbsorbOutcome::Applied {
            latest_changed: false
        }
    );

    let latest = h.engine.latest_event_message();
    assert!(latest.starts_with("Mar 1, 2024, 10:00:00 AM: "), "{latest}");
    assert!(latest.contains("POIT2"));

    // Re-delivery changes nothing.
    assert_eq!(
        h.engine.absorb(&later),
        AbsorbOutcome::Applied {
            latest_changed: false
        }
    );
    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 2);
    assert_eq!(snap.total, 30.0);
    assert_eq!(h.engine.logs(CollectionKind::PurchaseOrders).len(), 2);
}

#[tokio::test]
async fn test_live_update_notifies_subscribers() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    finish(h.engine.select(today(), None)).await;

    let mut rx = h.engine.subscribe_latest();
    h.engine
        .absorb(&po_event("POIT7", "A", "2024-03-01T11:00:00Z", 70));

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("notified in time")
        .expect("sender alive");
    assert!(rx.borrow().contains("POIT7"));
}

#[tokio::test]
async fn test_past_date_never_refreshed_by_timer() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    let yesterday = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");

    finish(h.engine.select(yesterday, None)).await;
    let key = CacheKey::new(yesterday, None);
    let refreshed_at = h.engine.cached(&key).expect("cached").refreshed_at;
    let calls = h.source.calls();

    for _ in 0..5 {
        h.clock.advance(chrono::Duration::hours(1));
        assert!(h.engine.on_refresh_tick().is_none());
    }

    assert_eq!(h.source.calls(), calls);
    assert_eq!(
        h.engine.cached(&key).expect("cached").refreshed_at,
        refreshed_at
    );

    // A past date picked on purpose stays put after midnight.
    h.clock.set(
        Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 5)
            .single()
            .expect("time"),
    );
    assert!(h.engine.on_refresh_tick().is_none());
    assert_eq!(h.engine.selection().date, yesterday);
    assert_eq!(h.source.calls(), calls);
}

#[tokio::test]
async fn test_selection_follows_today_past_midnight() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    let bob = h.directory.find_by_name("bob").expect("identity");

    finish(h.engine.select(today(), Some(bob.clone()))).await;

    h.clock.set(
        Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 5)
            .single()
            .expect("time"),
    );
    let status = h.engine.on_refresh_tick().expect("rollover cycle");
    assert!(matches!(finish(status).await, CycleReport::Published { .. }));

    let next_day = NaiveDate::from_ymd_opt(2024, 3, 2).expect("date");
    let selection = h.engine.selection();
    assert_eq!(selection.date, next_day);
    assert_eq!(selection.identity, Some(bob));
    assert!(h.engine.cached(&CacheKey::new(next_day, Some("B".to_string()))).is_some());

    let outcome = h
        .engine
        .absorb(&po_event("POIT9", "B", "2024-03-02T00:00:01Z", 5));
    assert!(matches!(outcome, AbsorbOutcome::Applied { .. }));

    // Only one rollover per day.
    assert!(h.engine.on_refresh_tick().is_none());
}

#[tokio::test]
async fn test_today_refreshed_after_interval() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());

    finish(h.engine.select(today(), None)).await;
    assert!(h.engine.on_refresh_tick().is_none());

    h.clock.advance(chrono::Duration::seconds(31));
    let status = h.engine.on_refresh_tick().expect("refresh started");
    let report = finish(status).await;
    assert!(matches!(report, CycleReport::Published { .. }));

    let key = CacheKey::new(today(), None);
    assert_eq!(
        h.engine.cached(&key).expect("cached").refreshed_at,
        noon() + chrono::Duration::seconds(31)
    );
}

#[tokio::test]
async fn test_frozen_date_ignores_live_events() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    let yesterday = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
    finish(h.engine.select(yesterday, None)).await;

    let outcome = h
        .engine
        .absorb(&po_event("POIT5", "A", "2024-02-29T10:00:00Z", 5));
    assert_eq!(outcome, AbsorbOutcome::Ignored(IgnoreReason::FrozenDate));

    let other = h.engine.absorb(
        &LiveEvent::from_message(
            r#"{"collection": "salesinvoices", "SICode": "SIIT1"}"#,
            noon(),
        )
        .expect("decode"),
    );
    assert_eq!(other, AbsorbOutcome::Ignored(IgnoreReason::NotTracked));
}

#[tokio::test]
async fn test_identity_filter_round_trip() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    let mut records = purchase_orders();
    records.push(json!({"POCode": "POIT3", "POStatus": "Open", "currentTotal": 40,
                        "createdBy": "u1"}));
    h.source.set(CollectionKind::PurchaseOrders, records);

    finish(h.engine.select(today(), None)).await;
    let unfiltered = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");

    let mostafa = h
        .directory
        .find_by_name("Mostafa Sallam")
        .expect("identity");
    finish(h.engine.select(today(), Some(mostafa.clone()))).await;
    let filtered = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(filtered.total, unfiltered.total);
    assert_eq!(filtered.count, unfiltered.count);
    assert_eq!(filtered.open, unfiltered.open);
    let ranked: Vec<&Identity> = filtered.rankings.iter().map(|r| &r.identity).collect();
    assert_eq!(ranked, vec![&mostafa]);

    assert!(matches!(
        h.engine.select(today(), None),
        CycleStatus::Cached
    ));
    assert_eq!(
        h.engine
            .snapshot(CollectionKind::PurchaseOrders)
            .expect("snapshot"),
        unfiltered
    );
}

#[tokio::test]
async fn test_filter_switch_keeps_absorbed_events() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());

    finish(h.engine.select(today(), None)).await;
    let alice = h.directory.find_by_name("alice").expect("identity");
    finish(h.engine.select(today(), Some(alice))).await;

    let outcome = h
        .engine
        .absorb(&po_event("POIT9", "B", "2024-03-01T11:30:00Z", 25));
    assert!(matches!(outcome, AbsorbOutcome::Applied { .. }));

    assert!(matches!(h.engine.select(today(), None), CycleStatus::Cached));
    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 3);
    assert_eq!(snap.total, 175.0);
    assert!(h.engine.latest_event_message().contains("POIT9"));
    assert_eq!(
        h.engine.user_totals().get("B").expect("bob").total_count,
        2
    );
}

#[tokio::test]
async fn test_events_reach_today_while_past_date_selected() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    let yesterday = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");

    finish(h.engine.select(today(), None)).await;
    finish(h.engine.select(yesterday, None)).await;

    let outcome = h
        .engine
        .absorb(&po_event("POIT9", "A", "2024-03-01T11:30:00Z", 5));
    assert_eq!(outcome, AbsorbOutcome::Ignored(IgnoreReason::FrozenDate));
    assert_eq!(
        h.engine
            .snapshot(CollectionKind::PurchaseOrders)
            .expect("snapshot")
            .count,
        2
    );

    assert!(matches!(h.engine.select(today(), None), CycleStatus::Cached));
    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 3);
    assert_eq!(snap.total, 155.0);
}

#[tokio::test]
async fn test_fallback_then_stale_but_present() {
    let kinds = [CollectionKind::PurchaseOrders, CollectionKind::SalesInvoices];
    let h = harness(&kinds);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    h.source.set(
        CollectionKind::SalesInvoices,
        vec![json!({"SICode": "SIIT1", "createdBy": "A", "totalNetAmount": 80})],
    );
    h.source
        .set_primary_failing(CollectionKind::PurchaseOrders, true);

    let report = finish(h.engine.select(today(), None)).await;
    assert!(matches!(report, CycleReport::Published { failed_kinds: 0, .. }));
    let before = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(before.total, 150.0);

    h.source.set_failing(CollectionKind::PurchaseOrders, true);
    h.source.set(
        CollectionKind::SalesInvoices,
        vec![
            json!({"SICode": "SIIT1", "createdBy": "A", "totalNetAmount": 80}),
            json!({"SICode": "SIIT2", "createdBy": "B", "totalNetAmount": 20}),
        ],
    );

    let report = finish(h.engine.refresh()).await;
    assert!(matches!(report, CycleReport::Published { failed_kinds: 1, .. }));

    let after = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert!(after.stale);
    assert_eq!(after.total, before.total);
    assert_eq!(after.rankings, before.rankings);

    let invoices = h
        .engine
        .snapshot(CollectionKind::SalesInvoices)
        .expect("snapshot");
    assert_eq!(invoices.count, 2);

    let totals = h.engine.user_totals();
    assert_eq!(totals.get("A").expect("alice").total_count, 2);
}

#[tokio::test]
async fn test_superseded_cycle_never_publishes() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    h.source
        .set_delay(CollectionKind::PurchaseOrders, Some(Duration::from_millis(100)));

    let first = h.engine.select(today(), None);
    let bob = h.directory.find_by_name("bob").expect("identity");
    let second = h.engine.select(today(), Some(bob.clone()));

    assert!(matches!(finish(first).await, CycleReport::Cancelled { .. }));
    assert!(matches!(finish(second).await, CycleReport::Published { .. }));

    let view = h.engine.view().expect("view");
    assert_eq!(view.filter(), Some(&bob));
    assert!(h
        .engine
        .cached(&CacheKey::new(today(), None))
        .is_none());
}

#[tokio::test]
async fn test_events_during_cycle_are_replayed() {
    let h = harness(&[CollectionKind::PurchaseOrders]);
    h.source.set(CollectionKind::PurchaseOrders, purchase_orders());
    h.source
        .set_delay(CollectionKind::PurchaseOrders, Some(Duration::from_millis(100)));

    let status = h.engine.select(today(), None);
    let outcome = h
        .engine
        .absorb(&po_event("POIT9", "A", "2024-03-01T11:30:00Z", 5));
    assert_eq!(outcome, AbsorbOutcome::Buffered);

    finish(status).await;

    let snap = h
        .engine
        .snapshot(CollectionKind::PurchaseOrders)
        .expect("snapshot");
    assert_eq!(snap.count, 3);
    assert_eq!(snap.total, 155.0);
    assert!(h.engine.latest_event_message().contains("POIT9"));
    assert_eq!(
        h.engine
            .user_totals()
            .get("A")
            .expect("alice")
            .total_count,
        2
    );
}
