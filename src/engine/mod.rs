//! Per-consumer aggregation engine.
//!
//! An [`Engine`] owns one consumer view: the current (date, identity)
//! selection, the published [`AggregationView`], a snapshot cache and the
//! live-event path. Each aggregation cycle fans out one task per collection
//! kind, folds the fetched batches concurrently and publishes the combined
//! view only if no newer cycle has started in the meantime.

pub mod cache;
pub mod view;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use cache::{CacheEntry, CacheKey, SnapshotCache};
pub use view::{AggregationView, ApplyOutcome, KindPart, ViewReport};

use crate::aggregate::{CollectionSnapshot, KindLedger, UserTotals, UserTotalsSnapshot};
use crate::clock::Clock;
use crate::config::{Config, ViewConfig};
use crate::export::health::HealthMetrics;
use crate::identity::{Identity, IdentityDirectory};
use crate::live::{LiveEvent, LogEntry, NO_LOGS};
use crate::registry::{self, CollectionKind};
use crate::source::{fetch_with_fallback, CollectionSource, FetchOutcome, FetchScope};

/// Live events remembered for replay onto a cycle that is still in flight.
const DEFAULT_REPLAY_CAPACITY: usize = 1024;

/// Static settings of one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub name: String,
    pub kinds: Vec<CollectionKind>,
    pub refresh_interval: Duration,
    pub cache_entries: usize,
    pub log_limit: usize,
    pub replay_capacity: usize,
}

impl EngineSettings {
    pub fn from_config(view: &ViewConfig, cfg: &Config) -> Self {
        Self {
            name: view.name.clone(),
            kinds: view.collections.clone(),
            refresh_interval: view.refresh_interval,
            cache_entries: cfg.cache.max_entries,
            log_limit: cfg.log_limit,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

/// The (date, identity) context a consumer is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub date: NaiveDate,
    pub identity: Option<Identity>,
}

impl Selection {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.date, self.identity.as_ref().map(|i| i.id.clone()))
    }
}

/// How a selection change or refresh was satisfied.
#[derive(Debug)]
pub enum CycleStatus {
    /// Served from a fresh cache entry.
    Cached,
    /// A new aggregation cycle is running.
    Started(JoinHandle<CycleReport>),
}

/// How an aggregation cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleReport {
    Published { generation: u64, failed_kinds: usize },
    /// Finished after a newer cycle had started; result dropped.
    Discarded { generation: u64 },
    /// Cancelled before all fetches completed.
    Cancelled { generation: u64 },
}

/// Why a live event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The engine does not aggregate the event's kind.
    NotTracked,
    /// The selected date is not today.
    FrozenDate,
    /// The record's code lacks its kind's prefix.
    PrefixMismatch,
}

impl IgnoreReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotTracked => "not_tracked",
            Self::FrozenDate => "frozen_date",
            Self::PrefixMismatch => "prefix_mismatch",
        }
    }
}

/// Result of [`Engine::absorb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorbOutcome {
    Applied { latest_changed: bool },
    /// No view is published for the selection yet; the event will be
    /// replayed when the running cycle publishes.
    Buffered,
    Ignored(IgnoreReason),
}

impl AbsorbOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Buffered => "buffered",
            Self::Ignored(reason) => reason.as_str(),
        }
    }
}

struct Current {
    selection: Selection,
    cancel: CancellationToken,
}

struct Inner<S> {
    settings: EngineSettings,
    source: Arc<S>,
    clock: Arc<dyn Clock>,
    directory: Arc<IdentityDirectory>,
    metrics: Option<Arc<HealthMetrics>>,
    cache: SnapshotCache,
    /// Latest issued cycle generation.
    generation: AtomicU64,
    /// Generation of the last published or cache-served view.
    settled: AtomicU64,
    current: Mutex<Current>,
    /// Business day seen by the last refresh tick.
    day: Mutex<NaiveDate>,
    view: ArcSwapOption<AggregationView>,
    /// Serialises publication and live absorption.
    writer: Mutex<()>,
    live_seq: AtomicU64,
    replay: Mutex<VecDeque<(u64, LiveEvent)>>,
    latest_tx: watch::Sender<String>,
    approval_tx: watch::Sender<String>,
    shutdown: CancellationToken,
}

/// Aggregation engine for one consumer view. Cheap to clone.
pub struct Engine<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CollectionSource + 'static> Engine<S> {
    /// Creates an engine selecting today with no identity filter. Nothing is
    /// fetched until [`Engine::select`] or [`Engine::refresh`] is called.
    pub fn new(
        settings: EngineSettings,
        source: Arc<S>,
        clock: Arc<dyn Clock>,
        directory: Arc<IdentityDirectory>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let today = clock.today();
        let selection = Selection {
            date: today,
            identity: None,
        };
        let cache = SnapshotCache::new(settings.cache_entries, settings.refresh_interval);
        let (latest_tx, _) = watch::channel(NO_LOGS.to_string());
        let (approval_tx, _) = watch::channel(NO_LOGS.to_string());

        Self {
            inner: Arc::new(Inner {
                settings,
                source,
                clock,
                directory,
                metrics,
                cache,
                generation: AtomicU64::new(0),
                settled: AtomicU64::new(0),
                current: Mutex::new(Current {
                    selection,
                    cancel: CancellationToken::new(),
                }),
                day: Mutex::new(today),
                view: ArcSwapOption::empty(),
                writer: Mutex::new(()),
                live_seq: AtomicU64::new(0),
                replay: Mutex::new(VecDeque::new()),
                latest_tx,
                approval_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn kinds(&self) -> &[CollectionKind] {
        &self.inner.settings.kinds
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.settings.refresh_interval
    }

    pub fn directory(&self) -> &IdentityDirectory {
        &self.inner.directory
    }

    pub fn selection(&self) -> Selection {
        self.inner.current.lock().selection.clone()
    }

    /// Changes the (date, identity) selection. Any running cycle is
    /// cancelled. A fresh cache entry is published immediately; otherwise a
    /// new cycle starts and, if the key changed, the previous view is
    /// withdrawn until it publishes.
    pub fn select(&self, date: NaiveDate, identity: Option<Identity>) -> CycleStatus {
        let selection = Selection { date, identity };
        let key = selection.key();
        let (generation, cancel, key_changed) = self.begin(selection.clone());

        let today = self.inner.clock.today();
        let now = self.inner.clock.now();
        if let Some(entry) = self.inner.cache.lookup_fresh(&key, today, now) {
            self.record_cache_lookup("hit");
            let _writer = self.inner.writer.lock();
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                self.inner.settled.store(generation, Ordering::SeqCst);
                self.inner.view.store(Some(Arc::clone(&entry.view)));
                self.emit_latest(&entry.view);
                debug!(view = %self.name(), date = %date, "served selection from cache");
            }
            return CycleStatus::Cached;
        }
        self.record_cache_lookup("miss");

        if key_changed {
            let _writer = self.inner.writer.lock();
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                self.inner.view.store(None);
                self.inner.latest_tx.send_replace(NO_LOGS.to_string());
                self.inner.approval_tx.send_replace(NO_LOGS.to_string());
            }
        }

        CycleStatus::Started(self.spawn_cycle(selection, generation, cancel))
    }

    /// Starts a new cycle for the current selection, bypassing the cache.
    /// The current view stays visible until the new one publishes.
    pub fn refresh(&self) -> CycleStatus {
        let selection = self.selection();
        let (generation, cancel, _) = self.begin(selection.clone());
        CycleStatus::Started(self.spawn_cycle(selection, generation, cancel))
    }

    /// Background timer hook. Drops stale entries for today and refreshes
    /// the current selection when it is today and no longer fresh. A
    /// selection still on the previous business day moves to the new one
    /// after midnight. Other past dates are never refreshed.
    pub fn on_refresh_tick(&self) -> Option<CycleStatus> {
        let today = self.inner.clock.today();
        let now = self.inner.clock.now();

        let evicted = self.inner.cache.evict_stale_today(today, now);
        if evicted > 0 {
            debug!(view = %self.name(), evicted, "evicted stale cache entries");
        }
        self.record_cache_size();

        let previous_day = std::mem::replace(&mut *self.inner.day.lock(), today);
        let selection = self.selection();
        if previous_day < today && selection.date == previous_day {
            info!(
                view = %self.name(),
                from = %previous_day,
                to = %today,
                "business day rolled over, following today",
            );
            return Some(self.select(today, selection.identity));
        }
        if selection.date < today {
            return None;
        }
        if self
            .inner
            .cache
            .lookup_fresh(&selection.key(), today, now)
            .is_some()
        {
            return None;
        }
        if self.in_flight() {
            debug!(view = %self.name(), "refresh skipped, cycle already running");
            return None;
        }
        Some(self.refresh())
    }

    /// Applies a pushed record to the published view and to every cached
    /// view of today. The published view takes events only while today is
    /// selected.
    pub fn absorb(&self, event: &LiveEvent) -> AbsorbOutcome {
        let outcome = self.absorb_inner(event);
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .live_events_total
                .with_label_values(&[self.name(), outcome.as_str()])
                .inc();
        }
        outcome
    }

    fn absorb_inner(&self, event: &LiveEvent) -> AbsorbOutcome {
        if !self.inner.settings.kinds.contains(&event.kind()) {
            return AbsorbOutcome::Ignored(IgnoreReason::NotTracked);
        }
        if registry::match_kind(&event.record).is_none() {
            return AbsorbOutcome::Ignored(IgnoreReason::PrefixMismatch);
        }
        let today = self.inner.clock.today();

        let _writer = self.inner.writer.lock();
        let selection = self.selection();

        let overlaid = self.overlay_cached(event, today, &selection.key());
        if overlaid > 0 {
            debug!(view = %self.name(), overlaid, "applied live event to cached views");
        }
        if selection.date != today {
            return AbsorbOutcome::Ignored(IgnoreReason::FrozenDate);
        }

        let seq = self.inner.live_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut replay = self.inner.replay.lock();
            if replay.len() >= self.inner.settings.replay_capacity.max(1) {
                replay.pop_front();
            }
            replay.push_back((seq, event.clone()));
        }

        let Some(current) = self.inner.view.load_full() else {
            return AbsorbOutcome::Buffered;
        };
        if current.key != selection.key() {
            return AbsorbOutcome::Buffered;
        }

        let mut next = (*current).clone();
        match next.apply(event, &self.inner.directory) {
            ApplyOutcome::Applied { latest_changed } => {
                let next = Arc::new(next);
                self.inner.cache.replace_view(&next.key, Arc::clone(&next));
                self.inner.view.store(Some(Arc::clone(&next)));
                if latest_changed {
                    self.emit_latest(&next);
                }
                AbsorbOutcome::Applied { latest_changed }
            }
            ApplyOutcome::NotTracked => AbsorbOutcome::Ignored(IgnoreReason::NotTracked),
            ApplyOutcome::PrefixMismatch => AbsorbOutcome::Ignored(IgnoreReason::PrefixMismatch),
        }
    }

    /// Currently published view, if any.
    pub fn view(&self) -> Option<Arc<AggregationView>> {
        self.inner.view.load_full()
    }

    pub fn snapshot(&self, kind: CollectionKind) -> Option<CollectionSnapshot> {
        self.view().and_then(|v| v.snapshot(kind).cloned())
    }

    pub fn user_totals(&self) -> UserTotalsSnapshot {
        self.view()
            .map(|v| v.user_totals().clone())
            .unwrap_or_default()
    }

    /// `"<timestamp>: <message>"` of the newest activity, or the no-logs text.
    pub fn latest_event_message(&self) -> String {
        self.view()
            .map(|v| v.activity().latest_message())
            .unwrap_or_else(|| NO_LOGS.to_string())
    }

    pub fn latest_approval_message(&self) -> String {
        self.view()
            .map(|v| v.approvals().latest_message())
            .unwrap_or_else(|| NO_LOGS.to_string())
    }

    pub fn logs(&self, kind: CollectionKind) -> Vec<LogEntry> {
        self.view()
            .map(|v| v.activity().logs(kind).to_vec())
            .unwrap_or_default()
    }

    pub fn approvals(&self, kind: CollectionKind) -> Vec<LogEntry> {
        self.view()
            .map(|v| v.approvals().logs(kind).to_vec())
            .unwrap_or_default()
    }

    /// Cache entry for `key`, regardless of freshness.
    pub fn cached(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.cache.get(key)
    }

    /// Receives the latest-activity line whenever it changes.
    pub fn subscribe_latest(&self) -> watch::Receiver<String> {
        self.inner.latest_tx.subscribe()
    }

    /// Receives the latest-approval line whenever it changes.
    pub fn subscribe_approvals(&self) -> watch::Receiver<String> {
        self.inner.approval_tx.subscribe()
    }

    /// Cancels every running cycle.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Applies `event` to cached views of `today` other than `skip`, keeping
    /// their refresh times. Returns the number of views changed.
    fn overlay_cached(&self, event: &LiveEvent, today: NaiveDate, skip: &CacheKey) -> usize {
        self.inner.cache.update_date(today, |key, view| {
            if key == skip {
                return None;
            }
            let mut next = view.clone();
            match next.apply(event, &self.inner.directory) {
                ApplyOutcome::Applied { .. } => Some(Arc::new(next)),
                _ => None,
            }
        })
    }

    fn in_flight(&self) -> bool {
        self.inner.generation.load(Ordering::SeqCst) != self.inner.settled.load(Ordering::SeqCst)
    }

    /// Installs a new selection under a fresh generation and cancels the
    /// previous cycle.
    fn begin(&self, selection: Selection) -> (u64, CancellationToken, bool) {
        let mut current = self.inner.current.lock();
        current.cancel.cancel();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();
        let key_changed = current.selection.key() != selection.key();

        *current = Current {
            selection,
            cancel: cancel.clone(),
        };
        (generation, cancel, key_changed)
    }

    fn spawn_cycle(
        &self,
        selection: Selection,
        generation: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<CycleReport> {
        // Live events absorbed from here on are replayed onto the result.
        let mark = {
            let _writer = self.inner.writer.lock();
            self.inner.live_seq.load(Ordering::SeqCst)
        };
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run_cycle(selection, generation, mark, cancel)
                .await
        })
    }

    async fn run_cycle(
        &self,
        selection: Selection,
        generation: u64,
        mark: u64,
        cancel: CancellationToken,
    ) -> CycleReport {
        self.record_cycle("started");
        info!(
            view = %self.name(),
            generation,
            date = %selection.date,
            identity = ?selection.identity.as_ref().map(|i| i.display_name.as_str()),
            "aggregation cycle started",
        );

        let user_totals = Arc::new(UserTotals::seeded(&self.inner.directory));
        let scope = FetchScope::day(selection.date);
        let mut tasks = JoinSet::new();

        // 1. Fan out one fetch-and-fold task per kind.
        for &kind in &self.inner.settings.kinds {
            let source = Arc::clone(&self.inner.source);
            let directory = Arc::clone(&self.inner.directory);
            let user_totals = Arc::clone(&user_totals);
            let metrics = self.inner.metrics.clone();

            tasks.spawn(async move {
                let outcome = fetch_with_fallback(source.as_ref(), kind, scope).await;
                if let Some(m) = &metrics {
                    m.fetch_requests_total
                        .with_label_values(&[kind.as_str(), outcome.label()])
                        .inc();
                    m.fetch_duration
                        .with_label_values(&[kind.as_str()])
                        .observe(outcome.elapsed().as_secs_f64());
                }

                match outcome {
                    FetchOutcome::Fetched { values, .. } => {
                        let (ledger, stats) = KindLedger::from_values(kind, values, &directory);
                        if let Some(m) = &metrics {
                            m.records_skipped_total
                                .with_label_values(&[kind.as_str(), "malformed"])
                                .inc_by(stats.malformed as f64);
                            m.records_skipped_total
                                .with_label_values(&[kind.as_str(), "prefix_mismatch"])
                                .inc_by(stats.mismatched as f64);
                        }
                        user_totals.absorb_ledger(&ledger);
                        (kind, Some(ledger))
                    }
                    FetchOutcome::Failed { .. } => (kind, None),
                }
            });
        }

        // 2. Wait for every kind unless the cycle is superseded.
        let mut results = HashMap::new();
        let completed = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = drain(&mut tasks, &mut results) => true,
        };
        if !completed {
            tasks.abort_all();
            self.record_cycle("cancelled");
            debug!(view = %self.name(), generation, "aggregation cycle cancelled");
            return CycleReport::Cancelled { generation };
        }

        // 3. Publish if still current.
        self.publish(selection, generation, mark, results, &user_totals)
    }

    fn publish(
        &self,
        selection: Selection,
        generation: u64,
        mark: u64,
        mut results: HashMap<CollectionKind, Option<KindLedger>>,
        user_totals: &UserTotals,
    ) -> CycleReport {
        let _writer = self.inner.writer.lock();

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            self.record_cycle("discarded");
            info!(view = %self.name(), generation, "discarding stale aggregation cycle");
            return CycleReport::Discarded { generation };
        }

        let key = selection.key();
        let previous = self
            .inner
            .cache
            .get(&key)
            .map(|entry| entry.view)
            .or_else(|| self.view().filter(|v| v.key == key));

        let mut parts = Vec::with_capacity(self.inner.settings.kinds.len());
        let mut failed_kinds = 0;
        for &kind in &self.inner.settings.kinds {
            match results.remove(&kind).flatten() {
                Some(ledger) => parts.push(KindPart {
                    ledger,
                    stale: false,
                }),
                None => {
                    failed_kinds += 1;
                    let carried = previous.as_ref().and_then(|v| v.ledger(kind)).cloned();
                    warn!(
                        view = %self.name(),
                        collection = %kind,
                        carried = carried.is_some(),
                        "fetch failed, keeping last known snapshot",
                    );
                    let ledger = carried.unwrap_or_else(|| KindLedger::new(kind));
                    user_totals.absorb_ledger(&ledger);
                    parts.push(KindPart {
                        ledger,
                        stale: true,
                    });
                }
            }
        }

        let mut view = AggregationView::build(
            key.clone(),
            generation,
            selection.identity,
            parts,
            user_totals.snapshot(),
            &self.inner.directory,
            self.inner.settings.log_limit,
            self.inner.clock.offset(),
        );

        if selection.date == self.inner.clock.today() {
            let replay = self.inner.replay.lock();
            let mut replayed = 0usize;
            for (seq, event) in replay.iter() {
                if *seq >= mark {
                    view.apply(event, &self.inner.directory);
                    replayed += 1;
                }
            }
            if replayed > 0 {
                debug!(view = %self.name(), replayed, "replayed live events onto new view");
            }
        }

        let view = Arc::new(view);
        self.inner
            .cache
            .insert(key, Arc::clone(&view), self.inner.clock.now());
        self.inner.view.store(Some(Arc::clone(&view)));
        self.inner.settled.store(generation, Ordering::SeqCst);
        self.emit_latest(&view);

        self.record_cycle("published");
        self.record_cache_size();
        info!(
            view = %self.name(),
            generation,
            failed_kinds,
            "aggregation cycle published",
        );

        CycleReport::Published {
            generation,
            failed_kinds,
        }
    }

    fn emit_latest(&self, view: &AggregationView) {
        let activity = view.activity().latest_message();
        self.inner.latest_tx.send_if_modified(|current| {
            if *current == activity {
                return false;
            }
            *current = activity;
            true
        });

        let approval = view.approvals().latest_message();
        self.inner.approval_tx.send_if_modified(|current| {
            if *current == approval {
                return false;
            }
            *current = approval;
            true
        });
    }

    fn record_cycle(&self, result: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .cycles_total
                .with_label_values(&[self.name(), result])
                .inc();
        }
    }

    fn record_cache_lookup(&self, result: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .cache_lookups_total
                .with_label_values(&[self.name(), result])
                .inc();
        }
    }

    fn record_cache_size(&self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .cache_entries
                .with_label_values(&[self.name()])
                .set(self.inner.cache.len() as f64);
        }
    }
}

type KindResult = (CollectionKind, Option<KindLedger>);

async fn drain(
    tasks: &mut JoinSet<KindResult>,
    results: &mut HashMap<CollectionKind, Option<KindLedger>>,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((kind, ledger)) => {
                results.insert(kind, ledger);
            }
            Err(e) => error!(error = %e, "collection task failed"),
        }
    }
}
