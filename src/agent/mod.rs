use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::KindLedger;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::{CycleReport, CycleStatus, Engine, EngineSettings};
use crate::export::api::{self, ApiState};
use crate::export::health::HealthMetrics;
use crate::identity::IdentityDirectory;
use crate::live::ws::LiveSubscriber;
use crate::live::LiveEvent;
use crate::registry::CollectionKind;
use crate::source::{fetch_with_fallback, FetchOutcome, FetchScope, HttpSource};
use crate::trend::{build_trend, Grouping, TrendReport};

/// Buffered live events between the push channel and the engines.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Agent orchestrates all components: source, engines, live feed and server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Arc<dyn Clock>,
    directory: Arc<IdentityDirectory>,
    engines: Vec<Engine<HttpSource>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.server.addr).context("creating health metrics")?);
        let clock: Arc<dyn Clock> =
            Arc::new(SystemClock::new(cfg.utc_offset_minutes).context("creating clock")?);
        let directory = Arc::new(cfg.directory());

        Ok(Self {
            cfg,
            health,
            clock,
            directory,
            engines: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and run the first aggregation cycles.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Create the collection source.
        let source = Arc::new(create_source(&self.cfg, Some(Arc::clone(&self.health)))?);
        info!(endpoint = %self.cfg.source.endpoint, "collection source configured");

        // 2. Create one engine per consumer view.
        self.engines = self
            .cfg
            .views
            .iter()
            .map(|view| {
                Engine::new(
                    EngineSettings::from_config(view, &self.cfg),
                    Arc::clone(&source),
                    Arc::clone(&self.clock),
                    Arc::clone(&self.directory),
                    Some(Arc::clone(&self.health)),
                )
            })
            .collect();

        // 3. Start the HTTP server (metrics, health and consumer API).
        let state = ApiState::new(
            self.engines.iter().cloned(),
            Arc::clone(&self.directory),
            Arc::clone(&self.clock),
        );
        let addr = self
            .health
            .start(api::router(state))
            .await
            .context("starting http server")?;
        info!(addr = %addr, "http server listening");

        // 4. Select today on every engine.
        let today = self.clock.today();
        for engine in &self.engines {
            if let CycleStatus::Started(_) = engine.select(today, None) {
                debug!(view = %engine.name(), "initial aggregation cycle started");
            }
        }

        // 5. Start the live feed.
        if self.cfg.live.enabled {
            self.spawn_live_feed();
        } else {
            info!("live feed disabled");
        }

        // 6. Start refresh timers.
        for engine in &self.engines {
            self.spawn_refresh_loop(engine.clone());
        }

        info!(views = self.engines.len(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for engine in &self.engines {
            engine.shutdown();
        }

        // Stop HTTP server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn the push-channel client and the pump fanning events out to
    /// every engine.
    fn spawn_live_feed(&self) {
        let (tx, mut rx) = mpsc::channel::<LiveEvent>(LIVE_CHANNEL_CAPACITY);

        let connected = Arc::clone(&self.health);
        let rejected = Arc::clone(&self.health);
        LiveSubscriber::new(&self.cfg.live)
            .with_connection_callback(Box::new(move |up| {
                connected.live_connected.set(if up { 1.0 } else { 0.0 });
            }))
            .with_reject_callback(Box::new(move |reason| {
                rejected.live_frames_rejected.inc();
                debug!(reason, "rejected live frame");
            }))
            .spawn(tx, self.cancel.child_token());

        let cancel = self.cancel.clone();
        let engines = self.engines.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                for engine in &engines {
                    let outcome = engine.absorb(&event);
                    debug!(
                        view = %engine.name(),
                        collection = %event.kind(),
                        code = event.record.code(),
                        outcome = outcome.as_str(),
                        "live event",
                    );
                }
            }
        });
    }

    /// Spawn the background refresh timer for one engine.
    fn spawn_refresh_loop(&self, engine: Engine<HttpSource>) {
        let cancel = self.cancel.clone();
        let period = engine.refresh_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if engine.on_refresh_tick().is_some() {
                            debug!(view = %engine.name(), "refresh cycle started");
                        }
                    }
                }
            }
        });
    }
}

/// Create the HTTP collection source, recording request stats when
/// metrics are given.
fn create_source(cfg: &Config, health: Option<Arc<HealthMetrics>>) -> Result<HttpSource> {
    let source = HttpSource::new(&cfg.source).context("creating collection source")?;

    let Some(health) = health else {
        return Ok(source);
    };

    Ok(source.with_metrics(Box::new(move |endpoint, status, duration| {
        health
            .source_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        health
            .source_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    })))
}

/// Runs a single aggregation cycle for `view_name` and renders the view as
/// pretty JSON.
pub async fn snapshot_once(
    cfg: &Config,
    view_name: &str,
    date: Option<NaiveDate>,
    identity: Option<&str>,
) -> Result<String> {
    let view = cfg
        .view(view_name)
        .with_context(|| format!("unknown view {view_name:?}"))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(cfg.utc_offset_minutes)?);
    let directory = Arc::new(cfg.directory());
    let identity = match identity {
        Some(name) => Some(
            directory
                .find_by_name(name)
                .with_context(|| format!("unknown identity {name:?}"))?,
        ),
        None => None,
    };

    let engine = Engine::new(
        EngineSettings::from_config(view, cfg),
        Arc::new(create_source(cfg, None)?),
        Arc::clone(&clock),
        directory,
        None,
    );

    let date = date.unwrap_or_else(|| clock.today());
    let CycleStatus::Started(handle) = engine.select(date, identity) else {
        bail!("no aggregation cycle started");
    };
    match handle.await.context("joining aggregation cycle")? {
        CycleReport::Published { failed_kinds, .. } => {
            if failed_kinds > 0 {
                warn!(failed_kinds, "some collections could not be fetched");
            }
        }
        other => bail!("aggregation cycle did not publish: {other:?}"),
    }

    let published = engine.view().context("no view published")?;
    serde_json::to_string_pretty(&published.report()).context("encoding view")
}

/// Fetches sales orders, purchase orders and estimations in full and builds
/// the trend report.
pub async fn trend_once(cfg: &Config, grouping: Grouping) -> Result<TrendReport> {
    let source = create_source(cfg, None)?;
    let directory = cfg.directory();

    let sales = fetch_ledger(&source, CollectionKind::SalesOrders, &directory).await?;
    let purchases = fetch_ledger(&source, CollectionKind::PurchaseOrders, &directory).await?;
    let estimations = fetch_ledger(&source, CollectionKind::Estimations, &directory).await?;

    Ok(build_trend(&sales, &purchases, &estimations, grouping))
}

async fn fetch_ledger(
    source: &HttpSource,
    kind: CollectionKind,
    directory: &IdentityDirectory,
) -> Result<KindLedger> {
    match fetch_with_fallback(source, kind, FetchScope::everything()).await {
        FetchOutcome::Fetched { values, .. } => {
            let (ledger, stats) = KindLedger::from_values(kind, values, directory);
            info!(collection = %kind, accepted = stats.accepted, "fetched collection");
            Ok(ledger)
        }
        FetchOutcome::Failed { .. } => {
            error!(collection = %kind, "collection unavailable");
            bail!("fetching {kind} failed")
        }
    }
}
