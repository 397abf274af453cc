//! JSON surface for dashboard consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{CollectionSnapshot, UserTotalsRow};
use crate::clock::Clock;
use crate::engine::{CycleStatus, Engine};
use crate::identity::{Identity, IdentityDirectory};
use crate::live::LogEntry;
use crate::registry::CollectionKind;
use crate::source::CollectionSource;

/// Engines by view name plus the shared directory.
pub struct ApiState<S> {
    engines: Arc<BTreeMap<String, Engine<S>>>,
    directory: Arc<IdentityDirectory>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            engines: Arc::clone(&self.engines),
            directory: Arc::clone(&self.directory),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: CollectionSource + 'static> ApiState<S> {
    pub fn new(
        engines: impl IntoIterator<Item = Engine<S>>,
        directory: Arc<IdentityDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engines = engines
            .into_iter()
            .map(|engine| (engine.name().to_string(), engine))
            .collect();
        Self {
            engines: Arc::new(engines),
            directory,
            clock,
        }
    }

    fn engine(&self, view: &str) -> Result<&Engine<S>, ApiError> {
        self.engines
            .get(view)
            .ok_or_else(|| ApiError::UnknownView(view.to_string()))
    }

    fn tracked_kind(
        &self,
        view: &str,
        kind: &str,
    ) -> Result<(&Engine<S>, CollectionKind), ApiError> {
        let engine = self.engine(view)?;
        let kind = CollectionKind::from_name(kind)
            .ok_or_else(|| ApiError::UnknownCollection(kind.to_string()))?;
        if !engine.kinds().contains(&kind) {
            return Err(ApiError::NotTracked {
                view: view.to_string(),
                kind,
            });
        }
        Ok((engine, kind))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown view {0:?}")]
    UnknownView(String),

    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("view {view:?} does not aggregate {kind}")]
    NotTracked { view: String, kind: CollectionKind },

    #[error("unknown identity {0:?}")]
    UnknownIdentity(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownView(_) | Self::UnknownCollection(_) => StatusCode::NOT_FOUND,
            Self::NotTracked { .. } | Self::UnknownIdentity(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Routes for the consumer API.
pub fn router<S: CollectionSource + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        .route("/views", get(list_views::<S>))
        .route("/views/:view/snapshots/:kind", get(snapshot::<S>))
        .route("/views/:view/user-totals", get(user_totals::<S>))
        .route("/views/:view/latest", get(latest::<S>))
        .route("/views/:view/logs/:kind", get(logs::<S>))
        .route("/views/:view/approvals/:kind", get(approvals::<S>))
        .route("/views/:view/selection", post(select::<S>))
        .route("/identities/suggest", get(suggest::<S>))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ViewSummary {
    name: String,
    collections: Vec<CollectionKind>,
    refresh_interval_secs: u64,
    date: NaiveDate,
    identity: Option<Identity>,
    generation: Option<u64>,
}

async fn list_views<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
) -> Json<Vec<ViewSummary>> {
    let views = state
        .engines
        .values()
        .map(|engine| {
            let selection = engine.selection();
            ViewSummary {
                name: engine.name().to_string(),
                collections: engine.kinds().to_vec(),
                refresh_interval_secs: engine.refresh_interval().as_secs(),
                date: selection.date,
                identity: selection.identity,
                generation: engine.view().map(|v| v.generation),
            }
        })
        .collect();
    Json(views)
}

async fn snapshot<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path((view, kind)): Path<(String, String)>,
) -> Result<Json<CollectionSnapshot>, ApiError> {
    let (engine, kind) = state.tracked_kind(&view, &kind)?;
    Ok(Json(
        engine
            .snapshot(kind)
            .unwrap_or_else(|| CollectionSnapshot::empty(kind)),
    ))
}

async fn user_totals<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path(view): Path<String>,
) -> Result<Json<Vec<UserTotalsRow>>, ApiError> {
    let totals = state.engine(&view)?.user_totals();
    Ok(Json(totals.leaderboard().into_iter().cloned().collect()))
}

#[derive(Debug, Serialize)]
struct LatestBody {
    activity: String,
    approval: String,
}

async fn latest<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path(view): Path<String>,
) -> Result<Json<LatestBody>, ApiError> {
    let engine = state.engine(&view)?;
    Ok(Json(LatestBody {
        activity: engine.latest_event_message(),
        approval: engine.latest_approval_message(),
    }))
}

async fn logs<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path((view, kind)): Path<(String, String)>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let (engine, kind) = state.tracked_kind(&view, &kind)?;
    Ok(Json(engine.logs(kind)))
}

async fn approvals<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path((view, kind)): Path<(String, String)>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let (engine, kind) = state.tracked_kind(&view, &kind)?;
    Ok(Json(engine.approvals(kind)))
}

#[derive(Debug, Deserialize)]
struct SelectionBody {
    /// Defaults to today.
    date: Option<NaiveDate>,
    /// Display name; absent or empty clears the filter.
    identity: Option<String>,
}

#[derive(Debug, Serialize)]
struct SelectionResponse {
    status: &'static str,
    date: NaiveDate,
    identity: Option<Identity>,
}

async fn select<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Path(view): Path<String>,
    Json(body): Json<SelectionBody>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let engine = state.engine(&view)?;

    let identity = match body.identity.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(name) => Some(
            state
                .directory
                .find_by_name(name)
                .ok_or_else(|| ApiError::UnknownIdentity(name.to_string()))?,
        ),
    };
    let date = body.date.unwrap_or_else(|| state.clock.today());

    let status = match engine.select(date, identity.clone()) {
        CycleStatus::Cached => "cached",
        CycleStatus::Started(_) => "started",
    };
    tracing::info!(view = %view, date = %date, status, "selection changed");

    Ok(Json(SelectionResponse {
        status,
        date,
        identity,
    }))
}

#[derive(Debug, Deserialize)]
struct SuggestQuery {
    #[serde(default)]
    q: String,
}

async fn suggest<S: CollectionSource + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<SuggestQuery>,
) -> Json<Vec<String>> {
    Json(state.directory.suggest(&query.q))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{CycleReport, EngineSettings};
    use crate::source::MemorySource;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        engine: Engine<MemorySource>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(IdentityDirectory::new([
            ("u1".to_string(), "Mostafa Sallam".to_string()),
            ("u2".to_string(), "Ahmed Sadek".to_string()),
        ]));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("time"),
        ));
        let source = Arc::new(MemorySource::new());
        source.set(
            CollectionKind::PurchaseOrders,
            vec![
                json!({"POCode": "POIT1", "POStatus": "Open", "createdBy": "u1",
                       "currentTotal": 100, "PODate": "2024-03-01T09:00:00Z"}),
                json!({"POCode": "POIT2", "POStatus": "Closed", "createdBy": "u2",
                       "currentTotal": 250, "PODate": "2024-03-01T10:00:00Z"}),
            ],
        );

        let settings = EngineSettings {
            name: "approvals".to_string(),
            kinds: vec![CollectionKind::PurchaseOrders, CollectionKind::SalesOrders],
            refresh_interval: Duration::from_secs(600),
            cache_entries: 8,
            log_limit: 50,
            replay_capacity: 16,
        };
        let engine = Engine::new(
            settings,
            source,
            Arc::clone(&clock),
            Arc::clone(&directory),
            None,
        );
        let app = router(ApiState::new([engine.clone()], directory, clock));
        Fixture { app, engine }
    }

    async fn published(engine: &Engine<MemorySource>) {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        match engine.select(today, None) {
            CycleStatus::Started(handle) => {
                let report = handle.await.expect("join");
                assert!(matches!(report, CycleReport::Published { .. }));
            }
            CycleStatus::Cached => {}
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn test_snapshot_route() {
        let f = fixture();
        published(&f.engine).await;

        let (status, body) = call(&f.app, get("/views/approvals/snapshots/purchaseorders")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 350.0);
        assert_eq!(body["open"], 1);
        assert_eq!(body["closed"], 1);
        assert_eq!(body["rankings"][0]["identity"]["display_name"], "Ahmed Sadek");
    }

    #[tokio::test]
    async fn test_unknown_view_and_kind() {
        let f = fixture();

        let (status, _) = call(&f.app, get("/views/nope/user-totals")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&f.app, get("/views/approvals/snapshots/widgets")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&f.app, get("/views/approvals/logs/opportunities")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .expect("error text")
            .contains("does not aggregate"));
    }

    #[tokio::test]
    async fn test_latest_before_publish() {
        let f = fixture();
        let (status, body) = call(&f.app, get("/views/approvals/latest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activity"], "No logs available.");
    }

    #[tokio::test]
    async fn test_selection_route() {
        let f = fixture();
        published(&f.engine).await;

        let request = Request::builder()
            .method("POST")
            .uri("/views/approvals/selection")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"identity": "mostafa sallam"}"#))
            .expect("request");
        let (status, body) = call(&f.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "started");
        assert_eq!(body["date"], "2024-03-01");
        assert_eq!(body["identity"]["id"], "u1");

        let request = Request::builder()
            .method("POST")
            .uri("/views/approvals/selection")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"identity": "Nobody"}"#))
            .expect("request");
        let (status, _) = call(&f.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_suggest_and_views() {
        let f = fixture();

        let (_, body) = call(&f.app, get("/identities/suggest?q=sa")).await;
        assert_eq!(body, json!(["Ahmed Sadek", "Mostafa Sallam"]));

        let (_, body) = call(&f.app, get("/views")).await;
        assert_eq!(body[0]["name"], "approvals");
        assert_eq!(body[0]["collections"], json!(["purchaseorders", "salesorders"]));
        assert_eq!(body[0]["refresh_interval_secs"], 600);
    }
}
