//! Axum JSON API over the opportunity store, matcher and sync manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use govmatch_core::{CapabilityUpdate, MatchRecord, NewCapability, HIGH_MATCH_THRESHOLD};
use govmatch_matcher::{CapabilityMatcher, MatchError};
use govmatch_storage::{OpportunityFilter, Store, StoreError, SYNC_LEASE};
use govmatch_sync::{SyncConfig, SyncError, SyncManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "govmatch-web";

const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 1000;
const MANUAL_SYNC_LEASE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub matcher: CapabilityMatcher,
    pub sync: Option<Arc<SyncManager>>,
    pub max_opportunities: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            matcher: CapabilityMatcher::new(store.clone()),
            store,
            sync: None,
            max_opportunities: 90,
        }
    }

    pub fn with_sync(mut self, manager: Arc<SyncManager>, max_opportunities: usize) -> Self {
        self.sync = Some(manager);
        self.max_opportunities = max_opportunities;
        self
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m,
        };
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        }
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Conflict(_) | StoreError::VersionConflict { .. } => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::Validation(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<MatchError> for ApiError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Store(err) => err.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(_) => ApiError::BadRequest(err.to_string()),
            SyncError::Store(err) => err.into(),
            SyncError::Config(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok(data: impl Serialize) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })).into_response())
}

fn ok_list<T: Serialize>(items: Vec<T>) -> ApiResult {
    let count = items.len();
    Ok(Json(json!({ "success": true, "data": items, "count": count })).into_response())
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid id {raw:?}")))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/opportunities", get(list_opportunities_handler))
        .route("/api/opportunities/{id}", get(opportunity_detail_handler))
        .route("/api/opportunities/{id}/analyze", post(analyze_handler))
        .route(
            "/api/capabilities",
            get(list_capabilities_handler).post(create_capability_handler),
        )
        .route("/api/capabilities/{id}", put(update_capability_handler))
        .route("/api/matches/high", get(high_matches_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/sync/state", get(sync_state_handler))
        .route("/api/sync/jobs", get(sync_jobs_handler))
        .route("/api/sync/incremental", post(incremental_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let store = govmatch_sync::connect_store(&config).await?;
    let mut state = AppState::new(store.clone());
    match govmatch_sync::build_manager(&config, store) {
        Ok(manager) => {
            state = state.with_sync(Arc::new(manager), config.max_opportunities);
        }
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(error = %reason, "sync endpoint disabled");
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Json<JsonValue> {
    Json(json!({
        "message": "Government opportunity matching API",
        "endpoints": {
            "opportunities": "/api/opportunities",
            "capabilities": "/api/capabilities",
            "high_matches": "/api/matches/high",
            "statistics": "/api/statistics",
            "sync_state": "/api/sync/state",
            "sync_jobs": "/api/sync/jobs",
            "incremental_sync": "/api/sync/incremental"
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct OpportunitiesQuery {
    naics: Option<String>,
    agency: Option<String>,
    set_aside: Option<String>,
    days: Option<u32>,
    limit: Option<usize>,
    skip: Option<usize>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn list_opportunities_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<OpportunitiesQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let posted_since = match query.days {
        Some(days) => Some(
            ChronoDuration::try_days(i64::from(days))
                .and_then(|back| Utc::now().checked_sub_signed(back))
                .ok_or_else(|| ApiError::BadRequest(format!("days {days} is out of range")))?
                .date_naive(),
        ),
        None => None,
    };
    let filter = OpportunityFilter {
        naics_code: non_empty(query.naics),
        agency_contains: non_empty(query.agency),
        set_aside: non_empty(query.set_aside),
        posted_since,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    let skip = query.skip.unwrap_or(0);
    let rows = state.store.scan_opportunities(&filter, skip, limit).await?;
    ok_list(rows)
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let opportunity = state
        .store
        .find_opportunity(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Opportunity not found".into()))?;
    let matches = state.store.matches_for_opportunity(id).await?;
    let matches = expand_matches(state.store.as_ref(), matches, false).await?;
    ok(json!({ "opportunity": opportunity, "matches": matches }))
}

async fn analyze_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id)?;
    let opportunity = state
        .store
        .find_opportunity(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Opportunity not found".into()))?;
    let results = state.matcher.analyze_opportunity(&opportunity).await?;
    ok_list(results)
}

#[derive(Debug, Deserialize)]
struct CapabilitiesQuery {
    active: Option<bool>,
}

async fn list_capabilities_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CapabilitiesQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let rows = state
        .store
        .list_capabilities(query.active.unwrap_or(true))
        .await?;
    ok_list(rows)
}

async fn create_capability_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewCapability>, JsonRejection>,
) -> ApiResult {
    let Json(new) = body?;
    let id = state.store.create_capability(&new).await?;
    info!(%id, name = %new.name, "capability created");
    let body = Json(json!({ "success": true, "data": { "id": id } }));
    Ok((StatusCode::CREATED, body).into_response())
}

async fn update_capability_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<CapabilityUpdate>, JsonRejection>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let Json(update) = body?;
    if update.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".into()));
    }
    if !state.store.update_capability(id, &update).await? {
        return Err(ApiError::NotFound("Capability not found".into()));
    }
    let capability = state.store.find_capability(id).await?;
    ok(capability)
}

#[derive(Debug, Deserialize)]
struct HighMatchesQuery {
    threshold: Option<f64>,
    limit: Option<usize>,
}

async fn high_matches_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HighMatchesQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let threshold = query.threshold.unwrap_or(HIGH_MATCH_THRESHOLD);
    if !(0.0..=100.0).contains(&threshold) {
        return Err(ApiError::BadRequest(format!(
            "threshold {threshold} must be between 0 and 100"
        )));
    }
    let limit = query.limit.unwrap_or(50).min(MAX_PAGE_LIMIT);
    let rows = state.store.high_matches(threshold, limit).await?;
    ok_list(expand_matches(state.store.as_ref(), rows, true).await?)
}

/// Inline the capability (and optionally the opportunity) each match refers to.
async fn expand_matches(
    store: &dyn Store,
    matches: Vec<MatchRecord>,
    with_opportunity: bool,
) -> Result<Vec<JsonValue>, ApiError> {
    let mut capabilities = HashMap::new();
    let mut expanded = Vec::with_capacity(matches.len());
    for record in matches {
        if !capabilities.contains_key(&record.capability_id) {
            let capability = store.find_capability(record.capability_id).await?;
            capabilities.insert(record.capability_id, capability);
        }
        let opportunity = if with_opportunity {
            store.find_opportunity(record.opportunity_id).await?
        } else {
            None
        };

        let mut value =
            serde_json::to_value(&record).map_err(|err| ApiError::Internal(err.to_string()))?;
        if let JsonValue::Object(fields) = &mut value {
            fields.insert("capability".into(), json!(capabilities.get(&record.capability_id)));
            if with_opportunity {
                fields.insert("opportunity".into(), json!(opportunity));
            }
        }
        expanded.push(value);
    }
    Ok(expanded)
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.store.statistics(Utc::now()).await?)
}

async fn sync_state_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.store.load_sync_state().await?)
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

async fn sync_jobs_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<JobsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let rows = state
        .store
        .job_history(query.limit.unwrap_or(20).min(MAX_PAGE_LIMIT))
        .await?;
    ok_list(rows)
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    max: Option<usize>,
}

async fn incremental_sync_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SyncQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let manager = state
        .sync
        .clone()
        .ok_or_else(|| ApiError::Unavailable("sync is not configured".into()))?;

    let holder = Uuid::new_v4();
    if !state
        .store
        .try_acquire_lease(SYNC_LEASE, holder, MANUAL_SYNC_LEASE_TTL)
        .await?
    {
        return Err(ApiError::Conflict("a sync run is already in progress".into()));
    }
    let run = manager
        .incremental_sync(query.max.unwrap_or(state.max_opportunities))
        .await;
    if let Err(err) = state.store.release_lease(SYNC_LEASE, holder).await {
        warn!(error = %err, "could not release sync lease");
    }
    ok(run?)
}
