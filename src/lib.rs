pub mod channels;
pub mod epg;
pub mod error;
pub mod filter;
pub mod grid;
pub mod guard;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod simulated;
pub mod tuner;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info};

use channels::{IpChannel, ResolvedChannel, ServiceKind};
use epg::EpgState;
use error::EngineError;
use filter::{DayDelta, Genre};
use grid::{BucketedEvent, TimeSlotGrid};
use manager::DvbManager;
use metrics::MonitoringConfig;
use tuner::TuneOutcome;

struct AppState {
    manager: Arc<DvbManager>,
    monitoring: MonitoringConfig,
}

pub fn create_app(manager: Arc<DvbManager>, monitoring: MonitoringConfig) -> Router {
    let state = Arc::new(AppState {
        manager,
        monitoring,
    });

    Router::new()
        .route("/api/channels", get(channels_handler))
        .route("/api/channels/{index}", get(channel_handler))
        .route("/api/tune", get(tune_status_handler))
        .route("/api/tune/up", post(tune_up_handler))
        .route("/api/tune/down", post(tune_down_handler))
        .route("/api/tune/{index}", post(tune_handler))
        .route("/api/stop", post(stop_handler))
        .route("/api/epg/grid", get(grid_handler))
        .route("/api/epg/state", get(epg_state_handler))
        .route("/api/epg/load/{day}", post(load_handler))
        .route("/api/epg/genre", put(genre_handler))
        .route("/api/epg/record", post(record_handler))
        .route("/api/epg/remind", post(remind_handler))
        .route("/api/epg/remind/manual", post(manual_remind_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Downloads an M3U playlist of IP channels.
pub async fn fetch_ip_channels(url: &str) -> anyhow::Result<Vec<IpChannel>> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let resp = client.get(url).send().await?.error_for_status()?;
    let text = resp.text().await?;
    channels::parse_m3u(&text)
}

/// Loads IP channels from a local playlist file or an http(s) URL.
pub async fn load_ip_playlist(source: &str) -> anyhow::Result<Vec<IpChannel>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_ip_channels(source).await
    } else {
        let text = tokio::fs::read_to_string(source).await?;
        channels::parse_m3u(&text)
    }
}

enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e @ EngineError::OutOfRange { .. }) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            ApiError::Engine(e @ EngineError::NoRoute(_)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Engine(e @ EngineError::MiddlewareUnavailable(_)) => {
                error!("{}", e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => {
                error!("{}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Middleware calls block; keep them off the async workers.
async fn blocking<T, F>(manager: &Arc<DvbManager>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&DvbManager) -> error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(&manager))
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        user_agent
    );
    (StatusCode::NOT_FOUND, "Not found")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub index: usize,
    pub number: usize,
    pub name: String,
    pub kind: ServiceKind,
}

async fn channels_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChannelEntry>>, ApiError> {
    let entries = blocking(&state.manager, |m| {
        let resolver = m.resolver();
        let layout = resolver.layout()?;
        let names = resolver.channel_names()?;
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(index, name)| ChannelEntry {
                index,
                number: index + 1,
                name,
                kind: if index < layout.broadcast_count {
                    ServiceKind::Broadcast
                } else {
                    ServiceKind::Ip
                },
            })
            .collect())
    })
    .await?;
    Ok(Json(entries))
}

async fn channel_handler(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<ResolvedChannel>, ApiError> {
    let channel = blocking(&state.manager, move |m| m.resolver().resolve_channel(index)).await?;
    Ok(Json(channel))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TuneStatus {
    pub current: Option<usize>,
    pub last_watched: Option<usize>,
}

async fn tune_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TuneStatus>, ApiError> {
    let status = blocking(&state.manager, |m| {
        Ok(TuneStatus {
            current: m.tuner().current_channel_number()?,
            last_watched: m.tuner().last_watched(),
        })
    })
    .await?;
    Ok(Json(status))
}

async fn tune_handler(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<TuneOutcome>, ApiError> {
    let outcome = blocking(&state.manager, move |m| {
        m.tuner().change_channel_by_number(index)
    })
    .await?;
    Ok(Json(outcome))
}

async fn tune_up_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TuneOutcome>, ApiError> {
    let outcome = blocking(&state.manager, |m| m.tuner().change_channel_up()).await?;
    Ok(Json(outcome))
}

async fn tune_down_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TuneOutcome>, ApiError> {
    let outcome = blocking(&state.manager, |m| m.tuner().change_channel_down()).await?;
    Ok(Json(outcome))
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    blocking(&state.manager, |m| m.tuner().stop()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn grid_handler(State(state): State<Arc<AppState>>) -> Json<TimeSlotGrid> {
    Json(state.manager.epg().grid().as_ref().clone())
}

async fn epg_state_handler(State(state): State<Arc<AppState>>) -> Json<EpgState> {
    Json(state.manager.epg().state())
}

async fn load_handler(
    State(state): State<Arc<AppState>>,
    Path(day): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let delta: DayDelta = day.parse().map_err(ApiError::BadRequest)?;
    let started = state.manager.epg().spawn_load(&Handle::current(), delta);
    Ok(Json(json!({ "started": started })))
}

#[derive(Debug, Deserialize)]
struct GenreRequest {
    genre: Genre,
}

async fn genre_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenreRequest>,
) -> Result<Json<EpgState>, ApiError> {
    let epg_state = blocking(&state.manager, move |m| {
        m.epg().set_genre_filter(req.genre)?;
        Ok(m.epg().state())
    })
    .await?;
    Ok(Json(epg_state))
}

/// Addresses one entry of the published grid.
#[derive(Debug, Deserialize)]
struct EntryRef {
    hour: usize,
    channel: usize,
    entry: usize,
}

fn lookup_entry(manager: &DvbManager, at: &EntryRef) -> Result<BucketedEvent, ApiError> {
    manager
        .epg()
        .grid()
        .entry(at.hour, at.channel, at.entry)
        .cloned()
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "no guide entry {} for channel {} at hour {}",
                at.entry, at.channel, at.hour
            ))
        })
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    Json(at): Json<EntryRef>,
) -> Result<StatusCode, ApiError> {
    let entry = lookup_entry(&state.manager, &at)?;
    blocking(&state.manager, move |m| m.tuner().schedule_recording(&entry)).await?;
    Ok(StatusCode::CREATED)
}

async fn remind_handler(
    State(state): State<Arc<AppState>>,
    Json(at): Json<EntryRef>,
) -> Result<StatusCode, ApiError> {
    let entry = lookup_entry(&state.manager, &at)?;
    blocking(&state.manager, move |m| m.tuner().schedule_reminder(&entry)).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct ManualReminderRequest {
    channel: usize,
    start: NaiveDateTime,
}

async fn manual_remind_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualReminderRequest>,
) -> Result<StatusCode, ApiError> {
    blocking(&state.manager, move |m| {
        m.tuner().schedule_manual_reminder(req.channel, req.start)
    })
    .await?;
    Ok(StatusCode::CREATED)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    if !state.monitoring.enabled {
        return Err(ApiError::NotFound("monitoring disabled".to_string()));
    }
    metrics::gather_metrics().map_err(|e| ApiError::Internal(format!("metrics: {e}")))
}
