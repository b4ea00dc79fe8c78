/**
 * API HTTP DAQLINK - Surface viewers et requêtes historiques
 *
 * RÔLE :
 * Expose l'état live (machines connectées, WebSocket par machine) et les
 * agrégats persistés (heure/jour/mois/année, anomalies).
 *
 * ROUTES :
 * - GET /health                    état du kernel (uptime, sessions, machines live)
 * - GET /sio/machineList           machines connectées
 * - GET /sio/{machine}             WebSocket : initialize (rejeu) puis update / anomaly
 * - GET /stat/machineList          machines ayant un stockage
 * - GET /stat/{granularity}        ?machine&start&end -> [{name, time, data}]
 * - GET /stat/anomaly              ?machine&start&end -> anomalies, plus récentes d'abord
 * - GET /stat/anomaly/all          ?start&end -> toutes machines, plus récentes d'abord
 *
 * CORS permissif : les dashboards sont servis depuis d'autres origines.
 */

use crate::channels::{viewer_queue, ChannelError, ViewerRx};
use crate::clock::date_serde;
use crate::coordinator::{CoordinatorGone, CoordinatorHandle};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{AnomalyRow, Granularity, MachineList, StatRow};
use crate::persistence::{PersistenceError, SharedStore};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use time::Date;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub store: SharedStore,
    pub health_tracker: HealthTracker,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] PersistenceError),
    #[error(transparent)]
    Unavailable(#[from] CoordinatorGone),
    #[error(transparent)]
    NotLive(#[from] ChannelError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Storage(PersistenceError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotLive(_) => StatusCode::NOT_FOUND,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MachineRange {
    machine: String,
    #[serde(with = "date_serde")]
    start: Date,
    #[serde(with = "date_serde")]
    end: Date,
}

#[derive(Debug, Deserialize)]
struct DateRange {
    #[serde(with = "date_serde")]
    start: Date,
    #[serde(with = "date_serde")]
    end: Date,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/sio/machineList", get(live_machines))
        .route("/sio/{machine}", get(attach_viewer))
        .route("/stat/machineList", get(stored_machines))
        .route("/stat/anomaly", get(machine_anomalies))
        .route("/stat/anomaly/all", get(all_anomalies))
        .route("/stat/{granularity}", get(get_stat))
        .with_state(app_state)
        .layer(CorsLayer::permissive())
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.coordinator))
}

// GET /sio/machineList
async fn live_machines(State(app): State<AppState>) -> Result<Json<MachineList>, ApiError> {
    let machine_list = app.coordinator.list_machines().await?;
    Ok(Json(MachineList { machine_list }))
}

// GET /sio/{machine} (upgrade WebSocket)
async fn attach_viewer(
    State(app): State<AppState>,
    Path(machine): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    // attach avant l'upgrade : machine inconnue -> 404, le rejeu attend dans la file du viewer
    let (tx, rx) = viewer_queue();
    app.coordinator.attach(&machine, tx).await??;
    match ws {
        Ok(ws) => Ok(ws.on_upgrade(move |socket| pump_viewer(socket, machine, rx))),
        Err(rejection) => Ok(rejection.into_response()),
    }
}

async fn pump_viewer(mut socket: WebSocket, machine: String, mut rx: ViewerRx) {
    debug!(machine = %machine, "viewer connected");
    loop {
        tokio::select! {
            event = rx.recv() => {
                // canal détruit : la machine s'est déconnectée
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(machine = %machine, error = %e, "failed to serialize viewer event");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
    debug!(machine = %machine, "viewer disconnected");
}

// GET /stat/machineList
async fn stored_machines(State(app): State<AppState>) -> Result<Json<MachineList>, ApiError> {
    let machine_list = app.store.list_machines().await?;
    Ok(Json(MachineList { machine_list }))
}

// GET /stat/{hour|day|month|year}
async fn get_stat(
    State(app): State<AppState>,
    Path(granularity): Path<Granularity>,
    Query(q): Query<MachineRange>,
) -> Result<Json<Vec<StatRow>>, ApiError> {
    let mut rows = Vec::new();
    for series in app.store.list_series(&q.machine, granularity).await? {
        let records = app.store.query_range(&q.machine, &series, q.start, q.end).await?;
        rows.extend(records.into_iter().map(|r| StatRow { name: series.clone(), time: r.time, data: r.value }));
    }
    Ok(Json(rows))
}

async fn anomalies_of(app: &AppState, machine: &str, start: Date, end: Date) -> Result<Vec<AnomalyRow>, ApiError> {
    let records = app.store.query_anomalies(machine, start, end).await?;
    Ok(records
        .into_iter()
        .map(|r| AnomalyRow { name: machine.to_string(), time: r.time, score: r.score, threshold: r.threshold })
        .collect())
}

fn newest_first(rows: &mut [AnomalyRow]) {
    rows.sort_by(|a, b| b.time.cmp(&a.time));
}

// GET /stat/anomaly
async fn machine_anomalies(
    State(app): State<AppState>,
    Query(q): Query<MachineRange>,
) -> Result<Json<Vec<AnomalyRow>>, ApiError> {
    let mut rows = anomalies_of(&app, &q.machine, q.start, q.end).await?;
    newest_first(&mut rows);
    Ok(Json(rows))
}

// GET /stat/anomaly/all
async fn all_anomalies(
    State(app): State<AppState>,
    Query(q): Query<DateRange>,
) -> Result<Json<Vec<AnomalyRow>>, ApiError> {
    let mut rows = Vec::new();
    for machine in app.store.list_machines().await? {
        rows.extend(anomalies_of(&app, &machine, q.start, q.end).await?);
    }
    newest_first(&mut rows);
    Ok(Json(rows))
}
