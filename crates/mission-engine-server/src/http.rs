use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use mission_engine::{
    ConfigStore, ControlAction, ControlRequest, Decomposer, EventKind, ExecutionController,
    ExecutionMode, MissionId, MissionStatus, MissionStore, SharedResourceMonitor, SharedScorer,
    SharedWorkerPool, Task,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::scheduling::{self, ScheduleRegistry, ScheduleRequest};

fn parse_mission_id(raw: &str) -> Result<MissionId, StatusCode> {
    Uuid::parse_str(raw).map(MissionId).map_err(|_| StatusCode::BAD_REQUEST)
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MissionStore>,
    pub workers: SharedWorkerPool,
    pub scorer: SharedScorer,
    pub monitor: SharedResourceMonitor,
    pub controller: Arc<ExecutionController>,
    pub config: ConfigStore,
    pub decomposer: Arc<dyn Decomposer + Send + Sync>,
    pub schedules: ScheduleRegistry,
}

/// Spawns the background sweeps (domain-lock/schedule expiry, resource
/// sampling) alongside the listener and tears them down on shutdown,
/// mirroring `tandem-server/src/http.rs::serve`'s reaper/routine-scheduler
/// tasks.
pub async fn serve(addr: std::net::SocketAddr, state: AppState) -> anyhow::Result<()> {
    let schedule_sweep = scheduling::spawn_schedule_sweep(state.store.clone(), state.schedules.clone());
    let monitor_loop = mission_engine::spawn_sampling_loop(state.monitor.clone());
    let dispatch_loop = crate::dispatch::spawn_dispatch_loop(
        state.store.clone(),
        state.workers.clone(),
        state.controller.clone(),
    );

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mission-engine-server listening on {addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    schedule_sweep.abort();
    monitor_loop.abort();
    dispatch_loop.abort();
    result?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/missions/{id}/update", post(update_mission))
        .route("/missions/{id}/schedule", put(schedule_mission))
        .route("/controls/request", post(submit_control))
        .route("/controls/{id}/approve", post(approve_control))
        .route("/controls/{id}/reject", post(reject_control))
        .route("/stream-health/{mission_id}", get(stream_health))
        .route("/ws/stream/{mission_id}", get(mission_stream_ws))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    session_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct MissionSpawned {
    mission_id: MissionId,
    status: MissionStatus,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    summary: String,
    missions_spawned: Vec<MissionSpawned>,
    artifacts: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    live_stream_id: Option<MissionId>,
}

/// `POST /chat`: classifies the objective, opens one Mission, and
/// schedules its initial Tasks (spec.md §6, §4.2).
async fn chat(State(state): State<AppState>, Json(input): Json<ChatRequest>) -> Result<Json<ResponseEnvelope>, StatusCode> {
    let classification = state.decomposer.classify(&input.text);

    let mission_id = state
        .store
        .create_mission(input.text.clone(), input.session_id, classification.domain, ExecutionMode::Mock)
        .await
        .map_err(|e| map_error_status(&e))?;

    let mut previous_task_id = None;
    if classification.is_composite {
        for subgoal in &classification.subgoals {
            let mut task = Task::new(mission_id, subgoal_action_kind(subgoal.kind), json!({"text": subgoal.text}));
            task.depends_on = previous_task_id.into_iter().collect();
            previous_task_id = Some(task.task_id);
            state.store.put_task(task.clone()).await.map_err(|e| map_error_status(&e))?;
            state
                .store
                .append_event(
                    mission_id,
                    EventKind::TaskScheduled,
                    json!({"task_id": task.task_id, "action_kind": task.action_kind}),
                )
                .await
                .map_err(|e| map_error_status(&e))?;
        }
    } else {
        let task = Task::new(mission_id, "general_action".to_string(), json!({"text": input.text}));
        state.store.put_task(task.clone()).await.map_err(|e| map_error_status(&e))?;
        state
            .store
            .append_event(
                mission_id,
                EventKind::TaskScheduled,
                json!({"task_id": task.task_id, "action_kind": task.action_kind}),
            )
            .await
            .map_err(|e| map_error_status(&e))?;
    }

    state
        .store
        .append_event(mission_id, EventKind::StatusChange, json!({"status": "QUEUED"}))
        .await
        .map_err(|e| map_error_status(&e))?;

    let mission = state.store.get_mission(mission_id).await.map_err(|e| map_error_status(&e))?;

    Ok(Json(ResponseEnvelope {
        summary: format!(
            "Opened mission for \"{}\" with {} task(s) in domain {}.",
            input.text,
            mission.task_ids.len(),
            classification.domain
        ),
        missions_spawned: vec![MissionSpawned {
            mission_id,
            status: mission.status,
        }],
        artifacts: Vec::new(),
        live_stream_id: Some(mission_id),
    }))
}

fn subgoal_action_kind(kind: mission_engine::SubgoalKind) -> String {
    use mission_engine::SubgoalKind::*;
    match kind {
        Research => "web_search",
        Analysis => "compare_options",
        Strategy => "plan_next_step",
        Synthesis => "summarize",
        General => "general_action",
    }
    .to_string()
}

#[derive(Debug, Deserialize, Default)]
struct MissionUpdateRequest {
    priority: Option<mission_engine::Priority>,
    execution_mode: Option<ExecutionMode>,
    policy_overrides: Option<mission_engine::PolicyOverrides>,
}

/// `POST /missions/{id}/update`: mutates policy fields while the mission
/// is still PROPOSED (spec.md §3's closed `MissionStatus` vocabulary has
/// no `CLARIFICATION_NEEDED` member; see DESIGN.md's Open Question
/// decision on this route's gate).
async fn update_mission(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(input): Json<MissionUpdateRequest>,
) -> Result<Json<Value>, StatusCode> {
    let id = parse_mission_id(&raw_id)?;
    let mission = state.store.get_mission(id).await.map_err(|e| map_error_status(&e))?;
    if mission.status != MissionStatus::Proposed {
        return Err(StatusCode::CONFLICT);
    }

    let mut patch = json!({});
    if let Some(priority) = input.priority {
        patch["priority"] = json!(priority);
    }
    if let Some(mode) = input.execution_mode {
        patch["execution_mode"] = json!(mode);
    }
    if let Some(overrides) = input.policy_overrides {
        patch["policy_overrides"] = json!(overrides);
    }

    state
        .store
        .append_event(id, EventKind::Progress, json!({"policy_update": patch, "progress_percent": mission.progress_percent}))
        .await
        .map_err(|e| map_error_status(&e))?;

    Ok(Json(json!({"ok": true})))
}

async fn schedule_mission(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(input): Json<ScheduleRequest>,
) -> Result<Json<Value>, StatusCode> {
    let id = parse_mission_id(&raw_id)?;
    state.store.get_mission(id).await.map_err(|e| map_error_status(&e))?;
    scheduling::schedule_mission(&state.schedules, id, input).await;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct ControlSubmitRequest {
    mission_id: MissionId,
    action: ControlAction,
    target_id: String,
    operator_id: String,
    reason: String,
}

async fn submit_control(
    State(state): State<AppState>,
    Json(input): Json<ControlSubmitRequest>,
) -> Result<Json<Value>, StatusCode> {
    let request = ControlRequest::new(input.action, input.target_id, input.operator_id, input.reason);
    let request_id = request.request_id.clone();
    state
        .controller
        .submit_control(input.mission_id, request)
        .await
        .map_err(|e| map_error_status(&e))?;
    Ok(Json(json!({"request_id": request_id})))
}

#[derive(Debug, Deserialize)]
struct ControlDecisionRequest {
    mission_id: MissionId,
    approver_id: Option<String>,
    reason: String,
}

async fn approve_control(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ControlDecisionRequest>,
) -> Result<Json<Value>, StatusCode> {
    let approver_id = input.approver_id.unwrap_or_default();
    state
        .controller
        .approve_control(input.mission_id, &id, &approver_id, input.reason)
        .await
        .map_err(|e| map_error_status(&e))?;
    Ok(Json(json!({"ok": true})))
}

async fn reject_control(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ControlDecisionRequest>,
) -> Result<Json<Value>, StatusCode> {
    state
        .controller
        .reject_control(input.mission_id, &id, input.reason)
        .await
        .map_err(|e| map_error_status(&e))?;
    Ok(Json(json!({"ok": true})))
}

async fn stream_health(Path(raw_mission_id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let mission_id = parse_mission_id(&raw_mission_id)?;
    Ok(Json(json!({
        "active_connections": 0,
        "observation_mode": "read-only",
        "control_enabled": false,
        "mission_id": mission_id,
    })))
}

async fn mission_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(raw_mission_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let mission_id = parse_mission_id(&raw_mission_id)?;
    Ok(ws.on_upgrade(move |socket| mission_stream_ws_pump(socket, state, mission_id)))
}

/// Pumps the per-mission broadcast stream into the socket; inbound
/// client frames are read and discarded, never interpreted as commands
/// (spec.md §6). Grounded on `tandem-server/src/http.rs`'s `pty_ws` /
/// `pty_ws_stream` pair.
async fn mission_stream_ws_pump(mut socket: WebSocket, state: AppState, mission_id: MissionId) {
    let mut events = state.store.subscribe_events(mission_id).await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = json!({
                    "mission_id": event.mission_id,
                    "event_kind": event.event_kind,
                    "sequence_number": event.sequence_number,
                    "timestamp_utc_iso8601": event.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                    "payload": event.payload,
                })
                .to_string();
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}

fn map_error_status(err: &mission_engine::MissionEngineError) -> StatusCode {
    use mission_engine::MissionEngineError::*;
    match err {
        InputRejected(_) | PolicyViolation(_) | DuplicateMission(_) => StatusCode::BAD_REQUEST,
        MissionNotFound(_) => StatusCode::NOT_FOUND,
        MissionTerminal(_) => StatusCode::CONFLICT,
        ResourceExhaustion(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageUnavailable(_) | Critical(_) | Io(_) | Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Retryable(_) | NonRetryable(_) => StatusCode::BAD_GATEWAY,
    }
}
