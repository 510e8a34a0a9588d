use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::ChatContext;
use crate::gateway::server::constant_time_eq;
use crate::tools::Toolbox;

/// Callback surface for the agent runtime's tool calls. The originating
/// chat context travels inside each request — it was handed to the agent on
/// invocation, and comes back here when the agent schedules work.
#[derive(Clone)]
struct ToolApiState {
    toolbox: Arc<Toolbox>,
    token: Option<Arc<str>>,
}

pub struct ToolApi {
    state: ToolApiState,
    port: u16,
}

impl ToolApi {
    pub fn new(toolbox: Arc<Toolbox>, token: Option<String>, port: u16) -> Self {
        Self {
            state: ToolApiState {
                toolbox,
                token: token.map(Into::into),
            },
            port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/tools/schedule_task", post(schedule_task_endpoint))
            .route("/tools/tasks", get(list_tasks_endpoint))
            .route("/tools/cancel_task", post(cancel_task_endpoint))
            .route("/tools/host_execute", post(host_execute_endpoint))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_auth,
            ))
            .with_state(self.state.clone())
    }

    /// Serve on loopback until the returned task is aborted.
    pub async fn spawn(self) -> Result<tokio::task::JoinHandle<()>> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding tool API on {}", addr))?;
        info!("Tool API on {}", addr);
        let router = self.router();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("Tool API server error: {}", e);
            }
        }))
    }
}

async fn require_auth(
    State(state): State<ToolApiState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = &state.token else {
        // Loopback-only default; a shared token is opt-in.
        return next.run(req).await;
    };
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(provided, &format!("Bearer {}", token)) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}

fn tool_reply(result: Result<String>) -> Response {
    match result {
        Ok(text) => Json(serde_json::json!({ "result": text })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ScheduleTaskRequest {
    channel: String,
    chat_id: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
}

async fn schedule_task_endpoint(
    State(state): State<ToolApiState>,
    Json(payload): Json<ScheduleTaskRequest>,
) -> Response {
    let ctx = ChatContext {
        channel: payload.channel,
        chat_id: payload.chat_id,
    };
    tool_reply(
        state
            .toolbox
            .schedule
            .schedule_task(
                &ctx,
                &payload.prompt,
                &payload.schedule_type,
                &payload.schedule_value,
            )
            .await,
    )
}

async fn list_tasks_endpoint(State(state): State<ToolApiState>) -> Response {
    tool_reply(state.toolbox.schedule.list_tasks().await)
}

#[derive(Deserialize)]
struct CancelTaskRequest {
    task_id: String,
}

async fn cancel_task_endpoint(
    State(state): State<ToolApiState>,
    Json(payload): Json<CancelTaskRequest>,
) -> Response {
    tool_reply(state.toolbox.schedule.cancel_task(&payload.task_id).await)
}

#[derive(Deserialize)]
struct HostExecuteRequest {
    bridge: String,
    command: String,
    #[serde(default)]
    timeout: u64,
}

async fn host_execute_endpoint(
    State(state): State<ToolApiState>,
    Json(payload): Json<HostExecuteRequest>,
) -> Response {
    let Some(host) = &state.toolbox.host else {
        return tool_reply(Ok("Error: host gateway not configured.".to_string()));
    };
    let output = host
        .host_execute(&payload.bridge, &payload.command, payload.timeout)
        .await;
    tool_reply(Ok(output))
}
