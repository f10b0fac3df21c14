use crate::middleware::{require_api_key, ApiKeys};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use maestro_core::{retry_with_backoff, MaestroError, RetryPolicy};
use maestro_orchestrator::OrchestratorState;
use maestro_store::AgentRegistry;
use maestro_workflow::{WorkflowEngine, WorkflowInstance};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub registry: AgentRegistry,
    /// Workflow started by `POST /workflows`.
    pub workflow: String,
    /// Backoff for store failures while starting an instance.
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub task: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartWorkflowResponse {
    pub message: String,
    pub workflow_instance_id: String,
}

/// Read model for `GET /workflows/{id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub instance_id: String,
    pub workflow: String,
    pub status: String,
    pub input: String,
    pub result: Option<String>,
    pub error: Option<Value>,
    pub failed_step: Option<Value>,
    pub phase: Option<Value>,
    pub plan: Value,
    pub history: Value,
    pub iteration: Option<u32>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl InstanceView {
    fn from_instance(inst: &WorkflowInstance) -> Self {
        let state: Option<OrchestratorState> =
            serde_json::from_value(inst.custom_state.clone()).ok();
        let (phase, plan, history, iteration, failed_step) = match &state {
            Some(s) => (
                serde_json::to_value(s.phase).ok(),
                serde_json::to_value(s.plan.steps()).unwrap_or(Value::Null),
                serde_json::to_value(&s.history).unwrap_or(Value::Null),
                Some(s.iteration),
                s.failed_step
                    .map(|(step, substep)| json!({"step": step, "substep": substep})),
            ),
            None => (None, json!([]), json!([]), None, None),
        };
        Self {
            instance_id: inst.instance_id.clone(),
            workflow: inst.workflow.clone(),
            status: inst.status.to_string(),
            input: inst.input.clone(),
            result: inst.result.clone(),
            error: inst
                .error
                .as_ref()
                .map(|e| json!({"code": e.code, "message": e.message})),
            failed_step,
            phase,
            plan,
            history,
            iteration,
            cancel_requested: inst.cancel_requested,
            created_at: inst.created_at.to_rfc3339(),
            completed_at: inst.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// A [`MaestroError`] rendered as an HTTP response.
pub struct ApiError(pub MaestroError);

impl From<MaestroError> for ApiError {
    fn from(e: MaestroError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MaestroError::InvalidInput(_) | MaestroError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            MaestroError::NotFound(_) => StatusCode::NOT_FOUND,
            MaestroError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MaestroError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({"error": self.0.to_string(), "code": self.0.code()});
        (status, Json(body)).into_response()
    }
}

/// The HTTP front door: start workflows and inspect instances and agents.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(state: Arc<AppState>) -> Router {
        Self::build_with_auth(state, ApiKeys::default())
    }

    /// Build the gateway, requiring an API key when `keys` has any.
    pub fn build_with_auth(state: Arc<AppState>, keys: ApiKeys) -> Router {
        let app = Router::new()
            .route("/workflows", post(start_workflow).get(list_workflows))
            .route("/workflows/{id}", get(get_workflow))
            .route("/workflows/{id}/cancel", post(cancel_workflow))
            .route("/agents", get(list_agents))
            .route("/health", get(health_handler))
            .with_state(state);

        if keys.is_enabled() {
            app.layer(axum_mw::from_fn_with_state(Arc::new(keys), require_api_key))
        } else {
            app
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "maestro"}))
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    body: Result<Json<StartWorkflowRequest>, JsonRejection>,
) -> Result<Json<StartWorkflowResponse>, ApiError> {
    let Json(req) = body.map_err(|e| {
        warn!(error = %e, "Rejected malformed start request");
        MaestroError::InvalidInput(e.body_text())
    })?;

    let instance_id = retry_with_backoff(&state.retry, "gateway.start_instance", || {
        state.engine.start_instance(&state.workflow, &req.task)
    })
    .await?;

    info!(instance_id = %instance_id, workflow = %state.workflow, "Workflow initiated via HTTP");
    Ok(Json(StartWorkflowResponse {
        message: "Workflow initiated successfully.".to_string(),
        workflow_instance_id: instance_id,
    }))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let instances = state.engine.list_instances().await?;
    Ok(Json(
        instances
            .iter()
            .map(|i| {
                json!({
                    "instanceId": i.instance_id,
                    "workflow": i.workflow,
                    "status": i.status.to_string(),
                    "createdAt": i.created_at.to_rfc3339(),
                })
            })
            .collect(),
    ))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, ApiError> {
    let inst = state
        .engine
        .get_instance(&id)
        .await?
        .ok_or_else(|| MaestroError::NotFound(format!("instance '{id}'")))?;
    Ok(Json(InstanceView::from_instance(&inst)))
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Cancellation requested.",
            "workflow_instance_id": id,
        })),
    ))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let agents = state.registry.list().await?;
    Ok(Json(agents))
}
