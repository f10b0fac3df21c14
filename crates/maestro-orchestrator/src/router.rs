use crate::orchestrator::RESPONSE_EVENT;
use maestro_bus::{topics, MessageBus};
use maestro_core::{retry_with_backoff, BusMessage, MaestroError, MaestroResult};
use maestro_workflow::WorkflowEngine;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Forward agent responses published to `orchestrators.{name}.responses`
/// onto the matching workflow instance as [`RESPONSE_EVENT`] events.
///
/// Transient store failures are retried with the engine's retry policy. The
/// subscription is in place when this returns. Abort the handle to stop
/// routing.
pub async fn spawn_response_router(
    bus: Arc<dyn MessageBus>,
    engine: Arc<WorkflowEngine>,
    orchestrator: &str,
) -> MaestroResult<JoinHandle<()>> {
    let topic = topics::orchestrator_responses(orchestrator);
    let mut sub = bus.subscribe(&topic).await?;
    info!(topic = %topic, "Response router started");

    Ok(tokio::spawn(async move {
        while let Some(env) = sub.recv().await {
            let resp = match env.message {
                BusMessage::AgentTaskResponse(resp) => resp,
                other => {
                    debug!(topic = %topic, kind = other.kind(), "Ignoring non-response message");
                    continue;
                }
            };
            let payload = match serde_json::to_value(&resp) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "Cannot encode response");
                    continue;
                }
            };
            let routed = retry_with_backoff(&engine.config().retry, "router.raise_event", || {
                engine.raise_event(&resp.instance_id, RESPONSE_EVENT, payload.clone())
            })
            .await;
            match routed {
                Ok(()) => debug!(
                    instance_id = %resp.instance_id,
                    from = %resp.from_agent,
                    step = resp.step,
                    "Response routed"
                ),
                Err(MaestroError::NotFound(_)) => warn!(
                    instance_id = %resp.instance_id,
                    from = %resp.from_agent,
                    "Response for unknown instance dropped"
                ),
                Err(e) => error!(
                    instance_id = %resp.instance_id,
                    error = %e,
                    "Failed to route response"
                ),
            }
        }
        debug!(topic = %topic, "Response router stopped");
    }))
}
