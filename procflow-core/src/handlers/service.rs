use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{HandlerDeps, NodeHandler, Outcome};
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::retry::{retry, RetryCallbacks, RetryConfig};
use crate::types::{NodeInstance, NodeType, ProcessInstance};

/// Automated step: invokes the registered handlers named in
/// `node.handlers`, each wrapped in the retry kernel with the node's
/// `retry_times` / `retry_interval`. Returned variables are merged
/// into the process; exhausted retries surface as an error outcome.
pub struct ServiceNodeHandler;

#[async_trait]
impl NodeHandler for ServiceNodeHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Service
    }

    async fn enter(
        &self,
        ctx: &ExecutionContext,
        deps: &HandlerDeps,
        process: &mut ProcessInstance,
        node: &mut NodeInstance,
    ) -> Result<Outcome> {
        let cfg = RetryConfig::fixed(
            node.retry_times.saturating_add(1),
            Duration::from_millis(node.retry_interval_ms),
        );

        for name in &node.handlers {
            // Template validation guarantees registration; a miss here
            // means the registry changed underneath a running process.
            let handler = match deps.services.get(name) {
                Some(h) => h,
                None => {
                    return Ok(Outcome::Error(EngineError::Fatal(format!(
                        "service handler {name} is not registered"
                    ))))
                }
            };

            let callbacks = RetryCallbacks {
                on_retry: Some(Box::new({
                    let name = name.clone();
                    move |attempt, err| {
                        warn!(handler = %name, attempt, %err, "service handler retrying");
                    }
                })),
                ..RetryCallbacks::default()
            };

            let result = retry(ctx.token(), &cfg, &callbacks, |attempt| {
                if attempt > 1 {
                    ctx.mark_retry();
                }
                handler.invoke(ctx, process, node)
            })
            .await;

            match result {
                Ok(updates) => {
                    // Writes land on the step context; the engine
                    // merges the working store back into the process.
                    ctx.merge_variables(&updates);
                    info!(handler = %name, node_key = %node.node_key, "service handler completed");
                }
                Err(err @ EngineError::Cancelled(_)) => return Err(err),
                Err(err) => return Ok(Outcome::Error(err)),
            }
        }

        Ok(Outcome::Advance(node.next_nodes.clone()))
    }
}
