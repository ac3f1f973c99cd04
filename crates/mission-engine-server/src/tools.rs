use std::time::Duration;

use async_trait::async_trait;
use mission_engine::{ExecutionMode, ToolInvoker, ToolOutcome};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Placeholder `ToolInvoker` for deployments that have not yet wired a
/// real tool registry. Specific web-automation tool implementations are
/// external collaborators (spec.md §1) loaded by the embedding
/// application; this stub exists only so the server binary is runnable
/// standalone, and always reports a non-retryable failure.
pub struct UnregisteredToolInvoker;

#[async_trait]
impl ToolInvoker for UnregisteredToolInvoker {
    async fn invoke(
        &self,
        action_kind: &str,
        _params: &Value,
        _mode: ExecutionMode,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> (ToolOutcome, Option<String>, Option<String>) {
        (
            ToolOutcome::NonRetryableFailure,
            None,
            Some(format!("no tool registered for action_kind={action_kind}")),
        )
    }
}
