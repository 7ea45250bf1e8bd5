//! Ambient per-request context.
//!
//! The context is carried in a task-local slot: set when a request is
//! admitted, readable anywhere below the handler, gone when the handler
//! returns. There is no process-global current context; concurrent requests
//! on different tasks never observe each other's slot.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
	/// Workload identifier of the calling agent.
	pub caller_id: String,
	/// Task this request is executing under.
	pub task_id: String,
	pub timestamp: DateTime<Utc>,
	pub metadata: Map<String, Value>,
}

impl RequestContext {
	pub fn new(caller_id: impl Into<String>, task_id: impl Into<String>) -> Self {
		RequestContext {
			caller_id: caller_id.into(),
			task_id: task_id.into(),
			timestamp: Utc::now(),
			metadata: Map::new(),
		}
	}

	pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
		self.metadata = metadata;
		self
	}

	/// Create a context with a generated task id, for callers outside any
	/// inbound request (e.g. CLI-initiated outbound calls).
	pub fn detached(caller_id: impl Into<String>) -> Self {
		RequestContext::new(caller_id, Uuid::new_v4().to_string())
	}
}

tokio::task_local! {
	static CURRENT: RequestContext;
}

/// Run `fut` with `ctx` as the ambient request context.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
	F: Future,
{
	CURRENT.scope(ctx, fut).await
}

/// The ambient context of the running task, if inside a request scope.
pub fn current() -> Option<RequestContext> {
	CURRENT.try_with(|c| c.clone()).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn context_is_task_scoped() {
		assert!(current().is_none());
		let ctx = RequestContext::new("spiffe://agentweave.io/agent/caller", "task-1");
		scope(ctx, async {
			let seen = current().unwrap();
			assert_eq!(seen.caller_id, "spiffe://agentweave.io/agent/caller");
			assert_eq!(seen.task_id, "task-1");
		})
		.await;
		assert!(current().is_none());
	}

	#[tokio::test]
	async fn concurrent_tasks_do_not_share_context() {
		let a = tokio::spawn(scope(
			RequestContext::new("spiffe://agentweave.io/agent/a", "task-a"),
			async {
				tokio::time::sleep(std::time::Duration::from_millis(10)).await;
				current().unwrap().caller_id
			},
		));
		let b = tokio::spawn(scope(
			RequestContext::new("spiffe://agentweave.io/agent/b", "task-b"),
			async { current().unwrap().caller_id },
		));
		assert_eq!(a.await.unwrap(), "spiffe://agentweave.io/agent/a");
		assert_eq!(b.await.unwrap(), "spiffe://agentweave.io/agent/b");
	}
}
