//! Client side of the A2A protocol: discovery, task submission, status
//! polling, and cancellation over a [`SecureChannel`].

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::card::AgentCard;
use super::task::{Message, Task};
use super::{Error, rpc_codes};
use crate::transport::SecureChannel;
use crate::transport::channel::ChannelResponse;

/// Stateless protocol operations; connection state lives in the channel.
pub struct A2aClient;

impl A2aClient {
	/// Fetch and validate the peer's agent card.
	pub async fn discover(channel: &SecureChannel) -> Result<AgentCard, Error> {
		let response = channel.get("/.well-known/agent.json").await?;
		if !response.status.is_success() {
			return Err(Error::Discovery(format!(
				"agent card fetch returned {}",
				response.status
			)));
		}
		response
			.json()
			.map_err(|e| Error::Discovery(format!("invalid agent card: {e}")))
	}

	/// Submit a task. The callee answers immediately with the initial task
	/// record; execution continues remotely.
	pub async fn send_task(
		channel: &SecureChannel,
		task_type: &str,
		payload: Value,
		messages: Vec<Message>,
	) -> Result<Task, Error> {
		let request = json!({
			"jsonrpc": "2.0",
			"method": "task.send",
			"params": {
				"task_type": task_type,
				"payload": payload,
				"messages": messages,
			},
			"id": Uuid::new_v4().to_string(),
		});
		let response = channel.post_json("/rpc", &request).await?;
		Self::parse_task_result(&response)
	}

	pub async fn task_status(channel: &SecureChannel, task_id: &str) -> Result<Task, Error> {
		let request = json!({
			"jsonrpc": "2.0",
			"method": "task.status",
			"params": { "task_id": task_id },
			"id": Uuid::new_v4().to_string(),
		});
		let response = channel.post_json("/rpc", &request).await?;
		Self::parse_task_result(&response)
	}

	pub async fn cancel_task(channel: &SecureChannel, task_id: &str) -> Result<Task, Error> {
		let request = json!({
			"jsonrpc": "2.0",
			"method": "task.cancel",
			"params": { "task_id": task_id },
			"id": Uuid::new_v4().to_string(),
		});
		let response = channel.post_json("/rpc", &request).await?;
		Self::parse_task_result(&response)
	}

	/// Poll `task.status` until the task is terminal, bounded by `max_wait`.
	pub async fn poll_until_complete(
		channel: &SecureChannel,
		task_id: &str,
		poll_interval: Duration,
		max_wait: Option<Duration>,
	) -> Result<Task, Error> {
		let started = Instant::now();
		loop {
			let task = Self::task_status(channel, task_id).await?;
			if task.is_terminal() {
				return Ok(task);
			}
			if let Some(limit) = max_wait
				&& started.elapsed() > limit
			{
				return Err(Error::Rpc {
					code: rpc_codes::SEMANTIC_ERROR,
					message: format!("task {task_id} did not complete within {limit:?}"),
				});
			}
			debug!(task_id, state = ?task.state, "task not terminal yet, polling");
			tokio::time::sleep(poll_interval).await;
		}
	}

	fn parse_task_result(response: &ChannelResponse) -> Result<Task, Error> {
		let body: Value = response
			.json()
			.map_err(|e| Error::InvalidResponse(e.to_string()))?;
		if let Some(error) = body.get("error") {
			let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
			let message = error
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or("unknown error")
				.to_string();
			return Err(match code {
				rpc_codes::PARSE_ERROR | rpc_codes::INVALID_REQUEST => Error::InvalidRpc(message),
				rpc_codes::METHOD_NOT_FOUND => Error::MethodNotFound(message),
				rpc_codes::INVALID_PARAMS => Error::InvalidParams(message),
				_ if message.contains("No handler registered") => {
					Error::UnknownCapability(message)
				},
				_ => Error::Rpc { code, message },
			});
		}
		let result = body
			.get("result")
			.ok_or_else(|| Error::InvalidResponse("missing result".into()))?;
		serde_json::from_value(result.clone())
			.map_err(|e| Error::InvalidResponse(format!("malformed task: {e}")))
	}
}
