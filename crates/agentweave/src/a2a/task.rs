//! Task lifecycle.
//!
//! A task is one tracked capability invocation. States move monotonically:
//! once terminal (completed, failed, cancelled) neither the state nor the
//! result/error change, and the completion signal has fired exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
	Pending,
	Running,
	Completed,
	Failed,
	Cancelled,
}

impl TaskState {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TaskState::Completed | TaskState::Failed | TaskState::Cancelled
		)
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
	#[error("task not found: {0}")]
	NotFound(String),
	#[error("illegal transition: task is already {from:?}")]
	IllegalTransition { from: TaskState },
	#[error("task cancelled")]
	Cancelled,
	#[error("timed out waiting for task completion")]
	Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePart {
	#[serde(rename = "type")]
	pub part_type: String,
	pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
	pub role: String,
	#[serde(default)]
	pub parts: Vec<MessagePart>,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

impl Message {
	pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
		Message {
			role: role.into(),
			parts: vec![MessagePart {
				part_type: "text".to_string(),
				content: Value::String(content.into()),
			}],
			timestamp: Utc::now(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
	#[serde(rename = "type")]
	pub artifact_type: String,
	pub data: Value,
	#[serde(default)]
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	pub id: String,
	#[serde(rename = "type")]
	pub task_type: String,
	pub state: TaskState,
	#[serde(default)]
	pub payload: Value,
	#[serde(default)]
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default)]
	pub artifacts: Vec<Artifact>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default)]
	pub metadata: Map<String, Value>,
}

impl Task {
	pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
		let now = Utc::now();
		Task {
			id: Uuid::new_v4().to_string(),
			task_type: task_type.into(),
			state: TaskState::Pending,
			payload,
			messages: Vec::new(),
			result: None,
			artifacts: Vec::new(),
			error: None,
			created_at: now,
			updated_at: now,
			metadata: Map::new(),
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.state.is_terminal()
	}

	fn touch(&mut self) {
		self.updated_at = Utc::now();
	}

	pub fn add_message(&mut self, message: Message) {
		self.messages.push(message);
		self.touch();
	}

	pub fn add_artifact(&mut self, artifact: Artifact) {
		self.artifacts.push(artifact);
		self.touch();
	}
}

struct Entry {
	task: tokio::sync::Mutex<Task>,
	/// Bumped on every accepted mutation; SSE streams watch this.
	updates: watch::Sender<u64>,
	/// Fires exactly once, when the state first becomes terminal.
	completed: watch::Sender<bool>,
}

/// In-memory task table. The table lock covers insert/delete only; state
/// transitions run under the per-task lock.
pub struct TaskManager {
	tasks: parking_lot::RwLock<HashMap<String, Arc<Entry>>>,
	reaper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskManager {
	pub fn new() -> Arc<Self> {
		Arc::new(TaskManager {
			tasks: parking_lot::RwLock::new(HashMap::new()),
			reaper: parking_lot::Mutex::new(None),
		})
	}

	pub async fn create(
		&self,
		task_type: impl Into<String>,
		payload: Value,
		messages: Vec<Message>,
		metadata: Map<String, Value>,
	) -> Task {
		let mut task = Task::new(task_type, payload);
		task.messages = messages;
		task.metadata = metadata;
		let entry = Arc::new(Entry {
			task: tokio::sync::Mutex::new(task.clone()),
			updates: watch::channel(0).0,
			completed: watch::channel(false).0,
		});
		self.tasks.write().insert(task.id.clone(), entry);
		debug!(task_id = %task.id, task_type = %task.task_type, "task created");
		task
	}

	fn entry(&self, id: &str) -> Option<Arc<Entry>> {
		self.tasks.read().get(id).cloned()
	}

	pub async fn get(&self, id: &str) -> Option<Task> {
		let entry = self.entry(id)?;
		let task = entry.task.lock().await;
		Some(task.clone())
	}

	/// Advance a task. Transitions out of a terminal state are rejected;
	/// the completion signal fires when (and only when) the task first
	/// becomes terminal, after result/error are populated.
	pub async fn update(
		&self,
		id: &str,
		state: Option<TaskState>,
		result: Option<Value>,
		error: Option<String>,
	) -> Result<Task, TaskError> {
		let entry = self
			.entry(id)
			.ok_or_else(|| TaskError::NotFound(id.to_string()))?;
		let mut task = entry.task.lock().await;
		if task.is_terminal() {
			return Err(TaskError::IllegalTransition { from: task.state });
		}
		if let Some(result) = result {
			task.result = Some(result);
		}
		if let Some(error) = error {
			task.error = Some(error);
		}
		if let Some(state) = state {
			task.state = state;
		}
		task.touch();
		let snapshot = task.clone();
		// Publish while holding the per-task lock: observers see the fields
		// already populated. send_replace stores the value even with no
		// subscriber yet.
		entry.updates.send_modify(|v| *v += 1);
		if snapshot.is_terminal() {
			entry.completed.send_replace(true);
		}
		drop(task);
		Ok(snapshot)
	}

	/// Append to a task's message history in arrival order.
	pub async fn add_message(&self, id: &str, message: Message) -> Result<(), TaskError> {
		let entry = self
			.entry(id)
			.ok_or_else(|| TaskError::NotFound(id.to_string()))?;
		let mut task = entry.task.lock().await;
		task.add_message(message);
		entry.updates.send_modify(|v| *v += 1);
		Ok(())
	}

	/// Transition a non-terminal task to cancelled. Cancelling an already
	/// terminal task is an illegal transition.
	pub async fn cancel(&self, id: &str) -> Result<Task, TaskError> {
		self
			.update(id, Some(TaskState::Cancelled), None, None)
			.await
	}

	/// Wait for the task to reach a terminal state. Returns immediately if
	/// it already has.
	pub async fn await_completion(
		&self,
		id: &str,
		timeout: Option<Duration>,
	) -> Result<Task, TaskError> {
		let entry = self
			.entry(id)
			.ok_or_else(|| TaskError::NotFound(id.to_string()))?;
		let mut rx = entry.completed.subscribe();
		let wait = async {
			while !*rx.borrow_and_update() {
				if rx.changed().await.is_err() {
					break;
				}
			}
		};
		match timeout {
			Some(limit) => tokio::time::timeout(limit, wait)
				.await
				.map_err(|_| TaskError::Timeout)?,
			None => wait.await,
		}
		let task = entry.task.lock().await;
		Ok(task.clone())
	}

	/// Current snapshot plus a stream of update notifications.
	pub async fn subscribe(&self, id: &str) -> Option<(Task, watch::Receiver<u64>)> {
		let entry = self.entry(id)?;
		let rx = entry.updates.subscribe();
		let task = entry.task.lock().await;
		Some((task.clone(), rx))
	}

	pub async fn list(&self, state: Option<TaskState>, task_type: Option<&str>) -> Vec<Task> {
		let entries: Vec<Arc<Entry>> = self.tasks.read().values().cloned().collect();
		let mut out = Vec::with_capacity(entries.len());
		for entry in entries {
			let task = entry.task.lock().await;
			if let Some(state) = state
				&& task.state != state
			{
				continue;
			}
			if let Some(task_type) = task_type
				&& task.task_type != task_type
			{
				continue;
			}
			out.push(task.clone());
		}
		out
	}

	pub fn remove(&self, id: &str) -> bool {
		self.tasks.write().remove(id).is_some()
	}

	/// Drop terminal tasks older than `max_age`, returning how many went.
	pub async fn reap(&self, max_age: Duration) -> usize {
		let now = Utc::now();
		let entries: Vec<(String, Arc<Entry>)> = self
			.tasks
			.read()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		let mut stale = Vec::new();
		for (id, entry) in entries {
			let task = entry.task.lock().await;
			if task.is_terminal() {
				let age = (now - task.updated_at).to_std().unwrap_or_default();
				if age > max_age {
					stale.push(id);
				}
			}
		}
		let count = stale.len();
		if count > 0 {
			let mut tasks = self.tasks.write();
			for id in stale {
				tasks.remove(&id);
			}
			info!(reaped = count, "removed aged-out terminal tasks");
		}
		count
	}

	/// Periodic reaper; exits within one cycle of shutdown.
	pub fn spawn_reaper(
		self: &Arc<Self>,
		interval: Duration,
		max_age: Duration,
		mut shutdown: watch::Receiver<bool>,
	) {
		let manager = self.clone();
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						manager.reap(max_age).await;
					},
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							return;
						}
					},
				}
			}
		});
		*self.reaper.lock() = Some(handle);
	}
}

impl Drop for TaskManager {
	fn drop(&mut self) {
		if let Some(handle) = self.reaper.lock().take() {
			handle.abort();
		}
	}
}
