//! Append-only audit trail with pluggable sinks.
//!
//! Every security-relevant action produces an immutable event. Emission never
//! blocks handler completion beyond a bounded buffer: when the file backend's
//! buffer is full the oldest buffered event is dropped and a loss counter
//! incremented.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use prometheus_client::metrics::counter::Counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
	#[serde(rename = "AUTH_CHECK")]
	AuthCheck,
	#[serde(rename = "CAPABILITY_CALL")]
	CapabilityCall,
	#[serde(rename = "CONFIG_CHANGE")]
	ConfigChange,
	#[serde(rename = "STARTUP")]
	Startup,
	#[serde(rename = "SHUTDOWN")]
	Shutdown,
	#[serde(rename = "IDENTITY_ROTATION")]
	IdentityRotation,
	#[serde(rename = "PEER_VERIFICATION")]
	PeerVerification,
	#[serde(rename = "POLICY_UPDATE")]
	PolicyUpdate,
}

/// One immutable audit record. Fields are event-specific; absent ones are
/// omitted from the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
	pub event_type: AuditEventType,
	pub timestamp: DateTime<Utc>,
	pub audit_id: String,
	pub agent_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trace_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub span_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub caller_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub peer_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub action: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resource: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub decision: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<f64>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub context: Map<String, Value>,
}

impl AuditEvent {
	pub fn new(event_type: AuditEventType, agent_name: impl Into<String>) -> Self {
		AuditEvent {
			event_type,
			timestamp: Utc::now(),
			audit_id: Uuid::new_v4().to_string(),
			agent_name: agent_name.into(),
			trace_id: None,
			span_id: None,
			caller_id: None,
			peer_id: None,
			action: None,
			resource: None,
			decision: None,
			reason: None,
			duration_ms: None,
			context: Map::new(),
		}
	}
}

#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
	async fn emit(&self, event: AuditEvent);
	async fn flush(&self);
	async fn close(&self);
	/// Events dropped due to buffer overflow, where applicable.
	fn dropped(&self) -> u64 {
		0
	}
}

/// Newline-delimited JSON to a file, buffered.
pub struct FileBackend {
	path: PathBuf,
	file: Mutex<Option<tokio::fs::File>>,
	buffer: Mutex<Vec<AuditEvent>>,
	/// Flush once this many events are buffered.
	flush_threshold: usize,
	/// Hard bound; beyond this the oldest buffered event is dropped.
	max_buffer: usize,
	dropped: AtomicU64,
	drop_counter: Option<Counter>,
}

impl FileBackend {
	pub async fn open(path: impl Into<PathBuf>, flush_threshold: usize) -> std::io::Result<Self> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await?;
		Ok(FileBackend {
			path,
			file: Mutex::new(Some(file)),
			buffer: Mutex::new(Vec::new()),
			flush_threshold: flush_threshold.max(1),
			max_buffer: flush_threshold.max(1) * 10,
			dropped: AtomicU64::new(0),
			drop_counter: None,
		})
	}

	/// Mirror buffer-overflow losses into a metric counter.
	pub fn with_drop_counter(mut self, counter: Counter) -> Self {
		self.drop_counter = Some(counter);
		self
	}

	async fn flush_locked(&self, buffer: &mut Vec<AuditEvent>) {
		if buffer.is_empty() {
			return;
		}
		let mut file = self.file.lock().await;
		let Some(file) = file.as_mut() else {
			return;
		};
		let mut out = String::new();
		for event in buffer.iter() {
			match serde_json::to_string(event) {
				Ok(line) => {
					out.push_str(&line);
					out.push('\n');
				},
				Err(e) => warn!(error = %e, "unserializable audit event"),
			}
		}
		if let Err(e) = file.write_all(out.as_bytes()).await {
			warn!(path = %self.path.display(), error = %e, "audit write failed");
			return;
		}
		if let Err(e) = file.flush().await {
			warn!(path = %self.path.display(), error = %e, "audit flush failed");
			return;
		}
		buffer.clear();
	}
}

#[async_trait::async_trait]
impl AuditBackend for FileBackend {
	async fn emit(&self, event: AuditEvent) {
		let mut buffer = self.buffer.lock().await;
		if buffer.len() >= self.max_buffer {
			buffer.remove(0);
			self.dropped.fetch_add(1, Ordering::Relaxed);
			if let Some(counter) = &self.drop_counter {
				counter.inc();
			}
		}
		buffer.push(event);
		if buffer.len() >= self.flush_threshold {
			self.flush_locked(&mut buffer).await;
		}
	}

	async fn flush(&self) {
		let mut buffer = self.buffer.lock().await;
		self.flush_locked(&mut buffer).await;
	}

	async fn close(&self) {
		self.flush().await;
		let mut file = self.file.lock().await;
		if let Some(mut f) = file.take() {
			let _ = f.shutdown().await;
		}
	}

	fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

/// One JSON line per event to stdout. Suited to containerized deployments
/// with log aggregation.
#[derive(Default)]
pub struct StdoutBackend;

#[async_trait::async_trait]
impl AuditBackend for StdoutBackend {
	async fn emit(&self, event: AuditEvent) {
		match serde_json::to_string(&event) {
			Ok(line) => {
				let mut stdout = tokio::io::stdout();
				let _ = stdout.write_all(line.as_bytes()).await;
				let _ = stdout.write_all(b"\n").await;
			},
			Err(e) => warn!(error = %e, "unserializable audit event"),
		}
	}

	async fn flush(&self) {
		let _ = tokio::io::stdout().flush().await;
	}

	async fn close(&self) {
		self.flush().await;
	}
}

/// Fan-out to an ordered list of backends; emission is concurrent.
pub struct MultiBackend {
	backends: Vec<Arc<dyn AuditBackend>>,
}

impl MultiBackend {
	pub fn new(backends: Vec<Arc<dyn AuditBackend>>) -> Self {
		MultiBackend { backends }
	}
}

#[async_trait::async_trait]
impl AuditBackend for MultiBackend {
	async fn emit(&self, event: AuditEvent) {
		futures_util::future::join_all(
			self.backends.iter().map(|b| b.emit(event.clone())),
		)
		.await;
	}

	async fn flush(&self) {
		futures_util::future::join_all(self.backends.iter().map(|b| b.flush())).await;
	}

	async fn close(&self) {
		futures_util::future::join_all(self.backends.iter().map(|b| b.close())).await;
	}

	fn dropped(&self) -> u64 {
		self.backends.iter().map(|b| b.dropped()).sum()
	}
}

/// Central recording surface: builds events and hands them to the backend.
pub struct AuditTrail {
	agent_name: String,
	backend: Arc<dyn AuditBackend>,
	enabled: bool,
}

impl AuditTrail {
	pub fn new(agent_name: impl Into<String>, backend: Arc<dyn AuditBackend>, enabled: bool) -> Self {
		AuditTrail {
			agent_name: agent_name.into(),
			backend,
			enabled,
		}
	}

	/// Build a backend from an audit destination string: `stdout`,
	/// `file:///path`, or a bare path. Buffer-overflow losses are mirrored
	/// into `metrics` when provided.
	pub async fn backend_for_destination(
		destination: &str,
		metrics: Option<&Metrics>,
	) -> std::io::Result<Arc<dyn AuditBackend>> {
		if destination == "stdout" {
			return Ok(Arc::new(StdoutBackend));
		}
		let path = destination.strip_prefix("file://").unwrap_or(destination);
		let mut backend = FileBackend::open(path, 100).await?;
		if let Some(metrics) = metrics {
			backend = backend.with_drop_counter(metrics.audit_events_dropped.clone());
		}
		Ok(Arc::new(backend))
	}

	async fn emit(&self, event: AuditEvent) {
		if self.enabled {
			self.backend.emit(event).await;
		}
	}

	pub async fn record_auth_check(
		&self,
		caller_id: &str,
		action: &str,
		resource: &str,
		decision: &str,
		reason: &str,
		duration_ms: f64,
		context: Map<String, Value>,
	) {
		let mut event = AuditEvent::new(AuditEventType::AuthCheck, &self.agent_name);
		event.caller_id = Some(caller_id.to_string());
		event.action = Some(action.to_string());
		event.resource = Some(resource.to_string());
		event.decision = Some(decision.to_string());
		event.reason = Some(reason.to_string());
		event.duration_ms = Some(duration_ms);
		event.context = context;
		self.emit(event).await;
	}

	pub async fn record_capability_call(
		&self,
		caller_id: &str,
		capability: &str,
		status: &str,
		duration_ms: f64,
	) {
		let mut event = AuditEvent::new(AuditEventType::CapabilityCall, &self.agent_name);
		event.caller_id = Some(caller_id.to_string());
		event.resource = Some(capability.to_string());
		event.decision = Some(status.to_string());
		event.duration_ms = Some(duration_ms);
		self.emit(event).await;
	}

	pub async fn record_config_change(&self, initiator: &str, change: &str, details: Map<String, Value>) {
		let mut event = AuditEvent::new(AuditEventType::ConfigChange, &self.agent_name);
		event.caller_id = Some(initiator.to_string());
		event.action = Some(change.to_string());
		event.context = details;
		self.emit(event).await;
	}

	pub async fn record_startup(&self, version: &str) {
		let mut event = AuditEvent::new(AuditEventType::Startup, &self.agent_name);
		event
			.context
			.insert("version".to_string(), Value::String(version.to_string()));
		self.emit(event).await;
	}

	pub async fn record_shutdown(&self, reason: &str) {
		let mut event = AuditEvent::new(AuditEventType::Shutdown, &self.agent_name);
		event.reason = Some(reason.to_string());
		self.emit(event).await;
	}

	pub async fn record_identity_rotation(&self, identity: &str, not_after: DateTime<Utc>) {
		let mut event = AuditEvent::new(AuditEventType::IdentityRotation, &self.agent_name);
		event.context.insert(
			"identity".to_string(),
			Value::String(identity.to_string()),
		);
		event.context.insert(
			"not_after".to_string(),
			Value::String(not_after.to_rfc3339()),
		);
		self.emit(event).await;
	}

	pub async fn record_peer_verification(&self, peer_id: &str, status: &str, reason: &str) {
		let mut event = AuditEvent::new(AuditEventType::PeerVerification, &self.agent_name);
		event.peer_id = Some(peer_id.to_string());
		event.decision = Some(status.to_string());
		if !reason.is_empty() {
			event.reason = Some(reason.to_string());
		}
		self.emit(event).await;
	}

	pub async fn flush(&self) {
		if self.enabled {
			self.backend.flush().await;
		}
	}

	pub async fn close(&self) {
		if self.enabled {
			self.backend.close().await;
		}
	}

	pub fn dropped(&self) -> u64 {
		self.backend.dropped()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn file_backend_writes_ndjson() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let backend = Arc::new(FileBackend::open(&path, 2).await.unwrap());
		let trail = AuditTrail::new("test-agent", backend, true);

		trail
			.record_auth_check(
				"spiffe://agentweave.io/agent/caller",
				"search",
				"spiffe://agentweave.io/agent/search",
				"allow",
				"same-domain",
				1.5,
				Map::new(),
			)
			.await;
		trail.record_shutdown("normal").await;
		trail.flush().await;

		let raw = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<&str> = raw.lines().collect();
		assert_eq!(lines.len(), 2);
		let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
		assert_eq!(first.event_type, AuditEventType::AuthCheck);
		assert_eq!(first.decision.as_deref(), Some("allow"));
		let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
		assert_eq!(second.event_type, AuditEventType::Shutdown);
	}

	#[tokio::test]
	async fn disabled_trail_emits_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let backend = Arc::new(FileBackend::open(&path, 1).await.unwrap());
		let trail = AuditTrail::new("test-agent", backend, false);
		trail.record_startup("0.1.0").await;
		trail.flush().await;
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
	}

	#[tokio::test]
	async fn multi_backend_fans_out() {
		let dir = tempfile::tempdir().unwrap();
		let a = dir.path().join("a.log");
		let b = dir.path().join("b.log");
		let multi = MultiBackend::new(vec![
			Arc::new(FileBackend::open(&a, 1).await.unwrap()),
			Arc::new(FileBackend::open(&b, 1).await.unwrap()),
		]);
		multi
			.emit(AuditEvent::new(AuditEventType::Startup, "test-agent"))
			.await;
		multi.flush().await;
		assert_eq!(std::fs::read_to_string(&a).unwrap().lines().count(), 1);
		assert_eq!(std::fs::read_to_string(&b).unwrap().lines().count(), 1);
	}

	#[tokio::test]
	async fn overflow_drops_oldest_and_counts_losses() {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Metrics::new(&mut registry);
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let backend = FileBackend::open(&path, 1)
			.await
			.unwrap()
			.with_drop_counter(metrics.audit_events_dropped.clone());
		// With the sink gone, the buffer cannot drain; the bound kicks in.
		backend.close().await;
		for _ in 0..15 {
			backend
				.emit(AuditEvent::new(AuditEventType::Startup, "test-agent"))
				.await;
		}
		assert_eq!(backend.dropped(), 5);
		assert_eq!(metrics.audit_events_dropped.get(), 5);
	}

	#[tokio::test]
	async fn event_serialization_omits_empty_fields() {
		let event = AuditEvent::new(AuditEventType::Startup, "test-agent");
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["event_type"], "STARTUP");
		assert!(json.get("caller_id").is_none());
		assert!(json.get("context").is_none());
	}
}
