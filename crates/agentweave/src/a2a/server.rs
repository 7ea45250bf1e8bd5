//! Server side of the A2A protocol.
//!
//! The accept loop terminates mTLS itself so the peer's workload identifier
//! can be lifted from the client certificate before any routing happens. In
//! strict mode a request without a verified peer identifier is rejected up
//! front; the JSON-RPC multiplex, agent card, SSE stream, and health
//! endpoints only ever see requests that passed that gate.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::Stream;
use http::StatusCode;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{Instrument, debug, info, warn};

use super::card::AgentCard;
use super::rpc_codes;
use super::task::{Message, Task, TaskManager, TaskState};
use crate::audit::AuditTrail;
use crate::authz::AuthzEnforcer;
use crate::config::{PeerVerification, TlsVersion};
use crate::identity::{IdentityProvider, SpiffeId, tls};
use crate::telemetry::Metrics;
use crate::transport;

/// The verified workload identifier of the connected client, attached to
/// every request on the connection.
#[derive(Debug, Clone)]
pub struct PeerIdentity(pub SpiffeId);

/// A semantic JSON-RPC failure produced by dispatch.
#[derive(Debug, Clone)]
pub struct RpcFailure {
	pub code: i64,
	pub message: String,
}

impl RpcFailure {
	pub fn semantic(message: impl Into<String>) -> Self {
		RpcFailure {
			code: rpc_codes::SEMANTIC_ERROR,
			message: message.into(),
		}
	}

	pub fn invalid_params(message: impl Into<String>) -> Self {
		RpcFailure {
			code: rpc_codes::INVALID_PARAMS,
			message: message.into(),
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct TaskSendParams {
	pub task_type: String,
	#[serde(default)]
	pub payload: Value,
	#[serde(default)]
	pub messages: Vec<Message>,
}

/// Dispatch seam between the protocol server and the capability shell.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
	/// Validate, authorize, create the task, and schedule execution.
	/// Returns the initial task record.
	async fn handle_send(
		&self,
		peer: Option<&SpiffeId>,
		params: TaskSendParams,
	) -> Result<Task, RpcFailure>;
}

pub struct ServerState {
	pub card: Arc<AgentCard>,
	pub tasks: Arc<TaskManager>,
	pub handler: Arc<dyn InboundHandler>,
	pub identity: Arc<dyn IdentityProvider>,
	pub authz: Arc<dyn AuthzEnforcer>,
	pub workload_id: SpiffeId,
	pub peer_verification: PeerVerification,
	pub audit: Option<Arc<AuditTrail>>,
	pub metrics: Option<Arc<Metrics>>,
}

impl ServerState {
	/// Aggregate component health: healthy only while both the identity
	/// path and the authorization provider answer.
	pub async fn health_report(&self) -> (bool, Value) {
		let identity_ok = self.identity.health_check().await;
		let authz_ok = self.authz.health_check().await;
		let healthy = identity_ok && authz_ok;
		let report = json!({
			"status": if healthy { "healthy" } else { "degraded" },
			"agent": self.card.name,
			"workload_id": self.workload_id.to_string(),
			"components": {
				"identity": if identity_ok { "healthy" } else { "unhealthy" },
				"authorization": if authz_ok { "healthy" } else { "unhealthy" },
			},
		});
		(healthy, report)
	}
}

pub struct A2aServer {
	state: Arc<ServerState>,
	identity: Arc<dyn IdentityProvider>,
	tls_min_version: TlsVersion,
}

impl A2aServer {
	pub fn new(
		state: Arc<ServerState>,
		identity: Arc<dyn IdentityProvider>,
		tls_min_version: TlsVersion,
	) -> Self {
		A2aServer {
			state,
			identity,
			tls_min_version,
		}
	}

	pub fn router(state: Arc<ServerState>) -> Router {
		Router::new()
			.route("/.well-known/agent.json", get(serve_card))
			.route("/rpc", post(handle_rpc))
			.route("/tasks/{task_id}/stream", get(stream_task))
			.route("/health", get(health))
			.with_state(state)
	}

	/// Bind and serve until `shutdown` flips. Each accepted connection is
	/// TLS-terminated with the current credential, so rotation applies to
	/// new connections without disturbing established ones.
	pub async fn serve(
		&self,
		addr: SocketAddr,
		shutdown: watch::Receiver<bool>,
	) -> Result<(), transport::Error> {
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|e| transport::Error::Connection(format!("bind {addr}: {e}")))?;
		self.serve_on(listener, shutdown).await
	}

	/// Serve on an already-bound listener (lets callers bind port 0 and
	/// read the address back).
	pub async fn serve_on(
		&self,
		listener: TcpListener,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<(), transport::Error> {
		let addr = listener
			.local_addr()
			.map_err(|e| transport::Error::Connection(e.to_string()))?;
		info!(%addr, identity = %self.state.workload_id, "a2a server listening");

		loop {
			let (stream, remote) = tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					},
				},
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						info!("a2a server shutting down");
						return Ok(());
					}
					continue;
				},
			};

			let acceptor = match self.tls_acceptor().await {
				Ok(acceptor) => acceptor,
				Err(e) => {
					warn!(error = %e, "cannot build TLS acceptor; dropping connection");
					continue;
				},
			};
			let state = self.state.clone();
			tokio::spawn(async move {
				if let Err(e) = Self::serve_connection(state, acceptor, stream, remote).await {
					debug!(%remote, error = %e, "connection closed with error");
				}
			});
		}
	}

	async fn tls_acceptor(&self) -> Result<TlsAcceptor, transport::Error> {
		let svid = self.identity.svid().await?;
		let own_domain = self.state.workload_id.trust_domain().to_string();
		let bundle = self.identity.trust_bundle(&own_domain).await?;
		let config = tls::server_config(&svid, &bundle, self.tls_min_version)?;
		Ok(TlsAcceptor::from(Arc::new(config)))
	}

	async fn serve_connection(
		state: Arc<ServerState>,
		acceptor: TlsAcceptor,
		stream: tokio::net::TcpStream,
		remote: SocketAddr,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		let tls_stream = match acceptor.accept(stream).await {
			Ok(s) => s,
			Err(e) => {
				if let Some(audit) = &state.audit {
					audit
						.record_peer_verification("unknown", "failure", &e.to_string())
						.await;
				}
				if let Some(metrics) = &state.metrics {
					metrics.record_peer_verification(false);
				}
				return Err(Box::new(e));
			},
		};

		let peer = tls_stream
			.get_ref()
			.1
			.peer_certificates()
			.and_then(|certs| certs.first())
			.and_then(tls::extract_spiffe_id);
		match &peer {
			Some(id) => {
				debug!(%remote, peer = %id, "verified peer connection");
				if let Some(audit) = &state.audit {
					audit
						.record_peer_verification(&id.to_string(), "success", "")
						.await;
				}
				if let Some(metrics) = &state.metrics {
					metrics.record_peer_verification(true);
				}
			},
			None => warn!(%remote, "client certificate carries no SPIFFE identity"),
		}

		let router = Self::router(state.clone());
		let service = hyper::service::service_fn(move |mut request: http::Request<hyper::body::Incoming>| {
			let router = router.clone();
			let state = state.clone();
			let peer = peer.clone();
			async move {
				// The gate: no verified peer identifier, no routing.
				if peer.is_none() && state.peer_verification == PeerVerification::Strict {
					return Ok::<_, Infallible>(peer_rejection());
				}
				let span = crate::telemetry::trace::inbound_request_span(
					request.method().as_str(),
					request.uri().path(),
					peer.as_ref().map(|p| p.to_string()).as_deref(),
				);
				if let Some(id) = peer {
					request.extensions_mut().insert(PeerIdentity(id));
				}
				router.oneshot(request).instrument(span).await
			}
		});

		hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
			.serve_connection(TokioIo::new(tls_stream), service)
			.await?;
		Ok(())
	}
}

fn peer_rejection() -> Response {
	(
		StatusCode::FORBIDDEN,
		Json(json!({ "error": "peer-verification-failed" })),
	)
		.into_response()
}

async fn serve_card(State(state): State<Arc<ServerState>>) -> Json<AgentCard> {
	Json((*state.card).clone())
}

async fn health(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<Value>) {
	let (healthy, report) = state.health_report().await;
	let status = if healthy {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(status, Json(report))
}

fn rpc_success(id: Value, result: Value) -> Json<Value> {
	Json(json!({ "jsonrpc": "2.0", "result": result, "id": id }))
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Json<Value> {
	Json(json!({
		"jsonrpc": "2.0",
		"error": { "code": code, "message": message.into() },
		"id": id,
	}))
}

async fn handle_rpc(
	State(state): State<Arc<ServerState>>,
	request: http::Request<axum::body::Body>,
) -> Json<Value> {
	let peer = request
		.extensions()
		.get::<PeerIdentity>()
		.map(|p| p.0.clone());
	let body = match axum::body::to_bytes(request.into_body(), 4 * 1024 * 1024).await {
		Ok(bytes) => bytes,
		Err(_) => return rpc_error(Value::Null, rpc_codes::PARSE_ERROR, "Parse error"),
	};
	dispatch_rpc(&state, peer.as_ref(), &body).await
}

async fn dispatch_rpc(state: &ServerState, peer: Option<&SpiffeId>, body: &Bytes) -> Json<Value> {
	let Ok(request) = serde_json::from_slice::<Value>(body) else {
		return rpc_error(Value::Null, rpc_codes::PARSE_ERROR, "Parse error");
	};
	let id = request.get("id").cloned().unwrap_or(Value::Null);
	if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
		return rpc_error(id, rpc_codes::INVALID_REQUEST, "Invalid Request");
	}
	let Some(method) = request.get("method").and_then(Value::as_str) else {
		return rpc_error(id, rpc_codes::INVALID_REQUEST, "Invalid Request");
	};
	let params = request.get("params").cloned().unwrap_or(json!({}));

	match method {
		"task.send" => handle_task_send(state, peer, params, id).await,
		"task.status" => handle_task_status(state, params, id).await,
		"task.cancel" => handle_task_cancel(state, params, id).await,
		other => rpc_error(
			id,
			rpc_codes::METHOD_NOT_FOUND,
			format!("Method not found: {other}"),
		),
	}
}

async fn handle_task_send(
	state: &ServerState,
	peer: Option<&SpiffeId>,
	params: Value,
	id: Value,
) -> Json<Value> {
	let params: TaskSendParams = match serde_json::from_value(params) {
		Ok(p) => p,
		Err(e) => {
			return rpc_error(
				id,
				rpc_codes::INVALID_PARAMS,
				format!("invalid params: {e}"),
			);
		},
	};
	if params.task_type.is_empty() {
		return rpc_error(
			id,
			rpc_codes::INVALID_PARAMS,
			"Missing required parameter: task_type",
		);
	}
	match state.handler.handle_send(peer, params).await {
		Ok(task) => rpc_success(id, serde_json::to_value(task).unwrap_or(Value::Null)),
		Err(failure) => rpc_error(id, failure.code, failure.message),
	}
}

async fn handle_task_status(state: &ServerState, params: Value, id: Value) -> Json<Value> {
	let Some(task_id) = params.get("task_id").and_then(Value::as_str) else {
		return rpc_error(
			id,
			rpc_codes::INVALID_PARAMS,
			"Missing required parameter: task_id",
		);
	};
	match state.tasks.get(task_id).await {
		Some(task) => rpc_success(id, serde_json::to_value(task).unwrap_or(Value::Null)),
		None => rpc_error(
			id,
			rpc_codes::SEMANTIC_ERROR,
			format!("Task not found: {task_id}"),
		),
	}
}

async fn handle_task_cancel(state: &ServerState, params: Value, id: Value) -> Json<Value> {
	let Some(task_id) = params.get("task_id").and_then(Value::as_str) else {
		return rpc_error(
			id,
			rpc_codes::INVALID_PARAMS,
			"Missing required parameter: task_id",
		);
	};
	let Some(task) = state.tasks.get(task_id).await else {
		return rpc_error(
			id,
			rpc_codes::SEMANTIC_ERROR,
			format!("Task not found: {task_id}"),
		);
	};
	if !task.is_terminal() {
		// A racing terminal transition makes this an illegal transition;
		// the task is terminal either way, so surface the current record.
		if let Err(e) = state.tasks.cancel(task_id).await {
			debug!(task_id, error = %e, "cancel raced with terminal transition");
		}
	}
	match state.tasks.get(task_id).await {
		Some(task) => rpc_success(id, serde_json::to_value(task).unwrap_or(Value::Null)),
		None => rpc_error(
			id,
			rpc_codes::SEMANTIC_ERROR,
			format!("Task not found: {task_id}"),
		),
	}
}

/// SSE stream: `task_update` on each observed change, one final
/// `task_complete` at the terminal state, `error` when the task is unknown.
async fn stream_task(
	State(state): State<Arc<ServerState>>,
	Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	let subscription = state.tasks.subscribe(&task_id).await;
	let tasks = state.tasks.clone();
	let stream = async_stream::stream! {
		let Some((initial, mut updates)) = subscription else {
			let data = json!({ "error": "Task not found" });
			yield Ok(Event::default().event("error").data(data.to_string()));
			return;
		};
		yield Ok(task_event("task_update", &initial));
		let mut last_state: TaskState = initial.state;
		if initial.is_terminal() {
			yield Ok(task_event("task_complete", &initial));
			return;
		}
		while updates.changed().await.is_ok() {
			let Some(task) = tasks.get(&task_id).await else {
				break;
			};
			if task.state != last_state {
				last_state = task.state;
				yield Ok(task_event("task_update", &task));
			}
			if task.is_terminal() {
				yield Ok(task_event("task_complete", &task));
				return;
			}
		}
	};
	Sse::new(stream).keep_alive(KeepAlive::default())
}

fn task_event(kind: &str, task: &Task) -> Event {
	let data = serde_json::to_string(task).unwrap_or_else(|_| "{}".to_string());
	Event::default().event(kind).data(data)
}
