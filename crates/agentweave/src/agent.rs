//! The agent shell: capability registry, inbound dispatch, and outbound
//! calls to peers.
//!
//! Inbound: the request server hands over a verified peer identifier and the
//! task parameters; dispatch looks up the capability, checks the peer
//! patterns, runs the inbound authorization gate, then executes the handler
//! under a fresh task with the request context installed.
//!
//! Outbound: `call_peer` runs the outbound authorization gate, borrows a
//! pooled channel, and submits the task through the per-target circuit
//! breaker.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};
use url::Url;

use crate::a2a::server::{A2aServer, InboundHandler, RpcFailure, ServerState, TaskSendParams};
use crate::a2a::task::TaskState;
use crate::a2a::{A2aClient, AgentCard, Capability, Task, TaskManager};
use crate::audit::AuditTrail;
use crate::authz::{AllowAllEnforcer, AuthzEnforcer, PolicyEnforcer, PolicyEnforcerConfig};
use crate::config::{AgentConfig, AuthorizationProviderKind, IdentityProviderKind};
use crate::context::{self, RequestContext};
use crate::errors::Error;
use crate::identity::workload::WorkloadApi;
use crate::identity::{
	IdentityProvider, SpiffeId, StaticIdentityProvider, WorkloadIdentityProvider,
};
use crate::telemetry::Metrics;
use crate::transport::retry::Jitter;
use crate::transport::{
	ChannelConfig, CircuitBreakerConfig, CircuitBreakerRegistry, ConnectionPool, PoolConfig,
	RetryConfig,
};
use crate::{a2a, transport};

static CAPABILITY_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// A glob pattern over workload identifiers (`*` and `?` wildcards).
#[derive(Debug, Clone)]
pub struct PeerPattern {
	pattern: String,
	regex: Regex,
}

impl PeerPattern {
	pub fn new(pattern: &str) -> Result<Self, Error> {
		let mut re = String::from("^");
		for ch in pattern.chars() {
			match ch {
				'*' => re.push_str(".*"),
				'?' => re.push('.'),
				other => re.push_str(&regex::escape(&other.to_string())),
			}
		}
		re.push('$');
		let regex = Regex::new(&re)
			.map_err(|e| Error::InvalidParams(format!("bad peer pattern '{pattern}': {e}")))?;
		Ok(PeerPattern {
			pattern: pattern.to_string(),
			regex,
		})
	}

	pub fn matches(&self, id: &str) -> bool {
		self.regex.is_match(id)
	}

	pub fn pattern(&self) -> &str {
		&self.pattern
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditLevel {
	Debug,
	#[default]
	Info,
	Warn,
	Error,
}

#[derive(Clone)]
pub struct CapabilityMetadata {
	pub name: String,
	pub description: String,
	pub peer_patterns: Vec<PeerPattern>,
	pub audit_level: AuditLevel,
}

impl CapabilityMetadata {
	pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
		CapabilityMetadata {
			name: name.into(),
			description: description.into(),
			peer_patterns: Vec::new(),
			audit_level: AuditLevel::default(),
		}
	}

	/// Restrict callers to workload identifiers matching `pattern`.
	/// A caller is eligible iff at least one registered pattern matches.
	pub fn require_peer(mut self, pattern: &str) -> Result<Self, Error> {
		self.peer_patterns.push(PeerPattern::new(pattern)?);
		Ok(self)
	}

	pub fn audit_level(mut self, level: AuditLevel) -> Self {
		self.audit_level = level;
		self
	}
}

/// A capability handler: JSON payload in, JSON result out. The request
/// context is ambient (see [`crate::context`]).
pub type CapabilityHandler =
	Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;

/// Wrap a plain async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> CapabilityHandler
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
	Arc::new(move |payload| Box::pin(f(payload)))
}

/// Wrap a handler taking a typed input struct. Payloads that do not
/// deserialize surface *invalid-params* instead of reaching the handler.
pub fn typed_handler<I, O, F, Fut>(f: F) -> CapabilityHandler
where
	I: DeserializeOwned + Send + 'static,
	O: Serialize,
	F: Fn(I) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<O, Error>> + Send + 'static,
{
	let f = Arc::new(f);
	Arc::new(move |payload| {
		let f = f.clone();
		Box::pin(async move {
			let input: I = serde_json::from_value(payload)
				.map_err(|e| Error::InvalidParams(e.to_string()))?;
			let output = f(input).await?;
			serde_json::to_value(output).map_err(|e| Error::Internal(e.to_string()))
		})
	})
}

struct RegisteredCapability {
	meta: CapabilityMetadata,
	handler: CapabilityHandler,
}

#[derive(Default)]
struct CapabilityRegistry {
	capabilities: RwLock<std::collections::HashMap<String, Arc<RegisteredCapability>>>,
}

impl CapabilityRegistry {
	fn register(&self, meta: CapabilityMetadata, handler: CapabilityHandler) -> Result<(), Error> {
		if !CAPABILITY_NAME_RE.is_match(&meta.name) {
			return Err(Error::InvalidParams(format!(
				"capability name '{}' must match ^[a-z][a-z0-9_]*$",
				meta.name
			)));
		}
		let mut capabilities = self.capabilities.write();
		info!(capability = %meta.name, patterns = meta.peer_patterns.len(), "registered capability");
		capabilities.insert(
			meta.name.clone(),
			Arc::new(RegisteredCapability { meta, handler }),
		);
		Ok(())
	}

	fn get(&self, name: &str) -> Option<Arc<RegisteredCapability>> {
		self.capabilities.read().get(name).cloned()
	}

	fn metadata(&self) -> Vec<CapabilityMetadata> {
		self
			.capabilities
			.read()
			.values()
			.map(|c| c.meta.clone())
			.collect()
	}
}

pub struct AgentBuilder {
	config: AgentConfig,
	identity: Option<Arc<dyn IdentityProvider>>,
	workload_api: Option<Arc<dyn WorkloadApi>>,
	authz: Option<Arc<dyn AuthzEnforcer>>,
	audit: Option<Arc<AuditTrail>>,
}

impl AgentBuilder {
	pub fn new(config: AgentConfig) -> Self {
		AgentBuilder {
			config,
			identity: None,
			workload_api: None,
			authz: None,
			audit: None,
		}
	}

	/// Inject a ready identity provider (tests, embeddings with their own
	/// lifecycle).
	pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
		self.identity = Some(identity);
		self
	}

	/// Bind the identity socket. Required when the configuration selects
	/// the `workload-api` provider.
	pub fn with_workload_api(mut self, api: Arc<dyn WorkloadApi>) -> Self {
		self.workload_api = Some(api);
		self
	}

	pub fn with_authz(mut self, authz: Arc<dyn AuthzEnforcer>) -> Self {
		self.authz = Some(authz);
		self
	}

	pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
		self.audit = Some(audit);
		self
	}

	pub async fn build(self) -> Result<Arc<Agent>, Error> {
		let AgentBuilder {
			config,
			identity,
			workload_api,
			authz,
			audit,
		} = self;
		config.validate()?;
		let config = Arc::new(config);

		let identity: Arc<dyn IdentityProvider> = match identity {
			Some(identity) => identity,
			None => match config.identity.provider {
				IdentityProviderKind::Static => {
					let files = config.identity.static_files.as_ref().expect(
						"validated config with static provider carries static_files",
					);
					StaticIdentityProvider::load(&files.cert, &files.key, &files.bundle, None)?
				},
				IdentityProviderKind::WorkloadApi => {
					let api = workload_api.ok_or_else(|| {
						crate::config::ConfigError::Invalid {
							field: "identity.provider".into(),
							message: "workload-api provider requires a WorkloadApi binding \
							          (AgentBuilder::with_workload_api)"
								.into(),
						}
					})?;
					WorkloadIdentityProvider::new(
						api,
						config.identity.allowed_trust_domains.clone(),
					)
					.await?
				},
			},
		};
		let workload_id = identity.spiffe_id().clone();

		let mut registry = prometheus_client::registry::Registry::with_prefix("agentweave");
		let metrics = Arc::new(Metrics::new(&mut registry));

		let audit = match audit {
			Some(audit) => audit,
			None => {
				let backend = AuditTrail::backend_for_destination(
					&config.authorization.audit.destination,
					Some(&metrics),
				)
				.await
				.map_err(|e| Error::Internal(format!("audit backend: {e}")))?;
				Arc::new(AuditTrail::new(
					&config.agent.name,
					backend,
					config.authorization.audit.enabled,
				))
			},
		};

		let breaker_config = CircuitBreakerConfig {
			failure_threshold: config.transport.circuit_breaker.failure_threshold,
			success_threshold: 2,
			timeout: config.recovery_timeout(),
		};
		let authz: Arc<dyn AuthzEnforcer> = match authz {
			Some(authz) => authz,
			None => match config.authorization.provider {
				AuthorizationProviderKind::ExternalPolicy => Arc::new(
					PolicyEnforcer::new(
						PolicyEnforcerConfig {
							endpoint: config.authorization.endpoint.clone(),
							policy_path: config.authorization.policy_path.clone(),
							default_action: config.authorization.default_action,
							breaker: breaker_config.clone(),
							..Default::default()
						},
						Some(audit.clone()),
						Some(metrics.clone()),
					)
					.map_err(|e| Error::Internal(format!("policy enforcer: {e}")))?,
				),
				AuthorizationProviderKind::AllowAll => Arc::new(AllowAllEnforcer::new()),
			},
		};

		let retry = RetryConfig {
			max_retries: config.transport.retry.max_attempts,
			base_delay: Duration::from_secs_f64(config.transport.retry.backoff_base_seconds),
			max_delay: Duration::from_secs_f64(config.transport.retry.backoff_max_seconds),
			exponential_base: 2.0,
			jitter: Jitter::Full,
		};
		let channel_config = ChannelConfig {
			tls_min_version: config.transport.tls_min_version,
			timeout: Duration::from_secs(30),
			retry: Some(retry),
		};
		let max_total = config.transport.connection_pool.max_connections;
		let pool = ConnectionPool::new(
			identity.clone(),
			PoolConfig {
				max_connections_per_target: max_total.min(10),
				max_total_connections: max_total,
				idle_timeout: config.idle_timeout(),
				..Default::default()
			},
			channel_config,
			Some(audit.clone()),
			Some(metrics.clone()),
		)?;

		let (shutdown_tx, _) = watch::channel(false);
		let breakers =
			CircuitBreakerRegistry::new(breaker_config).with_metrics(Some(metrics.clone()));
		let url = format!(
			"https://{}:{}",
			config.server.host, config.server.port
		);
		let card = AgentCard::from_config(&config, &workload_id, url);

		Ok(Arc::new(Agent {
			config,
			identity,
			authz,
			audit,
			metrics,
			metrics_registry: Mutex::new(registry),
			registry: CapabilityRegistry::default(),
			tasks: TaskManager::new(),
			pool,
			breakers,
			card: ArcSwap::from_pointee(card),
			workload_id,
			shutdown_tx,
			server_handle: Mutex::new(None),
		}))
	}
}

pub struct Agent {
	config: Arc<AgentConfig>,
	identity: Arc<dyn IdentityProvider>,
	authz: Arc<dyn AuthzEnforcer>,
	audit: Arc<AuditTrail>,
	metrics: Arc<Metrics>,
	metrics_registry: Mutex<prometheus_client::registry::Registry>,
	registry: CapabilityRegistry,
	tasks: Arc<TaskManager>,
	pool: Arc<ConnectionPool>,
	breakers: CircuitBreakerRegistry,
	card: ArcSwap<AgentCard>,
	workload_id: SpiffeId,
	shutdown_tx: watch::Sender<bool>,
	server_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Agent {
	pub fn builder(config: AgentConfig) -> AgentBuilder {
		AgentBuilder::new(config)
	}

	pub fn workload_id(&self) -> &SpiffeId {
		&self.workload_id
	}

	pub fn config(&self) -> &AgentConfig {
		&self.config
	}

	pub fn card(&self) -> Arc<AgentCard> {
		self.card.load_full()
	}

	pub fn tasks(&self) -> &Arc<TaskManager> {
		&self.tasks
	}

	pub fn audit(&self) -> &Arc<AuditTrail> {
		&self.audit
	}

	pub fn metrics(&self) -> &Arc<Metrics> {
		&self.metrics
	}

	/// Render current metrics in the Prometheus text exposition format.
	pub fn encode_metrics(&self) -> String {
		let mut out = String::new();
		let registry = self.metrics_registry.lock();
		if let Err(e) = prometheus_client::encoding::text::encode(&mut out, &registry) {
			warn!(error = %e, "metric encoding failed");
		}
		out
	}

	/// Register a capability handler. The agent card advertises it from the
	/// next (re)build at startup.
	pub fn register_capability(
		&self,
		meta: CapabilityMetadata,
		handler: CapabilityHandler,
	) -> Result<(), Error> {
		let card_entry = Capability::new(&meta.name, &meta.description);
		self.registry.register(meta, handler)?;
		let mut card = (*self.card.load_full()).clone();
		card.add_capability(card_entry);
		self.card.store(Arc::new(card));
		Ok(())
	}

	pub fn capabilities(&self) -> Vec<CapabilityMetadata> {
		self.registry.metadata()
	}

	/// The request router, for embedding the agent into an existing server
	/// (peer extraction and TLS remain the embedder's responsibility).
	pub fn router(self: &Arc<Self>) -> axum::Router {
		A2aServer::router(self.server_state())
	}

	fn server_state(self: &Arc<Self>) -> Arc<ServerState> {
		Arc::new(ServerState {
			card: self.card.load_full(),
			tasks: self.tasks.clone(),
			handler: Arc::new(AgentHandler(self.clone())),
			identity: self.identity.clone(),
			authz: self.authz.clone(),
			workload_id: self.workload_id.clone(),
			peer_verification: self.config.transport.peer_verification,
			audit: Some(self.audit.clone()),
			metrics: Some(self.metrics.clone()),
		})
	}

	/// Start serving: verify the credential, wire rotation auditing, spawn
	/// the background loops, and bind the request server.
	pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
		// The agent cannot come up without a valid credential.
		let svid = self.identity.svid().await?;
		info!(
			identity = %self.workload_id,
			not_after = ?svid.not_after,
			"agent identity verified"
		);

		{
			let audit = self.audit.clone();
			let identity = self.workload_id.to_string();
			self.identity.on_rotation(Box::new(move |svid| {
				let audit = audit.clone();
				let identity = identity.clone();
				Box::pin(async move {
					let not_after = chrono::DateTime::<chrono::Utc>::from(svid.not_after);
					audit.record_identity_rotation(&identity, not_after).await;
				})
			}));
		}

		self.audit.record_startup(env!("CARGO_PKG_VERSION")).await;

		let shutdown_rx = self.shutdown_tx.subscribe();
		self.pool.spawn_background(shutdown_rx.clone());
		self.tasks.spawn_reaper(
			Duration::from_secs(60),
			Duration::from_secs(3600),
			shutdown_rx.clone(),
		);

		let host: IpAddr = self
			.config
			.server
			.host
			.parse()
			.map_err(|_| Error::InvalidParams(format!(
				"server.host '{}' is not an IP address",
				self.config.server.host
			)))?;
		let addr = SocketAddr::new(host, self.config.server.port);
		let listener = tokio::net::TcpListener::bind(addr)
			.await
			.map_err(|e| transport::Error::Connection(format!("bind {addr}: {e}")))?;
		self.serve_listener(listener);
		info!(agent = %self.config.agent.name, "agent started");
		Ok(())
	}

	/// Serve the mTLS request server on an already-bound listener.
	pub fn serve_listener(self: &Arc<Self>, listener: tokio::net::TcpListener) {
		let server = A2aServer::new(
			self.server_state(),
			self.identity.clone(),
			self.config.transport.tls_min_version,
		);
		let shutdown_rx = self.shutdown_tx.subscribe();
		let handle = tokio::spawn(async move {
			if let Err(e) = server.serve_on(listener, shutdown_rx).await {
				error!(error = %e, "a2a server terminated");
			}
		});
		*self.server_handle.lock() = Some(handle);
	}

	pub async fn shutdown(&self, reason: &str) {
		info!(reason, "agent shutting down");
		self.shutdown_tx.send_replace(true);
		self.pool.close_all();
		self.audit.record_shutdown(reason).await;
		self.audit.flush().await;
		if let Some(handle) = self.server_handle.lock().take() {
			handle.abort();
		}
	}

	/// Start and run until interrupted.
	pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
		self.start().await?;
		let _ = tokio::signal::ctrl_c().await;
		self.shutdown("signal").await;
		Ok(())
	}

	/// Aggregated health over the agent's components. The `GET /health`
	/// endpoint serves the same report.
	pub async fn health(self: &Arc<Self>) -> Value {
		self.server_state().health_report().await.1
	}

	/// Call a capability on a peer agent: outbound authorization, pooled
	/// channel, `task.send`. Returns the initial task record from the peer.
	pub async fn call_peer(
		&self,
		target: &SpiffeId,
		url: &Url,
		task_type: &str,
		payload: Value,
	) -> Result<Task, Error> {
		let caller = self.workload_id.to_string();
		let mut ctx = Map::new();
		ctx.insert(
			"payload_size".to_string(),
			json!(payload.to_string().len()),
		);
		if let Some(upstream) = context::current() {
			ctx.insert(
				"upstream_caller".to_string(),
				Value::String(upstream.caller_id),
			);
		}

		// Authorization gate comes first; a denial never reaches the network.
		let decision = self
			.authz
			.check(&caller, &target.to_string(), task_type, Some(&ctx))
			.await;
		if !decision.allowed {
			warn!(
				target = %target,
				task_type,
				reason = %decision.reason,
				"outbound call denied"
			);
			return Err(Error::AccessDenied {
				reason: decision.reason,
			});
		}
		debug!(target = %target, task_type, audit_id = %decision.audit_id, "outbound call authorized");

		let span = crate::telemetry::trace::outbound_call_span(&target.to_string(), task_type);
		let started = Instant::now();
		let breaker = self.breakers.get(&target.to_string());
		let outcome = breaker
			.call_with_exclusions(
				|| async {
					let channel = self.pool.acquire(target, url).await?;
					A2aClient::send_task(&channel, task_type, payload.clone(), vec![])
						.await
						.map_err(Error::from)
				},
				// Semantic errors from the peer are not transport failures.
				|e: &Error| {
					matches!(
						e,
						Error::Protocol(
							a2a::Error::Rpc { .. }
								| a2a::Error::UnknownCapability(_)
								| a2a::Error::MethodNotFound(_)
								| a2a::Error::InvalidParams(_)
								| a2a::Error::InvalidRpc(_)
						)
					)
				},
			)
			.instrument(span)
			.await;
		self.metrics
			.request_duration
			.observe(started.elapsed().as_secs_f64());
		match outcome {
			Ok(result) => result,
			Err(transport::Error::CircuitOpen(name)) => {
				Err(transport::Error::CircuitOpen(name).into())
			},
			Err(other) => Err(other.into()),
		}
	}

	/// Call a peer and poll until the task is terminal.
	pub async fn call_peer_and_wait(
		&self,
		target: &SpiffeId,
		url: &Url,
		task_type: &str,
		payload: Value,
		timeout: Duration,
	) -> Result<Task, Error> {
		let task = self.call_peer(target, url, task_type, payload).await?;
		if task.is_terminal() {
			return Ok(task);
		}
		let channel = self.pool.acquire(target, url).await?;
		A2aClient::poll_until_complete(
			&channel,
			&task.id,
			Duration::from_millis(500),
			Some(timeout),
		)
		.await
		.map_err(Error::from)
	}

	async fn execute_task(self: Arc<Self>, task: Task, capability: Arc<RegisteredCapability>) {
		let caller = task
			.metadata
			.get("caller_spiffe_id")
			.and_then(Value::as_str)
			.unwrap_or("unknown")
			.to_string();
		let started = Instant::now();

		if let Err(e) = self
			.tasks
			.update(&task.id, Some(TaskState::Running), None, None)
			.await
		{
			// Cancelled before it ever ran.
			debug!(task_id = %task.id, error = %e, "task not started");
			return;
		}

		let ctx = RequestContext::new(&caller, &task.id).with_metadata({
			let mut m = Map::new();
			m.insert(
				"task_type".to_string(),
				Value::String(task.task_type.clone()),
			);
			m
		});
		let payload = task.payload.clone();
		let handler = capability.handler.clone();
		let span = crate::telemetry::trace::capability_span(&capability.meta.name, &task.id, &caller);
		let result = context::scope(ctx, async move { handler(payload).await })
			.instrument(span)
			.await;

		let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
		let status = match result {
			Ok(value) => {
				match self
					.tasks
					.update(&task.id, Some(TaskState::Completed), Some(value), None)
					.await
				{
					Ok(_) => "success",
					Err(_) => {
						// Task went terminal (cancelled) while the handler
						// ran; its result is discarded.
						debug!(task_id = %task.id, "discarding result for terminal task");
						"discarded"
					},
				}
			},
			Err(e) => {
				let _ = self
					.tasks
					.update(
						&task.id,
						Some(TaskState::Failed),
						None,
						Some(e.to_string()),
					)
					.await;
				"error"
			},
		};

		self.metrics
			.record_capability_call(&capability.meta.name, status);
		match capability.meta.audit_level {
			AuditLevel::Debug => {
				debug!(capability = %capability.meta.name, caller = %caller, status, "capability call")
			},
			AuditLevel::Info => {
				info!(capability = %capability.meta.name, caller = %caller, status, "capability call")
			},
			AuditLevel::Warn => {
				warn!(capability = %capability.meta.name, caller = %caller, status, "capability call")
			},
			AuditLevel::Error => {
				error!(capability = %capability.meta.name, caller = %caller, status, "capability call")
			},
		}
		self.audit
			.record_capability_call(&caller, &capability.meta.name, status, duration_ms)
			.await;
	}
}

/// Owning dispatch handle handed to the request server.
struct AgentHandler(Arc<Agent>);

#[async_trait::async_trait]
impl InboundHandler for AgentHandler {
	async fn handle_send(
		&self,
		peer: Option<&SpiffeId>,
		params: TaskSendParams,
	) -> Result<Task, RpcFailure> {
		let agent = &self.0;
		let Some(capability) = agent.registry.get(&params.task_type) else {
			return Err(RpcFailure::semantic(format!(
				"No handler registered for task type: {}",
				params.task_type
			)));
		};

		let caller = peer.map(|p| p.to_string());
		if !capability.meta.peer_patterns.is_empty() {
			let eligible = caller
				.as_deref()
				.map(|c| {
					capability
						.meta
						.peer_patterns
						.iter()
						.any(|p| p.matches(c))
				})
				.unwrap_or(false);
			if !eligible {
				warn!(
					capability = %capability.meta.name,
					caller = caller.as_deref().unwrap_or("unverified"),
					"caller does not match required peer patterns"
				);
				agent
					.audit
					.record_capability_call(
						caller.as_deref().unwrap_or("unverified"),
						&capability.meta.name,
						"peer_pattern_mismatch",
						0.0,
					)
					.await;
				return Err(RpcFailure::semantic(format!(
					"Caller does not match required peer patterns for '{}'",
					capability.meta.name
				)));
			}
		}

		let caller = caller.unwrap_or_else(|| "unverified".to_string());
		let decision = agent
			.authz
			.check(
				&caller,
				&agent.workload_id.to_string(),
				&params.task_type,
				None,
			)
			.await;
		if !decision.allowed {
			return Err(RpcFailure::semantic(format!(
				"Not authorized: {}",
				decision.reason
			)));
		}

		let mut metadata = Map::new();
		metadata.insert(
			"caller_spiffe_id".to_string(),
			Value::String(caller.clone()),
		);
		let task = agent
			.tasks
			.create(
				params.task_type.clone(),
				params.payload,
				params.messages,
				metadata,
			)
			.await;

		// Detach execution; the caller gets the pending record immediately.
		let spawned = self.0.clone();
		let spawn_task = task.clone();
		tokio::spawn(async move {
			spawned.execute_task(spawn_task, capability).await;
		});
		Ok(task)
	}
}
