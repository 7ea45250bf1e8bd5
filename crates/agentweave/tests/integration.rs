mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use agentweave::a2a::server::PeerIdentity;
use agentweave::a2a::{A2aClient, TaskState};
use agentweave::agent::{CapabilityMetadata, handler_fn, typed_handler};
use agentweave::authz::{AuthzEnforcer, PolicyEnforcer, PolicyEnforcerConfig};
use agentweave::identity::{IdentityProvider, SpiffeId, WorkloadIdentityProvider};
use agentweave::transport::{ChannelConfig, CircuitBreakerConfig, SecureChannel};
use agentweave::{Agent, Error};

use common::{FixedIdentity, MemoryWorkloadApi, StaticEnforcer, TestCa, dev_config};

const ORCHESTRATOR: &str = "spiffe://agentweave.io/agent/orchestrator";
const SEARCH: &str = "spiffe://agentweave.io/agent/search";

// ---------------------------------------------------------------------------
// Policy enforcer against a real (mocked) policy engine
// ---------------------------------------------------------------------------

fn enforcer_config(endpoint: String) -> PolicyEnforcerConfig {
	PolicyEnforcerConfig {
		endpoint,
		policy_path: "agentweave/authz/allow".to_string(),
		timeout: Duration::from_secs(2),
		..Default::default()
	}
}

#[tokio::test]
async fn policy_allow_and_deny() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/data/agentweave/authz/allow"))
		.and(body_partial_json(json!({
			"input": { "caller_spiffe_id": ORCHESTRATOR, "action": "search" }
		})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"result": { "allow": true, "reason": "same-domain" }
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(body_partial_json(json!({
			"input": { "caller_spiffe_id": "spiffe://evil.com/agent/bad" }
		})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"result": { "allow": false, "reason": "cross-domain" }
		})))
		.mount(&server)
		.await;

	let enforcer = PolicyEnforcer::new(enforcer_config(server.uri()), None, None).unwrap();
	let allowed = enforcer
		.check(ORCHESTRATOR, SEARCH, "search", None)
		.await;
	assert!(allowed.allowed);
	assert_eq!(allowed.reason, "same-domain");

	let denied = enforcer
		.check("spiffe://evil.com/agent/bad", SEARCH, "search", None)
		.await;
	assert!(!denied.allowed);
	assert_eq!(denied.reason, "cross-domain");
}

#[tokio::test]
async fn policy_decisions_are_cached() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
		.expect(1)
		.mount(&server)
		.await;

	let enforcer = PolicyEnforcer::new(enforcer_config(server.uri()), None, None).unwrap();
	let first = enforcer.check(ORCHESTRATOR, SEARCH, "search", None).await;
	let second = enforcer.check(ORCHESTRATOR, SEARCH, "search", None).await;
	// The cached decision is returned verbatim, audit id included.
	assert_eq!(first, second);
	server.verify().await;
}

#[tokio::test]
async fn policy_outage_defaults_to_deny_then_recovers() {
	let server = MockServer::start().await;
	let failure = Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.expect(2)
		.named("failing policy engine")
		.mount_as_scoped(&server)
		.await;

	let mut config = enforcer_config(server.uri());
	config.cache_ttl = Duration::ZERO; // every check consults the engine
	config.breaker = CircuitBreakerConfig {
		failure_threshold: 2,
		success_threshold: 1,
		timeout: Duration::from_millis(200),
	};
	let enforcer = PolicyEnforcer::new(config, None, None).unwrap();

	// Two engine failures trip the breaker; both resolve to default deny.
	for n in 0..2 {
		let decision = enforcer
			.check(ORCHESTRATOR, SEARCH, &format!("action{n}"), None)
			.await;
		assert!(!decision.allowed);
		assert!(decision.reason.contains("policy engine unavailable"));
	}
	// Breaker open: denied without touching the engine.
	let decision = enforcer
		.check(ORCHESTRATOR, SEARCH, "action2", None)
		.await;
	assert!(!decision.allowed);
	assert!(decision.reason.contains("policy engine unavailable"));
	drop(failure);

	// After the recovery timeout one probing call goes through and normal
	// decisions resume.
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"result": { "allow": true, "reason": "recovered" }
		})))
		.mount(&server)
		.await;
	tokio::time::sleep(Duration::from_millis(250)).await;
	let decision = enforcer
		.check(ORCHESTRATOR, SEARCH, "action3", None)
		.await;
	assert!(decision.allowed);
	assert_eq!(decision.reason, "recovered");
}

// ---------------------------------------------------------------------------
// JSON-RPC dispatch through the router (no TLS; peer injected directly)
// ---------------------------------------------------------------------------

async fn echo_agent(enforcer: Arc<dyn AuthzEnforcer>) -> Arc<Agent> {
	let ca = TestCa::new("agentweave.io");
	let identity = FixedIdentity::new(ca.issue_svid(SEARCH), vec![ca.bundle()]);
	let agent = Agent::builder(dev_config("search"))
		.with_identity(identity)
		.with_authz(enforcer)
		.build()
		.await
		.unwrap();
	agent
		.register_capability(
			CapabilityMetadata::new("echo", "Echo the payload back"),
			handler_fn(|payload| async move { Ok(json!({ "echo": payload })) }),
		)
		.unwrap();
	agent
		.register_capability(
			CapabilityMetadata::new("slow", "Runs until cancelled")
				.require_peer("spiffe://agentweave.io/agent/*")
				.unwrap(),
			handler_fn(|_| async move {
				tokio::time::sleep(Duration::from_secs(30)).await;
				Ok(json!("done"))
			}),
		)
		.unwrap();
	agent
}

async fn rpc(agent: &Arc<Agent>, peer: Option<&str>, body: Value) -> Value {
	rpc_raw(agent, peer, body.to_string()).await
}

async fn rpc_raw(agent: &Arc<Agent>, peer: Option<&str>, body: String) -> Value {
	let mut request = http::Request::builder()
		.method("POST")
		.uri("/rpc")
		.header("content-type", "application/json")
		.body(axum::body::Body::from(body))
		.unwrap();
	if let Some(peer) = peer {
		request
			.extensions_mut()
			.insert(PeerIdentity(SpiffeId::from_str(peer).unwrap()));
	}
	let response = agent.router().oneshot(request).await.unwrap();
	let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
		.await
		.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

fn send_request(task_type: &str, payload: Value) -> Value {
	json!({
		"jsonrpc": "2.0",
		"method": "task.send",
		"params": { "task_type": task_type, "payload": payload },
		"id": "req-1",
	})
}

#[tokio::test]
async fn task_send_executes_capability() {
	let agent = echo_agent(StaticEnforcer::allow()).await;
	let response = rpc(
		&agent,
		Some(ORCHESTRATOR),
		send_request("echo", json!({"q": "hello"})),
	)
	.await;
	assert_eq!(response["jsonrpc"], "2.0");
	assert_eq!(response["id"], "req-1");
	let task_id = response["result"]["id"].as_str().unwrap().to_string();
	assert_eq!(response["result"]["state"], "pending");

	let done = agent
		.tasks()
		.await_completion(&task_id, Some(Duration::from_secs(5)))
		.await
		.unwrap();
	assert_eq!(done.state, TaskState::Completed);
	assert_eq!(done.result.unwrap()["echo"]["q"], "hello");
}

#[tokio::test]
async fn denied_call_never_reaches_handler() {
	let agent = echo_agent(StaticEnforcer::deny("cross-domain")).await;
	let response = rpc(
		&agent,
		Some("spiffe://evil.com/agent/bad"),
		send_request("echo", json!({})),
	)
	.await;
	assert_eq!(response["error"]["code"], -32000);
	assert!(
		response["error"]["message"]
			.as_str()
			.unwrap()
			.contains("Not authorized")
	);
	// The denial happened before task creation.
	assert!(agent.tasks().list(None, None).await.is_empty());
}

#[tokio::test]
async fn peer_pattern_mismatch_is_rejected() {
	let agent = echo_agent(StaticEnforcer::allow()).await;
	let response = rpc(
		&agent,
		Some("spiffe://evil.com/agent/bad"),
		send_request("slow", json!({})),
	)
	.await;
	assert_eq!(response["error"]["code"], -32000);
	assert!(
		response["error"]["message"]
			.as_str()
			.unwrap()
			.contains("peer patterns")
	);
}

#[tokio::test]
async fn jsonrpc_error_codes() {
	let agent = echo_agent(StaticEnforcer::allow()).await;

	let parse = rpc_raw(&agent, Some(ORCHESTRATOR), "{not json".to_string()).await;
	assert_eq!(parse["error"]["code"], -32700);
	assert_eq!(parse["id"], Value::Null);

	let invalid = rpc(
		&agent,
		Some(ORCHESTRATOR),
		json!({ "method": "task.send", "id": 7 }),
	)
	.await;
	assert_eq!(invalid["error"]["code"], -32600);
	assert_eq!(invalid["id"], 7);

	let missing = rpc(
		&agent,
		Some(ORCHESTRATOR),
		json!({ "jsonrpc": "2.0", "method": "task.describe", "id": 8 }),
	)
	.await;
	assert_eq!(missing["error"]["code"], -32601);

	let params = rpc(
		&agent,
		Some(ORCHESTRATOR),
		json!({ "jsonrpc": "2.0", "method": "task.status", "params": {}, "id": 9 }),
	)
	.await;
	assert_eq!(params["error"]["code"], -32602);

	let unknown_task = rpc(
		&agent,
		Some(ORCHESTRATOR),
		json!({ "jsonrpc": "2.0", "method": "task.status", "params": {"task_id": "nope"}, "id": 10 }),
	)
	.await;
	assert_eq!(unknown_task["error"]["code"], -32000);

	let unknown_capability = rpc(
		&agent,
		Some(ORCHESTRATOR),
		send_request("unregistered", json!({})),
	)
	.await;
	assert_eq!(unknown_capability["error"]["code"], -32000);
	assert!(
		unknown_capability["error"]["message"]
			.as_str()
			.unwrap()
			.contains("No handler registered")
	);
}

#[tokio::test]
async fn cancel_discards_late_result() {
	let agent = echo_agent(StaticEnforcer::allow()).await;
	let sent = rpc(&agent, Some(ORCHESTRATOR), send_request("slow", json!({}))).await;
	let task_id = sent["result"]["id"].as_str().unwrap().to_string();

	// Let the handler start, then cancel.
	tokio::time::sleep(Duration::from_millis(50)).await;
	let cancelled = rpc(
		&agent,
		Some(ORCHESTRATOR),
		json!({ "jsonrpc": "2.0", "method": "task.cancel", "params": {"task_id": task_id}, "id": 2 }),
	)
	.await;
	assert_eq!(cancelled["result"]["state"], "cancelled");

	let done = agent
		.tasks()
		.await_completion(&task_id, Some(Duration::from_secs(1)))
		.await
		.unwrap();
	assert_eq!(done.state, TaskState::Cancelled);
	// Terminal state is final.
	assert_matches!(
		agent
			.tasks()
			.update(&task_id, Some(TaskState::Completed), Some(json!("late")), None)
			.await,
		Err(_)
	);
}

#[tokio::test]
async fn agent_card_and_health_endpoints() {
	let agent = echo_agent(StaticEnforcer::allow()).await;
	let request = http::Request::builder()
		.uri("/.well-known/agent.json")
		.body(axum::body::Body::empty())
		.unwrap();
	let response = agent.router().oneshot(request).await.unwrap();
	let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
		.await
		.unwrap();
	let card: Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(card["name"], "search");
	assert_eq!(card["extensions"]["workload_id"], SEARCH);
	let names: Vec<&str> = card["capabilities"]
		.as_array()
		.unwrap()
		.iter()
		.map(|c| c["name"].as_str().unwrap())
		.collect();
	assert!(names.contains(&"echo"));
	assert!(names.contains(&"slow"));

	let request = http::Request::builder()
		.uri("/health")
		.body(axum::body::Body::empty())
		.unwrap();
	let response = agent.router().oneshot(request).await.unwrap();
	assert_eq!(response.status(), http::StatusCode::OK);
	let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
		.await
		.unwrap();
	let health: Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(health["status"], "healthy");
	assert_eq!(health["workload_id"], SEARCH);
	assert_eq!(health["components"]["identity"], "healthy");
	assert_eq!(health["components"]["authorization"], "healthy");
}

#[tokio::test]
async fn health_reports_degraded_components() {
	// The enforcer answers calls but its health probe fails; the endpoint
	// must say so instead of a static "healthy".
	let agent = echo_agent(StaticEnforcer::unhealthy()).await;
	let request = http::Request::builder()
		.uri("/health")
		.body(axum::body::Body::empty())
		.unwrap();
	let response = agent.router().oneshot(request).await.unwrap();
	assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
	let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
		.await
		.unwrap();
	let health: Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(health["status"], "degraded");
	assert_eq!(health["components"]["identity"], "healthy");
	assert_eq!(health["components"]["authorization"], "unhealthy");
}

#[tokio::test]
async fn sse_stream_reports_missing_task() {
	let agent = echo_agent(StaticEnforcer::allow()).await;
	let request = http::Request::builder()
		.uri("/tasks/no-such-task/stream")
		.body(axum::body::Body::empty())
		.unwrap();
	let response = agent.router().oneshot(request).await.unwrap();
	assert_eq!(
		response.headers()["content-type"],
		"text/event-stream"
	);
	let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
		.await
		.unwrap();
	let body = String::from_utf8(bytes.to_vec()).unwrap();
	assert!(body.contains("event: error"));
	assert!(body.contains("Task not found"));
}

// ---------------------------------------------------------------------------
// Outbound authorization gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outbound_denial_precedes_network_io() {
	let agent = echo_agent(StaticEnforcer::deny("cross-domain")).await;
	let target = SpiffeId::from_str(SEARCH).unwrap();
	let url = Url::parse("https://127.0.0.1:1").unwrap();
	let result = agent
		.call_peer(&target, &url, "echo", json!({}))
		.await;
	assert_matches!(result, Err(Error::AccessDenied { reason }) if reason == "cross-domain");
}

// ---------------------------------------------------------------------------
// End-to-end over real mTLS
// ---------------------------------------------------------------------------

struct Cluster {
	ca: TestCa,
	server_agent: Arc<Agent>,
	server_url: Url,
}

async fn start_cluster() -> Cluster {
	let ca = TestCa::new("agentweave.io");
	let server_identity = FixedIdentity::new(ca.issue_svid(SEARCH), vec![ca.bundle()]);
	let server_agent = Agent::builder(dev_config("search"))
		.with_identity(server_identity)
		.with_authz(StaticEnforcer::allow())
		.build()
		.await
		.unwrap();
	server_agent
		.register_capability(
			CapabilityMetadata::new("search", "Search the corpus"),
			typed_handler(|input: serde_json::Map<String, Value>| async move {
				Ok(json!({ "hits": [input.get("query").cloned().unwrap_or(Value::Null)] }))
			}),
		)
		.unwrap();

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	server_agent.serve_listener(listener);
	let server_url = Url::parse(&format!("https://127.0.0.1:{}", addr.port())).unwrap();
	Cluster {
		ca,
		server_agent,
		server_url,
	}
}

fn client_channel(cluster: &Cluster, expected_peer: &str) -> SecureChannel {
	let identity = FixedIdentity::new(
		cluster.ca.issue_svid(ORCHESTRATOR),
		vec![cluster.ca.bundle()],
	);
	SecureChannel::new(
		identity,
		SpiffeId::from_str(expected_peer).unwrap(),
		cluster.server_url.clone(),
		ChannelConfig {
			timeout: Duration::from_secs(5),
			..Default::default()
		},
		None,
		None,
	)
	.unwrap()
}

#[tokio::test]
async fn mtls_end_to_end_call() {
	let cluster = start_cluster().await;
	let channel = client_channel(&cluster, SEARCH);

	let card = A2aClient::discover(&channel).await.unwrap();
	assert_eq!(card.name, "search");
	assert!(card.has_capability("search"));

	let task = A2aClient::send_task(&channel, "search", json!({"query": "rust"}), vec![])
		.await
		.unwrap();
	let done = A2aClient::poll_until_complete(
		&channel,
		&task.id,
		Duration::from_millis(50),
		Some(Duration::from_secs(5)),
	)
	.await
	.unwrap();
	assert_eq!(done.state, TaskState::Completed);
	assert_eq!(done.result.unwrap()["hits"][0], "rust");
	// The server saw the verified caller identity.
	let record = cluster.server_agent.tasks().get(&done.id).await.unwrap();
	assert_eq!(record.metadata["caller_spiffe_id"], ORCHESTRATOR);
}

#[tokio::test]
async fn peer_identity_mismatch_fails_channel() {
	let cluster = start_cluster().await;
	// Channel expects a different workload than the server presents.
	let channel = client_channel(&cluster, "spiffe://agentweave.io/agent/other");
	let result = channel.get("/.well-known/agent.json").await;
	assert_matches!(
		result,
		Err(agentweave::transport::Error::PeerVerificationFailed { .. })
	);
}

#[tokio::test]
async fn untrusted_client_certificate_is_rejected() {
	let cluster = start_cluster().await;
	let rogue_ca = TestCa::new("agentweave.io");
	let identity = FixedIdentity::new(
		rogue_ca.issue_svid(ORCHESTRATOR),
		// Trusts the server's CA, so the client side of the handshake
		// succeeds; the server must refuse the rogue client certificate.
		vec![cluster.ca.bundle()],
	);
	let channel = SecureChannel::new(
		identity,
		SpiffeId::from_str(SEARCH).unwrap(),
		cluster.server_url.clone(),
		ChannelConfig {
			timeout: Duration::from_secs(5),
			..Default::default()
		},
		None,
		None,
	)
	.unwrap();
	assert!(channel.get("/health").await.is_err());
}

// ---------------------------------------------------------------------------
// Credential rotation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rotation_outage_retains_valid_credential() {
	let ca = TestCa::new("agentweave.io");
	let svid = ca.issue_svid(ORCHESTRATOR);
	let api = MemoryWorkloadApi::new(svid.clone(), vec![ca.bundle()]);
	let provider = WorkloadIdentityProvider::new(api.clone(), vec![])
		.await
		.unwrap();

	api.set_failing(true);
	tokio::time::sleep(Duration::from_secs(10)).await;
	// The socket is down but the cached credential is still valid.
	let current = provider.svid().await.unwrap();
	assert!(current.same_certificate(&svid));
	api.set_failing(false);
}

#[tokio::test(start_paused = true)]
async fn rotation_swaps_credential_and_fires_callbacks_once() {
	let ca = TestCa::new("agentweave.io");
	let first = ca.issue_svid(ORCHESTRATOR);
	let api = MemoryWorkloadApi::new(first.clone(), vec![ca.bundle()]);
	let provider = WorkloadIdentityProvider::new(api.clone(), vec![])
		.await
		.unwrap();

	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	provider.on_rotation(Box::new(move |svid| {
		let tx = tx.clone();
		Box::pin(async move {
			let _ = tx.send(svid.not_after);
		})
	}));

	// One poll cycle with an unchanged credential: no callback.
	tokio::time::sleep(Duration::from_secs(6)).await;
	assert!(rx.try_recv().is_err());

	let second = ca.issue_svid(ORCHESTRATOR);
	api.set_svid(second.clone());
	// Callbacks observe the already-swapped credential.
	let rotated_not_after = tokio::time::timeout(Duration::from_secs(60), rx.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(rotated_not_after, second.not_after);
	let current = provider.svid().await.unwrap();
	assert!(current.same_certificate(&second));
	// Exactly one rotation observed.
	assert!(rx.try_recv().is_err());
}
