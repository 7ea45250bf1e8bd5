//! External policy engine enforcer.
//!
//! Decisions are fetched with `POST {endpoint}/v1/data/{policy_path}` and a
//! `{"input": ...}` document. The query runs through a circuit breaker with
//! a bounded timeout; engine failure and an open circuit both route to the
//! configured default decision (deny outside development). Audit events are
//! emitted only after the decision has been cached, so a concurrent
//! duplicate query may legally hit the cache with the just-audited decision.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::cache::DecisionCache;
use super::{AuthzDecision, AuthzEnforcer, Error};
use crate::audit::AuditTrail;
use crate::config::DefaultAction;
use crate::identity::SpiffeId;
use crate::telemetry::Metrics;
use crate::transport::{CircuitBreaker, CircuitBreakerConfig};

type PolicyClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct PolicyEnforcerConfig {
	pub endpoint: String,
	pub policy_path: String,
	pub default_action: DefaultAction,
	pub timeout: Duration,
	pub cache_size: usize,
	pub cache_ttl: Duration,
	pub breaker: CircuitBreakerConfig,
}

impl Default for PolicyEnforcerConfig {
	fn default() -> Self {
		PolicyEnforcerConfig {
			endpoint: "http://localhost:8181".to_string(),
			policy_path: "agentweave/authz/allow".to_string(),
			default_action: DefaultAction::Deny,
			timeout: Duration::from_secs(5),
			cache_size: 1000,
			cache_ttl: Duration::from_secs(60),
			breaker: CircuitBreakerConfig::default(),
		}
	}
}

pub struct PolicyEnforcer {
	endpoint: String,
	policy_path: String,
	default_action: DefaultAction,
	timeout: Duration,
	client: PolicyClient,
	cache: DecisionCache,
	breaker: CircuitBreaker,
	audit: Option<Arc<AuditTrail>>,
	metrics: Option<Arc<Metrics>>,
}

impl PolicyEnforcer {
	pub fn new(
		config: PolicyEnforcerConfig,
		audit: Option<Arc<AuditTrail>>,
		metrics: Option<Arc<Metrics>>,
	) -> std::io::Result<Self> {
		let connector = hyper_rustls::HttpsConnectorBuilder::new()
			.with_native_roots()?
			.https_or_http()
			.enable_http1()
			.build();
		let client = Client::builder(TokioExecutor::new()).build(connector);
		tracing::info!(
			endpoint = %config.endpoint,
			policy_path = %config.policy_path,
			default_action = ?config.default_action,
			"policy enforcer initialized"
		);
		Ok(PolicyEnforcer {
			endpoint: config.endpoint.trim_end_matches('/').to_string(),
			policy_path: config
				.policy_path
				.trim_matches('/')
				.to_string(),
			default_action: config.default_action,
			timeout: config.timeout,
			client,
			cache: DecisionCache::new(config.cache_size, config.cache_ttl),
			breaker: CircuitBreaker::new("policy-engine", config.breaker)
				.with_metrics(metrics.clone()),
			audit,
			metrics,
		})
	}

	/// Build the input document: identifiers, action, ISO-8601 timestamp,
	/// derived trust domains, and the caller-supplied context.
	fn build_input(
		caller_id: &str,
		resource_id: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> Value {
		let mut input = json!({
			"caller_spiffe_id": caller_id,
			"resource_spiffe_id": resource_id,
			"action": action,
			"timestamp": Utc::now().to_rfc3339(),
		});
		let doc = input.as_object_mut().unwrap();
		if let Ok(id) = SpiffeId::from_str(caller_id) {
			doc.insert(
				"caller_trust_domain".to_string(),
				Value::String(id.trust_domain().to_string()),
			);
		}
		if let Ok(id) = SpiffeId::from_str(resource_id) {
			doc.insert(
				"resource_trust_domain".to_string(),
				Value::String(id.trust_domain().to_string()),
			);
		}
		if let Some(context) = context {
			doc.insert("context".to_string(), Value::Object(context.clone()));
		}
		input
	}

	async fn query(&self, input: &Value) -> Result<AuthzDecision, Error> {
		let url = format!("{}/v1/data/{}", self.endpoint, self.policy_path);
		debug!(%url, "querying policy engine");
		let body = serde_json::to_vec(&json!({ "input": input }))
			.map_err(|e| Error::Evaluation(e.to_string()))?;
		let request = Request::builder()
			.method(Method::POST)
			.uri(&url)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(body)))
			.map_err(|e| Error::Evaluation(e.to_string()))?;

		let response = tokio::time::timeout(self.timeout, self.client.request(request))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::EngineUnavailable(e.to_string()))?;

		if !response.status().is_success() {
			return Err(Error::Status(response.status()));
		}
		let body = response
			.into_body()
			.collect()
			.await
			.map_err(|e| Error::EngineUnavailable(e.to_string()))?
			.to_bytes();
		let parsed: Value =
			serde_json::from_slice(&body).map_err(|e| Error::Evaluation(e.to_string()))?;
		Self::parse_result(parsed.get("result"))
	}

	/// The engine answers either a bare boolean or an object carrying
	/// `{allow, reason, policy_id}`.
	fn parse_result(result: Option<&Value>) -> Result<AuthzDecision, Error> {
		match result {
			None | Some(Value::Null) => {
				Err(Error::Evaluation("response missing 'result' field".into()))
			},
			Some(Value::Bool(allowed)) => Ok(if *allowed {
				AuthzDecision::allow("policy decision", None)
			} else {
				AuthzDecision::deny("policy denied", None)
			}),
			Some(Value::Object(obj)) => {
				let allowed = obj.get("allow").and_then(Value::as_bool).unwrap_or(false);
				let reason = obj
					.get("reason")
					.and_then(Value::as_str)
					.unwrap_or("policy decision")
					.to_string();
				let policy_id = obj
					.get("policy_id")
					.and_then(Value::as_str)
					.map(str::to_string);
				Ok(if allowed {
					AuthzDecision::allow(reason, policy_id)
				} else {
					AuthzDecision::deny(reason, policy_id)
				})
			},
			Some(other) => Err(Error::Evaluation(format!(
				"unexpected result type: {other}"
			))),
		}
	}

	/// The decision applied when the engine cannot answer. Deny everywhere
	/// except a development deployment that explicitly opted into log-only.
	fn default_decision(&self, error: &Error) -> AuthzDecision {
		match self.default_action {
			DefaultAction::Deny => AuthzDecision::deny(
				format!("policy engine unavailable, default deny applied: {error}"),
				Some("default-deny".to_string()),
			),
			DefaultAction::LogOnly => {
				warn!(%error, "policy engine unavailable; default allow (log-only mode)");
				AuthzDecision::allow(
					format!("policy engine unavailable, log-only default applied: {error}"),
					Some("default-allow".to_string()),
				)
			},
		}
	}

	async fn audit_decision(
		&self,
		caller_id: &str,
		resource_id: &str,
		action: &str,
		decision: &AuthzDecision,
		started: Instant,
		context: Option<&Map<String, Value>>,
	) {
		if let Some(metrics) = &self.metrics {
			metrics.record_auth_decision(decision.allowed);
		}
		if let Some(audit) = &self.audit {
			audit
				.record_auth_check(
					caller_id,
					action,
					resource_id,
					decision.decision_str(),
					&decision.reason,
					started.elapsed().as_secs_f64() * 1000.0,
					context.cloned().unwrap_or_default(),
				)
				.await;
		}
	}
}

#[async_trait::async_trait]
impl AuthzEnforcer for PolicyEnforcer {
	async fn check(
		&self,
		caller_id: &str,
		resource_id: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> AuthzDecision {
		let started = Instant::now();
		let key = DecisionCache::key(caller_id, resource_id, action, context);
		if let Some(decision) = self.cache.get(&key) {
			debug!(caller_id, resource_id, action, "authorization cache hit");
			return decision;
		}

		let input = Self::build_input(caller_id, resource_id, action, context);
		let outcome = self
			.breaker
			.call(|| self.query(&input))
			.await;

		let decision = match outcome {
			Ok(Ok(decision)) => {
				// Cache before audit: a concurrent duplicate may hit the
				// cache with the decision we are about to record.
				self.cache.put(key, decision.clone());
				decision
			},
			Ok(Err(e)) => {
				warn!(error = %e, caller_id, resource_id, action, "policy query failed");
				self.default_decision(&e)
			},
			Err(_open) => {
				warn!(caller_id, resource_id, action, "policy engine circuit open");
				self.default_decision(&Error::CircuitOpen)
			},
		};

		self
			.audit_decision(caller_id, resource_id, action, &decision, started, context)
			.await;
		decision
	}

	async fn health_check(&self) -> bool {
		let url = format!("{}/health", self.endpoint);
		let Ok(request) = Request::builder()
			.method(Method::GET)
			.uri(&url)
			.body(Full::new(Bytes::new()))
		else {
			return false;
		};
		match tokio::time::timeout(Duration::from_secs(2), self.client.request(request)).await {
			Ok(Ok(response)) => response.status().is_success(),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_boolean_results() {
		let allow = PolicyEnforcer::parse_result(Some(&json!(true))).unwrap();
		assert!(allow.allowed);
		let deny = PolicyEnforcer::parse_result(Some(&json!(false))).unwrap();
		assert!(!deny.allowed);
		assert_eq!(deny.reason, "policy denied");
	}

	#[test]
	fn parses_object_results() {
		let decision = PolicyEnforcer::parse_result(Some(&json!({
			"allow": true,
			"reason": "same-domain",
			"policy_id": "agent-to-agent-v2",
		})))
		.unwrap();
		assert!(decision.allowed);
		assert_eq!(decision.reason, "same-domain");
		assert_eq!(decision.policy_id.as_deref(), Some("agent-to-agent-v2"));
		// Missing `allow` defaults closed.
		let decision =
			PolicyEnforcer::parse_result(Some(&json!({"reason": "incomplete"}))).unwrap();
		assert!(!decision.allowed);
	}

	#[test]
	fn rejects_malformed_results() {
		assert_matches::assert_matches!(
			PolicyEnforcer::parse_result(None),
			Err(Error::Evaluation(_))
		);
		assert_matches::assert_matches!(
			PolicyEnforcer::parse_result(Some(&json!("yes"))),
			Err(Error::Evaluation(_))
		);
	}

	#[test]
	fn input_document_carries_trust_domains() {
		let input = PolicyEnforcer::build_input(
			"spiffe://agentweave.io/agent/orchestrator",
			"spiffe://agentweave.io/agent/search",
			"search",
			None,
		);
		assert_eq!(input["caller_trust_domain"], "agentweave.io");
		assert_eq!(input["resource_trust_domain"], "agentweave.io");
		assert_eq!(input["action"], "search");
		assert!(input["timestamp"].as_str().unwrap().contains('T'));
	}

	#[test]
	fn input_document_tolerates_non_spiffe_ids() {
		let input = PolicyEnforcer::build_input("anonymous", "resource-7", "read", None);
		assert!(input.get("caller_trust_domain").is_none());
		assert!(input.get("resource_trust_domain").is_none());
	}
}
