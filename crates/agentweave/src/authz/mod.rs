//! Authorization enforcement: decide, for each inbound and outbound call,
//! whether it may proceed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod cache;
pub mod policy;

pub use cache::DecisionCache;
pub use policy::{PolicyEnforcer, PolicyEnforcerConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("policy engine unavailable: {0}")]
	EngineUnavailable(String),
	#[error("policy evaluation error: {0}")]
	Evaluation(String),
	#[error("policy engine returned {0}")]
	Status(http::StatusCode),
	#[error("policy engine circuit is open")]
	CircuitOpen,
	#[error("policy query timed out")]
	Timeout,
}

/// An immutable authorization decision. The `audit_id` correlates this
/// decision with audit events recorded about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthzDecision {
	pub allowed: bool,
	pub reason: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub policy_id: Option<String>,
	pub audit_id: String,
}

impl AuthzDecision {
	pub fn allow(reason: impl Into<String>, policy_id: Option<String>) -> Self {
		AuthzDecision {
			allowed: true,
			reason: reason.into(),
			policy_id,
			audit_id: Uuid::new_v4().to_string(),
		}
	}

	pub fn deny(reason: impl Into<String>, policy_id: Option<String>) -> Self {
		AuthzDecision {
			allowed: false,
			reason: reason.into(),
			policy_id,
			audit_id: Uuid::new_v4().to_string(),
		}
	}

	pub fn decision_str(&self) -> &'static str {
		if self.allowed { "allow" } else { "deny" }
	}
}

/// The enforcement seam: implementations answer "may caller perform action
/// on resource". Engine failures are resolved internally into the configured
/// default decision; callers always get an answer.
#[async_trait::async_trait]
pub trait AuthzEnforcer: Send + Sync {
	async fn check(
		&self,
		caller_id: &str,
		resource_id: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> AuthzDecision;

	async fn health_check(&self) -> bool;
}

/// Unconditional allow, for development only. Construction logs a warning
/// and production configuration validation rejects it.
pub struct AllowAllEnforcer;

impl AllowAllEnforcer {
	pub fn new() -> Self {
		tracing::warn!("using allow-all authorization; every call will be permitted. Development only");
		AllowAllEnforcer
	}
}

impl Default for AllowAllEnforcer {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl AuthzEnforcer for AllowAllEnforcer {
	async fn check(
		&self,
		_caller_id: &str,
		_resource_id: &str,
		_action: &str,
		_context: Option<&Map<String, Value>>,
	) -> AuthzDecision {
		AuthzDecision::allow("allow-all enforcer", Some("allow-all".to_string()))
	}

	async fn health_check(&self) -> bool {
		true
	}
}
