//! Prometheus metric families for the SDK's hot paths.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum Decision {
	Allow,
	Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DecisionLabels {
	pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CapabilityLabels {
	pub capability: String,
	pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct PeerVerificationLabels {
	pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CircuitLabels {
	pub circuit: String,
	pub to_state: String,
}

pub struct Metrics {
	pub auth_decisions: Family<DecisionLabels, Counter>,
	pub capability_calls: Family<CapabilityLabels, Counter>,
	pub peer_verifications: Family<PeerVerificationLabels, Counter>,
	pub request_duration: Histogram,
	pub retries: Counter,
	pub circuit_transitions: Family<CircuitLabels, Counter>,
	pub audit_events_dropped: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let auth_decisions = Family::<DecisionLabels, Counter>::default();
		registry.register(
			"auth_decisions",
			"Authorization decisions by outcome",
			auth_decisions.clone(),
		);
		let capability_calls = Family::<CapabilityLabels, Counter>::default();
		registry.register(
			"capability_calls",
			"Capability invocations by capability and status",
			capability_calls.clone(),
		);
		let peer_verifications = Family::<PeerVerificationLabels, Counter>::default();
		registry.register(
			"peer_verifications",
			"Peer identity verification outcomes",
			peer_verifications.clone(),
		);
		let request_duration = Histogram::new(exponential_buckets(0.005, 2.0, 12));
		registry.register(
			"request_duration_seconds",
			"Outbound request round-trip time",
			request_duration.clone(),
		);
		let retries = Counter::default();
		registry.register("retries", "Retry attempts across all channels", retries.clone());
		let circuit_transitions = Family::<CircuitLabels, Counter>::default();
		registry.register(
			"circuit_transitions",
			"Circuit breaker state transitions",
			circuit_transitions.clone(),
		);
		let audit_events_dropped = Counter::default();
		registry.register(
			"audit_events_dropped",
			"Audit events lost to buffer overflow",
			audit_events_dropped.clone(),
		);
		Metrics {
			auth_decisions,
			capability_calls,
			peer_verifications,
			request_duration,
			retries,
			circuit_transitions,
			audit_events_dropped,
		}
	}

	pub fn record_auth_decision(&self, allowed: bool) {
		let decision = if allowed { Decision::Allow } else { Decision::Deny };
		self.auth_decisions.get_or_create(&DecisionLabels { decision }).inc();
	}

	pub fn record_capability_call(&self, capability: &str, status: &str) {
		self
			.capability_calls
			.get_or_create(&CapabilityLabels {
				capability: capability.to_string(),
				status: status.to_string(),
			})
			.inc();
	}

	pub fn record_peer_verification(&self, success: bool) {
		self
			.peer_verifications
			.get_or_create(&PeerVerificationLabels {
				status: if success { "success" } else { "failure" }.to_string(),
			})
			.inc();
	}

	pub fn record_retry(&self) {
		self.retries.inc();
	}

	pub fn record_circuit_transition(&self, circuit: &str, to_state: &str) {
		self
			.circuit_transitions
			.get_or_create(&CircuitLabels {
				circuit: circuit.to_string(),
				to_state: to_state.to_string(),
			})
			.inc();
	}
}
