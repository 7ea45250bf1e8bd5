//! Shared helpers for integration tests: an in-memory certificate authority,
//! identity providers backed by it, and canned authorization enforcers.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde_json::{Map, Value};

use agentweave::authz::{AuthzDecision, AuthzEnforcer};
use agentweave::config::AgentConfig;
use agentweave::identity::workload::WorkloadApi;
use agentweave::identity::{
	self, BundleSet, IdentityProvider, RotationCallback, SpiffeId, Svid, TrustBundle, tls,
};

/// A self-signed CA for one trust domain.
pub struct TestCa {
	pub trust_domain: String,
	key: rcgen::KeyPair,
	cert: rcgen::Certificate,
}

impl TestCa {
	pub fn new(trust_domain: &str) -> Self {
		let key = rcgen::KeyPair::generate().unwrap();
		let mut params = rcgen::CertificateParams::default();
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let cert = params.self_signed(&key).unwrap();
		TestCa {
			trust_domain: trust_domain.to_string(),
			key,
			cert,
		}
	}

	pub fn issue_svid(&self, id: &str) -> Svid {
		let id = SpiffeId::from_str(id).unwrap();
		let leaf_key = rcgen::KeyPair::generate().unwrap();
		let mut params = rcgen::CertificateParams::default();
		params.subject_alt_names =
			vec![rcgen::SanType::URI(id.to_string().try_into().unwrap())];
		let cert = params
			.signed_by(&leaf_key, &self.cert, &self.key)
			.unwrap();
		let der: CertificateDer<'static> = cert.der().clone();
		let (not_before, not_after) = tls::extract_validity(&der).unwrap();
		Svid {
			id,
			chain: vec![der],
			key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
			not_before,
			not_after,
		}
	}

	pub fn bundle(&self) -> TrustBundle {
		TrustBundle {
			trust_domain: self.trust_domain.clone(),
			roots: vec![self.cert.der().clone()],
		}
	}
}

/// Identity provider with a fixed credential, for channel/server tests.
pub struct FixedIdentity {
	id: SpiffeId,
	svid: Arc<Svid>,
	bundles: HashMap<String, Arc<TrustBundle>>,
}

impl FixedIdentity {
	pub fn new(svid: Svid, bundles: Vec<TrustBundle>) -> Arc<Self> {
		Arc::new(FixedIdentity {
			id: svid.id.clone(),
			svid: Arc::new(svid),
			bundles: bundles
				.into_iter()
				.map(|b| (b.trust_domain.clone(), Arc::new(b)))
				.collect(),
		})
	}
}

#[async_trait::async_trait]
impl IdentityProvider for FixedIdentity {
	fn spiffe_id(&self) -> &SpiffeId {
		&self.id
	}

	async fn svid(&self) -> Result<Arc<Svid>, identity::Error> {
		Ok(self.svid.clone())
	}

	async fn trust_bundle(&self, trust_domain: &str) -> Result<Arc<TrustBundle>, identity::Error> {
		self
			.bundles
			.get(trust_domain)
			.cloned()
			.ok_or_else(|| identity::Error::UnknownTrustDomain(trust_domain.to_string()))
	}

	fn on_rotation(&self, _callback: RotationCallback) {}
}

/// In-memory Workload API whose credential can be swapped to simulate
/// rotation, and which can be forced into failure.
pub struct MemoryWorkloadApi {
	svid: Mutex<Svid>,
	bundles: Mutex<BundleSet>,
	failing: AtomicBool,
}

impl MemoryWorkloadApi {
	pub fn new(svid: Svid, bundles: Vec<TrustBundle>) -> Arc<Self> {
		Arc::new(MemoryWorkloadApi {
			svid: Mutex::new(svid),
			bundles: Mutex::new(
				bundles
					.into_iter()
					.map(|b| (b.trust_domain.clone(), b))
					.collect(),
			),
			failing: AtomicBool::new(false),
		})
	}

	pub fn set_svid(&self, svid: Svid) {
		*self.svid.lock() = svid;
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl WorkloadApi for MemoryWorkloadApi {
	async fn fetch_svid(&self) -> Result<Svid, identity::Error> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(identity::Error::Unavailable("socket down".into()));
		}
		Ok(self.svid.lock().clone())
	}

	async fn fetch_trust_bundles(&self) -> Result<BundleSet, identity::Error> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(identity::Error::Unavailable("socket down".into()));
		}
		Ok(self.bundles.lock().clone())
	}
}

/// Enforcer returning a fixed verdict and a fixed health answer.
pub struct StaticEnforcer {
	pub allow: bool,
	pub reason: String,
	pub healthy: bool,
}

impl StaticEnforcer {
	pub fn allow() -> Arc<Self> {
		Arc::new(StaticEnforcer {
			allow: true,
			reason: "static allow".to_string(),
			healthy: true,
		})
	}

	pub fn deny(reason: &str) -> Arc<Self> {
		Arc::new(StaticEnforcer {
			allow: false,
			reason: reason.to_string(),
			healthy: true,
		})
	}

	/// Allows calls but reports itself unhealthy, for health-path tests.
	pub fn unhealthy() -> Arc<Self> {
		Arc::new(StaticEnforcer {
			allow: true,
			reason: "static allow".to_string(),
			healthy: false,
		})
	}
}

#[async_trait::async_trait]
impl AuthzEnforcer for StaticEnforcer {
	async fn check(
		&self,
		_caller_id: &str,
		_resource_id: &str,
		_action: &str,
		_context: Option<&Map<String, Value>>,
	) -> AuthzDecision {
		if self.allow {
			AuthzDecision::allow(self.reason.clone(), None)
		} else {
			AuthzDecision::deny(self.reason.clone(), None)
		}
	}

	async fn health_check(&self) -> bool {
		self.healthy
	}
}

/// A development-environment config for an agent named `name`.
pub fn dev_config(name: &str) -> AgentConfig {
	AgentConfig::from_yaml(&format!(
		r#"
agent:
  name: {name}
  trust_domain: agentweave.io
  description: test agent
  environment: development
server:
  host: 127.0.0.1
  port: 8443
"#
	))
	.unwrap()
}
