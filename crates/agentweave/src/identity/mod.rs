//! Workload identity: SPIFFE identifiers, short-lived credentials (SVIDs),
//! trust bundles, and the TLS material derived from them.
//!
//! The provider implementations own the credential lifecycle the same way a
//! mesh proxy owns its workload certificate: fetch on demand, rotate in the
//! background, swap atomically, notify observers after the swap.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

pub mod static_files;
pub mod tls;
pub mod workload;

pub use static_files::StaticIdentityProvider;
pub use workload::{WorkloadApi, WorkloadIdentityProvider};

const SPIFFE_SCHEME: &str = "spiffe://";

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("identity provider unavailable: {0}")]
	Unavailable(String),
	#[error("credential expired")]
	Expired,
	#[error("unknown trust domain: {0}")]
	UnknownTrustDomain(String),
	#[error("invalid workload identifier: {0}")]
	InvalidSpiffeId(String),
	#[error("certificate: {0}")]
	CertificateParse(String),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("rustls verifier: {0}")]
	Verifier(Arc<rustls::server::VerifierBuilderError>),
	#[error("identity not ready")]
	NotReady,
	#[error("io: {0}")]
	Io(String),
}

impl From<rustls::server::VerifierBuilderError> for Error {
	fn from(e: rustls::server::VerifierBuilderError) -> Self {
		Error::Verifier(Arc::new(e))
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e.to_string())
	}
}

/// A SPIFFE workload identifier: `spiffe://<trust-domain>/<path>`.
///
/// Equality is byte-exact over both components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpiffeId {
	trust_domain: String,
	path: String,
}

impl SpiffeId {
	pub fn new(trust_domain: impl Into<String>, path: impl Into<String>) -> Result<Self, Error> {
		let trust_domain = trust_domain.into();
		let mut path = path.into();
		if trust_domain.is_empty() {
			return Err(Error::InvalidSpiffeId("empty trust domain".to_string()));
		}
		if !path.starts_with('/') {
			path.insert(0, '/');
		}
		Ok(SpiffeId { trust_domain, path })
	}

	pub fn trust_domain(&self) -> &str {
		&self.trust_domain
	}

	pub fn path(&self) -> &str {
		&self.path
	}
}

impl FromStr for SpiffeId {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let Some(rest) = s.strip_prefix(SPIFFE_SCHEME) else {
			return Err(Error::InvalidSpiffeId(format!(
				"{s}: must start with {SPIFFE_SCHEME}"
			)));
		};
		let (trust_domain, path) = match rest.find('/') {
			Some(idx) => (&rest[..idx], &rest[idx..]),
			None => (rest, ""),
		};
		if trust_domain.is_empty() {
			return Err(Error::InvalidSpiffeId(format!("{s}: empty trust domain")));
		}
		SpiffeId::new(trust_domain, path)
	}
}

impl fmt::Display for SpiffeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{SPIFFE_SCHEME}{}{}", self.trust_domain, self.path)
	}
}

impl Serialize for SpiffeId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for SpiffeId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		SpiffeId::from_str(&s).map_err(serde::de::Error::custom)
	}
}

/// A workload credential: the certificate chain and private key proving a
/// [`SpiffeId`] at TLS time, bounded by a validity window.
pub struct Svid {
	pub id: SpiffeId,
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
	pub not_before: SystemTime,
	pub not_after: SystemTime,
}

impl Svid {
	pub fn is_expired(&self) -> bool {
		SystemTime::now() > self.not_after
	}

	/// The leaf certificate (first element of the chain).
	pub fn leaf(&self) -> &CertificateDer<'static> {
		&self.chain[0]
	}

	/// Two credentials are the same iff their leaf certificates are
	/// byte-identical. Used to detect rotation.
	pub fn same_certificate(&self, other: &Svid) -> bool {
		self.leaf().as_ref() == other.leaf().as_ref()
	}
}

impl Clone for Svid {
	fn clone(&self) -> Self {
		Svid {
			id: self.id.clone(),
			chain: self.chain.clone(),
			key: self.key.clone_key(),
			not_before: self.not_before,
			not_after: self.not_after,
		}
	}
}

impl fmt::Debug for Svid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Svid")
			.field("id", &self.id)
			.field("not_before", &self.not_before)
			.field("not_after", &self.not_after)
			.finish_non_exhaustive()
	}
}

/// The CA certificates that may sign credentials for one trust domain.
#[derive(Debug, Clone)]
pub struct TrustBundle {
	pub trust_domain: String,
	pub roots: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
	pub fn root_store(&self) -> Result<Arc<RootCertStore>, Error> {
		let mut store = RootCertStore::empty();
		let (_valid, invalid) = store.add_parsable_certificates(self.roots.iter().cloned());
		if invalid > 0 {
			tracing::warn!(
				trust_domain = %self.trust_domain,
				invalid, "found invalid root certificates in trust bundle"
			);
		}
		if store.is_empty() {
			return Err(Error::CertificateParse(format!(
				"no usable roots for trust domain {}",
				self.trust_domain
			)));
		}
		Ok(Arc::new(store))
	}
}

/// Callback invoked with the new credential after a rotation has been
/// published.
pub type RotationCallback =
	Box<dyn Fn(Arc<Svid>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Source of workload identity for an agent.
///
/// Implementations must uphold two invariants: any credential returned from
/// [`IdentityProvider::svid`] satisfies `not_after > now`, and rotation
/// callbacks observe the new credential already installed (reading back
/// through `svid()` inside a callback sees the new value).
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
	/// This workload's identifier. Constant once the provider is built.
	fn spiffe_id(&self) -> &SpiffeId;

	/// The current credential. Cached when valid, fetched otherwise.
	async fn svid(&self) -> Result<Arc<Svid>, Error>;

	/// The trust bundle for `trust_domain`, fetching the authority's full
	/// bundle set on a cache miss.
	async fn trust_bundle(&self, trust_domain: &str) -> Result<Arc<TrustBundle>, Error>;

	/// Register a callback fired on every credential rotation.
	fn on_rotation(&self, callback: RotationCallback);

	/// Liveness of the identity path: identifier, credential, and own-domain
	/// bundle are all obtainable.
	async fn health_check(&self) -> bool {
		if let Err(e) = self.svid().await {
			tracing::warn!(error = %e, "identity health check failed");
			return false;
		}
		let td = self.spiffe_id().trust_domain().to_string();
		if let Err(e) = self.trust_bundle(&td).await {
			tracing::warn!(error = %e, "identity health check failed");
			return false;
		}
		true
	}
}

/// The bundle set returned by an identity authority: one bundle per trust
/// domain it federates with.
pub type BundleSet = HashMap<String, TrustBundle>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spiffe_id_parse() {
		let id = SpiffeId::from_str("spiffe://agentweave.io/agent/search").unwrap();
		assert_eq!(id.trust_domain(), "agentweave.io");
		assert_eq!(id.path(), "/agent/search");
		assert_eq!(id.to_string(), "spiffe://agentweave.io/agent/search");
	}

	#[test]
	fn spiffe_id_rejects_garbage() {
		assert!(SpiffeId::from_str("https://agentweave.io/x").is_err());
		assert!(SpiffeId::from_str("spiffe:///path-only").is_err());
		assert!(SpiffeId::from_str("").is_err());
	}

	#[test]
	fn spiffe_id_equality_is_byte_exact() {
		let a = SpiffeId::from_str("spiffe://agentweave.io/agent/search").unwrap();
		let b = SpiffeId::from_str("spiffe://agentweave.io/agent/Search").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn spiffe_id_serde_round_trip() {
		let id = SpiffeId::from_str("spiffe://agentweave.io/agent/search").unwrap();
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, "\"spiffe://agentweave.io/agent/search\"");
		let back: SpiffeId = serde_json::from_str(&json).unwrap();
		assert_eq!(id, back);
	}
}
