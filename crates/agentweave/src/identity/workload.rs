//! Workload API backed identity provider.
//!
//! A background task keeps the cached credential fresh: it polls the identity
//! socket at a period derived from the credential's remaining lifetime, swaps
//! the cache atomically through a watch channel, and invokes rotation
//! callbacks only after the new credential is observable.

use std::cmp;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use super::{BundleSet, Error, IdentityProvider, RotationCallback, SpiffeId, Svid, TrustBundle};

/// Initial backoff delay after a failed credential fetch.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Maximum backoff delay between retry attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Bounds on the freshness-check period: at most a third of the remaining
/// credential lifetime, clamped into this window.
const MIN_POLL: Duration = Duration::from_secs(5);
const MAX_POLL: Duration = Duration::from_secs(30);

/// Address of the identity socket, `unix://` or `tcp://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	Unix(PathBuf),
	Tcp(String),
}

impl FromStr for Endpoint {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if let Some(path) = s.strip_prefix("unix://") {
			if path.is_empty() {
				return Err(Error::Unavailable(format!("empty unix socket path: {s}")));
			}
			Ok(Endpoint::Unix(PathBuf::from(path)))
		} else if let Some(addr) = s.strip_prefix("tcp://") {
			if addr.is_empty() {
				return Err(Error::Unavailable(format!("empty tcp address: {s}")));
			}
			Ok(Endpoint::Tcp(addr.to_string()))
		} else {
			Err(Error::Unavailable(format!(
				"identity socket must be unix:// or tcp://: {s}"
			)))
		}
	}
}

/// The external Workload API contract: short-lived credentials plus the
/// per-trust-domain CA bundle set.
///
/// The SDK owns everything above this seam (caching, rotation, backoff, TLS
/// material); the concrete socket binding is supplied by the embedding
/// application. Tests use an in-memory implementation.
#[async_trait::async_trait]
pub trait WorkloadApi: Send + Sync {
	async fn fetch_svid(&self) -> Result<Svid, Error>;
	async fn fetch_trust_bundles(&self) -> Result<BundleSet, Error>;
}

#[derive(Clone, Default)]
enum CredentialState {
	#[default]
	NotReady,
	Available(Arc<Svid>),
	Error(Error),
}

/// Identity provider backed by a [`WorkloadApi`].
pub struct WorkloadIdentityProvider {
	id: SpiffeId,
	api: Arc<dyn WorkloadApi>,
	state: watch::Receiver<CredentialState>,
	bundles: RwLock<HashMap<String, Arc<TrustBundle>>>,
	allowed_trust_domains: Vec<String>,
	callbacks: Arc<Mutex<Vec<RotationCallback>>>,
	fetcher_handle: tokio::task::JoinHandle<()>,
}

impl WorkloadIdentityProvider {
	/// Fetch the initial credential and start the rotation watcher.
	///
	/// Fails with *identity-unavailable* if the socket cannot produce a
	/// credential, and *credential-expired* if what it produced is already
	/// past its validity window.
	pub async fn new(
		api: Arc<dyn WorkloadApi>,
		allowed_trust_domains: Vec<String>,
	) -> Result<Arc<Self>, Error> {
		let initial = api.fetch_svid().await?;
		if initial.is_expired() {
			return Err(Error::Expired);
		}
		let id = initial.id.clone();
		info!(identity = %id, "fetched initial workload credential");

		let (state_tx, state_rx) = watch::channel(CredentialState::Available(Arc::new(initial)));
		let callbacks: Arc<Mutex<Vec<RotationCallback>>> = Arc::new(Mutex::new(Vec::new()));

		let fetcher_handle = tokio::spawn({
			let api = api.clone();
			let id = id.clone();
			let callbacks = callbacks.clone();
			async move {
				Self::run_fetcher(api, id, state_tx, callbacks).await;
			}
		});

		Ok(Arc::new(WorkloadIdentityProvider {
			id,
			api,
			state: state_rx,
			bundles: RwLock::new(HashMap::new()),
			allowed_trust_domains,
			callbacks,
			fetcher_handle,
		}))
	}

	/// Poll period for a valid credential: a third of its remaining
	/// lifetime, clamped to `[MIN_POLL, MAX_POLL]`.
	fn poll_period(svid: &Svid) -> Duration {
		let remaining = svid
			.not_after
			.duration_since(SystemTime::now())
			.unwrap_or(Duration::ZERO);
		(remaining / 3).clamp(MIN_POLL, MAX_POLL)
	}

	async fn run_fetcher(
		api: Arc<dyn WorkloadApi>,
		id: SpiffeId,
		state_tx: watch::Sender<CredentialState>,
		callbacks: Arc<Mutex<Vec<RotationCallback>>>,
	) {
		let mut backoff = INITIAL_BACKOFF;
		let mut next_attempt = Instant::now() + MIN_POLL;

		loop {
			tokio::time::sleep_until(next_attempt.into()).await;
			if state_tx.is_closed() {
				return;
			}

			let previous = match &*state_tx.borrow() {
				CredentialState::Available(svid) => Some(svid.clone()),
				_ => None,
			};

			match api.fetch_svid().await {
				Ok(fresh) => {
					backoff = INITIAL_BACKOFF;
					next_attempt = Instant::now() + Self::poll_period(&fresh);
					let rotated = previous
						.as_deref()
						.map(|p| !p.same_certificate(&fresh))
						.unwrap_or(true);
					if !rotated {
						continue;
					}
					let fresh = Arc::new(fresh);
					// Swap first: observers reading the provider inside a
					// callback must see the new credential.
					let _ = state_tx.send(CredentialState::Available(fresh.clone()));
					info!(identity = %id, not_after = ?fresh.not_after, "credential rotated");
					let cbs = callbacks.lock();
					for cb in cbs.iter() {
						let fut = cb(fresh.clone());
						tokio::spawn(async move {
							// Callback failures are isolated from each other
							// and from the rotation itself.
							fut.await;
						});
					}
				},
				Err(e) => {
					let have_valid = previous.as_deref().map(|p| !p.is_expired()).unwrap_or(false);
					if have_valid {
						warn!(identity = %id, error = %e, retry_in = ?backoff, "credential refresh failed, retaining valid credential");
					} else {
						error!(identity = %id, error = %e, retry_in = ?backoff, "credential fetch failed with no valid fallback");
						let _ = state_tx.send(CredentialState::Error(e));
					}
					next_attempt = Instant::now() + backoff;
					backoff = cmp::min(MAX_BACKOFF, backoff * 2);
				},
			}
		}
	}
}

#[async_trait::async_trait]
impl IdentityProvider for WorkloadIdentityProvider {
	fn spiffe_id(&self) -> &SpiffeId {
		&self.id
	}

	async fn svid(&self) -> Result<Arc<Svid>, Error> {
		let mut rx = self.state.clone();
		loop {
			let state = rx.borrow_and_update().clone();
			match state {
				CredentialState::Available(svid) => {
					return if svid.is_expired() {
						Err(Error::Expired)
					} else {
						Ok(svid)
					};
				},
				CredentialState::Error(e) => return Err(e),
				CredentialState::NotReady => {
					if rx.changed().await.is_err() {
						return Err(Error::NotReady);
					}
				},
			}
		}
	}

	async fn trust_bundle(&self, trust_domain: &str) -> Result<Arc<TrustBundle>, Error> {
		if !self.allowed_trust_domains.is_empty()
			&& trust_domain != self.id.trust_domain()
			&& !self
				.allowed_trust_domains
				.iter()
				.any(|d| d == trust_domain)
		{
			return Err(Error::UnknownTrustDomain(trust_domain.to_string()));
		}
		{
			let cache = self.bundles.read().await;
			if let Some(bundle) = cache.get(trust_domain) {
				return Ok(bundle.clone());
			}
		}
		// Miss: fetch the complete bundle set and replace the cache in one
		// step. Concurrent misses may race; the result is idempotent.
		let fetched = self.api.fetch_trust_bundles().await?;
		let mut cache = self.bundles.write().await;
		*cache = fetched
			.into_iter()
			.map(|(domain, bundle)| (domain, Arc::new(bundle)))
			.collect();
		debug!(trust_domain, domains = cache.len(), "refreshed trust bundle cache");
		cache
			.get(trust_domain)
			.cloned()
			.ok_or_else(|| Error::UnknownTrustDomain(trust_domain.to_string()))
	}

	fn on_rotation(&self, callback: RotationCallback) {
		self.callbacks.lock().push(callback);
	}
}

impl Drop for WorkloadIdentityProvider {
	fn drop(&mut self) {
		self.fetcher_handle.abort();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_parse() {
		assert_eq!(
			Endpoint::from_str("unix:///run/spire/sockets/agent.sock").unwrap(),
			Endpoint::Unix(PathBuf::from("/run/spire/sockets/agent.sock"))
		);
		assert_eq!(
			Endpoint::from_str("tcp://127.0.0.1:8081").unwrap(),
			Endpoint::Tcp("127.0.0.1:8081".to_string())
		);
		assert!(Endpoint::from_str("http://nope").is_err());
		assert!(Endpoint::from_str("unix://").is_err());
	}
}
