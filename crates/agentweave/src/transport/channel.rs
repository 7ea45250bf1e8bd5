//! A single-peer mTLS HTTP channel.
//!
//! The channel knows in advance which workload identifier it is talking to;
//! the TLS layer refuses the connection if the peer presents anything else.
//! There is no constructor argument, method, or config field that disables
//! verification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::CertificateError;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::retry::{RetryConfig, RetryPolicy};
use super::Error;
use crate::audit::AuditTrail;
use crate::config::TlsVersion;
use crate::identity::{IdentityProvider, SpiffeId, tls};
use crate::telemetry::Metrics;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
	pub tls_min_version: TlsVersion,
	pub timeout: Duration,
	pub retry: Option<RetryConfig>,
}

impl Default for ChannelConfig {
	fn default() -> Self {
		ChannelConfig {
			tls_min_version: TlsVersion::V1_3,
			timeout: Duration::from_secs(30),
			retry: None,
		}
	}
}

impl ChannelConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.timeout.is_zero() {
			return Err(Error::InvalidConfig("timeout must be positive".into()));
		}
		if let Some(retry) = &self.retry {
			retry.validate()?;
		}
		Ok(())
	}
}

#[derive(Debug)]
pub struct ChannelResponse {
	pub status: StatusCode,
	pub headers: http::HeaderMap,
	pub body: Bytes,
}

impl ChannelResponse {
	pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_slice(&self.body)
	}
}

pub struct SecureChannel {
	identity: Arc<dyn IdentityProvider>,
	peer: SpiffeId,
	base_url: Url,
	config: ChannelConfig,
	audit: Option<Arc<AuditTrail>>,
	metrics: Option<Arc<Metrics>>,
	client: OnceCell<HttpsClient>,
	channel_id: Uuid,
}

impl SecureChannel {
	pub fn new(
		identity: Arc<dyn IdentityProvider>,
		peer: SpiffeId,
		base_url: Url,
		config: ChannelConfig,
		audit: Option<Arc<AuditTrail>>,
		metrics: Option<Arc<Metrics>>,
	) -> Result<Self, Error> {
		config.validate()?;
		if base_url.scheme() != "https" {
			return Err(Error::InvalidConfig(format!(
				"peer URL must be https, got {base_url}"
			)));
		}
		debug!(peer = %peer, url = %base_url, "created secure channel");
		Ok(SecureChannel {
			identity,
			peer,
			base_url,
			config,
			audit,
			metrics,
			client: OnceCell::new(),
			channel_id: Uuid::new_v4(),
		})
	}

	pub fn peer(&self) -> &SpiffeId {
		&self.peer
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// Build the underlying HTTP client on first use. TLS material is pulled
	/// from the identity layer at build time; an already-built client keeps
	/// its credential until the channel is dropped.
	async fn ensure_client(&self) -> Result<&HttpsClient, Error> {
		self
			.client
			.get_or_try_init(|| async {
				let svid = self.identity.svid().await?;
				let bundle = self
					.identity
					.trust_bundle(self.peer.trust_domain())
					.await?;
				let tls_config = tls::client_config(
					&svid,
					&bundle,
					self.peer.clone(),
					self.config.tls_min_version,
				)?;
				let connector = hyper_rustls::HttpsConnectorBuilder::new()
					.with_tls_config(tls_config)
					.https_only()
					.enable_all_versions()
					.build();
				Ok::<_, Error>(Client::builder(TokioExecutor::new()).build(connector))
			})
			.await
	}

	async fn attempt(
		&self,
		method: &Method,
		url: &Url,
		body: &Option<Bytes>,
	) -> Result<ChannelResponse, Error> {
		let client = self.ensure_client().await?;
		let mut builder = Request::builder().method(method.clone()).uri(url.as_str());
		if body.is_some() {
			builder = builder.header(header::CONTENT_TYPE, "application/json");
		}
		let request = builder
			.body(Full::new(body.clone().unwrap_or_default()))
			.map_err(|e| Error::Connection(e.to_string()))?;

		let response = tokio::time::timeout(self.config.timeout, client.request(request))
			.await
			.map_err(|_| Error::RequestTimeout(self.config.timeout))?
			.map_err(|e| self.classify_client_error(&e))?;

		let (parts, body) = response.into_parts();
		let body = body
			.collect()
			.await
			.map_err(|e| Error::Connection(e.to_string()))?
			.to_bytes();
		Ok(ChannelResponse {
			status: parts.status,
			headers: parts.headers,
			body,
		})
	}

	/// One HTTP request to the peer, with the configured retry policy
	/// wrapped around it when present.
	pub async fn request(
		&self,
		method: Method,
		path: &str,
		body: Option<Bytes>,
	) -> Result<ChannelResponse, Error> {
		let url = self
			.base_url
			.join(path)
			.map_err(|e| Error::InvalidConfig(format!("bad request path {path}: {e}")))?;

		info!(
			channel = %self.channel_id,
			peer = %self.peer,
			%method,
			%url,
			"outbound request"
		);
		let started = Instant::now();

		let result = match &self.config.retry {
			Some(retry_config) => {
				let policy = RetryPolicy::new(retry_config.clone())?
					.with_metrics(self.metrics.clone());
				policy
					.execute(|| self.attempt(&method, &url, &body), Error::is_retryable)
					.await
			},
			None => self.attempt(&method, &url, &body).await,
		};

		let elapsed = started.elapsed();
		match &result {
			Ok(response) => {
				info!(
					channel = %self.channel_id,
					peer = %self.peer,
					%method,
					%url,
					status = %response.status,
					elapsed_ms = elapsed.as_millis() as u64,
					"outbound response"
				);
			},
			Err(e) => {
				warn!(
					channel = %self.channel_id,
					peer = %self.peer,
					%method,
					%url,
					error = %e,
					elapsed_ms = elapsed.as_millis() as u64,
					"outbound request failed"
				);
				if let (Error::PeerVerificationFailed { .. }, Some(audit)) = (e, &self.audit) {
					audit
						.record_peer_verification(&self.peer.to_string(), "failure", &e.to_string())
						.await;
				}
			},
		}
		result
	}

	pub async fn get(&self, path: &str) -> Result<ChannelResponse, Error> {
		self.request(Method::GET, path, None).await
	}

	pub async fn post_json<T: serde::Serialize>(
		&self,
		path: &str,
		body: &T,
	) -> Result<ChannelResponse, Error> {
		let bytes = serde_json::to_vec(body)
			.map_err(|e| Error::InvalidConfig(format!("unserializable body: {e}")))?;
		self
			.request(Method::POST, path, Some(Bytes::from(bytes)))
			.await
	}

	/// Map a client error onto the transport taxonomy by walking its source
	/// chain. A TLS alert carrying our verifier's rejection becomes
	/// *peer-verification-failed*; other TLS faults are handshake failures;
	/// the rest are connection errors.
	fn classify_client_error(&self, e: &(dyn std::error::Error + 'static)) -> Error {
		let mut current: Option<&(dyn std::error::Error + 'static)> = Some(e);
		while let Some(err) = current {
			if let Some(tls_err) = err.downcast_ref::<rustls::Error>() {
				return match tls_err {
					rustls::Error::InvalidCertificate(
						CertificateError::ApplicationVerificationFailure,
					) => Error::PeerVerificationFailed {
						expected: self.peer.to_string(),
						actual: None,
					},
					other => Error::TlsHandshakeFailed(other.to_string()),
				};
			}
			current = err.source();
		}
		Error::Connection(e.to_string())
	}
}

impl std::fmt::Debug for SecureChannel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecureChannel")
			.field("peer", &self.peer)
			.field("base_url", &self.base_url.as_str())
			.finish_non_exhaustive()
	}
}
