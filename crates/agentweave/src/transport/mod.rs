//! Secure transport: per-peer mTLS channels, connection pooling, circuit
//! breaking, and retry.

use std::time::Duration;

use http::StatusCode;

use crate::identity;

pub mod channel;
pub mod circuit;
pub mod pool;
pub mod retry;

pub use channel::{ChannelConfig, SecureChannel};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use pool::{ConnectionPool, PoolConfig, PooledChannel};
pub use retry::{Jitter, RetryConfig, RetryPolicy};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("TLS handshake failed: {0}")]
	TlsHandshakeFailed(String),
	#[error("peer verification failed: expected {expected}, got {}", actual.as_deref().unwrap_or("none"))]
	PeerVerificationFailed {
		expected: String,
		actual: Option<String>,
	},
	#[error("connection error: {0}")]
	Connection(String),
	#[error("request timed out after {0:?}")]
	RequestTimeout(Duration),
	#[error("connection pool exhausted for {target} (max {max})")]
	PoolExhausted { target: String, max: usize },
	#[error("circuit breaker '{0}' is open")]
	CircuitOpen(String),
	#[error("unexpected status {0}")]
	Status(StatusCode),
	#[error("invalid transport configuration: {0}")]
	InvalidConfig(String),
	#[error(transparent)]
	Identity(#[from] identity::Error),
}

impl Error {
	/// Whether the retry policy may re-attempt after this failure.
	/// Verification failures and configuration problems never retry.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			Error::Connection(_) | Error::RequestTimeout(_) | Error::TlsHandshakeFailed(_)
		)
	}
}
