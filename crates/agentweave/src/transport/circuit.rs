//! Per-target circuit breaker.
//!
//! State machine: closed -> open when consecutive failures reach the
//! threshold; open -> half-open once the recovery timeout elapses; half-open
//! -> closed after enough probe successes, or back to open on any failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::Error;
use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl std::fmt::Display for CircuitState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CircuitState::Closed => write!(f, "closed"),
			CircuitState::Open => write!(f, "open"),
			CircuitState::HalfOpen => write!(f, "half_open"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
	/// Consecutive failures before the circuit opens.
	pub failure_threshold: u32,
	/// Probe successes in half-open before the circuit closes.
	pub success_threshold: u32,
	/// How long an open circuit rejects before probing.
	pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		CircuitBreakerConfig {
			failure_threshold: 5,
			success_threshold: 2,
			timeout: Duration::from_secs(30),
		}
	}
}

impl CircuitBreakerConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.failure_threshold == 0 {
			return Err(Error::InvalidConfig(
				"failure_threshold must be positive".into(),
			));
		}
		if self.success_threshold == 0 {
			return Err(Error::InvalidConfig(
				"success_threshold must be positive".into(),
			));
		}
		if self.timeout.is_zero() {
			return Err(Error::InvalidConfig("timeout must be positive".into()));
		}
		Ok(())
	}
}

#[derive(Debug)]
struct Inner {
	state: CircuitState,
	failure_count: u32,
	success_count: u32,
	total_calls: u64,
	total_failures: u64,
	total_successes: u64,
	total_rejected: u64,
	last_failure_at: Option<Instant>,
	last_state_change: Instant,
}

/// Point-in-time view of a breaker, for admin surfaces and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
	pub state: CircuitState,
	pub failure_count: u32,
	pub success_count: u32,
	pub total_calls: u64,
	pub total_failures: u64,
	pub total_successes: u64,
	pub total_rejected: u64,
	/// Seconds since the last recorded failure, if any.
	pub seconds_since_last_failure: Option<f64>,
}

pub struct CircuitBreaker {
	name: String,
	config: CircuitBreakerConfig,
	metrics: Option<Arc<Metrics>>,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
		CircuitBreaker {
			name: name.into(),
			config,
			metrics: None,
			inner: Mutex::new(Inner {
				state: CircuitState::Closed,
				failure_count: 0,
				success_count: 0,
				total_calls: 0,
				total_failures: 0,
				total_successes: 0,
				total_rejected: 0,
				last_failure_at: None,
				last_state_change: Instant::now(),
			}),
		}
	}

	pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn state(&self) -> CircuitState {
		self.inner.lock().state
	}

	pub fn snapshot(&self) -> CircuitSnapshot {
		let inner = self.inner.lock();
		CircuitSnapshot {
			state: inner.state,
			failure_count: inner.failure_count,
			success_count: inner.success_count,
			total_calls: inner.total_calls,
			total_failures: inner.total_failures,
			total_successes: inner.total_successes,
			total_rejected: inner.total_rejected,
			seconds_since_last_failure: inner.last_failure_at.map(|t| t.elapsed().as_secs_f64()),
		}
	}

	fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
		if inner.state == new_state {
			return;
		}
		info!(
			circuit = %self.name,
			from = %inner.state,
			to = %new_state,
			"circuit state transition"
		);
		if let Some(metrics) = &self.metrics {
			metrics.record_circuit_transition(&self.name, &new_state.to_string());
		}
		inner.state = new_state;
		inner.last_state_change = Instant::now();
		match new_state {
			CircuitState::Closed => {
				inner.failure_count = 0;
				inner.success_count = 0;
			},
			CircuitState::HalfOpen => inner.success_count = 0,
			CircuitState::Open => {},
		}
	}

	/// Admit or reject before running the wrapped call.
	fn admit(&self) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		if inner.state == CircuitState::Open {
			let elapsed_timeout = inner
				.last_failure_at
				.map(|t| t.elapsed() >= self.config.timeout)
				.unwrap_or(false);
			if elapsed_timeout {
				self.transition(&mut inner, CircuitState::HalfOpen);
			} else {
				inner.total_rejected += 1;
				debug!(circuit = %self.name, "rejecting call, circuit open");
				return Err(Error::CircuitOpen(self.name.clone()));
			}
		}
		Ok(())
	}

	fn record_success(&self) {
		let mut inner = self.inner.lock();
		inner.total_calls += 1;
		inner.total_successes += 1;
		match inner.state {
			CircuitState::HalfOpen => {
				inner.success_count += 1;
				if inner.success_count >= self.config.success_threshold {
					self.transition(&mut inner, CircuitState::Closed);
					info!(circuit = %self.name, "circuit recovered");
				}
			},
			CircuitState::Closed => inner.failure_count = 0,
			CircuitState::Open => {},
		}
	}

	fn record_failure(&self) {
		let mut inner = self.inner.lock();
		inner.total_calls += 1;
		inner.total_failures += 1;
		inner.failure_count += 1;
		inner.last_failure_at = Some(Instant::now());
		match inner.state {
			// Any failure while probing re-opens immediately.
			CircuitState::HalfOpen => {
				self.transition(&mut inner, CircuitState::Open);
			},
			CircuitState::Closed => {
				if inner.failure_count >= self.config.failure_threshold {
					let failures = inner.failure_count;
					self.transition(&mut inner, CircuitState::Open);
					warn!(circuit = %self.name, failures, "circuit opened");
				}
			},
			CircuitState::Open => {},
		}
	}

	/// Run `op` through the breaker. `excluded` errors pass through without
	/// affecting breaker state (e.g. not-found, unauthorized).
	pub async fn call_with_exclusions<T, E, F, Fut>(
		&self,
		op: F,
		excluded: impl Fn(&E) -> bool,
	) -> Result<Result<T, E>, Error>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		self.admit()?;
		match op().await {
			Ok(value) => {
				self.record_success();
				Ok(Ok(value))
			},
			Err(e) => {
				if !excluded(&e) {
					self.record_failure();
				}
				Ok(Err(e))
			},
		}
	}

	pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<Result<T, E>, Error>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		self.call_with_exclusions(op, |_| false).await
	}

	/// Force the breaker back to closed. Administrative use only.
	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		self.transition(&mut inner, CircuitState::Closed);
		warn!(circuit = %self.name, "circuit manually reset");
	}
}

/// Keyed collection of breakers so independent peers' failures do not
/// interact.
pub struct CircuitBreakerRegistry {
	default_config: CircuitBreakerConfig,
	metrics: Option<Arc<Metrics>>,
	breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
	pub fn new(default_config: CircuitBreakerConfig) -> Self {
		CircuitBreakerRegistry {
			default_config,
			metrics: None,
			breakers: RwLock::new(HashMap::new()),
		}
	}

	pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
		if let Some(b) = self.breakers.read().get(target) {
			return b.clone();
		}
		let mut write = self.breakers.write();
		write
			.entry(target.to_string())
			.or_insert_with(|| {
				Arc::new(
					CircuitBreaker::new(target, self.default_config.clone())
						.with_metrics(self.metrics.clone()),
				)
			})
			.clone()
	}

	pub fn snapshots(&self) -> HashMap<String, CircuitSnapshot> {
		self
			.breakers
			.read()
			.iter()
			.map(|(k, b)| (k.clone(), b.snapshot()))
			.collect()
	}

	pub fn reset_all(&self) {
		for b in self.breakers.read().values() {
			b.reset();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn breaker(failures: u32, successes: u32, timeout: Duration) -> CircuitBreaker {
		CircuitBreaker::new(
			"spiffe://agentweave.io/agent/search",
			CircuitBreakerConfig {
				failure_threshold: failures,
				success_threshold: successes,
				timeout,
			},
		)
	}

	async fn fail(b: &CircuitBreaker) -> Result<Result<(), Error>, Error> {
		b.call(|| async { Err::<(), _>(Error::Connection("refused".into())) })
			.await
	}

	async fn succeed(b: &CircuitBreaker) -> Result<Result<(), Error>, Error> {
		b.call(|| async { Ok::<_, Error>(()) }).await
	}

	#[tokio::test(start_paused = true)]
	async fn opens_after_threshold_and_fails_fast() {
		let b = breaker(3, 1, Duration::from_secs(30));
		for _ in 0..3 {
			assert!(fail(&b).await.unwrap().is_err());
		}
		assert_eq!(b.state(), CircuitState::Open);

		// Open circuit rejects without invoking the wrapped function.
		let invoked = AtomicU32::new(0);
		let result = b
			.call(|| async {
				invoked.fetch_add(1, Ordering::SeqCst);
				Ok::<_, Error>(())
			})
			.await;
		assert_matches::assert_matches!(result, Err(Error::CircuitOpen(_)));
		assert_eq!(invoked.load(Ordering::SeqCst), 0);
		assert_eq!(b.snapshot().total_rejected, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_probe_then_close() {
		let b = breaker(1, 2, Duration::from_secs(10));
		assert!(fail(&b).await.unwrap().is_err());
		assert_eq!(b.state(), CircuitState::Open);

		tokio::time::advance(Duration::from_secs(11)).await;
		// First call after the timeout probes exactly once.
		assert!(succeed(&b).await.unwrap().is_ok());
		assert_eq!(b.state(), CircuitState::HalfOpen);
		assert!(succeed(&b).await.unwrap().is_ok());
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_failure_reopens() {
		let b = breaker(1, 2, Duration::from_secs(10));
		assert!(fail(&b).await.unwrap().is_err());
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(fail(&b).await.unwrap().is_err());
		assert_eq!(b.state(), CircuitState::Open);
	}

	#[tokio::test]
	async fn excluded_errors_do_not_trip() {
		let b = breaker(1, 1, Duration::from_secs(10));
		let result = b
			.call_with_exclusions(
				|| async { Err::<(), _>(Error::Status(http::StatusCode::NOT_FOUND)) },
				|e| matches!(e, Error::Status(s) if *s == http::StatusCode::NOT_FOUND),
			)
			.await;
		assert!(result.unwrap().is_err());
		assert_eq!(b.state(), CircuitState::Closed);
		assert_eq!(b.snapshot().failure_count, 0);
	}

	#[tokio::test]
	async fn success_resets_failure_count_when_closed() {
		let b = breaker(3, 1, Duration::from_secs(10));
		assert!(fail(&b).await.unwrap().is_err());
		assert!(fail(&b).await.unwrap().is_err());
		assert!(succeed(&b).await.unwrap().is_ok());
		assert_eq!(b.snapshot().failure_count, 0);
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn transitions_are_counted() {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(&mut registry));
		let b = CircuitBreaker::new(
			"spiffe://agentweave.io/agent/search",
			CircuitBreakerConfig {
				failure_threshold: 1,
				success_threshold: 1,
				timeout: Duration::from_secs(10),
			},
		)
		.with_metrics(Some(metrics.clone()));

		assert!(fail(&b).await.unwrap().is_err());
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(succeed(&b).await.unwrap().is_ok());

		let count = |to_state: &str| {
			metrics
				.circuit_transitions
				.get_or_create(&crate::telemetry::metrics::CircuitLabels {
					circuit: "spiffe://agentweave.io/agent/search".to_string(),
					to_state: to_state.to_string(),
				})
				.get()
		};
		assert_eq!(count("open"), 1);
		assert_eq!(count("half_open"), 1);
		assert_eq!(count("closed"), 1);
	}

	#[tokio::test]
	async fn registry_isolates_targets() {
		let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
			failure_threshold: 1,
			success_threshold: 1,
			timeout: Duration::from_secs(30),
		});
		let a = registry.get("spiffe://agentweave.io/agent/a");
		let b = registry.get("spiffe://agentweave.io/agent/b");
		assert!(fail(&a).await.unwrap().is_err());
		assert_eq!(a.state(), CircuitState::Open);
		assert_eq!(b.state(), CircuitState::Closed);
		// Same key yields the same breaker.
		assert_eq!(
			registry.get("spiffe://agentweave.io/agent/a").state(),
			CircuitState::Open
		);
	}
}
