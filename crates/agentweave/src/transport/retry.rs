//! Exponential backoff retry with optional full jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, warn};

use super::Error;
use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
	None,
	/// Delay drawn uniformly from `[0, computed]`.
	#[default]
	Full,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
	pub max_retries: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub exponential_base: f64,
	pub jitter: Jitter,
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			max_retries: 3,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
			exponential_base: 2.0,
			jitter: Jitter::Full,
		}
	}
}

impl RetryConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.base_delay.is_zero() {
			return Err(Error::InvalidConfig("base_delay must be positive".into()));
		}
		if self.max_delay < self.base_delay {
			return Err(Error::InvalidConfig(
				"max_delay must be >= base_delay".into(),
			));
		}
		if self.exponential_base <= 1.0 {
			return Err(Error::InvalidConfig(
				"exponential_base must be > 1".into(),
			));
		}
		Ok(())
	}
}

/// Outcome statistics, surfaced for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryStats {
	/// Total attempts made, including the first.
	pub attempts: u32,
	/// Sum of backoff sleeps.
	pub total_delay: Duration,
}

#[derive(Clone)]
pub struct RetryPolicy {
	config: RetryConfig,
	metrics: Option<Arc<Metrics>>,
}

impl RetryPolicy {
	pub fn new(config: RetryConfig) -> Result<Self, Error> {
		config.validate()?;
		Ok(RetryPolicy {
			config,
			metrics: None,
		})
	}

	pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
		self.metrics = metrics;
		self
	}

	/// Backoff before retry `n` (0-indexed): `min(base * expo^n, max)`,
	/// optionally jittered down.
	fn delay_for(&self, attempt: u32) -> Duration {
		let exp = self
			.config
			.base_delay
			.as_secs_f64()
			* self.config.exponential_base.powi(attempt as i32);
		let capped = exp.min(self.config.max_delay.as_secs_f64());
		let jittered = match self.config.jitter {
			Jitter::None => capped,
			Jitter::Full => rand::rng().random_range(0.0..=capped),
		};
		Duration::from_secs_f64(jittered)
	}

	/// Run `op` until it succeeds, a non-retryable error surfaces, or the
	/// retry budget is exhausted. `retryable` classifies errors.
	pub async fn execute_with_stats<T, E, F, Fut>(
		&self,
		mut op: F,
		retryable: impl Fn(&E) -> bool,
	) -> (Result<T, E>, RetryStats)
	where
		E: std::fmt::Display,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let mut stats = RetryStats::default();
		for attempt in 0..=self.config.max_retries {
			stats.attempts = attempt + 1;
			match op().await {
				Ok(value) => {
					if attempt > 0 {
						debug!(
							retries = attempt,
							total_delay = ?stats.total_delay,
							"operation succeeded after retries"
						);
					}
					return (Ok(value), stats);
				},
				Err(e) if !retryable(&e) => {
					debug!(error = %e, "non-retryable error");
					return (Err(e), stats);
				},
				Err(e) if attempt >= self.config.max_retries => {
					warn!(
						error = %e,
						attempts = stats.attempts,
						"retry budget exhausted"
					);
					return (Err(e), stats);
				},
				Err(e) => {
					let delay = self.delay_for(attempt);
					stats.total_delay += delay;
					if let Some(metrics) = &self.metrics {
						metrics.record_retry();
					}
					debug!(
						error = %e,
						retry = attempt + 1,
						max = self.config.max_retries,
						delay = ?delay,
						"retrying after backoff"
					);
					tokio::time::sleep(delay).await;
				},
			}
		}
		unreachable!("loop returns on final attempt")
	}

	pub async fn execute<T, E, F, Fut>(
		&self,
		op: F,
		retryable: impl Fn(&E) -> bool,
	) -> Result<T, E>
	where
		E: std::fmt::Display,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		self.execute_with_stats(op, retryable).await.0
	}
}
