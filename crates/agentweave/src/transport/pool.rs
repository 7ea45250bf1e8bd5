//! Per-peer connection pool.
//!
//! Channels to the same peer are reused to amortize TLS handshakes. List
//! mutation takes a per-target lock; the coarse pool lock covers only changes
//! to the target set. Two background loops run until shutdown: idle eviction
//! and a health probe that retires connections which have sat in the pool too
//! long without being used.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::channel::{ChannelConfig, SecureChannel};
use super::Error;
use crate::audit::AuditTrail;
use crate::identity::{IdentityProvider, SpiffeId};
use crate::telemetry::Metrics;

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub max_connections_per_target: usize,
	pub max_total_connections: usize,
	pub idle_timeout: Duration,
	pub health_check_interval: Duration,
	pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			max_connections_per_target: 10,
			max_total_connections: 100,
			idle_timeout: Duration::from_secs(60),
			health_check_interval: Duration::from_secs(30),
			cleanup_interval: Duration::from_secs(10),
		}
	}
}

impl PoolConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.max_connections_per_target == 0 {
			return Err(Error::InvalidConfig(
				"max_connections_per_target must be positive".into(),
			));
		}
		if self.max_total_connections < self.max_connections_per_target {
			return Err(Error::InvalidConfig(
				"max_total_connections must be >= max_connections_per_target".into(),
			));
		}
		if self.idle_timeout.is_zero()
			|| self.health_check_interval.is_zero()
			|| self.cleanup_interval.is_zero()
		{
			return Err(Error::InvalidConfig(
				"pool intervals must be positive".into(),
			));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
	Unknown,
	Healthy,
	Unhealthy,
}

#[derive(Debug)]
struct SlotState {
	last_used: Instant,
	in_use: bool,
	health: Health,
	use_count: u64,
}

struct Slot {
	channel: Arc<SecureChannel>,
	target: SpiffeId,
	created_at: Instant,
	state: Mutex<SlotState>,
}

impl Slot {
	fn is_idle(&self, idle_timeout: Duration) -> bool {
		let state = self.state.lock();
		!state.in_use && state.last_used.elapsed() > idle_timeout
	}
}

type TargetList = Arc<Mutex<Vec<Arc<Slot>>>>;

/// Scoped guard over a pooled channel. Dropping it returns the connection to
/// the pool.
pub struct PooledChannel {
	slot: Arc<Slot>,
}

impl std::fmt::Debug for PooledChannel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledChannel")
			.field("target", &self.slot.target)
			.finish_non_exhaustive()
	}
}

impl Deref for PooledChannel {
	type Target = SecureChannel;

	fn deref(&self) -> &SecureChannel {
		&self.slot.channel
	}
}

impl Drop for PooledChannel {
	fn drop(&mut self) {
		let mut state = self.slot.state.lock();
		state.in_use = false;
		state.last_used = Instant::now();
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
	pub total_connections: usize,
	pub total_acquisitions: u64,
	pub total_creations: u64,
	pub total_evictions: u64,
	pub targets: HashMap<String, usize>,
}

pub struct ConnectionPool {
	identity: Arc<dyn IdentityProvider>,
	config: PoolConfig,
	channel_config: ChannelConfig,
	audit: Option<Arc<AuditTrail>>,
	metrics: Option<Arc<Metrics>>,
	targets: Mutex<HashMap<SpiffeId, TargetList>>,
	total_connections: AtomicUsize,
	total_acquisitions: AtomicU64,
	total_creations: AtomicU64,
	total_evictions: AtomicU64,
	background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConnectionPool {
	pub fn new(
		identity: Arc<dyn IdentityProvider>,
		config: PoolConfig,
		channel_config: ChannelConfig,
		audit: Option<Arc<AuditTrail>>,
		metrics: Option<Arc<Metrics>>,
	) -> Result<Arc<Self>, Error> {
		config.validate()?;
		channel_config.validate()?;
		info!(
			max_per_target = config.max_connections_per_target,
			max_total = config.max_total_connections,
			"connection pool initialized"
		);
		Ok(Arc::new(ConnectionPool {
			identity,
			config,
			channel_config,
			audit,
			metrics,
			targets: Mutex::new(HashMap::new()),
			total_connections: AtomicUsize::new(0),
			total_acquisitions: AtomicU64::new(0),
			total_creations: AtomicU64::new(0),
			total_evictions: AtomicU64::new(0),
			background: Mutex::new(Vec::new()),
		}))
	}

	/// Borrow a channel to `target`, creating one when the pool has room.
	/// Fails with *pool-exhausted* once either the per-target or the
	/// pool-wide cap is hit.
	pub async fn acquire(
		self: &Arc<Self>,
		target: &SpiffeId,
		base_url: &Url,
	) -> Result<PooledChannel, Error> {
		self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
		let list = {
			let mut targets = self.targets.lock();
			targets.entry(target.clone()).or_default().clone()
		};

		let mut slots = list.lock();
		// Unhealthy connections are retired here rather than handed out.
		slots.retain(|slot| {
			let state = slot.state.lock();
			if !state.in_use && state.health == Health::Unhealthy {
				self.total_connections.fetch_sub(1, Ordering::Relaxed);
				self.total_evictions.fetch_add(1, Ordering::Relaxed);
				false
			} else {
				true
			}
		});
		for slot in slots.iter() {
			let mut state = slot.state.lock();
			if !state.in_use {
				state.in_use = true;
				state.last_used = Instant::now();
				state.use_count += 1;
				debug!(target = %target, use_count = state.use_count, "reusing pooled connection");
				return Ok(PooledChannel { slot: slot.clone() });
			}
		}

		if slots.len() >= self.config.max_connections_per_target {
			return Err(Error::PoolExhausted {
				target: target.to_string(),
				max: self.config.max_connections_per_target,
			});
		}
		if self.total_connections.load(Ordering::Relaxed) >= self.config.max_total_connections {
			return Err(Error::PoolExhausted {
				target: target.to_string(),
				max: self.config.max_total_connections,
			});
		}

		let channel = SecureChannel::new(
			self.identity.clone(),
			target.clone(),
			base_url.clone(),
			self.channel_config.clone(),
			self.audit.clone(),
			self.metrics.clone(),
		)?;
		let slot = Arc::new(Slot {
			channel: Arc::new(channel),
			target: target.clone(),
			created_at: Instant::now(),
			state: Mutex::new(SlotState {
				last_used: Instant::now(),
				in_use: true,
				health: Health::Unknown,
				use_count: 1,
			}),
		});
		slots.push(slot.clone());
		self.total_connections.fetch_add(1, Ordering::Relaxed);
		self.total_creations.fetch_add(1, Ordering::Relaxed);
		debug!(
			target = %target,
			total = self.total_connections.load(Ordering::Relaxed),
			"created pooled connection"
		);
		Ok(PooledChannel { slot })
	}

	/// Start the eviction and health-probe loops. Both exit within one cycle
	/// of `shutdown` flipping to true.
	pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
		let mut handles = self.background.lock();
		handles.push(tokio::spawn(Self::eviction_loop(
			self.clone(),
			shutdown.clone(),
		)));
		handles.push(tokio::spawn(Self::health_loop(self.clone(), shutdown)));
	}

	async fn eviction_loop(pool: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(pool.config.cleanup_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = ticker.tick() => pool.evict_idle(),
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						return;
					}
				},
			}
		}
	}

	fn evict_idle(&self) {
		let mut evicted = 0usize;
		let mut targets = self.targets.lock();
		targets.retain(|target, list| {
			let mut slots = list.lock();
			slots.retain(|slot| {
				if slot.is_idle(self.config.idle_timeout) {
					self.total_connections.fetch_sub(1, Ordering::Relaxed);
					evicted += 1;
					false
				} else {
					true
				}
			});
			if slots.is_empty() {
				debug!(target = %target, "dropping empty target pool");
				false
			} else {
				true
			}
		});
		if evicted > 0 {
			self.total_evictions.fetch_add(evicted as u64, Ordering::Relaxed);
			debug!(evicted, "evicted idle connections");
		}
	}

	async fn health_loop(pool: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(pool.config.health_check_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = ticker.tick() => pool.probe_health(),
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						return;
					}
				},
			}
		}
	}

	fn probe_health(&self) {
		// A connection that has outlived a bounded multiple of the probe
		// period without being used is presumed stale.
		let max_age = self.config.health_check_interval * 10;
		let targets = self.targets.lock();
		for list in targets.values() {
			let slots = list.lock();
			for slot in slots.iter() {
				let mut state = slot.state.lock();
				if state.in_use {
					continue;
				}
				if slot.created_at.elapsed() > max_age {
					if state.health != Health::Unhealthy {
						warn!(target = %slot.target, "marking stale pooled connection unhealthy");
					}
					state.health = Health::Unhealthy;
				} else {
					state.health = Health::Healthy;
				}
			}
		}
	}

	/// Drain and drop every pooled connection.
	pub fn close_all(&self) {
		let mut targets = self.targets.lock();
		let drained: usize = targets.values().map(|list| list.lock().len()).sum();
		targets.clear();
		self.total_connections.store(0, Ordering::Relaxed);
		info!(drained, "closed all pooled connections");
	}

	pub fn stats(&self) -> PoolStats {
		let targets = self.targets.lock();
		PoolStats {
			total_connections: self.total_connections.load(Ordering::Relaxed),
			total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
			total_creations: self.total_creations.load(Ordering::Relaxed),
			total_evictions: self.total_evictions.load(Ordering::Relaxed),
			targets: targets
				.iter()
				.map(|(k, v)| (k.to_string(), v.lock().len()))
				.collect(),
		}
	}
}

impl Drop for ConnectionPool {
	fn drop(&mut self) {
		for handle in self.background.lock().drain(..) {
			handle.abort();
		}
	}
}
