//! LRU decision cache with TTL.
//!
//! Keys are a stable digest of the full decision input. Expiry is checked on
//! read; the size bound is enforced by evicting the least recently used
//! entry on insert. The critical section is a single O(1)-ish map operation
//! under a coarse lock.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::AuthzDecision;

struct Entry {
	decision: AuthzDecision,
	inserted_at: Instant,
}

pub struct DecisionCache {
	inner: Mutex<IndexMap<String, Entry>>,
	ttl: Duration,
	max_size: usize,
}

impl DecisionCache {
	pub fn new(max_size: usize, ttl: Duration) -> Self {
		DecisionCache {
			inner: Mutex::new(IndexMap::new()),
			ttl,
			max_size: max_size.max(1),
		}
	}

	/// Stable digest over caller, resource, action, and the context entries
	/// in sorted key order.
	pub fn key(
		caller_id: &str,
		resource_id: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> String {
		let mut hasher = Sha256::new();
		hasher.update(caller_id.as_bytes());
		hasher.update(b":");
		hasher.update(resource_id.as_bytes());
		hasher.update(b":");
		hasher.update(action.as_bytes());
		hasher.update(b":");
		if let Some(context) = context {
			let mut keys: Vec<&String> = context.keys().collect();
			keys.sort();
			for k in keys {
				hasher.update(k.as_bytes());
				hasher.update(b"=");
				hasher.update(context[k].to_string().as_bytes());
				hasher.update(b";");
			}
		}
		hex::encode(hasher.finalize())
	}

	pub fn get(&self, key: &str) -> Option<AuthzDecision> {
		let mut cache = self.inner.lock();
		let expired = match cache.get(key) {
			None => return None,
			Some(entry) => entry.inserted_at.elapsed() > self.ttl,
		};
		if expired {
			cache.shift_remove(key);
			return None;
		}
		// Re-insert to refresh recency.
		let entry = cache.shift_remove(key)?;
		let decision = entry.decision.clone();
		cache.insert(key.to_string(), entry);
		Some(decision)
	}

	pub fn put(&self, key: String, decision: AuthzDecision) {
		let mut cache = self.inner.lock();
		cache.shift_remove(&key);
		cache.insert(
			key,
			Entry {
				decision,
				inserted_at: Instant::now(),
			},
		);
		while cache.len() > self.max_size {
			cache.shift_remove_index(0);
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	pub fn clear(&self) {
		self.inner.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx(pairs: &[(&str, &str)]) -> Map<String, Value> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
			.collect()
	}

	#[test]
	fn key_is_stable_under_context_order() {
		let a = ctx(&[("x", "1"), ("y", "2")]);
		let mut b = Map::new();
		b.insert("y".to_string(), Value::String("2".to_string()));
		b.insert("x".to_string(), Value::String("1".to_string()));
		assert_eq!(
			DecisionCache::key("c", "r", "a", Some(&a)),
			DecisionCache::key("c", "r", "a", Some(&b))
		);
	}

	#[test]
	fn key_differs_by_inputs() {
		let base = DecisionCache::key("c", "r", "a", None);
		assert_ne!(base, DecisionCache::key("c2", "r", "a", None));
		assert_ne!(base, DecisionCache::key("c", "r2", "a", None));
		assert_ne!(base, DecisionCache::key("c", "r", "a2", None));
		assert_ne!(
			base,
			DecisionCache::key("c", "r", "a", Some(&ctx(&[("k", "v")])))
		);
	}

	#[test]
	fn hit_returns_identical_decision() {
		let cache = DecisionCache::new(10, Duration::from_secs(60));
		let decision = AuthzDecision::allow("same-domain", Some("p1".to_string()));
		let key = DecisionCache::key("c", "r", "a", None);
		cache.put(key.clone(), decision.clone());
		// Byte-equal, audit_id included.
		assert_eq!(cache.get(&key).unwrap(), decision);
	}

	#[test]
	fn ttl_evicts_on_read() {
		let cache = DecisionCache::new(10, Duration::from_millis(0));
		let key = DecisionCache::key("c", "r", "a", None);
		cache.put(key.clone(), AuthzDecision::allow("ok", None));
		std::thread::sleep(Duration::from_millis(5));
		assert!(cache.get(&key).is_none());
		assert!(cache.is_empty());
	}

	#[test]
	fn lru_evicts_on_insert_beyond_bound() {
		let cache = DecisionCache::new(2, Duration::from_secs(60));
		cache.put("k1".into(), AuthzDecision::allow("1", None));
		cache.put("k2".into(), AuthzDecision::allow("2", None));
		// Touch k1 so k2 becomes the least recently used.
		assert!(cache.get("k1").is_some());
		cache.put("k3".into(), AuthzDecision::allow("3", None));
		assert_eq!(cache.len(), 2);
		assert!(cache.get("k2").is_none());
		assert!(cache.get("k1").is_some());
		assert!(cache.get("k3").is_some());
	}
}
