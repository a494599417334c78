//! Suppressing duplicate submissions within a time window.
//!
//! An entry stays live while its task runs and for the rest of the window
//! after it finishes, so bursts of identical submissions collapse into one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::task::TaskId;

#[derive(Debug, Clone)]
struct DedupEntry {
	task_id: TaskId,
	expires_at: Instant,
	completed: bool,
}

impl DedupEntry {
	fn is_expired(&self, now: Instant) -> bool {
		self.completed && now >= self.expires_at
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
	Registered,
	Duplicate { in_flight: TaskId },
}

pub struct DedupRegistry {
	entries: Mutex<HashMap<String, DedupEntry>>,
	clock: Arc<dyn Clock>,
}

impl DedupRegistry {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			clock,
		}
	}

	/// Registers `task_id` under `key` unless a live entry already owns it.
	pub fn try_register(&self, key: &str, task_id: &TaskId, window: Duration) -> DedupDecision {
		let now = self.clock.now();
		let mut entries = self.entries.lock();
		if let Some(existing) = entries.get(key).filter(|entry| !entry.is_expired(now)) {
			debug!(target = "cube.scheduler", key, in_flight = %existing.task_id, "duplicate submission suppressed");
			return DedupDecision::Duplicate {
				in_flight: existing.task_id.clone(),
			};
		}
		entries.insert(
			key.to_string(),
			DedupEntry {
				task_id: task_id.clone(),
				expires_at: now + window,
				completed: false,
			},
		);
		DedupDecision::Registered
	}

	/// Registers and returns a guard that completes the entry when dropped.
	pub fn register(self: &Arc<Self>, key: &str, task_id: &TaskId, window: Duration) -> Result<DedupGuard, TaskId> {
		match self.try_register(key, task_id, window) {
			DedupDecision::Registered => Ok(DedupGuard {
				registry: Arc::clone(self),
				key: key.to_string(),
				task_id: task_id.clone(),
				armed: true,
			}),
			DedupDecision::Duplicate { in_flight } => Err(in_flight),
		}
	}

	/// Marks the task finished. The entry lingers until its window closes.
	pub fn complete(&self, key: &str, task_id: &TaskId) {
		let now = self.clock.now();
		let mut entries = self.entries.lock();
		let Some(entry) = entries.get_mut(key).filter(|entry| &entry.task_id == task_id) else {
			return;
		};
		entry.completed = true;
		if entry.is_expired(now) {
			entries.remove(key);
		}
	}

	/// Drops the entry outright, as if it was never registered.
	pub fn forget(&self, key: &str, task_id: &TaskId) {
		let mut entries = self.entries.lock();
		if entries.get(key).is_some_and(|entry| &entry.task_id == task_id) {
			entries.remove(key);
		}
	}

	/// Removes expired entries and returns how many were dropped.
	pub fn purge_expired(&self) -> usize {
		let now = self.clock.now();
		let mut entries = self.entries.lock();
		let before = entries.len();
		entries.retain(|_, entry| !entry.is_expired(now));
		before - entries.len()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Completes a dedup entry when the owning task ends, however it ends.
#[derive(Debug)]
pub struct DedupGuard {
	registry: Arc<DedupRegistry>,
	key: String,
	task_id: TaskId,
	armed: bool,
}

impl DedupGuard {
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Removes the entry immediately; used when the task never got queued.
	pub fn cancel(mut self) {
		self.armed = false;
		self.registry.forget(&self.key, &self.task_id);
	}
}

impl Drop for DedupGuard {
	fn drop(&mut self) {
		if self.armed {
			self.registry.complete(&self.key, &self.task_id);
		}
	}
}

impl std::fmt::Debug for DedupRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DedupRegistry").field("entries", &self.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::VirtualClock;

	const WINDOW: Duration = Duration::from_secs(5);

	fn registry(clock: &VirtualClock) -> Arc<DedupRegistry> {
		Arc::new(DedupRegistry::new(clock.clone().shared()))
	}

	#[test]
	fn duplicate_while_in_flight() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);
		let first = TaskId::new("t-1");

		let _guard = registry.register("u:hi", &first, WINDOW).unwrap();
		assert_eq!(registry.register("u:hi", &TaskId::new("t-2"), WINDOW).unwrap_err(), first);

		// Still running past the window: still a duplicate.
		clock.advance(WINDOW * 3);
		assert!(registry.register("u:hi", &TaskId::new("t-3"), WINDOW).is_err());
	}

	#[test]
	fn completed_entry_lingers_until_window_closes() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);

		drop(registry.register("u:hi", &TaskId::new("t-1"), WINDOW).unwrap());
		clock.advance(Duration::from_secs(1));
		assert!(registry.register("u:hi", &TaskId::new("t-2"), WINDOW).is_err());

		clock.advance(Duration::from_secs(5));
		assert!(registry.register("u:hi", &TaskId::new("t-3"), WINDOW).is_ok());
	}

	#[test]
	fn completion_after_window_removes_entry() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);

		let guard = registry.register("u:hi", &TaskId::new("t-1"), WINDOW).unwrap();
		clock.advance(WINDOW * 2);
		drop(guard);
		assert!(registry.is_empty());
	}

	#[test]
	fn cancel_forgets_immediately() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);

		registry.register("u:hi", &TaskId::new("t-1"), WINDOW).unwrap().cancel();
		assert!(registry.is_empty());
		assert!(registry.register("u:hi", &TaskId::new("t-2"), WINDOW).is_ok());
	}

	#[test]
	fn purge_drops_only_expired() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);

		drop(registry.register("a", &TaskId::new("t-1"), WINDOW).unwrap());
		let _live = registry.register("b", &TaskId::new("t-2"), WINDOW).unwrap();
		clock.advance(WINDOW);

		assert_eq!(registry.purge_expired(), 1);
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn stale_completion_does_not_touch_newer_entry() {
		let clock = VirtualClock::new();
		let registry = registry(&clock);

		let _guard = registry.register("k", &TaskId::new("t-new"), WINDOW).unwrap();
		registry.complete("k", &TaskId::new("t-old"));
		assert!(registry.register("k", &TaskId::new("t-3"), WINDOW).is_err());
	}
}
