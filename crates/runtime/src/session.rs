//! Per-(user, provider) browser sessions with exclusive leases.
//!
//! Every key maps to a slot guarded by an async mutex. Holding the mutex is
//! holding the lease, so at most one task drives a session at a time and
//! waiters are served in arrival order. Eviction clears the record inside a
//! slot; the idle pass then drops slots that are empty, unlocked and held by
//! nobody else, so a waiter on an old slot never races a newcomer into a
//! second session for the same key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::driver::{ProviderDriver, SessionHandle};
use crate::error::{Result, TaskError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
	pub user_id: String,
	pub provider: String,
}

impl SessionKey {
	pub fn new(user_id: impl Into<String>, provider: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			provider: provider.into(),
		}
	}
}

impl fmt::Display for SessionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.user_id, self.provider)
	}
}

#[derive(Debug)]
struct SessionRecord {
	handle: SessionHandle,
	open_pages: u32,
	created_at: Instant,
	last_used_at: Instant,
}

#[derive(Default)]
struct SessionSlot {
	record: Arc<AsyncMutex<Option<SessionRecord>>>,
}

/// Point-in-time view of one pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
	pub key: SessionKey,
	pub session_id: Option<String>,
	pub leased: bool,
	pub open_pages: u32,
	pub idle_ms: Option<u64>,
	pub age_ms: Option<u64>,
}

pub struct SessionPool {
	driver: Arc<dyn ProviderDriver>,
	clock: Arc<dyn Clock>,
	slots: Mutex<HashMap<SessionKey, Arc<SessionSlot>>>,
}

impl SessionPool {
	pub fn new(driver: Arc<dyn ProviderDriver>, clock: Arc<dyn Clock>) -> Self {
		Self {
			driver,
			clock,
			slots: Mutex::new(HashMap::new()),
		}
	}

	fn slot(&self, key: &SessionKey) -> Arc<SessionSlot> {
		let mut slots = self.slots.lock();
		Arc::clone(slots.entry(key.clone()).or_default())
	}

	/// Waits for exclusive use of the session for `key`, opening it first if
	/// none exists. Driver failures surface as `SessionCreation`.
	pub async fn acquire(&self, key: &SessionKey) -> Result<SessionLease> {
		let slot = self.slot(key);
		let mut guard = Arc::clone(&slot.record).lock_owned().await;
		let now = self.clock.now();

		if guard.is_none() {
			let opened = self.driver.open(key).await.map_err(|err| {
				warn!(target = "cube.session", key = %key, error = %err, "session creation failed");
				TaskError::SessionCreation {
					user_id: key.user_id.clone(),
					provider: key.provider.clone(),
					message: err.to_string(),
				}
			})?;
			info!(target = "cube.session", key = %key, session = %opened.id, open_pages = opened.open_pages, "session opened");
			*guard = Some(SessionRecord {
				handle: SessionHandle::new(opened.id, key.clone()),
				open_pages: opened.open_pages,
				created_at: now,
				last_used_at: now,
			});
		}

		let Some(record) = guard.as_mut() else {
			return Err(TaskError::Internal(format!("session slot for {key} empty after open")));
		};
		record.last_used_at = now;
		let handle = record.handle.clone();
		debug!(target = "cube.session", key = %key, session = %handle.id, "lease acquired");

		Ok(SessionLease {
			handle,
			guard: Some(guard),
			clock: Arc::clone(&self.clock),
		})
	}

	/// Closes the session for `key` once its current lease ends.
	pub async fn evict(&self, key: &SessionKey) -> Result<bool> {
		let Some(slot) = self.slots.lock().get(key).cloned() else {
			return Ok(false);
		};
		let mut guard = slot.record.lock().await;
		let Some(record) = guard.take() else {
			return Ok(false);
		};
		info!(target = "cube.session", key = %key, session = %record.handle.id, "session evicted");
		self.driver.close(&record.handle).await?;
		Ok(true)
	}

	/// Closes every unleased session idle for longer than `idle_for`.
	/// Leased sessions are skipped, never waited on.
	pub async fn evict_idle(&self, idle_for: Duration) -> usize {
		let now = self.clock.now();
		let slots: Vec<_> = self.slots.lock().iter().map(|(key, slot)| (key.clone(), Arc::clone(slot))).collect();

		let mut closed = 0;
		for (key, slot) in slots {
			let Ok(mut guard) = slot.record.try_lock() else {
				continue;
			};
			let idle = guard.as_ref().is_some_and(|record| now.saturating_duration_since(record.last_used_at) > idle_for);
			if !idle {
				continue;
			}
			let Some(record) = guard.take() else {
				continue;
			};
			drop(guard);

			info!(target = "cube.session", key = %key, session = %record.handle.id, "idle session closed");
			if let Err(err) = self.driver.close(&record.handle).await {
				warn!(target = "cube.session", key = %key, error = %err, "failed to close idle session");
			}
			closed += 1;
		}

		let mut slots = self.slots.lock();
		let before = slots.len();
		slots.retain(|_, slot| Arc::strong_count(slot) > 1 || slot.record.try_lock().map_or(true, |record| record.is_some()));
		let pruned = before - slots.len();
		if pruned > 0 {
			debug!(target = "cube.session", pruned, "empty session slots dropped");
		}
		closed
	}

	/// Closes every session, waiting for active leases to end.
	pub async fn close_all(&self) {
		let keys: Vec<_> = self.slots.lock().keys().cloned().collect();
		for key in keys {
			if let Err(err) = self.evict(&key).await {
				warn!(target = "cube.session", key = %key, error = %err, "failed to close session");
			}
		}
	}

	pub fn snapshot(&self) -> Vec<SessionSnapshot> {
		let now = self.clock.now();
		let slots = self.slots.lock();
		let mut out: Vec<_> = slots
			.iter()
			.map(|(key, slot)| match slot.record.try_lock() {
				Ok(guard) => match guard.as_ref() {
					Some(record) => SessionSnapshot {
						key: key.clone(),
						session_id: Some(record.handle.id.clone()),
						leased: false,
						open_pages: record.open_pages,
						idle_ms: Some(now.saturating_duration_since(record.last_used_at).as_millis() as u64),
						age_ms: Some(now.saturating_duration_since(record.created_at).as_millis() as u64),
					},
					None => SessionSnapshot {
						key: key.clone(),
						session_id: None,
						leased: false,
						open_pages: 0,
						idle_ms: None,
						age_ms: None,
					},
				},
				Err(_) => SessionSnapshot {
					key: key.clone(),
					session_id: None,
					leased: true,
					open_pages: 0,
					idle_ms: None,
					age_ms: None,
				},
			})
			.collect();
		out.sort_by(|a, b| a.key.cmp(&b.key));
		out
	}

	/// Number of keys that currently hold an open session or a lease.
	pub fn live_sessions(&self) -> usize {
		self.snapshot().iter().filter(|s| s.leased || s.session_id.is_some()).count()
	}
}

/// Exclusive use of one session. Released when dropped.
pub struct SessionLease {
	handle: SessionHandle,
	guard: Option<OwnedMutexGuard<Option<SessionRecord>>>,
	clock: Arc<dyn Clock>,
}

impl SessionLease {
	pub fn handle(&self) -> &SessionHandle {
		&self.handle
	}

	pub fn key(&self) -> &SessionKey {
		&self.handle.key
	}

	pub fn release(self) {}
}

impl fmt::Debug for SessionLease {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionLease").field("handle", &self.handle).finish()
	}
}

impl Drop for SessionLease {
	fn drop(&mut self) {
		if let Some(mut guard) = self.guard.take() {
			if let Some(record) = guard.as_mut() {
				record.last_used_at = self.clock.now();
			}
			debug!(target = "cube.session", key = %self.handle.key, session = %self.handle.id, "lease released");
		}
	}
}
