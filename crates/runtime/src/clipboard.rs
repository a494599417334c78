//! Mutual exclusion over the single host clipboard.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, TaskError};

/// Serializes write-then-read clipboard sequences across all tasks.
pub struct ClipboardLock {
	gate: AsyncMutex<()>,
	holder: Mutex<Option<String>>,
	wait: Duration,
	acquisitions: AtomicU64,
}

impl ClipboardLock {
	/// `wait` bounds how long an acquirer queues before giving up.
	pub fn new(wait: Duration) -> Self {
		Self {
			gate: AsyncMutex::new(()),
			holder: Mutex::new(None),
			wait,
			acquisitions: AtomicU64::new(0),
		}
	}

	pub async fn acquire(&self, holder: &str) -> Result<ClipboardGuard<'_>> {
		let permit = match tokio::time::timeout(self.wait, self.gate.lock()).await {
			Ok(permit) => permit,
			Err(_) => {
				let current = self.holder();
				warn!(target = "cube.clipboard", holder, current = ?current, wait_ms = self.wait.as_millis() as u64, "clipboard wait timed out");
				return Err(TaskError::Clipboard(format!("timed out after {}ms waiting for the clipboard", self.wait.as_millis())));
			}
		};
		*self.holder.lock() = Some(holder.to_string());
		self.acquisitions.fetch_add(1, Ordering::Relaxed);
		debug!(target = "cube.clipboard", holder, "clipboard acquired");
		Ok(ClipboardGuard { lock: self, _permit: permit })
	}

	/// Runs `f` while holding the clipboard. The lock is released on every
	/// exit path, including when `f`'s future is dropped mid-flight.
	pub async fn with_clipboard<T, F, Fut>(&self, holder: &str, f: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let _guard = self.acquire(holder).await?;
		f().await
	}

	/// The task currently holding the clipboard, if any.
	pub fn holder(&self) -> Option<String> {
		self.holder.lock().clone()
	}

	pub fn acquisitions(&self) -> u64 {
		self.acquisitions.load(Ordering::Relaxed)
	}
}

impl fmt::Debug for ClipboardLock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClipboardLock").field("holder", &self.holder()).field("wait", &self.wait).finish()
	}
}

#[derive(Debug)]
pub struct ClipboardGuard<'a> {
	lock: &'a ClipboardLock,
	_permit: MutexGuard<'a, ()>,
}

impl Drop for ClipboardGuard<'_> {
	fn drop(&mut self) {
		if let Some(holder) = self.lock.holder.lock().take() {
			debug!(target = "cube.clipboard", holder = %holder, "clipboard released");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[tokio::test]
	async fn holder_is_visible_while_held() {
		let lock = ClipboardLock::new(Duration::from_secs(1));
		{
			let _guard = lock.acquire("task-1").await.unwrap();
			assert_eq!(lock.holder().as_deref(), Some("task-1"));
		}
		assert_eq!(lock.holder(), None);
		assert_eq!(lock.acquisitions(), 1);
	}

	#[tokio::test]
	async fn acquisition_times_out_while_held() {
		let lock = ClipboardLock::new(Duration::from_millis(20));
		let _guard = lock.acquire("task-1").await.unwrap();

		let err = lock.acquire("task-2").await.unwrap_err();
		assert!(matches!(err, TaskError::Clipboard(_)));
		assert_eq!(lock.holder().as_deref(), Some("task-1"));
	}

	#[tokio::test]
	async fn released_when_body_fails() {
		let lock = ClipboardLock::new(Duration::from_secs(1));
		let result: Result<()> = lock
			.with_clipboard("task-1", || async { Err(TaskError::Clipboard("read failed".into())) })
			.await;
		assert!(result.is_err());
		assert_eq!(lock.holder(), None);
		assert!(lock.acquire("task-2").await.is_ok());
	}

	#[tokio::test]
	async fn released_when_holder_panics() {
		let lock = Arc::new(ClipboardLock::new(Duration::from_secs(1)));
		let panicking = {
			let lock = Arc::clone(&lock);
			tokio::spawn(async move {
				let _guard = lock.acquire("task-1").await.unwrap();
				panic!("driver blew up");
			})
		};
		assert!(panicking.await.unwrap_err().is_panic());

		let _guard = lock.acquire("task-2").await.unwrap();
		assert_eq!(lock.holder().as_deref(), Some("task-2"));
	}
}
