//! Time source injected into every component that waits or measures.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
	fn now(&self) -> Instant;

	async fn sleep(&self, duration: Duration);

	/// Resolves once `now()` reaches `deadline`, without moving time itself.
	async fn wait_until(&self, deadline: Instant);

	fn elapsed_since(&self, earlier: Instant) -> Duration {
		self.now().saturating_duration_since(earlier)
	}
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	async fn sleep(&self, duration: Duration) {
		if !duration.is_zero() {
			tokio::time::sleep(duration).await;
		}
	}

	async fn wait_until(&self, deadline: Instant) {
		tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
	}
}

/// Runs `fut` until it completes or `limit` passes on `clock`. `None` means
/// the limit won.
pub async fn within<F: Future>(clock: &dyn Clock, limit: Duration, fut: F) -> Option<F::Output> {
	let expiry = clock.now() + limit;
	tokio::select! {
		biased;
		output = fut => Some(output),
		_ = clock.wait_until(expiry) => None,
	}
}

/// Manually driven clock. `sleep` advances time instantly and yields once so
/// concurrently running tasks still interleave. Deadlines registered through
/// `wait_until` fire only when some sleeper or [`advance`](Self::advance)
/// moves time past them.
#[derive(Clone)]
pub struct VirtualClock {
	origin: Instant,
	offset: Arc<watch::Sender<Duration>>,
}

impl VirtualClock {
	pub fn new() -> Self {
		let (offset, _) = watch::channel(Duration::ZERO);
		Self {
			origin: Instant::now(),
			offset: Arc::new(offset),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.offset.send_modify(|offset| *offset += by);
	}

	/// Total virtual time elapsed since construction.
	pub fn elapsed(&self) -> Duration {
		*self.offset.borrow()
	}

	pub fn shared(self) -> Arc<dyn Clock> {
		Arc::new(self)
	}
}

impl Default for VirtualClock {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for VirtualClock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("VirtualClock").field("elapsed", &self.elapsed()).finish()
	}
}

#[async_trait]
impl Clock for VirtualClock {
	fn now(&self) -> Instant {
		self.origin + *self.offset.borrow()
	}

	async fn sleep(&self, duration: Duration) {
		self.advance(duration);
		tokio::task::yield_now().await;
	}

	async fn wait_until(&self, deadline: Instant) {
		let mut moved = self.offset.subscribe();
		while self.now() < deadline {
			if moved.changed().await.is_err() {
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn virtual_sleep_advances_without_waiting() {
		let clock = VirtualClock::new();
		let start = clock.now();
		let wall = Instant::now();

		clock.sleep(Duration::from_secs(600)).await;

		assert_eq!(clock.elapsed_since(start), Duration::from_secs(600));
		assert!(wall.elapsed() < Duration::from_secs(5));
	}

	#[tokio::test]
	async fn clones_share_the_same_timeline() {
		let clock = VirtualClock::new();
		let other = clock.clone();
		other.advance(Duration::from_millis(250));
		assert_eq!(clock.elapsed(), Duration::from_millis(250));
	}

	#[tokio::test]
	async fn virtual_deadline_fires_only_when_time_moves() {
		let clock = VirtualClock::new();
		let pending = within(&clock, Duration::from_secs(5), std::future::pending::<()>());
		tokio::pin!(pending);

		assert!(tokio::time::timeout(Duration::from_millis(20), &mut pending).await.is_err());
		clock.advance(Duration::from_secs(6));
		assert_eq!(pending.await, None);
	}

	#[tokio::test]
	async fn ready_future_beats_an_expired_limit() {
		let clock = VirtualClock::new();
		assert_eq!(within(&clock, Duration::ZERO, async { 7 }).await, Some(7));
	}
}
