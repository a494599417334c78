//! Bounded retries with a terminal-signal check and a last-resort fallback.

use std::future::{Future, Ready};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub delay_ms: u64,
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, delay: Duration) -> Self {
		Self {
			max_attempts,
			delay_ms: delay.as_millis() as u64,
		}
	}

	pub fn delay(&self) -> Duration {
		Duration::from_millis(self.delay_ms)
	}

	pub fn attempts(&self) -> u32 {
		self.max_attempts.max(1)
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			delay_ms: 2_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
	pub value: T,
	pub attempts: u32,
	pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
	pub error: TaskError,
	pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryController {
	policy: RetryPolicy,
	clock: Arc<dyn Clock>,
}

type NoFallback<T> = fn() -> Ready<Result<T, TaskError>>;

impl RetryController {
	pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
		Self { policy, clock }
	}

	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Runs `op` up to `max_attempts` times. `signal` is consulted before the
	/// first attempt and after every failed one; a reported signal ends the
	/// run as `ProviderUnavailable`.
	pub async fn run<T, Op, OpFut, Sig, SigFut>(&self, label: &str, op: Op, signal: Sig) -> Result<Retried<T>, RetryFailure>
	where
		Op: FnMut(u32) -> OpFut,
		OpFut: Future<Output = Result<T, TaskError>>,
		Sig: FnMut() -> SigFut,
		SigFut: Future<Output = Option<String>>,
	{
		self.drive(label, op, signal, None::<NoFallback<T>>).await
	}

	/// Like [`run`](Self::run), but once attempts are exhausted without a
	/// terminal signal `fallback` gets one chance to produce the value.
	pub async fn run_with_fallback<T, Op, OpFut, Sig, SigFut, Fb, FbFut>(
		&self,
		label: &str,
		op: Op,
		signal: Sig,
		fallback: Fb,
	) -> Result<Retried<T>, RetryFailure>
	where
		Op: FnMut(u32) -> OpFut,
		OpFut: Future<Output = Result<T, TaskError>>,
		Sig: FnMut() -> SigFut,
		SigFut: Future<Output = Option<String>>,
		Fb: FnOnce() -> FbFut,
		FbFut: Future<Output = Result<T, TaskError>>,
	{
		self.drive(label, op, signal, Some(fallback)).await
	}

	async fn drive<T, Op, OpFut, Sig, SigFut, Fb, FbFut>(
		&self,
		label: &str,
		mut op: Op,
		mut signal: Sig,
		fallback: Option<Fb>,
	) -> Result<Retried<T>, RetryFailure>
	where
		Op: FnMut(u32) -> OpFut,
		OpFut: Future<Output = Result<T, TaskError>>,
		Sig: FnMut() -> SigFut,
		SigFut: Future<Output = Option<String>>,
		Fb: FnOnce() -> FbFut,
		FbFut: Future<Output = Result<T, TaskError>>,
	{
		let max = self.policy.attempts();
		let mut last_error = TaskError::Internal(format!("{label}: no attempt made"));

		for attempt in 1..=max {
			if attempt == 1 {
				if let Some(reason) = signal().await {
					warn!(target = "cube.retry", label, reason = %reason, "provider unavailable before first attempt");
					return Err(RetryFailure {
						error: TaskError::ProviderUnavailable(reason),
						attempts: 1,
					});
				}
			}

			match op(attempt).await {
				Ok(value) => {
					if attempt > 1 {
						info!(target = "cube.retry", label, attempt, "succeeded after retry");
					}
					return Ok(Retried {
						value,
						attempts: attempt,
						used_fallback: false,
					});
				}
				Err(error) if error.is_terminal() => {
					warn!(target = "cube.retry", label, attempt, error = %error, "terminal failure, not retrying");
					return Err(RetryFailure { error, attempts: attempt });
				}
				Err(error) => {
					warn!(target = "cube.retry", label, attempt, max, error = %error, "attempt failed");
					last_error = error;
				}
			}

			if let Some(reason) = signal().await {
				warn!(target = "cube.retry", label, attempt, reason = %reason, "provider reported unavailable");
				return Err(RetryFailure {
					error: TaskError::ProviderUnavailable(reason),
					attempts: attempt,
				});
			}

			if attempt < max {
				self.clock.sleep(self.policy.delay()).await;
			}
		}

		if let Some(fallback) = fallback {
			match fallback().await {
				Ok(value) => {
					info!(target = "cube.retry", label, attempts = max, "recovered through fallback");
					return Ok(Retried {
						value,
						attempts: max,
						used_fallback: true,
					});
				}
				Err(error) => debug!(target = "cube.retry", label, error = %error, "fallback produced nothing"),
			}
		}

		Err(RetryFailure {
			error: last_error,
			attempts: max,
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;
	use crate::clock::VirtualClock;

	fn controller(clock: &VirtualClock) -> RetryController {
		RetryController::new(RetryPolicy::default(), Arc::new(clock.clone()))
	}

	async fn quiet() -> Option<String> {
		None
	}

	#[tokio::test]
	async fn retries_until_success_with_delay() {
		let clock = VirtualClock::new();
		let calls = AtomicU32::new(0);

		let outcome = controller(&clock)
			.run(
				"extract",
				|attempt| {
					calls.fetch_add(1, Ordering::SeqCst);
					async move {
						if attempt < 3 {
							Err(TaskError::Extraction("empty".into()))
						} else {
							Ok("hello")
						}
					}
				},
				quiet,
			)
			.await
			.unwrap();

		assert_eq!(outcome.value, "hello");
		assert_eq!(outcome.attempts, 3);
		assert!(!outcome.used_fallback);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert_eq!(clock.elapsed(), Duration::from_secs(4));
	}

	#[tokio::test]
	async fn terminal_error_short_circuits() {
		let clock = VirtualClock::new();
		let calls = AtomicU32::new(0);

		let failure = controller(&clock)
			.run(
				"open",
				|_| {
					calls.fetch_add(1, Ordering::SeqCst);
					async { Err::<(), _>(TaskError::ProviderUnavailable("banner".into())) }
				},
				quiet,
			)
			.await
			.unwrap_err();

		assert_eq!(failure.attempts, 1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(clock.elapsed(), Duration::ZERO);
	}

	#[tokio::test]
	async fn unavailable_signal_stops_retries() {
		let clock = VirtualClock::new();
		let checks = AtomicU32::new(0);

		let failure = controller(&clock)
			.run(
				"extract",
				|_| async { Err::<(), _>(TaskError::StabilizationTimeout { elapsed_ms: 10 }) },
				|| {
					let seen = checks.fetch_add(1, Ordering::SeqCst);
					async move { (seen >= 1).then(|| "service busy".to_string()) }
				},
			)
			.await
			.unwrap_err();

		assert_eq!(failure.attempts, 1);
		assert_eq!(failure.error, TaskError::ProviderUnavailable("service busy".into()));
		assert_eq!(clock.elapsed(), Duration::ZERO);
	}

	#[tokio::test]
	async fn signal_present_up_front_skips_every_attempt() {
		let clock = VirtualClock::new();
		let calls = AtomicU32::new(0);

		let failure = controller(&clock)
			.run_with_fallback(
				"extract",
				|_| {
					calls.fetch_add(1, Ordering::SeqCst);
					async { Ok::<_, TaskError>("never".to_string()) }
				},
				|| async { Some("service busy".to_string()) },
				|| async { Ok("stale".to_string()) },
			)
			.await
			.unwrap_err();

		assert_eq!(failure.error.kind(), crate::error::ErrorKind::ProviderUnavailable);
		assert_eq!(failure.attempts, 1);
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn fallback_runs_after_exhaustion() {
		let clock = VirtualClock::new();

		let outcome = controller(&clock)
			.run_with_fallback(
				"extract",
				|_| async { Err::<String, _>(TaskError::StabilizationTimeout { elapsed_ms: 10 }) },
				quiet,
				|| async { Ok("last visible answer".to_string()) },
			)
			.await
			.unwrap();

		assert_eq!(outcome.value, "last visible answer");
		assert_eq!(outcome.attempts, 3);
		assert!(outcome.used_fallback);
	}

	#[tokio::test]
	async fn empty_fallback_reports_last_error() {
		let clock = VirtualClock::new();

		let failure = controller(&clock)
			.run_with_fallback(
				"extract",
				|attempt| async move { Err::<String, _>(TaskError::Extraction(format!("attempt {attempt}"))) },
				quiet,
				|| async { Err(TaskError::Extraction("nothing rendered".into())) },
			)
			.await
			.unwrap_err();

		assert_eq!(failure.attempts, 3);
		assert_eq!(failure.error, TaskError::Extraction("attempt 3".into()));
	}
}
