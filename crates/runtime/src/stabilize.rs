//! Deciding when a streamed answer has finished rendering.
//!
//! [`Stabilizer`] is the pure decision: feed it snapshots with their read
//! time and it says `Pending`, `Done` or `TimedOut`. [`await_stable`] drives
//! it against a [`SnapshotSource`] with an injected [`Clock`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, within};
use crate::error::{ErrorKind, Result, TaskError};

/// Polling parameters for one stabilization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StabilizationPolicy {
	pub poll_interval_ms: u64,
	/// Consecutive identical reads after the first that declare completion.
	pub required_stable_reads: u32,
	pub timeout_ms: u64,
	/// Initial wait before the first poll, letting the provider start streaming.
	pub settle_delay_ms: u64,
}

impl StabilizationPolicy {
	pub fn normal() -> Self {
		Self {
			poll_interval_ms: 300,
			required_stable_reads: 1,
			timeout_ms: 600_000,
			settle_delay_ms: 2_000,
		}
	}

	pub fn deep_thinking() -> Self {
		Self {
			required_stable_reads: 2,
			timeout_ms: 1_200_000,
			..Self::normal()
		}
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval_ms = interval.as_millis() as u64;
		self
	}

	pub fn with_settle_delay(mut self, delay: Duration) -> Self {
		self.settle_delay_ms = delay.as_millis() as u64;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout_ms = timeout.as_millis() as u64;
		self
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}

	pub fn settle_delay(&self) -> Duration {
		Duration::from_millis(self.settle_delay_ms)
	}

	pub fn stable_reads(&self) -> u32 {
		self.required_stable_reads.max(1)
	}
}

impl Default for StabilizationPolicy {
	fn default() -> Self {
		Self::normal()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
	Pending,
	Done(String),
	TimedOut { last_snapshot: Option<String> },
}

/// Tracks consecutive identical reads of the answer region.
#[derive(Debug, Clone)]
pub struct Stabilizer {
	policy: StabilizationPolicy,
	started_at: Instant,
	last_snapshot: Option<String>,
	stable_count: u32,
	polls: u32,
}

impl Stabilizer {
	pub fn new(policy: StabilizationPolicy, started_at: Instant) -> Self {
		Self {
			policy,
			started_at,
			last_snapshot: None,
			stable_count: 0,
			polls: 0,
		}
	}

	/// Records one read taken at `now`. `None` and blank snapshots carry no
	/// information and leave the counter alone.
	pub fn observe(&mut self, snapshot: Option<&str>, now: Instant) -> Progress {
		self.polls += 1;

		if let Some(text) = snapshot.filter(|text| !text.trim().is_empty()) {
			if self.last_snapshot.as_deref() == Some(text) {
				self.stable_count += 1;
				if self.stable_count >= self.policy.stable_reads() {
					return Progress::Done(text.to_string());
				}
			} else {
				self.stable_count = 0;
				self.last_snapshot = Some(text.to_string());
			}
		}

		if now.saturating_duration_since(self.started_at) > self.policy.timeout() {
			return Progress::TimedOut {
				last_snapshot: self.last_snapshot.clone(),
			};
		}
		Progress::Pending
	}

	pub fn polls(&self) -> u32 {
		self.polls
	}

	pub fn stable_count(&self) -> u32 {
		self.stable_count
	}

	pub fn last_snapshot(&self) -> Option<&str> {
		self.last_snapshot.as_deref()
	}
}

/// Where snapshots come from during [`await_stable`].
#[async_trait]
pub trait SnapshotSource: Send {
	/// `Ok(None)` and `Err(TaskError::Transient)` mean "nothing learned".
	/// Any other error ends the run.
	async fn probe(&mut self) -> Result<Option<String>>;

	/// Called after every poll that did not finish the run.
	async fn on_poll(&mut self, _poll: u32, _elapsed: Duration) {}
}

/// Polls `source` until the answer holds still or the policy's ceiling passes.
pub async fn await_stable(source: &mut dyn SnapshotSource, policy: &StabilizationPolicy, clock: &dyn Clock) -> Result<String> {
	let started = clock.now();
	clock.sleep(policy.settle_delay()).await;

	let mut stabilizer = Stabilizer::new(*policy, started);
	loop {
		// A probe never outlives the policy's ceiling.
		let remaining = policy.timeout().saturating_sub(clock.elapsed_since(started));
		let Some(read) = within(clock, remaining, source.probe()).await else {
			let elapsed_ms = clock.elapsed_since(started).as_millis() as u64;
			debug!(target = "cube.stabilize", polls = stabilizer.polls(), elapsed_ms, "probe still pending at timeout");
			return Err(TaskError::StabilizationTimeout { elapsed_ms });
		};
		let snapshot = match read {
			Ok(snapshot) => snapshot,
			Err(err) if err.kind() == ErrorKind::Transient => {
				debug!(target = "cube.stabilize", error = %err, "probe unreadable, treating as no information");
				None
			}
			Err(err) => return Err(err),
		};

		let now = clock.now();
		match stabilizer.observe(snapshot.as_deref(), now) {
			Progress::Done(text) => {
				debug!(
					target = "cube.stabilize",
					polls = stabilizer.polls(),
					elapsed_ms = now.saturating_duration_since(started).as_millis() as u64,
					"answer stabilized"
				);
				return Ok(text);
			}
			Progress::TimedOut { last_snapshot } => {
				let elapsed_ms = now.saturating_duration_since(started).as_millis() as u64;
				debug!(
					target = "cube.stabilize",
					polls = stabilizer.polls(),
					elapsed_ms,
					partial_len = last_snapshot.as_ref().map_or(0, String::len),
					"stabilization timed out"
				);
				return Err(TaskError::StabilizationTimeout { elapsed_ms });
			}
			Progress::Pending => {}
		}

		source.on_poll(stabilizer.polls(), now.saturating_duration_since(started)).await;
		clock.sleep(policy.poll_interval()).await;
	}
}
