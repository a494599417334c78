//! Engine tuning knobs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::stabilize::StabilizationPolicy;
use crate::task::Task;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StabilizationProfiles {
	pub normal: StabilizationPolicy,
	pub deep_thinking: StabilizationPolicy,
}

impl Default for StabilizationProfiles {
	fn default() -> Self {
		Self {
			normal: StabilizationPolicy::normal(),
			deep_thinking: StabilizationPolicy::deep_thinking(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
	/// Maximum concurrently executing tasks.
	pub workers: usize,
	/// Tasks allowed to wait for a worker before submissions are rejected.
	pub queue_capacity: usize,
	pub stabilization: StabilizationProfiles,
	/// Poll interval overrides keyed by provider.
	#[serde(rename = "providerPollIntervals")]
	pub provider_poll_intervals_ms: BTreeMap<String, u64>,
	pub retry: RetryPolicy,
	pub dedup_window_ms: u64,
	pub session_idle_timeout_ms: u64,
	pub session_reap_interval_ms: u64,
	pub clipboard_wait_ms: u64,
	/// Interval between progress screenshots; disabled when absent.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress_screenshot_interval_ms: Option<u64>,
	/// Added to the worst-case extraction time to form the per-task deadline.
	pub task_deadline_slack_ms: u64,
	/// Ceiling for a single driver step outside answer polling: navigation,
	/// prompt submission, mode toggles, share link, screenshots.
	pub step_timeout_ms: u64,
	/// How long a finished task's status stays queryable.
	pub status_retention_ms: u64,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			workers: 4,
			queue_capacity: 64,
			stabilization: StabilizationProfiles::default(),
			provider_poll_intervals_ms: BTreeMap::new(),
			retry: RetryPolicy::default(),
			dedup_window_ms: 5_000,
			session_idle_timeout_ms: 1_800_000,
			session_reap_interval_ms: 60_000,
			clipboard_wait_ms: 30_000,
			progress_screenshot_interval_ms: None,
			task_deadline_slack_ms: 60_000,
			step_timeout_ms: 60_000,
			status_retention_ms: 600_000,
		}
	}
}

impl EngineConfig {
	/// Clamps values that would stall the engine.
	pub fn normalized(mut self) -> Self {
		self.workers = self.workers.max(1);
		self.queue_capacity = self.queue_capacity.max(1);
		self.retry.max_attempts = self.retry.max_attempts.max(1);
		self.stabilization.normal.poll_interval_ms = self.stabilization.normal.poll_interval_ms.max(1);
		self.stabilization.deep_thinking.poll_interval_ms = self.stabilization.deep_thinking.poll_interval_ms.max(1);
		self
	}

	/// Picks the profile for `task`'s modes and applies the provider's poll override.
	pub fn stabilization_for(&self, task: &Task) -> StabilizationPolicy {
		let mut policy = if task.modes.is_deep_thinking() {
			self.stabilization.deep_thinking
		} else {
			self.stabilization.normal
		};
		if let Some(&interval) = self.provider_poll_intervals_ms.get(&task.provider) {
			policy.poll_interval_ms = interval.max(1);
		}
		policy
	}

	/// Whole-task ceiling: every extraction attempt timing out, the delays
	/// between them, every navigation attempt hitting the step timeout, plus
	/// slack for the remaining steps and dispatch.
	pub fn task_deadline(&self, task: &Task) -> Duration {
		let policy = self.stabilization_for(task);
		let attempts = u64::from(self.retry.max_attempts.max(1));
		let per_attempt = policy.timeout_ms + policy.settle_delay_ms + policy.poll_interval_ms;
		let navigation = self.step_timeout_ms.max(1) * attempts;
		let total = per_attempt * attempts + self.retry.delay_ms * (attempts - 1) + navigation + self.task_deadline_slack_ms;
		Duration::from_millis(total)
	}

	pub fn step_timeout(&self) -> Duration {
		Duration::from_millis(self.step_timeout_ms.max(1))
	}

	pub fn status_retention(&self) -> Duration {
		Duration::from_millis(self.status_retention_ms)
	}

	pub fn dedup_window(&self) -> Duration {
		Duration::from_millis(self.dedup_window_ms)
	}

	pub fn session_idle_timeout(&self) -> Duration {
		Duration::from_millis(self.session_idle_timeout_ms)
	}

	pub fn session_reap_interval(&self) -> Duration {
		Duration::from_millis(self.session_reap_interval_ms.max(1))
	}

	pub fn clipboard_wait(&self) -> Duration {
		Duration::from_millis(self.clipboard_wait_ms)
	}

	pub fn progress_screenshot_interval(&self) -> Option<Duration> {
		self.progress_screenshot_interval_ms.filter(|&ms| ms > 0).map(Duration::from_millis)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::DEEP_THINKING;

	#[test]
	fn defaults_match_production_profile() {
		let config = EngineConfig::default();
		assert_eq!(config.workers, 4);
		assert_eq!(config.retry, RetryPolicy::default());
		assert_eq!(config.stabilization.normal.required_stable_reads, 1);
		assert_eq!(config.stabilization.deep_thinking.required_stable_reads, 2);
		assert_eq!(config.stabilization.deep_thinking.timeout(), Duration::from_secs(1_200));
	}

	#[test]
	fn partial_json_fills_defaults() {
		let config: EngineConfig = serde_json::from_str(
			r#"{"workers":8,"providerPollIntervals":{"doubao":500},"stabilization":{"normal":{"timeoutMs":1000}}}"#,
		)
		.unwrap();
		assert_eq!(config.workers, 8);
		assert_eq!(config.queue_capacity, 64);
		assert_eq!(config.stabilization.normal.timeout_ms, 1_000);
		assert_eq!(config.stabilization.normal.poll_interval_ms, 300);
		assert_eq!(config.stabilization.deep_thinking, StabilizationPolicy::deep_thinking());
		assert_eq!(config.provider_poll_intervals_ms.get("doubao"), Some(&500));
	}

	#[test]
	fn profile_follows_modes_and_provider() {
		let mut config = EngineConfig::default();
		config.provider_poll_intervals_ms.insert("doubao".into(), 800);

		let plain = Task::generate("u", "deepseek", "hi");
		let deep = Task::generate("u", "deepseek", "hi").with_mode(DEEP_THINKING, true);
		let slow = Task::generate("u", "doubao", "hi");

		assert_eq!(config.stabilization_for(&plain).required_stable_reads, 1);
		assert_eq!(config.stabilization_for(&deep).required_stable_reads, 2);
		assert_eq!(config.stabilization_for(&slow).poll_interval_ms, 800);
	}

	#[test]
	fn normalized_clamps_zero_workers() {
		let config = EngineConfig {
			workers: 0,
			queue_capacity: 0,
			..EngineConfig::default()
		}
		.normalized();
		assert_eq!(config.workers, 1);
		assert_eq!(config.queue_capacity, 1);
	}

	#[test]
	fn deadline_covers_every_attempt() {
		let config = EngineConfig::default();
		let task = Task::generate("u", "deepseek", "hi");
		let deadline = config.task_deadline(&task);
		assert!(deadline > config.stabilization.normal.timeout() * 3 + config.step_timeout() * 3);
	}

	#[test]
	fn step_and_retention_knobs_deserialize() {
		let config: EngineConfig = serde_json::from_str(r#"{"stepTimeoutMs":5000,"statusRetentionMs":0}"#).unwrap();
		assert_eq!(config.step_timeout(), Duration::from_secs(5));
		assert_eq!(config.status_retention(), Duration::ZERO);
		assert_eq!(EngineConfig::default().step_timeout(), Duration::from_secs(60));
	}
}
