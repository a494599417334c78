//! Per-task execution states.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Linear progression of a task; any state may jump to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
	Init,
	Navigated,
	PromptSubmitted,
	AwaitingStabilization,
	Extracted,
	ShareLinkFetched,
	Persisted,
	Completed,
	Failed,
}

impl TaskState {
	pub fn is_terminal(self) -> bool {
		matches!(self, TaskState::Completed | TaskState::Failed)
	}

	/// Whether moving from `self` to `next` is a legal transition.
	pub fn can_advance_to(self, next: TaskState) -> bool {
		use TaskState::*;
		if self.is_terminal() {
			return false;
		}
		match next {
			Failed => true,
			// Retries re-enter stabilization from an earlier attempt.
			AwaitingStabilization => matches!(self, PromptSubmitted | AwaitingStabilization),
			_ => matches!(
				(self, next),
				(Init, Navigated)
					| (Navigated, PromptSubmitted)
					| (Extracted, ShareLinkFetched)
					| (ShareLinkFetched, Persisted)
					| (Persisted, Completed)
					| (AwaitingStabilization, Extracted)
					// Login checks skip straight to completion once the page is up.
					| (Navigated, Completed)
			),
		}
	}
}

impl fmt::Display for TaskState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Records the states a task passed through.
#[derive(Debug)]
pub struct StateTrail {
	states: Mutex<Vec<TaskState>>,
}

impl StateTrail {
	pub fn new() -> Self {
		Self {
			states: Mutex::new(vec![TaskState::Init]),
		}
	}

	pub fn current(&self) -> TaskState {
		self.states.lock().last().copied().unwrap_or(TaskState::Init)
	}

	/// Appends `next`. Returns false and leaves the trail unchanged when the
	/// transition is illegal.
	pub fn enter(&self, next: TaskState) -> bool {
		let mut states = self.states.lock();
		let current = states.last().copied().unwrap_or(TaskState::Init);
		if !current.can_advance_to(next) {
			tracing::warn!(target = "cube.task", from = %current, to = %next, "illegal state transition ignored");
			return false;
		}
		states.push(next);
		true
	}

	pub fn snapshot(&self) -> Vec<TaskState> {
		self.states.lock().clone()
	}
}

impl Default for StateTrail {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn happy_path_is_linear() {
		let trail = StateTrail::new();
		for state in [
			TaskState::Navigated,
			TaskState::PromptSubmitted,
			TaskState::AwaitingStabilization,
			TaskState::Extracted,
			TaskState::ShareLinkFetched,
			TaskState::Persisted,
			TaskState::Completed,
		] {
			assert!(trail.enter(state), "rejected {state}");
		}
		assert_eq!(trail.current(), TaskState::Completed);
	}

	#[test]
	fn stabilization_may_repeat_for_retries() {
		let trail = StateTrail::new();
		trail.enter(TaskState::Navigated);
		trail.enter(TaskState::PromptSubmitted);
		assert!(trail.enter(TaskState::AwaitingStabilization));
		assert!(trail.enter(TaskState::AwaitingStabilization));
		assert_eq!(trail.snapshot().len(), 5);
	}

	#[test]
	fn terminal_states_are_final() {
		let trail = StateTrail::new();
		assert!(trail.enter(TaskState::Failed));
		assert!(!trail.enter(TaskState::Navigated));
		assert!(!trail.enter(TaskState::Failed));
		assert_eq!(trail.current(), TaskState::Failed);
	}

	#[test]
	fn skipping_ahead_is_rejected() {
		let trail = StateTrail::new();
		assert!(!trail.enter(TaskState::Extracted));
		assert_eq!(trail.current(), TaskState::Init);
	}
}
