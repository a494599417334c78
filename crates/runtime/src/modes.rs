//! Bringing provider mode toggles into the requested state.

use tracing::{debug, warn};

use crate::driver::{ProviderDriver, SessionHandle};
use crate::error::TaskError;

/// Toggle attempts before giving up on a mode that will not flip.
pub const MAX_MODE_TOGGLES: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeOutcome {
	AlreadySet,
	Toggled { clicks: u8 },
	/// Still in the wrong state after [`MAX_MODE_TOGGLES`] toggles.
	Unconfirmed,
	/// The driver could not read or toggle the mode.
	Failed(TaskError),
}

impl ModeOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, ModeOutcome::AlreadySet | ModeOutcome::Toggled { .. })
	}
}

/// Reads the mode, toggles it when it differs from `desired`, and re-checks.
/// A mismatch after the second toggle is logged, not retried further. Mode
/// failures never fail the task.
pub async fn ensure_mode(driver: &dyn ProviderDriver, session: &SessionHandle, mode: &str, desired: bool) -> ModeOutcome {
	let mut clicks = 0u8;
	loop {
		let current = match driver.mode_enabled(session, mode).await {
			Ok(current) => current,
			Err(err) => {
				warn!(target = "cube.task", session = %session.id, mode, error = %err, "could not read mode state");
				return ModeOutcome::Failed(err);
			}
		};

		if current == desired {
			debug!(target = "cube.task", session = %session.id, mode, desired, clicks, "mode in requested state");
			return if clicks == 0 {
				ModeOutcome::AlreadySet
			} else {
				ModeOutcome::Toggled { clicks }
			};
		}

		if clicks >= MAX_MODE_TOGGLES {
			warn!(target = "cube.task", session = %session.id, mode, desired, "mode did not switch after retry");
			return ModeOutcome::Unconfirmed;
		}

		if let Err(err) = driver.toggle_mode(session, mode).await {
			warn!(target = "cube.task", session = %session.id, mode, error = %err, "mode toggle failed");
			return ModeOutcome::Failed(err);
		}
		clicks += 1;
	}
}
