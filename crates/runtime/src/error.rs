//! Error taxonomy for task execution.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a [`TaskError`], carried on failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
	SessionCreation,
	Navigation,
	StabilizationTimeout,
	ProviderUnavailable,
	ExtractionFailure,
	Clipboard,
	Transient,
	Cancelled,
	Internal,
}

impl ErrorKind {
	/// Terminal kinds are never retried.
	pub fn is_terminal(self) -> bool {
		matches!(self, ErrorKind::SessionCreation | ErrorKind::ProviderUnavailable | ErrorKind::Cancelled | ErrorKind::Internal)
	}

	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			ErrorKind::Navigation | ErrorKind::StabilizationTimeout | ErrorKind::ExtractionFailure | ErrorKind::Transient
		)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ErrorKind::SessionCreation => "SESSION_CREATION",
			ErrorKind::Navigation => "NAVIGATION",
			ErrorKind::StabilizationTimeout => "STABILIZATION_TIMEOUT",
			ErrorKind::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
			ErrorKind::ExtractionFailure => "EXTRACTION_FAILURE",
			ErrorKind::Clipboard => "CLIPBOARD",
			ErrorKind::Transient => "TRANSIENT",
			ErrorKind::Cancelled => "CANCELLED",
			ErrorKind::Internal => "INTERNAL",
		};
		f.write_str(name)
	}
}

/// Failure of a single task step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
	#[error("failed to open session for {user_id}/{provider}: {message}")]
	SessionCreation { user_id: String, provider: String, message: String },

	#[error("navigation failed: {0}")]
	Navigation(String),

	#[error("answer did not stabilize within {elapsed_ms}ms")]
	StabilizationTimeout { elapsed_ms: u64 },

	#[error("provider unavailable: {0}")]
	ProviderUnavailable(String),

	#[error("extraction failed: {0}")]
	Extraction(String),

	#[error("clipboard error: {0}")]
	Clipboard(String),

	/// The provider surface was unreadable for a moment; nothing was learned.
	#[error("transient probe error: {0}")]
	Transient(String),

	#[error("task cancelled: {0}")]
	Cancelled(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl TaskError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			TaskError::SessionCreation { .. } => ErrorKind::SessionCreation,
			TaskError::Navigation(_) => ErrorKind::Navigation,
			TaskError::StabilizationTimeout { .. } => ErrorKind::StabilizationTimeout,
			TaskError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
			TaskError::Extraction(_) => ErrorKind::ExtractionFailure,
			TaskError::Clipboard(_) => ErrorKind::Clipboard,
			TaskError::Transient(_) => ErrorKind::Transient,
			TaskError::Cancelled(_) => ErrorKind::Cancelled,
			TaskError::Internal(_) => ErrorKind::Internal,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.kind().is_terminal()
	}

	pub fn is_retryable(&self) -> bool {
		self.kind().is_retryable()
	}
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;
