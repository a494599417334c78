//! Capability surface the engine requires from a provider backend.
//!
//! Selectors, scripts and page layout live behind this trait. The engine
//! only sequences the calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::SessionKey;

/// Opaque reference to an open browser session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
	pub id: String,
	pub key: SessionKey,
}

impl SessionHandle {
	pub fn new(id: impl Into<String>, key: SessionKey) -> Self {
		Self { id: id.into(), key }
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
	pub id: String,
	pub open_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "account")]
pub enum LoginStatus {
	LoggedIn(String),
	LoggedOut,
}

impl LoginStatus {
	/// Message body reported to the live channel: the account name, or `"false"`.
	pub fn message(&self) -> &str {
		match self {
			LoginStatus::LoggedIn(account) => account,
			LoginStatus::LoggedOut => "false",
		}
	}
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
	/// Creates the browser session backing `key`.
	async fn open(&self, key: &SessionKey) -> Result<OpenedSession>;

	/// Loads the provider page, resuming `conversation_id` when given.
	async fn navigate(&self, session: &SessionHandle, conversation_id: Option<&str>) -> Result<()>;

	async fn mode_enabled(&self, session: &SessionHandle, mode: &str) -> Result<bool>;

	async fn toggle_mode(&self, session: &SessionHandle, mode: &str) -> Result<()>;

	async fn submit_prompt(&self, session: &SessionHandle, text: &str) -> Result<()>;

	/// Reads the current answer region. `Ok(None)` means nothing rendered yet.
	async fn probe(&self, session: &SessionHandle) -> Result<Option<String>>;

	/// Returns the provider's "service unavailable" message when it is showing.
	async fn unavailable_signal(&self, session: &SessionHandle) -> Result<Option<String>>;

	/// Last-resort read of whatever answer is visible.
	async fn fallback_extract(&self, session: &SessionHandle) -> Result<Option<String>>;

	/// Makes the provider write its share link to the host clipboard.
	async fn trigger_share_link(&self, session: &SessionHandle) -> Result<()>;

	async fn read_clipboard(&self, session: &SessionHandle) -> Result<String>;

	/// PNG bytes of the current page.
	async fn screenshot(&self, session: &SessionHandle) -> Result<Vec<u8>>;

	/// Conversation identifier from the current page address, when the provider exposes one.
	async fn conversation_id(&self, _session: &SessionHandle) -> Result<Option<String>> {
		Ok(None)
	}

	async fn login_status(&self, session: &SessionHandle) -> Result<LoginStatus>;

	async fn close(&self, session: &SessionHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn login_status_message() {
		assert_eq!(LoginStatus::LoggedIn("alice".into()).message(), "alice");
		assert_eq!(LoginStatus::LoggedOut.message(), "false");
	}
}
