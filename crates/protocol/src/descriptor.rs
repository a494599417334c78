//! Inbound task descriptors carried on the event channel.

use serde::{Deserialize, Serialize};

/// Prefix of descriptor `type` values that request a login-status check.
///
/// The provider key follows the colon, e.g. `CHECK_LOGIN:deepseek`.
pub const CHECK_LOGIN_PREFIX: &str = "CHECK_LOGIN:";

/// JSON task descriptor pushed by the upstream service.
///
/// ```json
/// {
///   "userId": "u-1",
///   "taskId": "6c0f…",
///   "type": "openAI",
///   "userPrompt": "summarize this",
///   "roles": "deepseek,ds-sdsk"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
	#[serde(default)]
	pub user_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	/// Channel type echoed back on every outbound message for this descriptor.
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, alias = "prompt", skip_serializing_if = "Option::is_none")]
	pub user_prompt: Option<String>,
	/// Comma-separated role flags selecting providers and modes.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub roles: Option<String>,
	/// Explicit provider, used instead of role flags when present.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub provider_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ai_name: Option<String>,
	/// Existing provider conversation to resume.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<String>,
	/// Collapse duplicate submissions of the same prompt.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dedup: Option<bool>,
}

impl TaskDescriptor {
	/// Parses a descriptor from a raw channel frame.
	pub fn from_json(raw: &str) -> serde_json::Result<Self> {
		serde_json::from_str(raw)
	}

	/// Returns the trimmed, non-empty role flags in declaration order.
	pub fn role_flags(&self) -> Vec<&str> {
		self.roles
			.as_deref()
			.map(|roles| roles.split(',').map(str::trim).filter(|flag| !flag.is_empty()).collect())
			.unwrap_or_default()
	}

	/// Returns `true` when `flag` is one of the role flags.
	pub fn has_role(&self, flag: &str) -> bool {
		self.role_flags().contains(&flag)
	}

	/// Returns the prompt text, or an empty string when absent.
	pub fn prompt(&self) -> &str {
		self.user_prompt.as_deref().unwrap_or_default()
	}

	/// Returns the provider addressed by a `CHECK_LOGIN:<provider>` type, if any.
	pub fn login_check_provider(&self) -> Option<&str> {
		self.kind
			.as_deref()
			.and_then(|kind| kind.strip_prefix(CHECK_LOGIN_PREFIX))
			.map(str::trim)
			.filter(|provider| !provider.is_empty())
	}
}
