//! Messages pushed back on the event channel.

use serde::{Deserialize, Serialize};

/// Outbound type used for per-task progress lines.
pub const TASK_LOG_TYPE: &str = "TASK_LOG";
/// Outbound type used for progress screenshots taken while an answer streams.
pub const TASK_SCREENSHOT_TYPE: &str = "TASK_SCREENSHOT";
/// Outbound type answering a login-status check.
pub const LOGIN_STATUS_TYPE: &str = "RETURN_LOGIN_STATUS";
/// Outbound type used when the descriptor did not carry one.
pub const DEFAULT_RESULT_TYPE: &str = "openAI";
/// Keep-alive frame type.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Result, progress, or status message addressed to `(userId, taskId)`.
///
/// ```json
/// {"type":"openAI","userId":"u-1","aiName":"DeepSeek","taskId":"t-9","message":"…"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
	#[serde(rename = "type")]
	pub kind: String,
	pub user_id: String,
	pub ai_name: String,
	pub task_id: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub share_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub share_img_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
}

impl OutboundMessage {
	pub fn new(kind: impl Into<String>, user_id: impl Into<String>, ai_name: impl Into<String>, task_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			user_id: user_id.into(),
			ai_name: ai_name.into(),
			task_id: task_id.into(),
			message: message.into(),
			..Default::default()
		}
	}

	pub fn with_share_url(mut self, url: Option<String>) -> Self {
		self.share_url = url.filter(|url| !url.is_empty());
		self
	}

	pub fn with_share_img_url(mut self, url: Option<String>) -> Self {
		self.share_img_url = url.filter(|url| !url.is_empty());
		self
	}

	pub fn with_conversation_id(mut self, id: Option<String>) -> Self {
		self.conversation_id = id;
		self
	}

	pub fn with_status(mut self, status: impl Into<String>) -> Self {
		self.status = Some(status.into());
		self
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}

/// Keep-alive frame sent periodically while the channel is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
	#[serde(rename = "type")]
	pub kind: String,
}

impl Default for Heartbeat {
	fn default() -> Self {
		Self {
			kind: HEARTBEAT_TYPE.to_string(),
		}
	}
}

impl Heartbeat {
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	/// Returns `true` when a raw frame is a heartbeat rather than a task.
	pub fn matches(raw: &str) -> bool {
		serde_json::from_str::<Heartbeat>(raw).is_ok_and(|frame| frame.kind == HEARTBEAT_TYPE)
	}
}
