//! Terminal outcome of a task.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TaskError};
use crate::state::TaskState;
use crate::task::{Task, TaskId, TaskKind, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultStatus {
	Succeeded,
	Failed,
}

impl From<ResultStatus> for TaskStatus {
	fn from(status: ResultStatus) -> Self {
		match status {
			ResultStatus::Succeeded => TaskStatus::Succeeded,
			ResultStatus::Failed => TaskStatus::Failed,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
	pub task_id: TaskId,
	pub kind: TaskKind,
	pub user_id: String,
	pub provider: String,
	pub ai_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_type: Option<String>,
	pub status: ResultStatus,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub share_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<ErrorKind>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub attempt_count: u32,
	#[serde(default)]
	pub used_fallback: bool,
	pub duration_ms: u64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub states: Vec<TaskState>,
}

impl TaskResult {
	pub fn is_success(&self) -> bool {
		self.status == ResultStatus::Succeeded
	}

	/// Succeeded with something worth showing or persisting.
	pub fn has_content(&self) -> bool {
		self.is_success() && !self.content.trim().is_empty()
	}
}

/// Builder for [`TaskResult`], seeded from the task it describes.
pub struct ResultBuilder {
	result: TaskResult,
}

impl ResultBuilder {
	pub fn new(task: &Task) -> Self {
		Self {
			result: TaskResult {
				task_id: task.id.clone(),
				kind: task.kind,
				user_id: task.user_id.clone(),
				provider: task.provider.clone(),
				ai_name: task.ai_name.clone(),
				channel_type: task.channel_type.clone(),
				status: ResultStatus::Failed,
				content: String::new(),
				share_url: None,
				image_url: None,
				conversation_id: task.conversation_id.clone(),
				error_kind: None,
				error_message: None,
				attempt_count: 0,
				used_fallback: false,
				duration_ms: 0,
				states: Vec::new(),
			},
		}
	}

	pub fn content(mut self, content: impl Into<String>) -> Self {
		self.result.status = ResultStatus::Succeeded;
		self.result.content = content.into();
		self
	}

	pub fn error(mut self, error: &TaskError) -> Self {
		self.result.status = ResultStatus::Failed;
		self.result.error_kind = Some(error.kind());
		self.result.error_message = Some(error.to_string());
		self
	}

	pub fn share_url(mut self, url: Option<String>) -> Self {
		self.result.share_url = url.filter(|url| !url.is_empty());
		self
	}

	pub fn image_url(mut self, url: Option<String>) -> Self {
		self.result.image_url = url.filter(|url| !url.is_empty());
		self
	}

	pub fn conversation_id(mut self, conversation_id: Option<String>) -> Self {
		if let Some(id) = conversation_id.filter(|id| !id.is_empty()) {
			self.result.conversation_id = Some(id);
		}
		self
	}

	pub fn attempts(mut self, attempts: u32, used_fallback: bool) -> Self {
		self.result.attempt_count = attempts;
		self.result.used_fallback = used_fallback;
		self
	}

	pub fn duration_ms(mut self, duration_ms: u64) -> Self {
		self.result.duration_ms = duration_ms;
		self
	}

	pub fn states(mut self, states: Vec<TaskState>) -> Self {
		self.result.states = states;
		self
	}

	pub fn build(self) -> TaskResult {
		self.result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn content_marks_success() {
		let task = Task::generate("u-1", "deepseek", "hi").with_conversation_id("c-1");
		let result = ResultBuilder::new(&task)
			.content("hello")
			.attempts(1, false)
			.share_url(Some(String::new()))
			.conversation_id(None)
			.build();

		assert!(result.has_content());
		assert_eq!(result.share_url, None);
		assert_eq!(result.conversation_id.as_deref(), Some("c-1"));
	}

	#[test]
	fn error_records_kind_and_message() {
		let task = Task::generate("u-1", "deepseek", "hi");
		let result = ResultBuilder::new(&task).error(&TaskError::Navigation("timeout".into())).build();

		assert_eq!(result.status, ResultStatus::Failed);
		assert_eq!(result.error_kind, Some(ErrorKind::Navigation));
		assert_eq!(result.error_message.as_deref(), Some("navigation failed: timeout"));
		assert!(!result.has_content());
	}

	#[test]
	fn blank_success_has_no_content() {
		let task = Task::generate("u-1", "deepseek", "hi");
		let result = ResultBuilder::new(&task).content("  ").build();
		assert!(result.is_success());
		assert!(!result.has_content());
	}
}
