//! Units of work handed to the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::session::SessionKey;

/// Mode toggled by the `-sdsk` role suffix. Uses the slower stabilization profile.
pub const DEEP_THINKING: &str = "deep-thinking";
/// Mode toggled by the `-lwss` role suffix.
pub const WEB_SEARCH: &str = "web-search";

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// Generates a process-unique id of the form `task-<millis>-<seq>`.
	pub fn generate() -> Self {
		let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
		let seq = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
		Self(format!("task-{millis}-{seq}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
	#[default]
	Generate,
	/// Reports whether the session is signed in instead of submitting a prompt.
	CheckLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
	Queued,
	Running,
	Succeeded,
	Failed,
	Deduplicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlag {
	pub name: String,
	pub enabled: bool,
}

/// Provider mode toggles, applied in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeFlags(Vec<ModeFlag>);

impl ModeFlags {
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets `name`, replacing an earlier value in place.
	pub fn set(&mut self, name: impl Into<String>, enabled: bool) {
		let name = name.into();
		match self.0.iter_mut().find(|flag| flag.name == name) {
			Some(flag) => flag.enabled = enabled,
			None => self.0.push(ModeFlag { name, enabled }),
		}
	}

	pub fn with(mut self, name: impl Into<String>, enabled: bool) -> Self {
		self.set(name, enabled);
		self
	}

	pub fn get(&self, name: &str) -> Option<bool> {
		self.0.iter().find(|flag| flag.name == name).map(|flag| flag.enabled)
	}

	pub fn is_deep_thinking(&self) -> bool {
		self.get(DEEP_THINKING).unwrap_or(false)
	}

	pub fn iter(&self) -> impl Iterator<Item = &ModeFlag> {
		self.0.iter()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// A single prompt against a single provider on behalf of a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
	pub id: TaskId,
	pub kind: TaskKind,
	pub user_id: String,
	pub provider: String,
	/// Display name used in outbound messages. Defaults to the provider key.
	pub ai_name: String,
	pub prompt: String,
	pub modes: ModeFlags,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dedup_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conversation_id: Option<String>,
	/// Outbound message `type` this task answers with.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_type: Option<String>,
	pub submitted_at: SystemTime,
}

impl Task {
	pub fn generate(user_id: impl Into<String>, provider: impl Into<String>, prompt: impl Into<String>) -> Self {
		let provider = provider.into();
		Self {
			id: TaskId::generate(),
			kind: TaskKind::Generate,
			user_id: user_id.into(),
			ai_name: provider.clone(),
			provider,
			prompt: prompt.into(),
			modes: ModeFlags::new(),
			dedup_key: None,
			conversation_id: None,
			channel_type: None,
			submitted_at: SystemTime::now(),
		}
	}

	pub fn check_login(user_id: impl Into<String>, provider: impl Into<String>) -> Self {
		let mut task = Self::generate(user_id, provider, "");
		task.kind = TaskKind::CheckLogin;
		task
	}

	pub fn with_id(mut self, id: TaskId) -> Self {
		self.id = id;
		self
	}

	pub fn with_ai_name(mut self, ai_name: impl Into<String>) -> Self {
		self.ai_name = ai_name.into();
		self
	}

	pub fn with_mode(mut self, name: impl Into<String>, enabled: bool) -> Self {
		self.modes.set(name, enabled);
		self
	}

	pub fn with_modes(mut self, modes: ModeFlags) -> Self {
		self.modes = modes;
		self
	}

	pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
		self.dedup_key = Some(key.into());
		self
	}

	pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
		self.conversation_id = Some(conversation_id.into());
		self
	}

	pub fn with_channel_type(mut self, channel_type: impl Into<String>) -> Self {
		self.channel_type = Some(channel_type.into());
		self
	}

	pub fn session_key(&self) -> SessionKey {
		SessionKey::new(&self.user_id, &self.provider)
	}

	/// Key used when the caller asks for deduplication without naming one:
	/// identical prompts from the same user collapse.
	pub fn default_dedup_key(&self) -> String {
		format!("{}:{}", self.user_id, self.prompt)
	}
}
