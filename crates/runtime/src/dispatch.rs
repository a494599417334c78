//! Delivering outcomes to the live channel and the persistence backend.
//!
//! Nothing here can change a task's status: every delivery failure is
//! counted and logged, then dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use cube_protocol::{DEFAULT_RESULT_TYPE, DraftRecord, LOGIN_STATUS_TYPE, OutboundMessage, TASK_LOG_TYPE, TASK_SCREENSHOT_TYPE, png_data_url};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::result::TaskResult;
use crate::task::{Task, TaskKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
	#[error("live channel is disconnected")]
	Disconnected,

	#[error("live channel push failed: {0}")]
	Channel(String),

	#[error("persistence failed: {0}")]
	Persistence(String),
}

/// Outbound half of the event channel.
#[async_trait]
pub trait LiveChannel: Send + Sync {
	fn is_connected(&self) -> bool;

	async fn push(&self, message: OutboundMessage) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait Persistence: Send + Sync {
	async fn save_draft(&self, record: DraftRecord) -> Result<(), DispatchError>;
}

/// Persistence that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

#[async_trait]
impl Persistence for NullPersistence {
	async fn save_draft(&self, _record: DraftRecord) -> Result<(), DispatchError> {
		Ok(())
	}
}

/// In-memory channel that keeps every pushed message. Can be flipped to
/// disconnected to exercise the drop path.
#[derive(Debug)]
pub struct MemoryChannel {
	connected: AtomicBool,
	messages: Mutex<Vec<OutboundMessage>>,
}

impl MemoryChannel {
	pub fn new() -> Self {
		Self {
			connected: AtomicBool::new(true),
			messages: Mutex::new(Vec::new()),
		}
	}

	pub fn set_connected(&self, connected: bool) {
		self.connected.store(connected, Ordering::SeqCst);
	}

	pub fn messages(&self) -> Vec<OutboundMessage> {
		self.messages.lock().clone()
	}

	/// Messages of the given outbound `type`.
	pub fn messages_of(&self, kind: &str) -> Vec<OutboundMessage> {
		self.messages.lock().iter().filter(|message| message.kind == kind).cloned().collect()
	}

	pub fn take(&self) -> Vec<OutboundMessage> {
		std::mem::take(&mut *self.messages.lock())
	}
}

impl Default for MemoryChannel {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl LiveChannel for MemoryChannel {
	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn push(&self, message: OutboundMessage) -> Result<(), DispatchError> {
		if !self.is_connected() {
			return Err(DispatchError::Disconnected);
		}
		self.messages.lock().push(message);
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
	pub delivered: u64,
	pub dropped: u64,
	pub persisted: u64,
	pub persist_failures: u64,
}

#[derive(Default)]
struct Counters {
	delivered: AtomicU64,
	dropped: AtomicU64,
	persisted: AtomicU64,
	persist_failures: AtomicU64,
}

pub struct ResultDispatcher {
	channel: Arc<dyn LiveChannel>,
	persistence: Arc<dyn Persistence>,
	counters: Arc<Counters>,
}

impl ResultDispatcher {
	pub fn new(channel: Arc<dyn LiveChannel>, persistence: Arc<dyn Persistence>) -> Self {
		Self {
			channel,
			persistence,
			counters: Arc::new(Counters::default()),
		}
	}

	/// Outbound message describing `result`.
	pub fn outbound_for(result: &TaskResult) -> OutboundMessage {
		let task_id = result.task_id.as_str();
		if result.kind == TaskKind::CheckLogin {
			let status = if result.is_success() { result.content.as_str() } else { "false" };
			return OutboundMessage::new(LOGIN_STATUS_TYPE, &result.user_id, &result.ai_name, task_id, status).with_status(status);
		}

		let kind = result.channel_type.as_deref().unwrap_or(DEFAULT_RESULT_TYPE);
		if !result.has_content() {
			return OutboundMessage::new(kind, &result.user_id, &result.ai_name, task_id, failure_message(&result.ai_name));
		}
		OutboundMessage::new(kind, &result.user_id, &result.ai_name, task_id, &result.content)
			.with_share_url(result.share_url.clone())
			.with_share_img_url(result.image_url.clone())
			.with_conversation_id(result.conversation_id.clone())
	}

	/// Pushes `result` to the live channel. A disconnected channel drops it.
	pub async fn deliver(&self, result: &TaskResult) {
		let message = Self::outbound_for(result);
		self.push(message, "result").await;
	}

	/// Hands a successful answer to persistence without waiting for it.
	/// Returns `None` when the result is not persisted at all.
	pub fn persist(&self, result: &TaskResult) -> Option<JoinHandle<()>> {
		if result.kind != TaskKind::Generate || !result.has_content() {
			return None;
		}
		let record = DraftRecord {
			user_id: result.user_id.clone(),
			ai_name: result.ai_name.clone(),
			draft_content: result.content.clone(),
			share_url: result.share_url.clone().unwrap_or_default(),
			share_img_url: result.image_url.clone().unwrap_or_default(),
			task_id: Some(result.task_id.to_string()),
		};
		let persistence = Arc::clone(&self.persistence);
		let counters = Arc::clone(&self.counters);
		let task_id = result.task_id.clone();
		Some(tokio::spawn(async move {
			match persistence.save_draft(record).await {
				Ok(()) => {
					counters.persisted.fetch_add(1, Ordering::Relaxed);
					debug!(target = "cube.dispatch", task_id = %task_id, "draft persisted");
				}
				Err(err) => {
					counters.persist_failures.fetch_add(1, Ordering::Relaxed);
					warn!(target = "cube.dispatch", task_id = %task_id, error = %err, "draft persistence failed");
				}
			}
		}))
	}

	/// Human-readable progress line for the task's owner.
	pub async fn task_log(&self, task: &Task, line: &str) {
		let message = OutboundMessage::new(TASK_LOG_TYPE, &task.user_id, &task.ai_name, task.id.as_str(), line);
		self.push(message, "task_log").await;
	}

	pub async fn progress_screenshot(&self, task: &Task, png: &[u8]) {
		let message = OutboundMessage::new(TASK_SCREENSHOT_TYPE, &task.user_id, &task.ai_name, task.id.as_str(), png_data_url(png));
		self.push(message, "screenshot").await;
	}

	async fn push(&self, message: OutboundMessage, what: &'static str) {
		if !self.channel.is_connected() {
			self.counters.dropped.fetch_add(1, Ordering::Relaxed);
			debug!(target = "cube.dispatch", task_id = %message.task_id, what, "channel disconnected, message dropped");
			return;
		}
		let task_id = message.task_id.clone();
		match self.channel.push(message).await {
			Ok(()) => {
				self.counters.delivered.fetch_add(1, Ordering::Relaxed);
			}
			Err(err) => {
				self.counters.dropped.fetch_add(1, Ordering::Relaxed);
				warn!(target = "cube.dispatch", task_id = %task_id, what, error = %err, "push failed, message dropped");
			}
		}
	}

	pub fn stats(&self) -> DispatchStats {
		DispatchStats {
			delivered: self.counters.delivered.load(Ordering::Relaxed),
			dropped: self.counters.dropped.load(Ordering::Relaxed),
			persisted: self.counters.persisted.load(Ordering::Relaxed),
			persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
		}
	}
}

/// Message sent when a task fails or produced nothing.
pub fn failure_message(ai_name: &str) -> String {
	format!("{ai_name} failed, please retry later")
}
