//! Draft records accepted by the persistence backend.

use serde::{Deserialize, Serialize};

/// Path appended to the persistence base URL when saving drafts.
pub const SAVE_DRAFT_PATH: &str = "/saveDraftContent";

/// Finished answer handed to the persistence backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRecord {
	pub user_id: String,
	pub ai_name: String,
	pub draft_content: String,
	#[serde(default)]
	pub share_url: String,
	#[serde(default)]
	pub share_img_url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
}
