//! Frames exchanged with the browser automation daemon.
//!
//! One request per line, one response per line. The daemon owns every
//! provider-specific selector and script; these frames only name the
//! capability being invoked.

use serde::{Deserialize, Serialize};

/// Unix socket the automation daemon listens on.
#[cfg(unix)]
pub const DRIVER_SOCKET: &str = "/tmp/cube-driver.sock";
/// Localhost TCP port the automation daemon listens on.
pub const DRIVER_TCP_PORT: u16 = 19_322;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverRequest {
	Ping,
	Open { user_id: String, provider: String },
	Navigate {
		session: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		conversation_id: Option<String>,
	},
	ModeEnabled { session: String, mode: String },
	ToggleMode { session: String, mode: String },
	SubmitPrompt { session: String, text: String },
	Probe { session: String },
	UnavailableSignal { session: String },
	FallbackExtract { session: String },
	TriggerShareLink { session: String },
	ReadClipboard { session: String },
	Screenshot { session: String },
	ConversationId { session: String },
	LoginStatus { session: String },
	Close { session: String },
}

impl DriverRequest {
	/// Returns the wire name of the request, used in logs.
	pub fn op(&self) -> &'static str {
		match self {
			DriverRequest::Ping => "ping",
			DriverRequest::Open { .. } => "open",
			DriverRequest::Navigate { .. } => "navigate",
			DriverRequest::ModeEnabled { .. } => "mode_enabled",
			DriverRequest::ToggleMode { .. } => "toggle_mode",
			DriverRequest::SubmitPrompt { .. } => "submit_prompt",
			DriverRequest::Probe { .. } => "probe",
			DriverRequest::UnavailableSignal { .. } => "unavailable_signal",
			DriverRequest::FallbackExtract { .. } => "fallback_extract",
			DriverRequest::TriggerShareLink { .. } => "trigger_share_link",
			DriverRequest::ReadClipboard { .. } => "read_clipboard",
			DriverRequest::Screenshot { .. } => "screenshot",
			DriverRequest::ConversationId { .. } => "conversation_id",
			DriverRequest::LoginStatus { .. } => "login_status",
			DriverRequest::Close { .. } => "close",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverResponse {
	Pong,
	Opened {
		session: String,
		#[serde(default)]
		open_pages: u32,
	},
	Flag { value: bool },
	Text {
		#[serde(default)]
		value: Option<String>,
	},
	/// Base64-encoded image bytes.
	Image { data: String },
	Ok,
	Error { code: DriverErrorCode, message: String },
}

/// Failure categories reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorCode {
	SessionCreation,
	Navigation,
	Extraction,
	Unavailable,
	Clipboard,
	/// The page was momentarily unreadable; nothing learned.
	Transient,
	Unsupported,
	Internal,
}
