//! [`ProviderDriver`] backed by the external automation daemon.
//!
//! Every capability becomes one newline-terminated JSON request on a fresh
//! connection, answered by one JSON line. The daemon owns the browser and
//! all provider selectors; this side only maps frames to engine types.
//! A round trip that outlives the request timeout is reported as transient.

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cube_protocol::{DriverErrorCode, DriverRequest, DriverResponse, decode_bytes};
use cube_runtime::{LoginStatus, OpenedSession, ProviderDriver, SessionHandle, SessionKey, TaskError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::CubeError;

type TaskResult<T> = cube_runtime::Result<T>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEndpoint {
	#[cfg(unix)]
	Unix(PathBuf),
	Tcp(String),
}

impl DriverEndpoint {
	/// Parses `unix:/path`, `tcp:host:port`, or `host:port`. `None` selects
	/// the daemon's well-known address.
	pub fn parse(raw: Option<&str>) -> Result<Self, CubeError> {
		let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
			return Ok(Self::default());
		};
		if let Some(path) = raw.strip_prefix("unix:") {
			#[cfg(unix)]
			return Ok(Self::Unix(PathBuf::from(path)));
			#[cfg(not(unix))]
			return Err(CubeError::Context(format!("unix socket endpoints are not supported here: {path}")));
		}
		let address = raw.strip_prefix("tcp:").unwrap_or(raw);
		if !address.contains(':') {
			return Err(CubeError::Context(format!("driver endpoint {raw:?} must be host:port")));
		}
		Ok(Self::Tcp(address.to_string()))
	}
}

impl Default for DriverEndpoint {
	fn default() -> Self {
		#[cfg(unix)]
		return Self::Unix(PathBuf::from(cube_protocol::DRIVER_SOCKET));
		#[cfg(not(unix))]
		return Self::Tcp(format!("127.0.0.1:{}", cube_protocol::DRIVER_TCP_PORT));
	}
}

impl fmt::Display for DriverEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			#[cfg(unix)]
			DriverEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
			DriverEndpoint::Tcp(address) => write!(f, "tcp:{address}"),
		}
	}
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct DaemonDriver {
	endpoint: DriverEndpoint,
	request_timeout: Duration,
}

impl DaemonDriver {
	pub fn new(endpoint: DriverEndpoint) -> Self {
		Self {
			endpoint,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	pub fn endpoint(&self) -> &DriverEndpoint {
		&self.endpoint
	}

	/// Returns `true` when the daemon answers a ping.
	pub async fn ping(&self) -> bool {
		matches!(self.call(DriverRequest::Ping).await, Ok(DriverResponse::Pong))
	}

	async fn call(&self, request: DriverRequest) -> TaskResult<DriverResponse> {
		let op = request.op();
		debug!(target = "cube.driver", op, endpoint = %self.endpoint, "daemon request");
		let round_trip = async {
			match &self.endpoint {
				#[cfg(unix)]
				DriverEndpoint::Unix(path) => exchange(UnixStream::connect(path).await?, &request).await,
				DriverEndpoint::Tcp(address) => exchange(TcpStream::connect(address.as_str()).await?, &request).await,
			}
		};
		let Ok(response) = tokio::time::timeout(self.request_timeout, round_trip).await else {
			let timeout_ms = self.request_timeout.as_millis() as u64;
			warn!(target = "cube.driver", op, endpoint = %self.endpoint, timeout_ms, "daemon request timed out");
			return Err(TaskError::Transient(format!("automation daemon {op} timed out after {timeout_ms}ms")));
		};

		match response {
			Ok(DriverResponse::Error { code, message }) => {
				debug!(target = "cube.driver", op, ?code, message = %message, "daemon reported failure");
				Err(error_from_code(code, message))
			}
			Ok(response) => Ok(response),
			Err(err) => {
				warn!(target = "cube.driver", op, endpoint = %self.endpoint, error = %err, "daemon unreachable");
				Err(TaskError::Transient(format!("automation daemon {op} failed: {err}")))
			}
		}
	}

	async fn call_ok(&self, request: DriverRequest) -> TaskResult<()> {
		let op = request.op();
		match self.call(request).await? {
			DriverResponse::Ok => Ok(()),
			other => Err(unexpected(op, &other)),
		}
	}

	async fn call_text(&self, request: DriverRequest) -> TaskResult<Option<String>> {
		let op = request.op();
		match self.call(request).await? {
			DriverResponse::Text { value } => Ok(value),
			DriverResponse::Ok => Ok(None),
			other => Err(unexpected(op, &other)),
		}
	}
}

async fn exchange<S>(mut stream: S, request: &DriverRequest) -> std::io::Result<DriverResponse>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let payload = serde_json::to_string(request)?;
	stream.write_all(format!("{payload}\n").as_bytes()).await?;
	stream.flush().await?;

	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	if reader.read_line(&mut line).await? == 0 {
		return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "daemon closed the connection"));
	}
	Ok(serde_json::from_str(&line)?)
}

fn error_from_code(code: DriverErrorCode, message: String) -> TaskError {
	match code {
		DriverErrorCode::Navigation => TaskError::Navigation(message),
		DriverErrorCode::Extraction => TaskError::Extraction(message),
		DriverErrorCode::Unavailable => TaskError::ProviderUnavailable(message),
		DriverErrorCode::Clipboard => TaskError::Clipboard(message),
		DriverErrorCode::Transient => TaskError::Transient(message),
		DriverErrorCode::SessionCreation | DriverErrorCode::Unsupported | DriverErrorCode::Internal => TaskError::Internal(message),
	}
}

fn unexpected(op: &str, response: &DriverResponse) -> TaskError {
	TaskError::Internal(format!("unexpected daemon response to {op}: {response:?}"))
}

#[async_trait]
impl ProviderDriver for DaemonDriver {
	async fn open(&self, key: &SessionKey) -> TaskResult<OpenedSession> {
		let request = DriverRequest::Open {
			user_id: key.user_id.clone(),
			provider: key.provider.clone(),
		};
		match self.call(request).await? {
			DriverResponse::Opened { session, open_pages } => Ok(OpenedSession { id: session, open_pages }),
			other => Err(unexpected("open", &other)),
		}
	}

	async fn navigate(&self, session: &SessionHandle, conversation_id: Option<&str>) -> TaskResult<()> {
		self.call_ok(DriverRequest::Navigate {
			session: session.id.clone(),
			conversation_id: conversation_id.map(str::to_string),
		})
		.await
	}

	async fn mode_enabled(&self, session: &SessionHandle, mode: &str) -> TaskResult<bool> {
		let request = DriverRequest::ModeEnabled {
			session: session.id.clone(),
			mode: mode.to_string(),
		};
		match self.call(request).await? {
			DriverResponse::Flag { value } => Ok(value),
			other => Err(unexpected("mode_enabled", &other)),
		}
	}

	async fn toggle_mode(&self, session: &SessionHandle, mode: &str) -> TaskResult<()> {
		self.call_ok(DriverRequest::ToggleMode {
			session: session.id.clone(),
			mode: mode.to_string(),
		})
		.await
	}

	async fn submit_prompt(&self, session: &SessionHandle, text: &str) -> TaskResult<()> {
		self.call_ok(DriverRequest::SubmitPrompt {
			session: session.id.clone(),
			text: text.to_string(),
		})
		.await
	}

	/// A daemon-side internal failure while reading is one unreadable poll,
	/// not the end of the task.
	async fn probe(&self, session: &SessionHandle) -> TaskResult<Option<String>> {
		match self.call_text(DriverRequest::Probe { session: session.id.clone() }).await {
			Err(TaskError::Internal(message)) => {
				debug!(target = "cube.driver", session = %session.id, message = %message, "probe failed inside the daemon");
				Err(TaskError::Transient(message))
			}
			other => other,
		}
	}

	async fn unavailable_signal(&self, session: &SessionHandle) -> TaskResult<Option<String>> {
		self.call_text(DriverRequest::UnavailableSignal { session: session.id.clone() }).await
	}

	async fn fallback_extract(&self, session: &SessionHandle) -> TaskResult<Option<String>> {
		self.call_text(DriverRequest::FallbackExtract { session: session.id.clone() }).await
	}

	async fn trigger_share_link(&self, session: &SessionHandle) -> TaskResult<()> {
		self.call_ok(DriverRequest::TriggerShareLink { session: session.id.clone() }).await
	}

	async fn read_clipboard(&self, session: &SessionHandle) -> TaskResult<String> {
		Ok(self.call_text(DriverRequest::ReadClipboard { session: session.id.clone() }).await?.unwrap_or_default())
	}

	async fn screenshot(&self, session: &SessionHandle) -> TaskResult<Vec<u8>> {
		match self.call(DriverRequest::Screenshot { session: session.id.clone() }).await? {
			DriverResponse::Image { data } => decode_bytes(&data).map_err(|err| TaskError::Internal(format!("screenshot payload: {err}"))),
			other => Err(unexpected("screenshot", &other)),
		}
	}

	async fn conversation_id(&self, session: &SessionHandle) -> TaskResult<Option<String>> {
		match self.call_text(DriverRequest::ConversationId { session: session.id.clone() }).await {
			Err(TaskError::Internal(message)) => {
				debug!(target = "cube.driver", session = %session.id, message = %message, "conversation id unavailable");
				Ok(None)
			}
			other => other,
		}
	}

	async fn login_status(&self, session: &SessionHandle) -> TaskResult<LoginStatus> {
		let account = self.call_text(DriverRequest::LoginStatus { session: session.id.clone() }).await?;
		Ok(match account.filter(|account| !account.is_empty() && account != "false") {
			Some(account) => LoginStatus::LoggedIn(account),
			None => LoginStatus::LoggedOut,
		})
	}

	async fn close(&self, session: &SessionHandle) -> TaskResult<()> {
		self.call_ok(DriverRequest::Close { session: session.id.clone() }).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_forms() {
		assert_eq!(DriverEndpoint::parse(Some("tcp:127.0.0.1:4000")).unwrap(), DriverEndpoint::Tcp("127.0.0.1:4000".into()));
		assert_eq!(DriverEndpoint::parse(Some("localhost:19322")).unwrap(), DriverEndpoint::Tcp("localhost:19322".into()));
		assert_eq!(DriverEndpoint::parse(Some("  ")).unwrap(), DriverEndpoint::default());
		assert!(DriverEndpoint::parse(Some("localhost")).is_err());
	}

	#[cfg(unix)]
	#[test]
	fn unix_endpoint_round_trips_through_display() {
		let endpoint = DriverEndpoint::parse(Some("unix:/run/cube.sock")).unwrap();
		assert_eq!(endpoint, DriverEndpoint::Unix(PathBuf::from("/run/cube.sock")));
		assert_eq!(endpoint.to_string(), "unix:/run/cube.sock");
		assert_eq!(DriverEndpoint::default().to_string(), format!("unix:{}", cube_protocol::DRIVER_SOCKET));
	}

	#[test]
	fn daemon_codes_map_to_engine_errors() {
		assert!(matches!(error_from_code(DriverErrorCode::Unavailable, "busy".into()), TaskError::ProviderUnavailable(_)));
		assert!(error_from_code(DriverErrorCode::Navigation, "x".into()).is_retryable());
		assert!(error_from_code(DriverErrorCode::Extraction, "x".into()).is_retryable());
		assert!(error_from_code(DriverErrorCode::Internal, "x".into()).is_terminal());
	}
}
