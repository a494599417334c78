//! Engine runs through the daemon driver against an in-process fake daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use cube_cli::config::AppConfig;
use cube_cli::driver::{DaemonDriver, DriverEndpoint};
use cube_cli::serve::{build_engine, handle_frame};
use cube_protocol::{DriverErrorCode, DriverRequest, DriverResponse, encode_bytes};
use cube_runtime::{ErrorKind, LiveChannel, MemoryChannel, ProviderDriver, ResultStatus, RetryPolicy, SessionKey, StabilizationPolicy};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Clone, Copy)]
enum Behavior {
	Answers,
	Unavailable,
	/// The first probe fails inside the daemon, later ones answer.
	FlakyProbe,
}

fn respond(request: DriverRequest, behavior: Behavior, probes: &AtomicU32) -> DriverResponse {
	match request {
		DriverRequest::Ping => DriverResponse::Pong,
		DriverRequest::Open { .. } => DriverResponse::Opened {
			session: "d1".to_string(),
			open_pages: 1,
		},
		DriverRequest::ModeEnabled { .. } => DriverResponse::Flag { value: false },
		DriverRequest::Probe { .. } => match behavior {
			Behavior::Unavailable => DriverResponse::Error {
				code: DriverErrorCode::Unavailable,
				message: "server busy".to_string(),
			},
			Behavior::FlakyProbe if probes.fetch_add(1, Ordering::SeqCst) == 0 => DriverResponse::Error {
				code: DriverErrorCode::Internal,
				message: "evaluate failed: execution context was destroyed".to_string(),
			},
			Behavior::Answers | Behavior::FlakyProbe => DriverResponse::Text {
				value: Some("answer".to_string()),
			},
		},
		DriverRequest::UnavailableSignal { .. } | DriverRequest::FallbackExtract { .. } => DriverResponse::Text { value: None },
		DriverRequest::ReadClipboard { session } => DriverResponse::Text {
			value: Some(format!("https://share.example/{session}")),
		},
		DriverRequest::Screenshot { .. } => DriverResponse::Image { data: encode_bytes(b"png") },
		DriverRequest::ConversationId { .. } => DriverResponse::Error {
			code: DriverErrorCode::Unsupported,
			message: "no conversation ids".to_string(),
		},
		DriverRequest::LoginStatus { .. } => DriverResponse::Text {
			value: Some("alice".to_string()),
		},
		DriverRequest::Navigate { .. }
		| DriverRequest::ToggleMode { .. }
		| DriverRequest::SubmitPrompt { .. }
		| DriverRequest::TriggerShareLink { .. }
		| DriverRequest::Close { .. } => DriverResponse::Ok,
	}
}

async fn fake_daemon(behavior: Behavior) -> DriverEndpoint {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let probes = Arc::new(AtomicU32::new(0));
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let probes = Arc::clone(&probes);
			tokio::spawn(async move {
				let mut reader = BufReader::new(stream);
				let mut line = String::new();
				if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
					return;
				}
				let request: DriverRequest = serde_json::from_str(&line).unwrap();
				let response = serde_json::to_string(&respond(request, behavior, &probes)).unwrap();
				let mut stream = reader.into_inner();
				stream.write_all(format!("{response}\n").as_bytes()).await.unwrap();
			});
		}
	});
	DriverEndpoint::Tcp(addr.to_string())
}

/// Accepts connections and reads requests but never answers.
async fn silent_daemon() -> DriverEndpoint {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((stream, _)) = listener.accept().await {
			held.push(stream);
		}
	});
	DriverEndpoint::Tcp(addr.to_string())
}

fn fast_config() -> AppConfig {
	let mut config = AppConfig::default();
	config.engine.stabilization.normal = StabilizationPolicy {
		poll_interval_ms: 5,
		required_stable_reads: 1,
		timeout_ms: 2_000,
		settle_delay_ms: 0,
	};
	config.engine.retry = RetryPolicy::new(3, std::time::Duration::ZERO);
	config
}

#[tokio::test]
async fn descriptor_runs_end_to_end_through_daemon() {
	let driver = Arc::new(DaemonDriver::new(fake_daemon(Behavior::Answers).await));
	assert!(driver.ping().await);

	let channel = Arc::new(MemoryChannel::new());
	let engine = build_engine(&fast_config(), driver, Arc::clone(&channel) as Arc<dyn LiveChannel>).unwrap();
	let results = handle_frame(&engine, r#"{"userId":"u1","taskId":"t1","userPrompt":"hi","roles":"deepseek"}"#).await;

	assert_eq!(results.len(), 1);
	let result = &results[0];
	assert_eq!(result.status, ResultStatus::Succeeded);
	assert_eq!(result.content, "answer");
	assert_eq!(result.share_url.as_deref(), Some("https://share.example/d1"));
	assert!(result.image_url.as_deref().is_some_and(|url| url.starts_with("data:image/png;base64,")));
	assert_eq!(result.conversation_id, None);

	let delivered = channel.messages_of("openAI");
	assert_eq!(delivered.len(), 1);
	assert_eq!(delivered[0].task_id, "t1");
	engine.shutdown().await;
}

#[tokio::test]
async fn daemon_unavailable_code_fails_task_without_retry() {
	let driver = Arc::new(DaemonDriver::new(fake_daemon(Behavior::Unavailable).await));
	let channel = Arc::new(MemoryChannel::new());
	let engine = build_engine(&fast_config(), driver, Arc::clone(&channel) as Arc<dyn LiveChannel>).unwrap();

	let results = handle_frame(&engine, r#"{"userId":"u1","userPrompt":"hi","providerKey":"doubao"}"#).await;
	assert_eq!(results[0].error_kind, Some(ErrorKind::ProviderUnavailable));
	assert_eq!(results[0].attempt_count, 1);
	assert_eq!(channel.messages_of("openAI")[0].message, "Doubao failed, please retry later");
}

#[tokio::test]
async fn login_status_is_read_from_daemon() {
	let driver = DaemonDriver::new(fake_daemon(Behavior::Answers).await);
	let session = driver.open(&SessionKey::new("u1", "deepseek")).await.unwrap();
	assert_eq!(session.id, "d1");

	let handle = cube_runtime::SessionHandle::new(session.id, SessionKey::new("u1", "deepseek"));
	assert_eq!(driver.login_status(&handle).await.unwrap(), cube_runtime::LoginStatus::LoggedIn("alice".into()));
	assert_eq!(driver.screenshot(&handle).await.unwrap(), b"png".to_vec());
}

#[tokio::test]
async fn unreachable_daemon_is_transient() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);

	let driver = DaemonDriver::new(DriverEndpoint::Tcp(addr.to_string()));
	assert!(!driver.ping().await);
	let err = driver.open(&SessionKey::new("u1", "deepseek")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn internal_probe_failure_is_one_unreadable_poll() {
	let driver = Arc::new(DaemonDriver::new(fake_daemon(Behavior::FlakyProbe).await));
	let channel = Arc::new(MemoryChannel::new());
	let engine = build_engine(&fast_config(), driver, Arc::clone(&channel) as Arc<dyn LiveChannel>).unwrap();

	let results = handle_frame(&engine, r#"{"userId":"u1","taskId":"t1","userPrompt":"hi","roles":"deepseek"}"#).await;

	assert_eq!(results[0].status, ResultStatus::Succeeded);
	assert_eq!(results[0].content, "answer");
	assert_eq!(results[0].attempt_count, 1);
	engine.shutdown().await;
}

#[tokio::test]
async fn silent_daemon_times_out_as_transient() {
	let driver = DaemonDriver::new(silent_daemon().await).with_request_timeout(Duration::from_millis(100));
	let started = Instant::now();

	let err = driver.open(&SessionKey::new("u1", "deepseek")).await.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::Transient);
	assert!(err.to_string().contains("open timed out after 100ms"));
	assert!(started.elapsed() < Duration::from_secs(5));
	assert!(!driver.ping().await);
}
