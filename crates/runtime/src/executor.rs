//! Per-task state machine.
//!
//! ```text
//! Init → Navigated → PromptSubmitted → AwaitingStabilization → Extracted
//!      → ShareLinkFetched → Persisted → Completed        (any step → Failed)
//! ```
//!
//! The executor never returns an error: every outcome becomes a
//! [`TaskResult`] and is handed to the dispatcher before the session lease
//! is released.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cube_protocol::png_data_url;
use tracing::{debug, info, warn};

use crate::clipboard::ClipboardLock;
use crate::clock::{Clock, within};
use crate::config::EngineConfig;
use crate::dispatch::ResultDispatcher;
use crate::driver::{ProviderDriver, SessionHandle};
use crate::error::{Result, TaskError};
use crate::modes::ensure_mode;
use crate::result::{ResultBuilder, TaskResult};
use crate::retry::{RetryController, RetryFailure, Retried};
use crate::session::{SessionLease, SessionPool};
use crate::stabilize::{SnapshotSource, await_stable};
use crate::state::{StateTrail, TaskState};
use crate::task::{Task, TaskKind};

/// What a task produced before persistence and delivery.
struct Finished {
	content: String,
	attempts: u32,
	used_fallback: bool,
	share_url: Option<String>,
	image_url: Option<String>,
	conversation_id: Option<String>,
	lease: SessionLease,
}

pub struct TaskExecutor {
	driver: Arc<dyn ProviderDriver>,
	sessions: Arc<SessionPool>,
	clipboard: Arc<ClipboardLock>,
	dispatcher: Arc<ResultDispatcher>,
	config: Arc<EngineConfig>,
	clock: Arc<dyn Clock>,
}

impl TaskExecutor {
	pub fn new(
		driver: Arc<dyn ProviderDriver>,
		sessions: Arc<SessionPool>,
		clipboard: Arc<ClipboardLock>,
		dispatcher: Arc<ResultDispatcher>,
		config: Arc<EngineConfig>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			driver,
			sessions,
			clipboard,
			dispatcher,
			config,
			clock,
		}
	}

	pub fn dispatcher(&self) -> &Arc<ResultDispatcher> {
		&self.dispatcher
	}

	/// Runs `task` to completion and dispatches its result.
	pub async fn execute(&self, task: &Task) -> TaskResult {
		self.execute_traced(task, &StateTrail::new()).await
	}

	/// Like [`execute`](Self::execute), recording transitions on a trail the
	/// caller can still read if the run is cut short.
	pub async fn execute_traced(&self, task: &Task, trail: &StateTrail) -> TaskResult {
		let started = self.clock.now();
		info!(
			target = "cube.task",
			task_id = %task.id,
			user_id = %task.user_id,
			provider = %task.provider,
			kind = ?task.kind,
			"task started"
		);

		let outcome = match task.kind {
			TaskKind::Generate => self.run_generate(task, trail).await,
			TaskKind::CheckLogin => self.run_login_check(task, trail).await,
		};
		let duration_ms = self.clock.elapsed_since(started).as_millis() as u64;

		match outcome {
			Ok(finished) => {
				let Finished {
					content,
					attempts,
					used_fallback,
					share_url,
					image_url,
					conversation_id,
					lease,
				} = finished;
				let mut result = ResultBuilder::new(task)
					.content(content)
					.attempts(attempts, used_fallback)
					.share_url(share_url)
					.image_url(image_url)
					.conversation_id(conversation_id)
					.duration_ms(duration_ms)
					.build();

				if task.kind == TaskKind::Generate {
					self.dispatcher.persist(&result);
					self.transition(task, trail, TaskState::Persisted, None).await;
				}
				self.dispatcher.deliver(&result).await;
				self.transition(task, trail, TaskState::Completed, None).await;
				lease.release();

				info!(
					target = "cube.task",
					task_id = %task.id,
					attempts,
					used_fallback,
					duration_ms,
					content_len = result.content.len(),
					"task completed"
				);
				result.states = trail.snapshot();
				result
			}
			Err(RetryFailure { error, attempts }) => {
				trail.enter(TaskState::Failed);
				warn!(
					target = "cube.task",
					task_id = %task.id,
					kind = %error.kind(),
					attempts,
					duration_ms,
					error = %error,
					"task failed"
				);
				let result = ResultBuilder::new(task)
					.error(&error)
					.attempts(attempts, false)
					.duration_ms(duration_ms)
					.states(trail.snapshot())
					.build();
				self.dispatcher.deliver(&result).await;
				result
			}
		}
	}

	async fn run_generate(&self, task: &Task, trail: &StateTrail) -> Result<Finished, RetryFailure> {
		let lease = self.sessions.acquire(&task.session_key()).await.map_err(at_attempt(0))?;
		let session = lease.handle().clone();

		self.navigate(task, &session).await?;
		self.transition(task, trail, TaskState::Navigated, Some("page opened")).await;

		for flag in task.modes.iter() {
			let applied = within(
				self.clock.as_ref(),
				self.config.step_timeout(),
				ensure_mode(self.driver.as_ref(), &session, &flag.name, flag.enabled),
			)
			.await;
			if applied.is_none() {
				warn!(target = "cube.task", task_id = %task.id, mode = %flag.name, "mode toggle timed out, continuing");
			}
		}
		self.step("submit prompt", self.driver.submit_prompt(&session, &task.prompt), TaskError::Navigation)
			.await
			.map_err(at_attempt(0))?;
		self.transition(task, trail, TaskState::PromptSubmitted, Some("prompt submitted")).await;

		let extracted = self.extract(task, &session, trail).await?;
		self.transition(task, trail, TaskState::Extracted, Some("answer received")).await;

		let conversation_id = match self.step("conversation id", self.driver.conversation_id(&session), TaskError::Transient).await {
			Ok(id) => id,
			Err(err) => {
				debug!(target = "cube.task", task_id = %task.id, error = %err, "conversation id unavailable");
				None
			}
		};

		let share_url = self.fetch_share_link(task, &session).await;
		let note = if share_url.is_some() { "share link captured" } else { "share link unavailable" };
		self.transition(task, trail, TaskState::ShareLinkFetched, Some(note)).await;
		let image_url = self.capture_share_image(task, &session).await;

		Ok(Finished {
			content: extracted.value,
			attempts: extracted.attempts,
			used_fallback: extracted.used_fallback,
			share_url,
			image_url,
			conversation_id,
			lease,
		})
	}

	async fn run_login_check(&self, task: &Task, trail: &StateTrail) -> Result<Finished, RetryFailure> {
		let lease = self.sessions.acquire(&task.session_key()).await.map_err(at_attempt(0))?;
		let session = lease.handle().clone();

		self.navigate(task, &session).await?;
		self.transition(task, trail, TaskState::Navigated, Some("page opened")).await;

		let status = self
			.step("login status", self.driver.login_status(&session), TaskError::Navigation)
			.await
			.map_err(at_attempt(1))?;
		debug!(target = "cube.task", task_id = %task.id, status = ?status, "login status read");

		Ok(Finished {
			content: status.message().to_string(),
			attempts: 1,
			used_fallback: false,
			share_url: None,
			image_url: None,
			conversation_id: None,
			lease,
		})
	}

	async fn navigate(&self, task: &Task, session: &SessionHandle) -> Result<(), RetryFailure> {
		let conversation = task.conversation_id.as_deref();
		let controller = RetryController::new(self.config.retry, Arc::clone(&self.clock));
		controller
			.run(
				"navigate",
				move |_| self.step("navigate", self.driver.navigate(session, conversation), TaskError::Navigation),
				|| async { None },
			)
			.await
			.map(|_| ())
	}

	async fn extract(&self, task: &Task, session: &SessionHandle, trail: &StateTrail) -> Result<Retried<String>, RetryFailure> {
		let policy = self.config.stabilization_for(task);
		let policy = &policy;
		let controller = RetryController::new(self.config.retry, Arc::clone(&self.clock));

		controller
			.run_with_fallback(
				"extract",
				move |attempt| async move {
					trail.enter(TaskState::AwaitingStabilization);
					debug!(target = "cube.task", task_id = %task.id, attempt, "awaiting stable answer");
					let mut source = ProbeSource::new(self, task, session);
					await_stable(&mut source, policy, self.clock.as_ref()).await
				},
				move || self.unavailable_signal(task, session),
				move || async move {
					match self.step("fallback extract", self.driver.fallback_extract(session), TaskError::Extraction).await {
						Ok(Some(text)) if !text.trim().is_empty() => Ok(text),
						Ok(_) => Err(TaskError::Extraction("fallback found no answer".into())),
						Err(err) => Err(err),
					}
				},
			)
			.await
	}

	async fn unavailable_signal(&self, task: &Task, session: &SessionHandle) -> Option<String> {
		match self.step("unavailable check", self.driver.unavailable_signal(session), TaskError::Transient).await {
			Ok(signal) => signal,
			Err(err) => {
				debug!(target = "cube.task", task_id = %task.id, error = %err, "unavailable check failed");
				None
			}
		}
	}

	/// Triggers the provider's share action and reads the link back, all
	/// under the clipboard lock. Failures leave the link empty.
	async fn fetch_share_link(&self, task: &Task, session: &SessionHandle) -> Option<String> {
		let holder = task.id.to_string();
		let link = self
			.clipboard
			.with_clipboard(&holder, move || {
				self.step(
					"share link",
					async move {
						match self.driver.trigger_share_link(session).await {
							Ok(()) => self.driver.read_clipboard(session).await,
							Err(err) => Err(err),
						}
					},
					TaskError::Clipboard,
				)
			})
			.await;

		match link {
			Ok(link) if !link.trim().is_empty() => Some(link.trim().to_string()),
			Ok(_) => {
				debug!(target = "cube.clipboard", task_id = %task.id, "clipboard was empty");
				None
			}
			Err(err) => {
				warn!(target = "cube.clipboard", task_id = %task.id, error = %err, "share link not captured");
				None
			}
		}
	}

	async fn capture_share_image(&self, task: &Task, session: &SessionHandle) -> Option<String> {
		match self.step("share image", self.driver.screenshot(session), TaskError::Transient).await {
			Ok(png) if !png.is_empty() => Some(png_data_url(&png)),
			Ok(_) => None,
			Err(err) => {
				debug!(target = "cube.task", task_id = %task.id, error = %err, "share image not captured");
				None
			}
		}
	}

	/// Runs one driver step under the configured step timeout. Expiry becomes
	/// `on_timeout` so each step keeps its own error class.
	async fn step<T>(&self, label: &str, fut: impl Future<Output = Result<T>>, on_timeout: fn(String) -> TaskError) -> Result<T> {
		let limit = self.config.step_timeout();
		match within(self.clock.as_ref(), limit, fut).await {
			Some(outcome) => outcome,
			None => {
				warn!(target = "cube.task", step = label, timeout_ms = limit.as_millis() as u64, "driver step timed out");
				Err(on_timeout(format!("{label} timed out after {}ms", limit.as_millis())))
			}
		}
	}

	async fn transition(&self, task: &Task, trail: &StateTrail, state: TaskState, line: Option<&str>) {
		if !trail.enter(state) {
			return;
		}
		info!(target = "cube.task", task_id = %task.id, state = %state, "state changed");
		if let Some(line) = line {
			self.dispatcher.task_log(task, &format!("{}: {line}", task.ai_name)).await;
		}
	}
}

fn at_attempt(attempts: u32) -> impl Fn(TaskError) -> RetryFailure {
	move |error| RetryFailure { error, attempts }
}

/// Feeds driver probes to the stabilizer and pushes progress screenshots.
/// Every poll first looks for the provider's unavailable banner.
struct ProbeSource<'a> {
	executor: &'a TaskExecutor,
	task: &'a Task,
	session: &'a SessionHandle,
	screenshot_every: Option<Duration>,
	next_screenshot: Duration,
}

impl<'a> ProbeSource<'a> {
	fn new(executor: &'a TaskExecutor, task: &'a Task, session: &'a SessionHandle) -> Self {
		let screenshot_every = executor.config.progress_screenshot_interval();
		Self {
			executor,
			task,
			session,
			screenshot_every,
			next_screenshot: screenshot_every.unwrap_or_default(),
		}
	}
}

#[async_trait]
impl SnapshotSource for ProbeSource<'_> {
	async fn probe(&mut self) -> Result<Option<String>> {
		if let Some(reason) = self.executor.unavailable_signal(self.task, self.session).await {
			return Err(TaskError::ProviderUnavailable(reason));
		}
		self.executor.driver.probe(self.session).await
	}

	async fn on_poll(&mut self, _poll: u32, elapsed: Duration) {
		let Some(every) = self.screenshot_every else {
			return;
		};
		if elapsed < self.next_screenshot {
			return;
		}
		self.next_screenshot = elapsed + every;
		let shot = self
			.executor
			.step("progress screenshot", self.executor.driver.screenshot(self.session), TaskError::Transient)
			.await;
		match shot {
			Ok(png) => self.executor.dispatcher.progress_screenshot(self.task, &png).await,
			Err(err) => debug!(target = "cube.task", task_id = %self.task.id, error = %err, "progress screenshot failed"),
		}
	}
}

#[cfg(test)]
mod tests {
	use cube_protocol::{DEFAULT_RESULT_TYPE, TASK_LOG_TYPE, TASK_SCREENSHOT_TYPE};

	use super::*;
	use crate::clock::VirtualClock;
	use crate::dispatch::{LiveChannel, MemoryChannel, Persistence};
	use crate::error::ErrorKind;
	use crate::result::ResultStatus;
	use crate::stabilize::StabilizationPolicy;
	use crate::task::DEEP_THINKING;
	use crate::testing::{FakeDriver, ProbeStep, RecordingPersistence};

	struct Harness {
		driver: Arc<FakeDriver>,
		channel: Arc<MemoryChannel>,
		persistence: Arc<RecordingPersistence>,
		clock: VirtualClock,
		executor: TaskExecutor,
	}

	fn harness(driver: FakeDriver, config: EngineConfig) -> Harness {
		let driver = Arc::new(driver);
		let channel = Arc::new(MemoryChannel::new());
		let persistence = Arc::new(RecordingPersistence::new());
		let clock = VirtualClock::new();
		let shared_clock = clock.clone().shared();
		let dyn_driver: Arc<dyn ProviderDriver> = driver.clone();
		let executor = TaskExecutor::new(
			Arc::clone(&dyn_driver),
			Arc::new(SessionPool::new(dyn_driver, Arc::clone(&shared_clock))),
			Arc::new(ClipboardLock::new(Duration::from_secs(1))),
			Arc::new(ResultDispatcher::new(
				channel.clone() as Arc<dyn LiveChannel>,
				persistence.clone() as Arc<dyn Persistence>,
			)),
			Arc::new(config),
			shared_clock,
		);
		Harness {
			driver,
			channel,
			persistence,
			clock,
			executor,
		}
	}

	#[tokio::test]
	async fn happy_path_walks_every_state() {
		let h = harness(FakeDriver::new(), EngineConfig::default());
		let task = Task::generate("u-1", "deepseek", "hi").with_ai_name("DeepSeek");

		let result = h.executor.execute(&task).await;

		assert_eq!(result.status, ResultStatus::Succeeded);
		assert_eq!(result.content, "hello");
		assert_eq!(result.attempt_count, 1);
		assert_eq!(
			result.states,
			vec![
				TaskState::Init,
				TaskState::Navigated,
				TaskState::PromptSubmitted,
				TaskState::AwaitingStabilization,
				TaskState::Extracted,
				TaskState::ShareLinkFetched,
				TaskState::Persisted,
				TaskState::Completed,
			]
		);
		assert_eq!(result.share_url.as_deref(), Some("https://share.example/s1"));
		assert!(result.image_url.as_deref().is_some_and(|url| url.starts_with("data:image/png;base64,")));
		assert_eq!(result.conversation_id.as_deref(), Some("conv-s1"));

		let delivered = h.channel.messages_of(DEFAULT_RESULT_TYPE);
		assert_eq!(delivered.len(), 1);
		assert_eq!(delivered[0].message, "hello");
		assert!(!h.channel.messages_of(TASK_LOG_TYPE).is_empty());
		assert_eq!(h.driver.prompts()[0].1, "hi");
	}

	#[tokio::test]
	async fn persistence_receives_successful_answer() {
		let h = harness(FakeDriver::new(), EngineConfig::default());
		let task = Task::generate("u-1", "deepseek", "hi");

		h.executor.execute(&task).await;
		for _ in 0..10 {
			if !h.persistence.records().is_empty() {
				break;
			}
			tokio::task::yield_now().await;
		}

		let drafts = h.persistence.records();
		assert_eq!(drafts.len(), 1);
		assert_eq!(drafts[0].draft_content, "hello");
		assert_eq!(drafts[0].share_url, "https://share.example/s1");
	}

	#[tokio::test]
	async fn deep_thinking_toggles_mode_and_waits_longer() {
		let h = harness(
			FakeDriver::builder()
				.script("deepseek", vec![ProbeStep::text("a"), ProbeStep::text("a"), ProbeStep::text("a")])
				.build(),
			EngineConfig::default(),
		);
		let task = Task::generate("u-1", "deepseek", "think").with_mode(DEEP_THINKING, true);

		let result = h.executor.execute(&task).await;

		assert!(result.is_success());
		assert_eq!(h.driver.stats().toggles, 1);
		assert_eq!(h.driver.stats().probes, 3);
	}

	#[tokio::test]
	async fn navigation_retries_then_succeeds() {
		let h = harness(FakeDriver::builder().navigation_failures(2).build(), EngineConfig::default());
		let result = h.executor.execute(&Task::generate("u-1", "deepseek", "hi")).await;

		assert!(result.is_success());
		assert_eq!(h.driver.stats().navigations, 3);
	}

	#[tokio::test]
	async fn navigation_exhaustion_fails_terminally() {
		let h = harness(FakeDriver::builder().navigation_failures(5).build(), EngineConfig::default());
		let result = h.executor.execute(&Task::generate("u-1", "deepseek", "hi")).await;

		assert_eq!(result.status, ResultStatus::Failed);
		assert_eq!(result.error_kind, Some(ErrorKind::Navigation));
		assert_eq!(result.attempt_count, 3);
		assert_eq!(h.driver.stats().prompts, 0);
	}

	#[tokio::test]
	async fn stalled_navigation_gives_up_at_the_step_timeout() {
		let h = harness(FakeDriver::builder().stall_navigation().build(), EngineConfig::default());
		let task = Task::generate("u-1", "deepseek", "hi");
		let ticker = async {
			loop {
				tokio::time::sleep(Duration::from_millis(1)).await;
				h.clock.advance(Duration::from_secs(30));
			}
		};

		let result = tokio::select! {
			result = h.executor.execute(&task) => result,
			_ = ticker => unreachable!(),
		};

		assert_eq!(result.error_kind, Some(ErrorKind::Navigation));
		assert!(result.error_message.as_deref().is_some_and(|msg| msg.contains("navigate timed out")));
		assert_eq!(result.attempt_count, 3);
		assert_eq!(h.driver.stats().navigations, 3);
		assert_eq!(h.driver.stats().prompts, 0);
	}

	#[tokio::test]
	async fn share_link_failure_is_not_fatal() {
		let h = harness(FakeDriver::builder().fail_share_link().build(), EngineConfig::default());
		let result = h.executor.execute(&Task::generate("u-1", "deepseek", "hi")).await;

		assert!(result.is_success());
		assert_eq!(result.share_url, None);
		assert!(result.states.contains(&TaskState::ShareLinkFetched));
	}

	#[tokio::test]
	async fn exhausted_attempts_use_fallback() {
		let mut config = EngineConfig::default();
		config.stabilization.normal = StabilizationPolicy::normal().with_timeout(Duration::from_secs(2));
		let h = harness(FakeDriver::builder().answer("").fallback("partial answer").build(), config);

		let result = h.executor.execute(&Task::generate("u-1", "deepseek", "hi")).await;

		assert!(result.is_success());
		assert!(result.used_fallback);
		assert_eq!(result.content, "partial answer");
		assert_eq!(result.attempt_count, 3);
	}

	#[tokio::test]
	async fn progress_screenshots_follow_interval() {
		let config = EngineConfig {
			progress_screenshot_interval_ms: Some(600),
			..EngineConfig::default()
		};
		let h = harness(
			FakeDriver::builder()
				.script(
					"deepseek",
					vec![
						ProbeStep::text("a"),
						ProbeStep::text("ab"),
						ProbeStep::text("abc"),
						ProbeStep::text("abcd"),
						ProbeStep::text("abcd"),
					],
				)
				.build(),
			config,
		);

		h.executor.execute(&Task::generate("u-1", "deepseek", "hi")).await;

		let shots = h.channel.messages_of(TASK_SCREENSHOT_TYPE);
		assert!(!shots.is_empty());
		assert!(h.clock.elapsed() >= Duration::from_millis(2_000 + 4 * 300));
	}

	#[tokio::test]
	async fn login_check_reports_account() {
		let h = harness(FakeDriver::builder().logged_out("doubao").build(), EngineConfig::default());

		let logged_in = h.executor.execute(&Task::check_login("u-1", "deepseek")).await;
		let logged_out = h.executor.execute(&Task::check_login("u-1", "doubao")).await;

		assert_eq!(logged_in.content, "u-1@deepseek");
		assert_eq!(logged_out.content, "false");
		assert_eq!(logged_in.states.last(), Some(&TaskState::Completed));
		assert_eq!(h.driver.stats().prompts, 0);
		assert!(h.persistence.records().is_empty());
	}
}
