//! In-memory provider backend for exercising the engine without a browser.
//!
//! # Example
//!
//! ```ignore
//! let driver = Arc::new(
//!     FakeDriver::builder()
//!         .script("deepseek", vec![ProbeStep::text("hel"), ProbeStep::text("hello")])
//!         .build(),
//! );
//! let engine = Engine::builder(config, driver.clone()).clock(clock).build();
//! let result = engine.scheduler().submit(task)?.wait().await?;
//! assert_eq!(driver.stats().overlaps, 0);
//! ```
//!
//! Besides answering driver calls, the fake checks that no session is driven
//! by two tasks at once and that share-link writes never interleave on the
//! clipboard. Both are reported through [`FakeDriver::stats`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cube_protocol::DraftRecord;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::dispatch::{DispatchError, Persistence};
use crate::driver::{LoginStatus, OpenedSession, ProviderDriver, SessionHandle};
use crate::error::{Result, TaskError};
use crate::session::SessionKey;

/// One scripted read of the answer region. The last step of a script repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStep {
	Text(String),
	Empty,
	Transient,
	Fail(TaskError),
	/// Panics inside the driver call.
	Panic(String),
	/// Raises the provider's unavailable banner and reads nothing.
	Banner(String),
}

impl ProbeStep {
	pub fn text(text: impl Into<String>) -> Self {
		ProbeStep::Text(text.into())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FakeStats {
	pub opens: u64,
	pub closes: u64,
	pub navigations: u64,
	pub prompts: u64,
	pub probes: u64,
	pub toggles: u64,
	pub share_links: u64,
	pub screenshots: u64,
	pub fallbacks: u64,
	/// Driver calls that overlapped another call on the same session.
	pub overlaps: u64,
	/// Share-link writes that landed before the previous one was read.
	pub clipboard_clobbers: u64,
}

#[derive(Default)]
struct Counters {
	opens: AtomicU64,
	closes: AtomicU64,
	navigations: AtomicU64,
	prompts: AtomicU64,
	probes: AtomicU64,
	toggles: AtomicU64,
	share_links: AtomicU64,
	screenshots: AtomicU64,
	fallbacks: AtomicU64,
	overlaps: AtomicU64,
	clipboard_clobbers: AtomicU64,
}

fn bump(counter: &AtomicU64) {
	counter.fetch_add(1, Ordering::SeqCst);
}

pub struct FakeDriverBuilder {
	default_script: Vec<ProbeStep>,
	scripts: HashMap<String, Vec<ProbeStep>>,
	fail_open: HashSet<String>,
	navigation_failures: u32,
	unavailable_banner: Option<String>,
	fallback: Option<String>,
	ignored_toggles: HashMap<String, u32>,
	logged_out: HashSet<String>,
	fail_share_link: bool,
	hold_probes: bool,
	stall_navigation: bool,
}

impl FakeDriverBuilder {
	pub fn new() -> Self {
		Self {
			default_script: vec![ProbeStep::text("hello")],
			scripts: HashMap::new(),
			fail_open: HashSet::new(),
			navigation_failures: 0,
			unavailable_banner: None,
			fallback: None,
			ignored_toggles: HashMap::new(),
			logged_out: HashSet::new(),
			fail_share_link: false,
			hold_probes: false,
			stall_navigation: false,
		}
	}

	/// Every provider without its own script answers `text` immediately.
	pub fn answer(mut self, text: impl Into<String>) -> Self {
		self.default_script = vec![ProbeStep::text(text)];
		self
	}

	pub fn default_script(mut self, steps: Vec<ProbeStep>) -> Self {
		self.default_script = steps;
		self
	}

	/// Probe script for sessions of `provider`, replayed per session.
	pub fn script(mut self, provider: impl Into<String>, steps: Vec<ProbeStep>) -> Self {
		self.scripts.insert(provider.into(), steps);
		self
	}

	pub fn fail_open(mut self, provider: impl Into<String>) -> Self {
		self.fail_open.insert(provider.into());
		self
	}

	/// The first `count` navigations fail.
	pub fn navigation_failures(mut self, count: u32) -> Self {
		self.navigation_failures = count;
		self
	}

	pub fn unavailable_banner(mut self, message: impl Into<String>) -> Self {
		self.unavailable_banner = Some(message.into());
		self
	}

	pub fn fallback(mut self, text: impl Into<String>) -> Self {
		self.fallback = Some(text.into());
		self
	}

	/// The first `count` toggles of `mode` are silently ignored.
	pub fn ignore_toggles_for(mut self, mode: impl Into<String>, count: u32) -> Self {
		self.ignored_toggles.insert(mode.into(), count);
		self
	}

	pub fn logged_out(mut self, provider: impl Into<String>) -> Self {
		self.logged_out.insert(provider.into());
		self
	}

	pub fn fail_share_link(mut self) -> Self {
		self.fail_share_link = true;
		self
	}

	/// Probes block until [`FakeDriver::release_probes`] is called.
	pub fn hold_probes(mut self) -> Self {
		self.hold_probes = true;
		self
	}

	/// Navigations never complete.
	pub fn stall_navigation(mut self) -> Self {
		self.stall_navigation = true;
		self
	}

	pub fn build(self) -> FakeDriver {
		let (gate, _) = watch::channel(!self.hold_probes);
		FakeDriver {
			default_script: self.default_script,
			scripts: self.scripts,
			fail_open: self.fail_open,
			navigation_failures: Mutex::new(self.navigation_failures),
			unavailable_banner: Mutex::new(self.unavailable_banner),
			fallback: self.fallback,
			ignored_toggles: Mutex::new(self.ignored_toggles),
			logged_out: self.logged_out,
			fail_share_link: self.fail_share_link,
			stall_navigation: self.stall_navigation,
			gate,
			sessions: Mutex::new(HashMap::new()),
			busy: Mutex::new(HashMap::new()),
			clipboard: Mutex::new(None),
			prompts: Mutex::new(Vec::new()),
			next_session: AtomicU64::new(1),
			counters: Counters::default(),
		}
	}
}

impl Default for FakeDriverBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct FakeSession {
	key: SessionKey,
	modes: HashMap<String, bool>,
	cursor: usize,
}

struct Clipboard {
	writer: String,
	value: String,
	read: bool,
}

pub struct FakeDriver {
	default_script: Vec<ProbeStep>,
	scripts: HashMap<String, Vec<ProbeStep>>,
	fail_open: HashSet<String>,
	navigation_failures: Mutex<u32>,
	unavailable_banner: Mutex<Option<String>>,
	fallback: Option<String>,
	ignored_toggles: Mutex<HashMap<String, u32>>,
	logged_out: HashSet<String>,
	fail_share_link: bool,
	stall_navigation: bool,
	gate: watch::Sender<bool>,
	sessions: Mutex<HashMap<String, FakeSession>>,
	busy: Mutex<HashMap<String, u32>>,
	clipboard: Mutex<Option<Clipboard>>,
	prompts: Mutex<Vec<(SessionKey, String)>>,
	next_session: AtomicU64,
	counters: Counters,
}

impl FakeDriver {
	pub fn new() -> Self {
		FakeDriverBuilder::new().build()
	}

	pub fn builder() -> FakeDriverBuilder {
		FakeDriverBuilder::new()
	}

	pub fn release_probes(&self) {
		self.gate.send_replace(true);
	}

	pub fn set_unavailable_banner(&self, message: Option<String>) {
		*self.unavailable_banner.lock() = message;
	}

	/// Prompts submitted so far, in order.
	pub fn prompts(&self) -> Vec<(SessionKey, String)> {
		self.prompts.lock().clone()
	}

	pub fn open_sessions(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn stats(&self) -> FakeStats {
		let c = &self.counters;
		let load = |counter: &AtomicU64| counter.load(Ordering::SeqCst);
		FakeStats {
			opens: load(&c.opens),
			closes: load(&c.closes),
			navigations: load(&c.navigations),
			prompts: load(&c.prompts),
			probes: load(&c.probes),
			toggles: load(&c.toggles),
			share_links: load(&c.share_links),
			screenshots: load(&c.screenshots),
			fallbacks: load(&c.fallbacks),
			overlaps: load(&c.overlaps),
			clipboard_clobbers: load(&c.clipboard_clobbers),
		}
	}

	/// Share link the fake writes for `session`.
	pub fn share_link_for(session: &str) -> String {
		format!("https://share.example/{session}")
	}

	/// Marks `session` as in use until the returned guard drops, counting overlaps.
	async fn enter(&self, session: &SessionHandle) -> Result<BusyGuard<'_>> {
		{
			let mut busy = self.busy.lock();
			let users = busy.entry(session.id.clone()).or_default();
			if *users > 0 {
				bump(&self.counters.overlaps);
			}
			*users += 1;
		}
		let guard = BusyGuard {
			driver: self,
			session: session.id.clone(),
		};
		if !self.sessions.lock().contains_key(&session.id) {
			return Err(TaskError::Navigation(format!("session {} is closed", session.id)));
		}
		tokio::task::yield_now().await;
		Ok(guard)
	}
}

impl Default for FakeDriver {
	fn default() -> Self {
		Self::new()
	}
}

struct BusyGuard<'a> {
	driver: &'a FakeDriver,
	session: String,
}

impl Drop for BusyGuard<'_> {
	fn drop(&mut self) {
		let mut busy = self.driver.busy.lock();
		if let Some(users) = busy.get_mut(&self.session) {
			*users = users.saturating_sub(1);
			if *users == 0 {
				busy.remove(&self.session);
			}
		}
	}
}

#[async_trait]
impl ProviderDriver for FakeDriver {
	async fn open(&self, key: &SessionKey) -> Result<OpenedSession> {
		tokio::task::yield_now().await;
		if self.fail_open.contains(&key.provider) {
			return Err(TaskError::Internal(format!("no browser profile for {key}")));
		}
		bump(&self.counters.opens);
		let id = format!("s{}", self.next_session.fetch_add(1, Ordering::SeqCst));
		self.sessions.lock().insert(
			id.clone(),
			FakeSession {
				key: key.clone(),
				modes: HashMap::new(),
				cursor: 0,
			},
		);
		Ok(OpenedSession { id, open_pages: 1 })
	}

	async fn navigate(&self, session: &SessionHandle, _conversation_id: Option<&str>) -> Result<()> {
		let _busy = self.enter(session).await?;
		bump(&self.counters.navigations);
		if self.stall_navigation {
			std::future::pending::<()>().await;
		}
		let mut remaining = self.navigation_failures.lock();
		if *remaining > 0 {
			*remaining -= 1;
			return Err(TaskError::Navigation("page load timed out".into()));
		}
		Ok(())
	}

	async fn mode_enabled(&self, session: &SessionHandle, mode: &str) -> Result<bool> {
		let _busy = self.enter(session).await?;
		let sessions = self.sessions.lock();
		Ok(sessions.get(&session.id).and_then(|s| s.modes.get(mode).copied()).unwrap_or(false))
	}

	async fn toggle_mode(&self, session: &SessionHandle, mode: &str) -> Result<()> {
		let _busy = self.enter(session).await?;
		bump(&self.counters.toggles);
		{
			let mut ignored = self.ignored_toggles.lock();
			if let Some(remaining) = ignored.get_mut(mode).filter(|remaining| **remaining > 0) {
				*remaining -= 1;
				return Ok(());
			}
		}
		let mut sessions = self.sessions.lock();
		if let Some(state) = sessions.get_mut(&session.id) {
			let enabled = state.modes.entry(mode.to_string()).or_insert(false);
			*enabled = !*enabled;
		}
		Ok(())
	}

	async fn submit_prompt(&self, session: &SessionHandle, text: &str) -> Result<()> {
		let _busy = self.enter(session).await?;
		bump(&self.counters.prompts);
		self.prompts.lock().push((session.key.clone(), text.to_string()));
		Ok(())
	}

	async fn probe(&self, session: &SessionHandle) -> Result<Option<String>> {
		let _busy = self.enter(session).await?;
		let mut gate = self.gate.subscribe();
		if gate.wait_for(|open| *open).await.is_err() {
			return Err(TaskError::Transient("probe gate closed".into()));
		}
		bump(&self.counters.probes);

		let step = {
			let mut sessions = self.sessions.lock();
			let Some(state) = sessions.get_mut(&session.id) else {
				return Err(TaskError::Transient("session vanished".into()));
			};
			let script = self.scripts.get(&state.key.provider).unwrap_or(&self.default_script);
			let step = script.get(state.cursor.min(script.len().saturating_sub(1))).cloned();
			state.cursor += 1;
			step
		};

		match step {
			Some(ProbeStep::Text(text)) => Ok(Some(text)),
			Some(ProbeStep::Empty) | None => Ok(None),
			Some(ProbeStep::Transient) => Err(TaskError::Transient("answer region detached".into())),
			Some(ProbeStep::Fail(err)) => Err(err),
			Some(ProbeStep::Panic(message)) => panic!("{message}"),
			Some(ProbeStep::Banner(message)) => {
				*self.unavailable_banner.lock() = Some(message);
				Ok(None)
			}
		}
	}

	async fn unavailable_signal(&self, session: &SessionHandle) -> Result<Option<String>> {
		let _busy = self.enter(session).await?;
		Ok(self.unavailable_banner.lock().clone())
	}

	async fn fallback_extract(&self, session: &SessionHandle) -> Result<Option<String>> {
		let _busy = self.enter(session).await?;
		bump(&self.counters.fallbacks);
		Ok(self.fallback.clone())
	}

	async fn trigger_share_link(&self, session: &SessionHandle) -> Result<()> {
		let _busy = self.enter(session).await?;
		if self.fail_share_link {
			return Err(TaskError::Clipboard("share button not found".into()));
		}
		bump(&self.counters.share_links);
		{
			let mut clipboard = self.clipboard.lock();
			if clipboard.as_ref().is_some_and(|current| !current.read && current.writer != session.id) {
				bump(&self.counters.clipboard_clobbers);
			}
			*clipboard = Some(Clipboard {
				writer: session.id.clone(),
				value: Self::share_link_for(&session.id),
				read: false,
			});
		}
		// Give a concurrent writer the chance to interleave.
		for _ in 0..3 {
			tokio::task::yield_now().await;
		}
		Ok(())
	}

	async fn read_clipboard(&self, session: &SessionHandle) -> Result<String> {
		let _busy = self.enter(session).await?;
		let mut clipboard = self.clipboard.lock();
		match clipboard.as_mut() {
			Some(current) => {
				current.read = true;
				Ok(current.value.clone())
			}
			None => Err(TaskError::Clipboard("clipboard empty".into())),
		}
	}

	async fn screenshot(&self, session: &SessionHandle) -> Result<Vec<u8>> {
		let _busy = self.enter(session).await?;
		bump(&self.counters.screenshots);
		Ok(format!("png:{}", session.id).into_bytes())
	}

	async fn conversation_id(&self, session: &SessionHandle) -> Result<Option<String>> {
		let _busy = self.enter(session).await?;
		Ok(Some(format!("conv-{}", session.id)))
	}

	async fn login_status(&self, session: &SessionHandle) -> Result<LoginStatus> {
		let _busy = self.enter(session).await?;
		if self.logged_out.contains(&session.key.provider) {
			return Ok(LoginStatus::LoggedOut);
		}
		Ok(LoginStatus::LoggedIn(format!("{}@{}", session.key.user_id, session.key.provider)))
	}

	async fn close(&self, session: &SessionHandle) -> Result<()> {
		bump(&self.counters.closes);
		self.sessions.lock().remove(&session.id);
		Ok(())
	}
}

/// Persistence that keeps every draft in memory.
#[derive(Debug, Default)]
pub struct RecordingPersistence {
	records: Mutex<Vec<DraftRecord>>,
	failing: bool,
}

impl RecordingPersistence {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rejects every draft.
	pub fn failing() -> Self {
		Self {
			records: Mutex::new(Vec::new()),
			failing: true,
		}
	}

	pub fn records(&self) -> Vec<DraftRecord> {
		self.records.lock().clone()
	}
}

#[async_trait]
impl Persistence for RecordingPersistence {
	async fn save_draft(&self, record: DraftRecord) -> std::result::Result<(), DispatchError> {
		if self.failing {
			return Err(DispatchError::Persistence("backend returned 503".into()));
		}
		self.records.lock().push(record);
		Ok(())
	}
}
