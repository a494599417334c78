//! Wiring of the shared components into one running engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clipboard::ClipboardLock;
use crate::clock::{Clock, TokioClock};
use crate::config::EngineConfig;
use crate::dedup::DedupRegistry;
use crate::dispatch::{LiveChannel, MemoryChannel, NullPersistence, Persistence, ResultDispatcher};
use crate::driver::ProviderDriver;
use crate::executor::TaskExecutor;
use crate::scheduler::Scheduler;
use crate::session::SessionPool;

pub struct EngineBuilder {
	config: EngineConfig,
	driver: Arc<dyn ProviderDriver>,
	channel: Option<Arc<dyn LiveChannel>>,
	persistence: Option<Arc<dyn Persistence>>,
	clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
	pub fn channel(mut self, channel: Arc<dyn LiveChannel>) -> Self {
		self.channel = Some(channel);
		self
	}

	pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
		self.persistence = Some(persistence);
		self
	}

	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	/// Builds the engine and starts its workers. Requires a tokio runtime.
	pub fn build(self) -> Engine {
		let config = Arc::new(self.config.normalized());
		let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
		let channel = self.channel.unwrap_or_else(|| Arc::new(MemoryChannel::new()));
		let persistence = self.persistence.unwrap_or_else(|| Arc::new(NullPersistence));

		let sessions = Arc::new(SessionPool::new(Arc::clone(&self.driver), Arc::clone(&clock)));
		let clipboard = Arc::new(ClipboardLock::new(config.clipboard_wait()));
		let dispatcher = Arc::new(ResultDispatcher::new(channel, persistence));
		let dedup = Arc::new(DedupRegistry::new(Arc::clone(&clock)));
		let executor = Arc::new(TaskExecutor::new(
			self.driver,
			Arc::clone(&sessions),
			Arc::clone(&clipboard),
			Arc::clone(&dispatcher),
			Arc::clone(&config),
			Arc::clone(&clock),
		));
		let scheduler = Arc::new(Scheduler::start(executor, Arc::clone(&dedup), Arc::clone(&config), Arc::clone(&clock)));

		Engine {
			config,
			clock,
			sessions,
			clipboard,
			dispatcher,
			dedup,
			scheduler,
		}
	}
}

/// Owns every shared resource: session pool, clipboard lock, dedup registry,
/// dispatcher, and the scheduler feeding the executors.
pub struct Engine {
	config: Arc<EngineConfig>,
	clock: Arc<dyn Clock>,
	sessions: Arc<SessionPool>,
	clipboard: Arc<ClipboardLock>,
	dispatcher: Arc<ResultDispatcher>,
	dedup: Arc<DedupRegistry>,
	scheduler: Arc<Scheduler>,
}

impl Engine {
	pub fn builder(config: EngineConfig, driver: Arc<dyn ProviderDriver>) -> EngineBuilder {
		EngineBuilder {
			config,
			driver,
			channel: None,
			persistence: None,
			clock: None,
		}
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn scheduler(&self) -> &Scheduler {
		&self.scheduler
	}

	pub fn sessions(&self) -> &Arc<SessionPool> {
		&self.sessions
	}

	pub fn clipboard(&self) -> &Arc<ClipboardLock> {
		&self.clipboard
	}

	pub fn dispatcher(&self) -> &Arc<ResultDispatcher> {
		&self.dispatcher
	}

	pub fn dedup(&self) -> &Arc<DedupRegistry> {
		&self.dedup
	}

	/// Starts the background pass that closes idle sessions, purges expired
	/// dedup entries and forgets old task statuses. Abort the handle to stop it.
	pub fn spawn_maintenance(&self) -> JoinHandle<()> {
		let sessions = Arc::clone(&self.sessions);
		let dedup = Arc::clone(&self.dedup);
		let scheduler = Arc::clone(&self.scheduler);
		let retention = self.config.status_retention();
		let clock = Arc::clone(&self.clock);
		let interval = self.config.session_reap_interval();
		let idle_for = self.config.session_idle_timeout();
		info!(target = "cube.session", interval_ms = interval.as_millis() as u64, idle_ms = idle_for.as_millis() as u64, "maintenance started");

		tokio::spawn(async move {
			loop {
				clock.sleep(interval).await;
				let closed = sessions.evict_idle(idle_for).await;
				let purged = dedup.purge_expired();
				let forgotten = scheduler.purge_finished(retention);
				if closed > 0 || purged > 0 || forgotten > 0 {
					debug!(target = "cube.session", closed, purged, forgotten, "maintenance pass");
				}
			}
		})
	}

	/// Drains the queue, waits for running tasks, then closes every session.
	pub async fn shutdown(&self) {
		self.scheduler.shutdown().await;
		self.sessions.close_all().await;
	}
}
