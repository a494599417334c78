//! Bounded admission and parallel execution of tasks.
//!
//! Submissions land on a bounded queue; a fixed set of workers pulls from it.
//! A full queue rejects immediately instead of blocking the submitter. Each
//! task runs on its own tokio task so a panic or an expired deadline only
//! fails that task; the worker survives and dispatches a failure result.
//! Finished and deduplicated tasks keep a queryable status until
//! [`Scheduler::purge_finished`] drops them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dedup::{DedupGuard, DedupRegistry};
use crate::error::TaskError;
use crate::executor::TaskExecutor;
use crate::result::{ResultBuilder, TaskResult};
use crate::state::{StateTrail, TaskState};
use crate::task::{Task, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
	#[error("task queue is full ({capacity} waiting)")]
	QueueFull { capacity: usize },

	#[error("scheduler is shutting down")]
	ShuttingDown,

	#[error("task {0} was dropped before producing a result")]
	Abandoned(TaskId),
}

/// Handle on an accepted task's eventual result.
#[derive(Debug)]
pub struct Receipt {
	task_id: TaskId,
	completion: oneshot::Receiver<TaskResult>,
}

impl Receipt {
	pub fn task_id(&self) -> &TaskId {
		&self.task_id
	}

	pub async fn wait(self) -> Result<TaskResult, SubmitError> {
		self.completion.await.map_err(|_| SubmitError::Abandoned(self.task_id))
	}
}

#[derive(Debug)]
pub enum Submission {
	Accepted(Receipt),
	/// An equivalent task is already running; nothing was queued.
	Deduplicated { task_id: TaskId, in_flight: TaskId },
}

impl Submission {
	pub fn task_id(&self) -> &TaskId {
		match self {
			Submission::Accepted(receipt) => receipt.task_id(),
			Submission::Deduplicated { task_id, .. } => task_id,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
	pub workers: usize,
	pub active: usize,
	pub queued: usize,
	pub queue_capacity: usize,
	pub submitted: u64,
	pub completed: u64,
	pub rejected: u64,
	pub deduplicated: u64,
}

struct Job {
	task: Task,
	reply: oneshot::Sender<TaskResult>,
	dedup: Option<DedupGuard>,
}

#[derive(Default)]
struct Counters {
	active: AtomicUsize,
	queued: AtomicUsize,
	submitted: AtomicU64,
	completed: AtomicU64,
	rejected: AtomicU64,
	deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct StatusEntry {
	status: TaskStatus,
	finished_at: Option<Instant>,
}

impl StatusEntry {
	fn live(status: TaskStatus) -> Self {
		Self { status, finished_at: None }
	}
}

struct Shared {
	executor: Arc<TaskExecutor>,
	config: Arc<EngineConfig>,
	clock: Arc<dyn Clock>,
	counters: Counters,
	statuses: Mutex<HashMap<TaskId, StatusEntry>>,
}

impl Shared {
	fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
		self.statuses.lock().insert(task_id.clone(), StatusEntry::live(status));
	}

	fn finish(&self, task_id: &TaskId, status: TaskStatus) {
		let entry = StatusEntry {
			status,
			finished_at: Some(self.clock.now()),
		};
		self.statuses.lock().insert(task_id.clone(), entry);
	}
}

pub struct Scheduler {
	shared: Arc<Shared>,
	dedup: Arc<DedupRegistry>,
	queue: Mutex<Option<mpsc::Sender<Job>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
	/// Starts `config.workers` workers. Must be called inside a tokio runtime.
	pub fn start(executor: Arc<TaskExecutor>, dedup: Arc<DedupRegistry>, config: Arc<EngineConfig>, clock: Arc<dyn Clock>) -> Self {
		let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
		let rx = Arc::new(AsyncMutex::new(rx));
		let shared = Arc::new(Shared {
			executor,
			config: Arc::clone(&config),
			clock,
			counters: Counters::default(),
			statuses: Mutex::new(HashMap::new()),
		});

		let workers = (0..config.workers.max(1))
			.map(|worker| {
				let shared = Arc::clone(&shared);
				let rx = Arc::clone(&rx);
				tokio::spawn(async move { worker_loop(worker, shared, rx).await })
			})
			.collect();

		info!(target = "cube.scheduler", workers = config.workers, queue_capacity = config.queue_capacity, "scheduler started");
		Self {
			shared,
			dedup,
			queue: Mutex::new(Some(tx)),
			workers: Mutex::new(workers),
		}
	}

	/// Queues `task`, failing fast when the queue is full.
	pub fn submit(&self, task: Task) -> Result<Receipt, SubmitError> {
		self.enqueue(task, None)
	}

	/// Queues `task` unless another task with the same dedup key is live.
	/// The key is the task's own, or `userId:prompt` when it has none.
	pub fn submit_dedup(&self, task: Task) -> Result<Submission, SubmitError> {
		let key = task.dedup_key.clone().unwrap_or_else(|| task.default_dedup_key());
		match self.dedup.register(&key, &task.id, self.shared.config.dedup_window()) {
			Ok(guard) => self.enqueue(task, Some(guard)).map(Submission::Accepted),
			Err(in_flight) => {
				self.shared.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
				// A resent task id that is itself the live one keeps its live status.
				if task.id != in_flight {
					self.shared.finish(&task.id, TaskStatus::Deduplicated);
				}
				info!(target = "cube.scheduler", task_id = %task.id, in_flight = %in_flight, "submission deduplicated");
				Ok(Submission::Deduplicated { task_id: task.id, in_flight })
			}
		}
	}

	fn enqueue(&self, task: Task, dedup: Option<DedupGuard>) -> Result<Receipt, SubmitError> {
		let (reply, completion) = oneshot::channel();
		let task_id = task.id.clone();
		let counters = &self.shared.counters;

		let sent = {
			let queue = self.queue.lock();
			let Some(tx) = queue.as_ref() else {
				if let Some(guard) = dedup {
					guard.cancel();
				}
				return Err(SubmitError::ShuttingDown);
			};
			// Count before sending so a fast worker never sees the counter underflow.
			counters.queued.fetch_add(1, Ordering::SeqCst);
			self.shared.set_status(&task_id, TaskStatus::Queued);
			tx.try_send(Job { task, reply, dedup })
		};

		match sent {
			Ok(()) => {
				counters.submitted.fetch_add(1, Ordering::Relaxed);
				debug!(target = "cube.scheduler", task_id = %task_id, "task queued");
				Ok(Receipt { task_id, completion })
			}
			Err(err) => {
				counters.queued.fetch_sub(1, Ordering::SeqCst);
				self.shared.statuses.lock().remove(&task_id);
				let job = match err {
					mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
				};
				if let Some(guard) = job.dedup {
					guard.cancel();
				}
				if self.queue.lock().is_none() {
					return Err(SubmitError::ShuttingDown);
				}
				counters.rejected.fetch_add(1, Ordering::Relaxed);
				let capacity = self.shared.config.queue_capacity;
				warn!(target = "cube.scheduler", task_id = %task_id, capacity, "queue full, task rejected");
				Err(SubmitError::QueueFull { capacity })
			}
		}
	}

	/// Submits every task and waits for all of them. Rejections are reported
	/// per task; one failure never cancels the others.
	pub async fn run_all(&self, tasks: Vec<Task>) -> Vec<Result<TaskResult, SubmitError>> {
		let pending: Vec<_> = tasks
			.into_iter()
			.map(|task| self.submit(task))
			.map(|receipt| async move {
				match receipt {
					Ok(receipt) => receipt.wait().await,
					Err(err) => Err(err),
				}
			})
			.collect();
		join_all(pending).await
	}

	/// Live or recently finished status of `task_id`.
	pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
		self.shared.statuses.lock().get(task_id).map(|entry| entry.status)
	}

	/// Forgets statuses of tasks that finished more than `older_than` ago.
	pub fn purge_finished(&self, older_than: Duration) -> usize {
		let now = self.shared.clock.now();
		let mut statuses = self.shared.statuses.lock();
		let before = statuses.len();
		statuses.retain(|_, entry| entry.finished_at.is_none_or(|at| now.saturating_duration_since(at) < older_than));
		before - statuses.len()
	}

	pub fn snapshot(&self) -> SchedulerSnapshot {
		let counters = &self.shared.counters;
		SchedulerSnapshot {
			workers: self.shared.config.workers.max(1),
			active: counters.active.load(Ordering::SeqCst),
			queued: counters.queued.load(Ordering::SeqCst),
			queue_capacity: self.shared.config.queue_capacity,
			submitted: counters.submitted.load(Ordering::Relaxed),
			completed: counters.completed.load(Ordering::Relaxed),
			rejected: counters.rejected.load(Ordering::Relaxed),
			deduplicated: counters.deduplicated.load(Ordering::Relaxed),
		}
	}

	/// Stops accepting work and waits for queued and running tasks to finish.
	pub async fn shutdown(&self) {
		self.queue.lock().take();
		let workers = std::mem::take(&mut *self.workers.lock());
		for worker in workers {
			if let Err(err) = worker.await {
				warn!(target = "cube.scheduler", error = %err, "worker ended abnormally");
			}
		}
		info!(target = "cube.scheduler", "scheduler stopped");
	}
}

async fn worker_loop(worker: usize, shared: Arc<Shared>, rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
	loop {
		let job = { rx.lock().await.recv().await };
		let Some(job) = job else {
			debug!(target = "cube.scheduler", worker, "queue closed, worker exiting");
			return;
		};
		shared.counters.queued.fetch_sub(1, Ordering::SeqCst);
		shared.counters.active.fetch_add(1, Ordering::SeqCst);

		let Job { task, reply, dedup } = job;
		let task_id = task.id.clone();
		shared.set_status(&task_id, TaskStatus::Running);
		debug!(target = "cube.scheduler", worker, task_id = %task_id, "task picked up");

		let result = run_isolated(&shared, task).await;

		shared.finish(&task_id, result.status.into());
		shared.counters.active.fetch_sub(1, Ordering::SeqCst);
		shared.counters.completed.fetch_add(1, Ordering::Relaxed);
		drop(dedup);
		if reply.send(result).is_err() {
			debug!(target = "cube.scheduler", task_id = %task_id, "submitter stopped waiting");
		}
	}
}

/// Runs the task on its own tokio task under the whole-task deadline.
/// Panics and expiries become failure results that are dispatched here,
/// since the executor never got to do it.
async fn run_isolated(shared: &Shared, task: Task) -> TaskResult {
	let deadline = shared.config.task_deadline(&task);
	let started = tokio::time::Instant::now();
	let trail = Arc::new(StateTrail::new());
	let executor = Arc::clone(&shared.executor);
	let running = task.clone();
	let running_trail = Arc::clone(&trail);
	let mut handle = tokio::spawn(async move { executor.execute_traced(&running, &running_trail).await });

	let failure = match tokio::time::timeout(deadline, &mut handle).await {
		Ok(Ok(result)) => return result,
		Ok(Err(join_error)) if join_error.is_panic() => {
			error!(target = "cube.scheduler", task_id = %task.id, "task panicked");
			TaskError::Internal("task panicked".into())
		}
		Ok(Err(join_error)) => TaskError::Cancelled(join_error.to_string()),
		Err(_) => {
			handle.abort();
			// Wait for the cancelled future to drop so its session lease is free.
			let _ = handle.await;
			warn!(
				target = "cube.scheduler",
				task_id = %task.id,
				deadline = %format_duration(deadline),
				"task deadline expired"
			);
			TaskError::StabilizationTimeout {
				elapsed_ms: started.elapsed().as_millis() as u64,
			}
		}
	};

	trail.enter(TaskState::Failed);
	let result = ResultBuilder::new(&task)
		.error(&failure)
		.duration_ms(started.elapsed().as_millis() as u64)
		.states(trail.snapshot())
		.build();
	shared.executor.dispatcher().deliver(&result).await;
	result
}

fn format_duration(duration: Duration) -> String {
	let secs = duration.as_secs();
	if secs >= 60 { format!("{}m{}s", secs / 60, secs % 60) } else { format!("{}ms", duration.as_millis()) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn durations_format_compactly() {
		assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
		assert_eq!(format_duration(Duration::from_secs(1_830)), "30m30s");
	}

	#[test]
	fn submission_exposes_task_id() {
		let submission = Submission::Deduplicated {
			task_id: TaskId::new("t-2"),
			in_flight: TaskId::new("t-1"),
		};
		assert_eq!(submission.task_id().as_str(), "t-2");
	}
}
