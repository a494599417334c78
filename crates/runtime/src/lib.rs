//! Task orchestration and resource coordination for browser-driven providers.
//!
//! The engine decides when and how many provider interactions run, which
//! per-user browser session backs each one, when a streamed answer has
//! finished rendering, and how the single host clipboard is shared.
//!
//! ```text
//! Scheduler ──► TaskExecutor ──► SessionPool ──► ProviderDriver
//!    │               │  ├─► Stabilizer (await_stable)
//!    │               │  ├─► RetryController
//!    │               │  └─► ClipboardLock
//!    └─ DedupRegistry └────► ResultDispatcher ──► LiveChannel / Persistence
//! ```
//!
//! Everything shared is owned by an [`Engine`] and injected; there are no
//! process globals.

pub mod clipboard;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod modes;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod stabilize;
pub mod state;
pub mod task;
pub mod testing;

pub use clipboard::{ClipboardGuard, ClipboardLock};
pub use clock::{Clock, TokioClock, VirtualClock, within};
pub use config::{EngineConfig, StabilizationProfiles};
pub use dedup::{DedupDecision, DedupGuard, DedupRegistry};
pub use dispatch::{DispatchError, DispatchStats, LiveChannel, MemoryChannel, NullPersistence, Persistence, ResultDispatcher};
pub use driver::{LoginStatus, OpenedSession, ProviderDriver, SessionHandle};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, Result, TaskError};
pub use executor::TaskExecutor;
pub use modes::{ModeOutcome, ensure_mode};
pub use result::{ResultBuilder, ResultStatus, TaskResult};
pub use retry::{RetryController, RetryFailure, RetryPolicy, Retried};
pub use scheduler::{Receipt, Scheduler, SchedulerSnapshot, SubmitError, Submission};
pub use session::{SessionKey, SessionLease, SessionPool, SessionSnapshot};
pub use stabilize::{Progress, SnapshotSource, StabilizationPolicy, Stabilizer, await_stable};
pub use state::{StateTrail, TaskState};
pub use task::{DEEP_THINKING, ModeFlag, ModeFlags, Task, TaskId, TaskKind, TaskStatus, WEB_SEARCH};
