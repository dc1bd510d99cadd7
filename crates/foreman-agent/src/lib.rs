//! Engine workers for Foreman.
//!
//! The [`Supervisor`] launches external command-line engines, feeds them a
//! prompt, and folds their NDJSON output into a [`SpawnResult`] through the
//! per-engine [`EngineBackend`] adapters. Rate limits are retried with
//! backoff; exhausted or missing engines fall back to the next configured
//! engine.

pub mod backends;
pub mod config;
pub mod context;
pub mod failover;
pub mod process;
pub mod stream;
pub mod supervisor;

pub use backends::{EngineBackend, EngineRegistry, Invocation};
pub use config::{EngineSpec, PermissionMode, SupervisorConfig};
pub use context::ContextWindow;
pub use failover::{FallbackState, RetryPolicy};
pub use process::{ChildControl, LaunchedProcess, ProcessLauncher, TokioLauncher};
pub use stream::{LineBuffer, ParsedEvent, StreamAccumulator, Usage};
pub use supervisor::{
    Dispatcher, IdleHook, KillReason, RunStatus, SleepFn, SpawnOptions, SpawnResult, Supervisor,
};
