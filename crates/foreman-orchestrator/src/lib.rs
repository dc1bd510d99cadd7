//! Multi-worker orchestration on top of the Foreman supervisor.
//!
//! Complex requests are split by a planner into subtasks, one per configured
//! employee, and driven through review rounds where each worker advances
//! along its role's phase sequence on a pass verdict. Every step is traced
//! in the markdown worklog so an interrupted or capped run can be resumed.
//!
//! # Main types
//!
//! - [`Pipeline`]: Runs one request from triage to the final answer.
//! - [`QueueCoordinator`]: One run at a time; fair per-channel draining.
//! - [`AgentPhase`]: A worker's position in its phase sequence.
//! - [`WorkerMonitor`]: Per-worker usage and status.
//! - [`OrchestratorConfig`]: Round budget, triage threshold, engine overrides.

/// Orchestrator settings.
pub mod config;
/// Per-worker usage and status tracking.
pub mod monitor;
/// Planner and reviewer reply decoding.
pub mod parse;
/// The orchestration state machine.
pub mod pipeline;
/// Prompt templates and report rendering.
pub mod profiles;
/// Inbound message queue and drain.
pub mod queue;
/// Complexity triage of incoming requests.
pub mod triage;
/// Roles, phases, subtasks and verdicts.
pub mod types;

pub use config::OrchestratorConfig;
pub use monitor::{WorkerMetrics, WorkerMonitor, WorkerState, WorkerStatus};
pub use parse::{parse_plan, parse_review, Plan, Review};
pub use pipeline::{Pipeline, RunOutcome, RunReport, RunRequest};
pub use queue::{InboundMessage, Intent, QueueCoordinator, QueueEntry, SubmitOutcome};
pub use triage::{assess, Assessment, Signal};
pub use types::{AgentPhase, Employee, Phase, Subtask, Verdict, VerdictRecord, WorkerRole};
