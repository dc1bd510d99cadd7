use thiserror::Error;

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Top-level error type for Foreman.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// An error from a worker invocation that could not be recovered locally.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An engine is unknown, unsupported or misconfigured.
    #[error("Engine error: {0}")]
    Engine(String),

    /// An error from the history store or session bindings.
    #[error("Session error: {0}")]
    Session(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error reading or writing a worklog.
    #[error("Worklog error: {0}")]
    Worklog(String),

    /// An error from the queue coordinator.
    #[error("Queue error: {0}")]
    Queue(String),

    /// An error from the orchestration pipeline.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// The main worker slot is already held by another process.
    #[error("Main worker slot is busy")]
    Busy,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
