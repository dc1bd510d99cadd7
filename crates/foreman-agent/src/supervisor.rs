//! The process supervisor: spawns engine workers, streams their output
//! through the protocol adapters, and recovers from rate limits and
//! unavailable engines.
//!
//! At most one *main* worker runs at a time. Its slot, the table of degraded
//! engines and the session binding live behind a single `tokio` mutex.
//! Auxiliary workers (summaries, side questions) run alongside it.

use crate::backends::{EngineBackend, EngineRegistry, Invocation};
use crate::config::SupervisorConfig;
use crate::context::ContextWindow;
use crate::failover::{compute_backoff, failure_summary, next_fallback, FallbackState, FallbackTable};
use crate::process::ProcessLauncher;
use crate::stream::{parse_line, LineBuffer, StreamAccumulator, Usage};
use async_trait::async_trait;
use foreman_core::{
    AgentStatus, BroadcastBus, BusEvent, ChannelKey, EngineKind, ForemanError, ForemanResult,
    Message, Role,
};
use foreman_session::{BindingStore, HistoryStore, SessionBinding};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Injectable sleep used for retry backoff.
pub type SleepFn =
    Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why a worker was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The user redirected the conversation; partial output is kept and the
    /// queue is not drained.
    Steer,
    /// The user stopped the run; the queue is not drained.
    Stop,
    /// The host is shutting down.
    Shutdown,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KillReason::Steer => "steer",
            KillReason::Stop => "stop",
            KillReason::Shutdown => "shutdown",
        })
    }
}

/// How one spawn resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The engine produced its answer.
    Completed,
    /// The worker was killed.
    Interrupted,
    /// Rate limited with no retry or fallback left.
    RateLimited,
    /// Non-zero exit without output.
    Failed {
        /// Diagnosis built from stderr.
        summary: String,
    },
    /// The engine binary is not installed (exit code 127).
    MissingTool,
    /// The process could not be started.
    SpawnFailed {
        /// OS error text.
        error: String,
    },
    /// No backend handles the engine.
    Unsupported,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => f.write_str("completed"),
            RunStatus::Interrupted => f.write_str("interrupted"),
            RunStatus::RateLimited => f.write_str("rate limited"),
            RunStatus::Failed { summary } => write!(f, "failed: {summary}"),
            RunStatus::MissingTool => f.write_str("engine binary not found"),
            RunStatus::SpawnFailed { error } => write!(f, "spawn failed: {error}"),
            RunStatus::Unsupported => f.write_str("unsupported engine"),
        }
    }
}

/// Options for one [`Supervisor::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Requested engine.
    pub engine: EngineKind,
    /// Model; the engine default when `None`.
    pub model: Option<String>,
    /// Reasoning effort; the engine default when `None`.
    pub effort: Option<String>,
    /// Occupies the single main slot.
    pub main: bool,
    /// Output is not recorded into history.
    pub internal: bool,
    /// Opaque system prompt (skills, memory, role instructions).
    pub system_prompt: Option<String>,
    /// Resume the bound session when it belongs to the same engine.
    pub resume: bool,
    /// Display label for status events, e.g. the worker name.
    pub label: Option<String>,
    /// Conversation the output belongs to.
    pub channel: ChannelKey,
}

impl SpawnOptions {
    /// Auxiliary, non-internal, fresh invocation of `engine`.
    pub fn new(engine: EngineKind) -> Self {
        Self {
            engine,
            model: None,
            effort: None,
            main: false,
            internal: false,
            system_prompt: None,
            resume: false,
            label: None,
            channel: ChannelKey::default(),
        }
    }

    /// Marks the spawn as the main worker.
    pub fn main(mut self) -> Self {
        self.main = true;
        self
    }

    /// Keeps output out of history.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Requests a session resume.
    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the effort.
    pub fn with_effort(mut self, effort: impl Into<String>) -> Self {
        self.effort = Some(effort.into());
        self
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the conversation.
    pub fn with_channel(mut self, channel: ChannelKey) -> Self {
        self.channel = channel;
        self
    }
}

/// Outcome of one [`Supervisor::spawn`], after retries and fallbacks.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    /// Final status.
    pub status: RunStatus,
    /// Assistant text (prefixed with `[interrupted] ` after a steer).
    pub text: String,
    /// Engine that produced the final attempt.
    pub engine: EngineKind,
    /// Model of the final attempt.
    pub model: String,
    /// Exit code of the final attempt; 127 for a missing binary.
    pub exit_code: Option<i32>,
    /// Session id announced by the engine.
    pub session_id: Option<String>,
    /// Usage of the final attempt.
    pub usage: Usage,
    /// Tool/thinking trace of the final attempt.
    pub trace: Option<String>,
    /// Attempts made, across retries and fallbacks.
    pub attempts: u32,
    /// Set when the worker was killed.
    pub kill_reason: Option<KillReason>,
}

impl SpawnResult {
    fn new(engine: EngineKind, model: &str) -> Self {
        Self {
            status: RunStatus::Unsupported,
            text: String::new(),
            engine,
            model: model.to_string(),
            exit_code: None,
            session_id: None,
            usage: Usage::default(),
            trace: None,
            attempts: 0,
            kill_reason: None,
        }
    }

    /// Whether the engine produced its answer.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Called when the main slot frees up for a reason other than a steer or
/// stop kill. Implemented by the queue coordinator.
#[async_trait]
pub trait IdleHook: Send + Sync {
    /// The main worker finished.
    async fn on_main_idle(&self);
}

/// What the orchestration pipeline and queue need from the supervisor.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Runs one worker invocation to completion.
    async fn dispatch(&self, prompt: &str, opts: SpawnOptions) -> ForemanResult<SpawnResult>;

    /// Whether the main slot is held.
    fn is_main_busy(&self) -> bool;

    /// Kills the main worker and waits for the slot to free up.
    async fn kill_and_wait(&self, reason: KillReason) -> bool;

    /// Clears degraded engines and session bindings.
    async fn reset(&self) -> ForemanResult<()>;
}

/// One live engine process.
#[derive(Debug)]
pub struct ProcessRun {
    /// Unique id, for logs.
    pub id: Uuid,
    /// Engine running.
    pub engine: EngineKind,
    /// Model running.
    pub model: String,
    /// Effort, if any.
    pub effort: Option<String>,
    /// Whether this is the main worker.
    pub main: bool,
    settled: AtomicBool,
}

impl ProcessRun {
    fn new(engine: EngineKind, model: &str, effort: Option<String>, main: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            engine,
            model: model.to_string(),
            effort,
            main,
            settled: AtomicBool::new(false),
        }
    }

    /// Marks the run resolved. Only the first caller gets `true`.
    pub fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    /// Whether the run has resolved.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct MainSlot {
    run: Option<Arc<ProcessRun>>,
    cancel: CancellationToken,
    kill_reason: Option<KillReason>,
}

#[derive(Default)]
struct SupervisorState {
    main: Option<MainSlot>,
    aux: HashMap<Uuid, CancellationToken>,
    fallbacks: FallbackTable,
    binding: Option<SessionBinding>,
    binding_loaded: bool,
}

/// Owns every engine process.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: EngineRegistry,
    launcher: Arc<dyn ProcessLauncher>,
    history: Arc<dyn HistoryStore>,
    bindings: Arc<dyn BindingStore>,
    bus: Arc<BroadcastBus>,
    state: Mutex<SupervisorState>,
    main_busy: watch::Sender<bool>,
    idle_hook: OnceLock<Weak<dyn IdleHook>>,
    sleep_fn: SleepFn,
}

impl Supervisor {
    /// Creates a supervisor. Backoff uses `tokio::time::sleep`.
    pub fn new(
        config: SupervisorConfig,
        registry: EngineRegistry,
        launcher: Arc<dyn ProcessLauncher>,
        history: Arc<dyn HistoryStore>,
        bindings: Arc<dyn BindingStore>,
        bus: Arc<BroadcastBus>,
    ) -> Self {
        let (main_busy, _) = watch::channel(false);
        Self {
            config,
            registry,
            launcher,
            history,
            bindings,
            bus,
            state: Mutex::new(SupervisorState::default()),
            main_busy,
            idle_hook: OnceLock::new(),
            sleep_fn: Arc::new(|d: Duration| {
                Box::pin(tokio::time::sleep(d)) as Pin<Box<dyn Future<Output = ()> + Send>>
            }),
        }
    }

    /// Replaces the backoff sleep (tests skip real delays).
    pub fn with_sleep(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    /// Registers the idle callback. Only the first registration takes
    /// effect; returns whether this one did.
    pub fn set_idle_hook(&self, hook: Weak<dyn IdleHook>) -> bool {
        self.idle_hook.set(hook).is_ok()
    }

    /// Configuration in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Whether the main slot is held.
    pub fn is_main_busy(&self) -> bool {
        *self.main_busy.borrow()
    }

    /// Recovery state of `engine`, if it is degraded.
    pub async fn fallback_state(&self, engine: EngineKind) -> Option<FallbackState> {
        self.state.lock().await.fallbacks.get(engine).cloned()
    }

    /// The session the main conversation is bound to.
    pub async fn binding(&self) -> Option<SessionBinding> {
        let mut state = self.state.lock().await;
        self.ensure_binding_loaded(&mut state).await;
        state.binding.clone()
    }

    /// Runs `prompt` on the requested engine, retrying and falling back as
    /// needed. A main spawn while the main slot is held fails with
    /// [`ForemanError::Busy`].
    pub async fn spawn(&self, prompt: &str, opts: SpawnOptions) -> ForemanResult<SpawnResult> {
        let cancel = CancellationToken::new();
        let aux_id = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            if opts.main {
                if state.main.is_some() {
                    return Err(ForemanError::Busy);
                }
                state.main = Some(MainSlot {
                    run: None,
                    cancel: cancel.clone(),
                    kill_reason: None,
                });
                self.main_busy.send_replace(true);
            } else {
                state.aux.insert(aux_id, cancel.clone());
            }
        }

        let result = self.run_with_recovery(prompt, &opts, &cancel).await;
        self.finish(&opts, &result).await;

        {
            let mut state = self.state.lock().await;
            if opts.main {
                state.main = None;
                self.main_busy.send_replace(false);
            } else {
                state.aux.remove(&aux_id);
            }
        }

        if opts.main
            && !matches!(
                result.kill_reason,
                Some(KillReason::Steer) | Some(KillReason::Stop)
            )
        {
            if let Some(hook) = self.idle_hook.get().and_then(Weak::upgrade) {
                hook.on_main_idle().await;
            }
        }
        Ok(result)
    }

    /// Kills the main worker (and, on shutdown, every auxiliary worker).
    /// Cancels a pending retry backoff. Returns whether anything was
    /// running.
    pub async fn kill(&self, reason: KillReason) -> bool {
        let mut state = self.state.lock().await;
        let mut any = false;
        if let Some(slot) = state.main.as_mut() {
            slot.kill_reason.get_or_insert(reason);
            slot.cancel.cancel();
            any = true;
            info!(
                reason = %reason,
                run = ?slot.run.as_ref().map(|r| r.id),
                "Killing main worker"
            );
        }
        if reason == KillReason::Shutdown {
            for token in state.aux.values() {
                token.cancel();
                any = true;
            }
        }
        any
    }

    /// Kills the main worker and waits until its slot is released.
    pub async fn kill_and_wait(&self, reason: KillReason) -> bool {
        let killed = self.kill(reason).await;
        let mut rx = self.main_busy.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
        killed
    }

    /// Forgets every degraded engine and every session binding.
    pub async fn reset(&self) -> ForemanResult<()> {
        {
            let mut state = self.state.lock().await;
            state.fallbacks.reset();
            state.binding = None;
            state.binding_loaded = true;
        }
        self.bindings.save(None).await?;
        info!("Supervisor reset: fallbacks and session bindings cleared");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery loop
    // -----------------------------------------------------------------------

    async fn run_with_recovery(
        &self,
        prompt: &str,
        opts: &SpawnOptions,
        cancel: &CancellationToken,
    ) -> SpawnResult {
        let policy = &self.config.retry;
        let mut engine = opts.engine;
        let spec = self.config.engine(engine);
        let mut model = opts
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| spec.default_model.clone());
        let mut effort = spec.effort(opts.effort.as_deref());
        let mut tried = vec![engine];
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut result = self
                .attempt(prompt, opts, engine, &model, effort.clone(), cancel)
                .await;
            result.attempts = attempts;

            match &result.status {
                RunStatus::Completed => {
                    if self.state.lock().await.fallbacks.clear(engine) {
                        info!(engine = %engine, "Engine recovered");
                    }
                    return result;
                }
                RunStatus::Interrupted | RunStatus::Unsupported => return result,
                RunStatus::RateLimited => {
                    let retry = self.state.lock().await.fallbacks.take_retry(engine, policy);
                    if let Some(n) = retry {
                        let delay_ms = compute_backoff(policy, n);
                        info!(engine = %engine, attempt = n + 1, delay_ms, "Rate limited, backing off");
                        self.bus.emit(BusEvent::AgentRetry {
                            engine,
                            attempt: n + 1,
                            delay_ms,
                        });
                        self.emit_status(engine, &model, AgentStatus::Retrying, opts);
                        let cancelled = tokio::select! {
                            () = (self.sleep_fn)(Duration::from_millis(delay_ms)) => false,
                            () = cancel.cancelled() => true,
                        };
                        if cancelled {
                            result.status = RunStatus::Interrupted;
                            result.kill_reason = self.kill_reason(opts.main).await;
                            return result;
                        }
                        continue;
                    }
                }
                _ => {
                    self.state
                        .lock()
                        .await
                        .fallbacks
                        .record_failure(engine, policy);
                }
            }

            let Some(next) = next_fallback(&self.config.fallback_order, &tried) else {
                warn!(engine = %engine, status = %result.status, "No fallback engine left");
                return result;
            };
            let reason = result.status.to_string();
            self.state
                .lock()
                .await
                .fallbacks
                .set_fallback(engine, next, policy);
            warn!(from = %engine, to = %next, reason = %reason, "Falling back to another engine");
            self.bus.emit(BusEvent::AgentFallback {
                from: engine,
                to: next,
                reason,
            });

            engine = next;
            tried.push(next);
            let spec = self.config.engine(next);
            model = spec.default_model.clone();
            effort = spec.effort(None);
        }
    }

    // -----------------------------------------------------------------------
    // One process
    // -----------------------------------------------------------------------

    async fn attempt(
        &self,
        prompt: &str,
        opts: &SpawnOptions,
        engine: EngineKind,
        model: &str,
        effort: Option<String>,
        cancel: &CancellationToken,
    ) -> SpawnResult {
        let mut result = SpawnResult::new(engine, model);

        let Some(backend) = self.registry.get(engine) else {
            warn!(engine = %engine, "No backend registered for engine");
            return result;
        };
        let spec = self.config.engine(engine);
        let Some(program) = self.launcher.locate(&spec.binary) else {
            warn!(engine = %engine, binary = %spec.binary, "Engine binary not found");
            result.status = RunStatus::MissingTool;
            result.exit_code = Some(127);
            return result;
        };

        let resume_session = if opts.resume {
            self.resumable_session(engine).await
        } else {
            None
        };
        let context_block = if resume_session.is_none() {
            self.context_block(prompt, opts).await
        } else {
            None
        };
        let native = backend.native_system_prompt();
        let inv = Invocation {
            engine,
            model: model.to_string(),
            effort,
            permission_mode: self.config.permission_mode,
            system_prompt: if native { context_block.clone() } else { None },
            resume_session,
            prompt: prompt.to_string(),
        };
        let args = backend.build_args(&inv);
        if args.is_empty() {
            return result;
        }
        let payload = backend.stdin_payload(&inv, if native { None } else { context_block.as_deref() });

        if cancel.is_cancelled() {
            result.status = RunStatus::Interrupted;
            result.kill_reason = self.kill_reason(opts.main).await;
            return result;
        }

        let run = Arc::new(ProcessRun::new(engine, model, inv.effort.clone(), opts.main));
        if opts.main {
            if let Some(slot) = self.state.lock().await.main.as_mut() {
                slot.run = Some(Arc::clone(&run));
            }
        }
        debug!(
            run = %run.id,
            engine = %engine,
            model = %model,
            resume = inv.is_resume(),
            main = opts.main,
            "Launching engine"
        );
        self.emit_status(engine, model, AgentStatus::Running, opts);

        let mut launched = match self.launcher.launch(&program, &args).await {
            Ok(p) => p,
            Err(e) => {
                if run.settle() {
                    warn!(engine = %engine, error = %e, "Failed to spawn engine");
                    result.status = RunStatus::SpawnFailed {
                        error: e.to_string(),
                    };
                }
                return result;
            }
        };

        let stdout_task = tokio::spawn(read_events(
            launched.stdout,
            Arc::clone(&backend),
            Arc::clone(&self.bus),
            engine,
        ));
        let stderr_task = tokio::spawn(read_all(launched.stderr));
        let stdin_task = launched.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "Engine closed stdin early");
                }
                let _ = stdin.shutdown().await;
            })
        });

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let child = &mut launched.child;
        let exit = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => {
                if let Err(e) = child.terminate() {
                    debug!(error = %e, "Terminate request failed");
                }
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(engine = %engine, grace_ms = self.config.kill_grace_ms, "Engine ignored terminate, killing");
                        let _ = child.kill().await;
                        child.wait().await
                    }
                }
            }
        };
        if let Some(task) = stdin_task {
            task.abort();
        }

        let acc = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = exit.unwrap_or_else(|e| {
            warn!(engine = %engine, error = %e, "Failed to wait for engine");
            None
        });

        if !run.settle() {
            return result;
        }

        result.exit_code = exit_code;
        result.session_id = acc.session_id().map(str::to_string);
        result.usage = acc.usage().clone();
        result.trace = acc.trace();
        let mut text = acc.text().trim().to_string();
        let errors = acc.errors().join("\n");

        let status = if cancel.is_cancelled() {
            let reason = self.kill_reason(opts.main).await;
            if reason == Some(KillReason::Steer) && !text.is_empty() {
                text = format!("[interrupted] {text}");
            }
            result.kill_reason = reason;
            RunStatus::Interrupted
        } else if backend.is_rate_limited(exit_code, &format!("{stderr}\n{errors}"), &text) {
            RunStatus::RateLimited
        } else if exit_code == Some(0) {
            RunStatus::Completed
        } else if !text.is_empty() {
            warn!(engine = %engine, exit_code = ?exit_code, "Engine exited non-zero but produced output");
            RunStatus::Completed
        } else {
            let diagnostics = if stderr.trim().is_empty() { &errors } else { &stderr };
            RunStatus::Failed {
                summary: failure_summary(engine, exit_code, diagnostics),
            }
        };
        result.status = status;
        result.text = text;

        debug!(
            run = %run.id,
            engine = %engine,
            exit_code = ?exit_code,
            status = %result.status,
            text_len = result.text.len(),
            "Engine exited"
        );
        result
    }

    /// Records output, refreshes the binding and broadcasts the outcome.
    async fn finish(&self, opts: &SpawnOptions, result: &SpawnResult) {
        let recordable = matches!(result.status, RunStatus::Completed | RunStatus::Interrupted);
        if !opts.internal && recordable && !result.text.trim().is_empty() {
            let mut message = Message::assistant(result.text.clone())
                .with_engine(result.engine, result.model.clone())
                .with_channel(opts.channel.clone());
            if let Some(trace) = &result.trace {
                message = message.with_trace(trace.clone());
            }
            match self.history.insert(message).await {
                Ok(_) => {
                    self.bus.emit(BusEvent::NewMessage {
                        role: Role::Assistant,
                        content: result.text.clone(),
                        channel: opts.channel.clone(),
                    });
                }
                Err(e) => warn!(error = %e, "Failed to record assistant message"),
            }
        }

        if opts.main && !opts.internal && result.is_success() {
            if let Some(sid) = &result.session_id {
                let binding = SessionBinding::new(result.engine, sid.clone());
                self.state.lock().await.binding = Some(binding.clone());
                if let Err(e) = self.bindings.save(Some(&binding)).await {
                    warn!(error = %e, "Failed to persist session binding");
                }
            }
        }

        let status = if result.is_success() || result.status == RunStatus::Interrupted {
            AgentStatus::Done
        } else {
            AgentStatus::Error
        };
        self.emit_status(result.engine, &result.model, status, opts);
        self.bus.emit(BusEvent::AgentDone {
            engine: result.engine,
            model: result.model.clone(),
            exit_code: result.exit_code,
            text: result.text.clone(),
            internal: opts.internal,
            cost_usd: result.usage.cost_usd,
        });
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn emit_status(&self, engine: EngineKind, model: &str, status: AgentStatus, opts: &SpawnOptions) {
        self.bus.emit(BusEvent::AgentStatus {
            engine,
            model: model.to_string(),
            status,
            main: opts.main,
            label: opts.label.clone(),
        });
    }

    async fn kill_reason(&self, main: bool) -> Option<KillReason> {
        if main {
            self.state
                .lock()
                .await
                .main
                .as_ref()
                .and_then(|s| s.kill_reason)
        } else {
            Some(KillReason::Shutdown)
        }
    }

    async fn ensure_binding_loaded(&self, state: &mut SupervisorState) {
        if state.binding_loaded {
            return;
        }
        state.binding = self.bindings.load().await.unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable session binding");
            None
        });
        state.binding_loaded = true;
    }

    async fn resumable_session(&self, engine: EngineKind) -> Option<String> {
        let mut state = self.state.lock().await;
        self.ensure_binding_loaded(&mut state).await;
        let sid = state
            .binding
            .as_ref()
            .and_then(|b| b.resumable_for(engine))
            .map(str::to_string);
        if sid.is_none() {
            debug!(engine = %engine, "No resumable session, starting fresh");
        }
        sid
    }

    async fn context_block(&self, prompt: &str, opts: &SpawnOptions) -> Option<String> {
        let mut window = ContextWindow::new(self.config.history_context);
        if let Some(sys) = &opts.system_prompt {
            window.set_system_prompt(sys.clone());
        }
        if !opts.internal && self.config.history_context > 0 {
            match self.history.recent(self.config.history_context + 1).await {
                Ok(messages) => window.extend(
                    messages
                        .into_iter()
                        .filter(|m| !(m.role == Role::User && m.content == prompt)),
                ),
                Err(e) => warn!(error = %e, "Failed to load history for context"),
            }
        }
        window.render()
    }
}

#[async_trait]
impl Dispatcher for Supervisor {
    async fn dispatch(&self, prompt: &str, opts: SpawnOptions) -> ForemanResult<SpawnResult> {
        self.spawn(prompt, opts).await
    }

    fn is_main_busy(&self) -> bool {
        Supervisor::is_main_busy(self)
    }

    async fn kill_and_wait(&self, reason: KillReason) -> bool {
        Supervisor::kill_and_wait(self, reason).await
    }

    async fn reset(&self) -> ForemanResult<()> {
        Supervisor::reset(self).await
    }
}

// ---------------------------------------------------------------------------
// Stream readers
// ---------------------------------------------------------------------------

async fn read_events(
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    backend: Arc<dyn EngineBackend>,
    bus: Arc<BroadcastBus>,
    engine: EngineKind,
) -> StreamAccumulator {
    let mut acc = StreamAccumulator::new();
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    fold_line(&line, backend.as_ref(), &bus, engine, &mut acc);
                }
            }
            Err(e) => {
                warn!(engine = %engine, error = %e, "Engine stdout read failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        fold_line(&line, backend.as_ref(), &bus, engine, &mut acc);
    }
    acc
}

fn fold_line(
    line: &str,
    backend: &dyn EngineBackend,
    bus: &BroadcastBus,
    engine: EngineKind,
    acc: &mut StreamAccumulator,
) {
    let Some(value) = parse_line(line) else {
        trace!(engine = %engine, "Skipping non-JSON line");
        return;
    };
    let event = backend.parse_event(&value);
    for label in &event.labels {
        bus.emit(BusEvent::AgentTool {
            engine,
            kind: label.kind,
            label: label.text.clone(),
        });
    }
    acc.apply(&event);
}

async fn read_all(mut stderr: Box<dyn AsyncRead + Send + Unpin>) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        debug!(error = %e, "Engine stderr read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
