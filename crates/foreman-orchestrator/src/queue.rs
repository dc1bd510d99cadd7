//! Message intake: one pipeline run at a time, a FIFO of messages that
//! arrived while busy, and fair per-channel draining.

use crate::pipeline::{Pipeline, RunReport, RunRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_agent::{Dispatcher, IdleHook, KillReason};
use foreman_core::{BroadcastBus, BusEvent, ChannelKey, EngineKind, ForemanResult, Message, Role};
use foreman_session::HistoryStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Separator between prompts merged into one drained batch.
pub const BATCH_SEPARATOR: &str = "\n\n---\n\n";

/// What an inbound message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Message,
    Continue,
    Reset,
}

/// A message from any front end.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
    pub channel: ChannelKey,
    /// Engine override for this message.
    pub engine: Option<EngineKind>,
}

impl InboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel: ChannelKey::default(),
            engine: None,
        }
    }

    pub fn with_channel(mut self, channel: ChannelKey) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn intent(&self) -> Intent {
        let text = self.text.trim();
        if text.eq_ignore_ascii_case("continue") || text.eq_ignore_ascii_case("/continue") {
            Intent::Continue
        } else if text.eq_ignore_ascii_case("reset") || text.eq_ignore_ascii_case("/reset") {
            Intent::Reset
        } else {
            Intent::Message
        }
    }
}

/// A message waiting for the main worker.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub prompt: String,
    /// Shortened form for status displays.
    pub display: String,
    pub channel: ChannelKey,
    pub engine: Option<EngineKind>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn new(msg: &InboundMessage) -> Self {
        let prompt = msg.text.trim().to_string();
        let display = if prompt.chars().count() > 80 {
            let cut: String = prompt.chars().take(80).collect();
            format!("{cut}...")
        } else {
            prompt.clone()
        };
        Self {
            prompt,
            display,
            channel: msg.channel.clone(),
            engine: msg.engine,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of [`QueueCoordinator::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A pipeline run started in the background.
    Started,
    /// Busy; the message waits at position `pending`.
    Queued { pending: usize },
    /// Engine recovery state and session bindings were cleared.
    Reset,
    Rejected { reason: String },
}

/// A contiguous same-channel run of queue entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub prompt: String,
    pub channel: ChannelKey,
    pub engine: Option<EngineKind>,
    pub count: usize,
}

/// Pops the head entry plus every immediately following entry on the same
/// channel. Entries from other channels keep their positions.
pub fn take_batch(queue: &mut VecDeque<QueueEntry>) -> Option<Batch> {
    let head = queue.pop_front()?;
    let mut prompts = vec![head.prompt];
    while queue.front().is_some_and(|e| e.channel == head.channel) {
        if let Some(entry) = queue.pop_front() {
            prompts.push(entry.prompt);
        }
    }
    Some(Batch {
        count: prompts.len(),
        prompt: prompts.join(BATCH_SEPARATOR),
        channel: head.channel,
        engine: head.engine,
    })
}

enum Job {
    Run(RunRequest),
    Resume {
        channel: ChannelKey,
        engine: EngineKind,
        system_prompt: Option<String>,
    },
}

/// Serializes pipeline runs and queues messages that arrive while busy.
///
/// Busy means a pipeline run is active or the supervisor's main slot is
/// held. Registered with the supervisor as its [`IdleHook`], so the queue
/// drains whenever the main worker frees up on its own.
pub struct QueueCoordinator {
    self_ref: Weak<Self>,
    pipeline: Arc<Pipeline>,
    history: Arc<dyn HistoryStore>,
    bus: Arc<BroadcastBus>,
    default_engine: EngineKind,
    system_prompt: Option<String>,
    pending: Mutex<VecDeque<QueueEntry>>,
    running: watch::Sender<bool>,
    last_report: Mutex<Option<RunReport>>,
}

impl QueueCoordinator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        history: Arc<dyn HistoryStore>,
        bus: Arc<BroadcastBus>,
        default_engine: EngineKind,
    ) -> Arc<Self> {
        Self::with_system_prompt(pipeline, history, bus, default_engine, None)
    }

    pub fn with_system_prompt(
        pipeline: Arc<Pipeline>,
        history: Arc<dyn HistoryStore>,
        bus: Arc<BroadcastBus>,
        default_engine: EngineKind,
        system_prompt: Option<String>,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pipeline,
            history,
            bus,
            default_engine,
            system_prompt,
            pending: Mutex::new(VecDeque::new()),
            running,
            last_report: Mutex::new(None),
        })
    }

    /// Weak handle for [`foreman_agent::Supervisor::set_idle_hook`].
    pub fn idle_hook(self: &Arc<Self>) -> Weak<dyn IdleHook> {
        let hook: Arc<dyn IdleHook> = self.clone();
        Arc::downgrade(&hook)
    }

    fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        self.pipeline.dispatcher()
    }

    pub fn is_busy(&self) -> bool {
        *self.running.borrow() || self.dispatcher().is_main_busy()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Display text of every queued message, in order.
    pub fn pending_display(&self) -> Vec<String> {
        self.pending.lock().iter().map(|e| e.display.clone()).collect()
    }

    /// Report of the most recent finished run.
    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.lock().clone()
    }

    /// Watch of the pipeline-run flag.
    pub fn running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Waits until no pipeline run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Accepts a message from a front end.
    ///
    /// While older messages are still queued (a stop or steer leaves the
    /// queue undrained), a new message joins the back of the queue and the
    /// oldest batch starts instead.
    pub async fn submit(&self, msg: InboundMessage) -> ForemanResult<SubmitOutcome> {
        self.accept(msg, false).await
    }

    async fn accept(&self, msg: InboundMessage, jump_queue: bool) -> ForemanResult<SubmitOutcome> {
        if msg.text.trim().is_empty() {
            return Ok(SubmitOutcome::Rejected {
                reason: "empty message".into(),
            });
        }
        let intent = msg.intent();

        if self.dispatcher().is_main_busy() || !self.claim() {
            return Ok(match intent {
                Intent::Message => {
                    let pending = {
                        let mut queue = self.pending.lock();
                        queue.push_back(QueueEntry::new(&msg));
                        queue.len()
                    };
                    debug!(pending, channel = ?msg.channel, "Queued message");
                    self.bus.emit(BusEvent::QueueUpdate {
                        pending,
                        channel: Some(msg.channel),
                    });
                    SubmitOutcome::Queued { pending }
                }
                Intent::Continue | Intent::Reset => SubmitOutcome::Rejected {
                    reason: "busy: wait for the current run to finish or stop it".into(),
                },
            });
        }

        let engine = msg.engine.unwrap_or(self.default_engine);
        match intent {
            Intent::Message if !jump_queue && self.pending_len() > 0 => {
                let queued = {
                    let mut queue = self.pending.lock();
                    queue.push_back(QueueEntry::new(&msg));
                    queue.len()
                };
                debug!(pending = queued, channel = ?msg.channel, "Queued behind older messages");
                self.start_batch().await;
                let pending = self.pending_len();
                Ok(if pending == 0 {
                    SubmitOutcome::Started
                } else {
                    SubmitOutcome::Queued { pending }
                })
            }
            Intent::Message => {
                let prompt = msg.text.trim().to_string();
                self.record_user(&prompt, &msg.channel).await;
                self.launch(Job::Run(self.request(prompt, msg.channel, engine)));
                Ok(SubmitOutcome::Started)
            }
            Intent::Continue => {
                info!("Continuing latest orchestration run");
                self.launch(Job::Resume {
                    channel: msg.channel,
                    engine,
                    system_prompt: self.system_prompt.clone(),
                });
                Ok(SubmitOutcome::Started)
            }
            Intent::Reset => {
                let result = self.dispatcher().reset().await;
                self.release();
                result?;
                info!("Session reset");
                self.bus.emit(BusEvent::NewMessage {
                    role: Role::System,
                    content: "Session reset: engine recovery state and session bindings cleared."
                        .into(),
                    channel: msg.channel,
                });
                Ok(SubmitOutcome::Reset)
            }
        }
    }

    /// Interrupts the active run, waits for it to wind down, then starts
    /// `msg` ahead of anything queued. Partial output of the killed worker
    /// stays in history.
    pub async fn steer(&self, msg: InboundMessage) -> ForemanResult<SubmitOutcome> {
        self.interrupt(KillReason::Steer).await;
        info!("Steering with a new message");
        self.accept(msg, true).await
    }

    /// Interrupts the active run. Queued messages stay queued. Returns
    /// whether anything was running.
    pub async fn stop(&self) -> bool {
        self.interrupt(KillReason::Stop).await
    }

    /// Marks the active run as interrupted, so it ends at its next
    /// dispatch boundary, kills the main worker and waits for the run to
    /// finish.
    async fn interrupt(&self, reason: KillReason) -> bool {
        let running = *self.running.borrow();
        if running {
            self.pipeline.interrupt(reason);
        }
        let killed = self.dispatcher().kill_and_wait(reason).await;
        self.wait_idle().await;
        running || killed
    }

    /// Starts a run for the next batch of queued messages. Returns whether
    /// a run started.
    pub async fn drain(&self) -> bool {
        if self.pending_len() == 0 || self.dispatcher().is_main_busy() || !self.claim() {
            return false;
        }
        self.start_batch().await
    }

    /// Takes the head batch and launches it. The caller holds the claim.
    async fn start_batch(&self) -> bool {
        let (batch, remaining) = {
            let mut queue = self.pending.lock();
            let batch = take_batch(&mut queue);
            (batch, queue.len())
        };
        let Some(batch) = batch else {
            self.release();
            return false;
        };
        info!(messages = batch.count, remaining, channel = ?batch.channel, "Draining queue");
        self.record_user(&batch.prompt, &batch.channel).await;
        self.bus.emit(BusEvent::QueueUpdate {
            pending: remaining,
            channel: Some(batch.channel.clone()),
        });
        let engine = batch.engine.unwrap_or(self.default_engine);
        self.launch(Job::Run(self.request(batch.prompt, batch.channel, engine)));
        true
    }

    fn request(&self, prompt: String, channel: ChannelKey, engine: EngineKind) -> RunRequest {
        let mut req = RunRequest::new(prompt, engine).with_channel(channel);
        if let Some(sys) = &self.system_prompt {
            req = req.with_system_prompt(sys.clone());
        }
        req
    }

    fn claim(&self) -> bool {
        let claimed = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if claimed {
            self.pipeline.clear_interrupt();
        }
        claimed
    }

    fn release(&self) {
        self.running.send_replace(false);
    }

    async fn record_user(&self, text: &str, channel: &ChannelKey) {
        let message = Message::user(text).with_channel(channel.clone());
        if let Err(e) = self.history.insert(message).await {
            warn!(error = %e, "Failed to record user message");
        }
        self.bus.emit(BusEvent::NewMessage {
            role: Role::User,
            content: text.to_string(),
            channel: channel.clone(),
        });
    }

    fn launch(&self, job: Job) {
        let Some(this) = self.self_ref.upgrade() else {
            self.release();
            return;
        };
        tokio::spawn(async move {
            let result = match job {
                Job::Run(req) => this.pipeline.run(req).await,
                Job::Resume {
                    channel,
                    engine,
                    system_prompt,
                } => this.pipeline.resume(channel, engine, system_prompt).await,
            };
            let drain = match result {
                Ok(report) => {
                    let killed = matches!(
                        report.kill_reason,
                        Some(KillReason::Steer | KillReason::Stop | KillReason::Shutdown)
                    );
                    *this.last_report.lock() = Some(report);
                    !killed
                }
                Err(e) => {
                    warn!(error = %e, "Pipeline run failed");
                    true
                }
            } && this.pipeline.interrupted().is_none();
            this.release();
            if drain {
                this.drain().await;
            }
        });
    }
}

#[async_trait]
impl IdleHook for QueueCoordinator {
    async fn on_main_idle(&self) {
        if *self.running.borrow() || self.pending_len() == 0 {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.drain().await;
        });
    }
}
