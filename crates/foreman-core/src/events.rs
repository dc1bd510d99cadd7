//! Process-wide publish/subscribe channel.
//!
//! Components emit typed [`BusEvent`]s; every registered listener receives
//! them synchronously, in registration order. There is no buffering and no
//! persistence: a listener registered after an emit never sees it.
//!
//! Delivery iterates over a snapshot of the listener set, so a listener may
//! subscribe or unsubscribe (itself or others) while an event is in flight
//! without deadlocking; the change takes effect from the next emit.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{ChannelKey, EngineKind, Role};

/// Lifecycle state of one worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The engine process is running.
    Running,
    /// Waiting out a rate-limit backoff before retrying.
    Retrying,
    /// The invocation finished with output.
    Done,
    /// The invocation failed after retries and fallbacks.
    Error,
}

/// Kind of a live-display label extracted from an engine stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    /// A tool or command the engine is executing.
    Tool,
    /// A reasoning / thinking fragment.
    Thinking,
}

/// Every event that travels over the [`BroadcastBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// A worker changed lifecycle state.
    AgentStatus {
        engine: EngineKind,
        model: String,
        status: AgentStatus,
        main: bool,
        #[serde(default)]
        label: Option<String>,
    },
    /// A tool or thinking label parsed from a worker stream.
    AgentTool {
        engine: EngineKind,
        kind: LabelKind,
        label: String,
    },
    /// A worker invocation resolved.
    AgentDone {
        engine: EngineKind,
        model: String,
        exit_code: Option<i32>,
        text: String,
        internal: bool,
        #[serde(default)]
        cost_usd: Option<f64>,
    },
    /// The supervisor switched to another engine.
    AgentFallback {
        from: EngineKind,
        to: EngineKind,
        reason: String,
    },
    /// The supervisor is retrying the same engine after a rate limit.
    AgentRetry {
        engine: EngineKind,
        attempt: u32,
        delay_ms: u64,
    },
    /// A message entered the history.
    NewMessage {
        role: Role,
        content: String,
        channel: ChannelKey,
    },
    /// The pending queue changed size.
    QueueUpdate {
        pending: usize,
        #[serde(default)]
        channel: Option<ChannelKey>,
    },
    /// An orchestration round began.
    RoundStart {
        round: u32,
        max_rounds: u32,
        agents: Vec<String>,
    },
    /// An orchestration round was reviewed.
    RoundDone {
        round: u32,
        passed: Vec<String>,
        failed: Vec<String>,
        completed: Vec<String>,
    },
    /// A worklog file was created for a run.
    WorklogCreated { path: String },
    /// An orchestration run ended (direct answer, done, partial or interrupted).
    OrchestrateDone {
        text: String,
        channel: ChannelKey,
        partial: bool,
        #[serde(default)]
        pending: Vec<String>,
        #[serde(default)]
        worklog: Option<String>,
    },
}

impl BusEvent {
    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::AgentStatus { .. } => "agent_status",
            BusEvent::AgentTool { .. } => "agent_tool",
            BusEvent::AgentDone { .. } => "agent_done",
            BusEvent::AgentFallback { .. } => "agent_fallback",
            BusEvent::AgentRetry { .. } => "agent_retry",
            BusEvent::NewMessage { .. } => "new_message",
            BusEvent::QueueUpdate { .. } => "queue_update",
            BusEvent::RoundStart { .. } => "round_start",
            BusEvent::RoundDone { .. } => "round_done",
            BusEvent::WorklogCreated { .. } => "worklog_created",
            BusEvent::OrchestrateDone { .. } => "orchestrate_done",
        }
    }
}

/// A timestamped event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Emission time.
    pub ts: DateTime<Utc>,
    /// The event payload.
    #[serde(flatten)]
    pub event: BusEvent,
}

/// Handle returned by [`BroadcastBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returns `false` once it can no longer receive, which unregisters it.
type Listener = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Synchronous, in-order fan-out of [`BusEvent`]s.
pub struct BroadcastBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl BroadcastBus {
    /// Creates an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a listener. Listeners are called in registration order.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(Arc::new(move |envelope: &Envelope| {
            listener(envelope);
            true
        }))
    }

    /// Registers a listener that forwards every envelope into an unbounded
    /// channel. Useful for async consumers (WebSocket writers, tests). The
    /// listener unregisters itself on the first event after the receiver
    /// is dropped.
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Arc::new(move |envelope: &Envelope| {
            tx.send(envelope.clone()).is_ok()
        }));
        (id, rx)
    }

    fn register(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Stamps `event` and delivers it to a snapshot of the current
    /// listeners. Returns how many listeners were called.
    pub fn emit(&self, event: BusEvent) -> usize {
        let envelope = Envelope {
            ts: Utc::now(),
            event,
        };
        let snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        tracing::trace!(kind = envelope.event.kind(), listeners = snapshot.len(), "bus emit");
        let mut closed = Vec::new();
        for (id, listener) in &snapshot {
            if !listener(&envelope) {
                closed.push(*id);
            }
        }
        if !closed.is_empty() {
            self.listeners.write().retain(|(id, _)| !closed.contains(id));
            tracing::debug!(removed = closed.len(), "Dropped closed bus listeners");
        }
        snapshot.len()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }
}
