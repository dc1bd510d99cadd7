use crate::types::WorkerRole;
use foreman_agent::SpawnResult;
use foreman_core::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle of one worker within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Done,
    Error,
}

/// Usage accumulated by one worker across rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub dispatches: u32,
    pub turns: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub errors: u32,
    pub duration_ms: u64,
}

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub agent: String,
    pub role: WorkerRole,
    pub engine: EngineKind,
    pub status: WorkerStatus,
    pub metrics: WorkerMetrics,
}

/// Tracks status and usage per worker identity.
pub struct WorkerMonitor {
    states: Arc<RwLock<HashMap<String, WorkerState>>>,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Adds a worker (or refreshes its role and engine) as idle.
    pub async fn register(&self, agent: &str, role: WorkerRole, engine: EngineKind) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| WorkerState {
                agent: agent.to_string(),
                role,
                engine,
                status: WorkerStatus::Idle,
                metrics: WorkerMetrics::default(),
            });
        state.role = role;
        state.engine = engine;
    }

    /// Mark a worker as running a dispatch.
    pub async fn start(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.status = WorkerStatus::Working;
            state.metrics.dispatches += 1;
        }
    }

    /// Folds a finished dispatch into the worker's metrics.
    pub async fn record(&self, agent: &str, result: &SpawnResult, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            let usage = &result.usage;
            state.engine = result.engine;
            state.metrics.turns += usage.turns.unwrap_or(1);
            state.metrics.input_tokens += usage.input_tokens;
            state.metrics.output_tokens += usage.output_tokens;
            state.metrics.cost_usd += usage.cost_usd.unwrap_or(0.0);
            state.metrics.duration_ms += duration_ms;
            if result.is_success() {
                state.status = WorkerStatus::Idle;
            } else {
                state.metrics.errors += 1;
                state.status = WorkerStatus::Error;
            }
        }
    }

    /// Record an error that produced no result.
    pub async fn record_error(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.metrics.errors += 1;
            state.status = WorkerStatus::Error;
        }
    }

    /// Mark a worker as having passed its last phase.
    pub async fn complete(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.status = WorkerStatus::Done;
        }
    }

    /// All workers, sorted by name.
    pub async fn snapshot(&self) -> Vec<WorkerState> {
        let states = self.states.read().await;
        let mut all: Vec<WorkerState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    pub async fn get(&self, agent: &str) -> Option<WorkerState> {
        self.states.read().await.get(agent).cloned()
    }

    /// Aggregate metrics across all workers.
    pub async fn aggregate(&self) -> WorkerMetrics {
        let states = self.states.read().await;
        let mut total = WorkerMetrics::default();
        for state in states.values() {
            total.dispatches += state.metrics.dispatches;
            total.turns += state.metrics.turns;
            total.input_tokens += state.metrics.input_tokens;
            total.output_tokens += state.metrics.output_tokens;
            total.cost_usd += state.metrics.cost_usd;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Forgets every worker; called at the start of each run.
    pub async fn clear(&self) {
        self.states.write().await.clear();
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let workers = self.snapshot().await;
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "workers": workers,
            "aggregate": aggregate,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_agent::{RunStatus, Usage};

    fn result(status: RunStatus, cost: f64) -> SpawnResult {
        SpawnResult {
            status,
            text: "x".into(),
            engine: EngineKind::Codex,
            model: "gpt-5".into(),
            exit_code: Some(0),
            session_id: None,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
                cost_usd: Some(cost),
                turns: Some(3),
                ..Usage::default()
            },
            trace: None,
            attempts: 1,
            kill_reason: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_start() {
        let monitor = WorkerMonitor::new();
        monitor.register("Ana", WorkerRole::Frontend, EngineKind::Claude).await;
        let state = monitor.get("Ana").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);

        monitor.start("Ana").await;
        let state = monitor.get("Ana").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.metrics.dispatches, 1);
    }

    #[tokio::test]
    async fn test_record_usage_and_engine() {
        let monitor = WorkerMonitor::new();
        monitor.register("Bo", WorkerRole::Backend, EngineKind::Claude).await;
        monitor.record("Bo", &result(RunStatus::Completed, 0.5), 1200).await;
        monitor.record("Bo", &result(RunStatus::Completed, 0.25), 800).await;

        let state = monitor.get("Bo").await.unwrap();
        assert_eq!(state.engine, EngineKind::Codex);
        assert_eq!(state.metrics.turns, 6);
        assert_eq!(state.metrics.input_tokens, 200);
        assert!((state.metrics.cost_usd - 0.75).abs() < f64::EPSILON);
        assert_eq!(state.metrics.duration_ms, 2000);
        assert_eq!(state.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_failed_result_counts_error() {
        let monitor = WorkerMonitor::new();
        monitor.register("Cy", WorkerRole::Data, EngineKind::Gemini).await;
        monitor.record("Cy", &result(RunStatus::RateLimited, 0.0), 10).await;
        let state = monitor.get("Cy").await.unwrap();
        assert_eq!(state.metrics.errors, 1);
        assert_eq!(state.status, WorkerStatus::Error);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = WorkerMonitor::new();
        monitor.register("A", WorkerRole::Docs, EngineKind::Claude).await;
        monitor.register("B", WorkerRole::Custom, EngineKind::Claude).await;
        monitor.start("A").await;
        monitor.start("B").await;
        monitor.record_error("B").await;
        monitor.complete("A").await;

        let agg = monitor.aggregate().await;
        assert_eq!(agg.dispatches, 2);
        assert_eq!(agg.errors, 1);

        let json = monitor.to_json().await;
        assert_eq!(json["workers"][0]["agent"], "A");
        assert_eq!(json["workers"][0]["status"], "done");
        assert!(json["aggregate"].is_object());

        monitor.clear().await;
        assert!(monitor.snapshot().await.is_empty());
    }
}
