use foreman_core::EngineKind;
use serde::{Deserialize, Serialize};

/// Settings for the orchestration pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Round budget for one run (and for each continue).
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Request length that counts as a complexity signal.
    #[serde(default = "default_triage_min_len")]
    pub triage_min_len: usize,
    /// Engine for the planner; the run's engine when unset.
    #[serde(default)]
    pub planner_engine: Option<EngineKind>,
    /// Engine for the reviewer; the run's engine when unset.
    #[serde(default)]
    pub reviewer_engine: Option<EngineKind>,
}

fn default_max_rounds() -> u32 {
    3
}

fn default_triage_min_len() -> usize {
    160
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            triage_min_len: default_triage_min_len(),
            planner_engine: None,
            reviewer_engine: None,
        }
    }
}
