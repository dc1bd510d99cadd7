use foreman_core::{EngineKind, ForemanError};
use foreman_session::{MatrixRow, PlanEntry, RowStatus};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role of a worker; fixes the phase sequence it passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// User-facing code.
    Frontend,
    /// Services, APIs, storage.
    Backend,
    /// Data pipelines, schemas, migrations.
    Data,
    /// Documentation.
    Docs,
    /// Narrowly scoped one-off work.
    Custom,
}

impl WorkerRole {
    /// Ordered phases for the role.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            WorkerRole::Frontend | WorkerRole::Backend => &[
                Phase::Plan,
                Phase::PlanVerify,
                Phase::Build,
                Phase::Debug,
                Phase::IntegrationVerify,
            ],
            WorkerRole::Data => &[
                Phase::Plan,
                Phase::Build,
                Phase::Debug,
                Phase::IntegrationVerify,
            ],
            WorkerRole::Docs => &[Phase::Plan, Phase::Build],
            WorkerRole::Custom => &[Phase::Build],
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Frontend => "frontend",
            WorkerRole::Backend => "backend",
            WorkerRole::Data => "data",
            WorkerRole::Docs => "docs",
            WorkerRole::Custom => "custom",
        }
    }

    /// Lenient parse used for planner output: unknown roles become
    /// [`WorkerRole::Custom`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(WorkerRole::Custom)
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frontend" => Ok(WorkerRole::Frontend),
            "backend" => Ok(WorkerRole::Backend),
            "data" => Ok(WorkerRole::Data),
            "docs" | "documentation" => Ok(WorkerRole::Docs),
            "custom" => Ok(WorkerRole::Custom),
            other => Err(ForemanError::Orchestrator(format!("unknown role: {other}"))),
        }
    }
}

/// One stage of a role's review sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    PlanVerify,
    Build,
    Debug,
    IntegrationVerify,
}

impl Phase {
    /// Snake-case name, as written in the worklog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::PlanVerify => "plan_verify",
            Phase::Build => "build",
            Phase::Debug => "debug",
            Phase::IntegrationVerify => "integration_verify",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "plan" => Ok(Phase::Plan),
            "plan_verify" => Ok(Phase::PlanVerify),
            "build" => Ok(Phase::Build),
            "debug" => Ok(Phase::Debug),
            "integration_verify" => Ok(Phase::IntegrationVerify),
            other => Err(ForemanError::Orchestrator(format!("unknown phase: {other}"))),
        }
    }
}

/// A configured worker identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub name: String,
    pub role: WorkerRole,
    /// Engine override; the run's engine when `None`.
    #[serde(default)]
    pub engine: Option<EngineKind>,
    #[serde(default)]
    pub model: Option<String>,
    /// Reasoning effort for engines that take one.
    #[serde(default)]
    pub effort: Option<String>,
}

impl Employee {
    pub fn new(name: impl Into<String>, role: WorkerRole) -> Self {
        Self {
            name: name.into(),
            role,
            engine: None,
            model: None,
            effort: None,
        }
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = Some(engine);
        self
    }
}

/// A unit of planned work assigned to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub agent: String,
    pub role: WorkerRole,
    pub task: String,
    #[serde(default)]
    pub criteria: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Subtask {
    pub fn to_plan_entry(&self) -> PlanEntry {
        PlanEntry {
            agent: self.agent.clone(),
            role: self.role.to_string(),
            task: self.task.clone(),
            criteria: self.criteria.clone(),
            files: self.files.clone(),
        }
    }

    /// Rebuilds a subtask from a worklog plan entry.
    pub fn from_plan_entry(entry: &PlanEntry) -> Self {
        Self {
            agent: entry.agent.clone(),
            role: WorkerRole::parse_lenient(&entry.role),
            task: entry.task.clone(),
            criteria: entry.criteria.clone(),
            files: entry.files.clone(),
        }
    }
}

/// A reviewer's judgment of one worker in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub agent: String,
    pub pass: bool,
    #[serde(default)]
    pub feedback: String,
}

impl Verdict {
    pub fn pass(agent: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            pass: true,
            feedback: feedback.into(),
        }
    }

    pub fn fail(agent: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            pass: false,
            feedback: feedback.into(),
        }
    }
}

/// A verdict together with the round it was applied in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub round: u32,
    pub verdict: Verdict,
}

/// Progress of one worker through its role's phases.
///
/// `current` only moves forward, and only on a pass verdict. A pass at the
/// last phase marks the worker completed and leaves `current` in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPhase {
    pub subtask: Subtask,
    pub phases: Vec<Phase>,
    pub current: usize,
    pub completed: bool,
    pub history: Vec<VerdictRecord>,
    pub last_applied_round: Option<u32>,
}

impl AgentPhase {
    /// Starts `subtask` at the role's first phase.
    pub fn new(subtask: Subtask) -> Self {
        let phases = subtask.role.phases().to_vec();
        Self {
            subtask,
            phases,
            current: 0,
            completed: false,
            history: Vec::new(),
            last_applied_round: None,
        }
    }

    /// Rebuilds a pending worker from its matrix row. The phase index is
    /// clamped to the role's sequence.
    pub fn from_row(row: &MatrixRow, subtask: Subtask) -> Self {
        let mut phase = Self::new(subtask);
        phase.current = row.phase_index.min(phase.phases.len().saturating_sub(1));
        phase.completed = row.status == RowStatus::Done;
        phase
    }

    pub fn agent(&self) -> &str {
        &self.subtask.agent
    }

    pub fn role(&self) -> WorkerRole {
        self.subtask.role
    }

    /// The phase being worked on (the last one once completed).
    pub fn current_phase(&self) -> Phase {
        self.phases
            .get(self.current)
            .copied()
            .unwrap_or(Phase::Build)
    }

    pub fn is_last_phase(&self) -> bool {
        self.current + 1 >= self.phases.len()
    }

    /// Feedback from the most recent verdict.
    pub fn last_feedback(&self) -> Option<&str> {
        self.history
            .last()
            .map(|r| r.verdict.feedback.as_str())
            .filter(|f| !f.trim().is_empty())
    }

    /// Applies `verdict` for `round`. Returns `false` (and changes nothing)
    /// when the worker is already completed or a verdict for this round or
    /// a later one was already applied.
    pub fn apply_verdict(&mut self, round: u32, verdict: Verdict) -> bool {
        if self.completed || self.last_applied_round.is_some_and(|r| r >= round) {
            return false;
        }
        if verdict.pass {
            if self.is_last_phase() {
                self.completed = true;
            } else {
                self.current += 1;
            }
        }
        self.last_applied_round = Some(round);
        self.history.push(VerdictRecord { round, verdict });
        true
    }

    pub fn status(&self) -> RowStatus {
        if self.completed {
            RowStatus::Done
        } else if self.current > 0 || !self.history.is_empty() {
            RowStatus::InProgress
        } else {
            RowStatus::Pending
        }
    }

    pub fn to_matrix_row(&self) -> MatrixRow {
        MatrixRow {
            agent: self.subtask.agent.clone(),
            role: self.subtask.role.to_string(),
            phase_index: self.current,
            phase_count: self.phases.len(),
            phase_name: self.current_phase().to_string(),
            status: self.status(),
        }
    }

    /// `Name (role) - phase i/n name`, used in partial reports.
    pub fn describe(&self) -> String {
        format!(
            "{} ({}) - phase {}/{} {}",
            self.subtask.agent,
            self.subtask.role,
            self.current + 1,
            self.phases.len(),
            self.current_phase()
        )
    }
}
