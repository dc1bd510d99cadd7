//! The orchestration pipeline.
//!
//! A run moves through `planning → distributing(N) → reviewing(N)` and ends
//! `done` (every worker passed its last phase) or `partial` (round cap
//! reached). Control flow inside a run is sequential: workers within a
//! round are dispatched one after another because later workers may build
//! on earlier workers' file changes.

use crate::config::OrchestratorConfig;
use crate::monitor::{WorkerMonitor, WorkerState};
use crate::parse::{self, Review};
use crate::profiles;
use crate::triage;
use crate::types::{AgentPhase, Employee, Subtask, Verdict};
use foreman_agent::{Dispatcher, KillReason, SpawnOptions, SpawnResult};
use foreman_core::{
    BroadcastBus, BusEvent, ChannelKey, EngineKind, ForemanResult, Message, Role,
};
use foreman_session::{
    HistoryStore, LogEntry, MatrixRow, PlanEntry, WorklogStatus, WorklogStore,
};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One request entering the pipeline.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub channel: ChannelKey,
    /// Engine for the direct answer, the planner and workers without an
    /// override.
    pub engine: EngineKind,
    /// Opaque system prompt (skills, memory) passed to every invocation.
    pub system_prompt: Option<String>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            prompt: prompt.into(),
            channel: ChannelKey::default(),
            engine,
            system_prompt: None,
        }
    }

    pub fn with_channel(mut self, channel: ChannelKey) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Answered by a single invocation.
    Direct,
    /// Every worker completed.
    Done,
    /// Round cap reached with workers pending.
    Partial,
    /// Killed by steer, stop or shutdown.
    Interrupted,
    /// Nothing useful came back.
    Failed,
}

/// Result of [`Pipeline::run`] / [`Pipeline::resume`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Text broadcast in `orchestrate_done`.
    pub text: String,
    pub channel: ChannelKey,
    pub worklog: Option<PathBuf>,
    /// Rounds completed, counted from the worklog's counter.
    pub rounds: u32,
    /// `describe()` of every worker left pending.
    pub pending: Vec<String>,
    pub workers: Vec<WorkerState>,
    pub kill_reason: Option<KillReason>,
}

enum ReviewOutcome {
    Parsed(Review),
    Unparsable,
    Interrupted(Option<KillReason>),
}

struct RunState {
    request: String,
    channel: ChannelKey,
    engine: EngineKind,
    system_prompt: Option<String>,
    phases: Vec<AgentPhase>,
    round: u32,
    max_rounds: u32,
    resumed: bool,
    outputs: HashMap<String, String>,
}

/// Worklog writes for one run. Failures are logged and never abort the run.
struct RunLog<'a> {
    store: &'a WorklogStore,
    path: Option<PathBuf>,
}

impl RunLog<'_> {
    fn path_string(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.display().to_string())
    }

    fn check(&self, what: &str, result: ForemanResult<impl Sized>) {
        if let Err(e) = result {
            warn!(error = %e, write = what, "Worklog write failed");
        }
    }

    async fn plan(&self, plan: &[PlanEntry]) {
        if let Some(path) = &self.path {
            self.check("plan", self.store.set_plan(path, plan).await);
        }
    }

    async fn matrix(&self, rows: &[MatrixRow], round: u32) {
        if let Some(path) = &self.path {
            self.check("matrix", self.store.replace_matrix(path, rows, round).await);
        }
    }

    async fn entry(&self, entry: LogEntry) {
        if let Some(path) = &self.path {
            self.check("log", self.store.append_log(path, &entry).await);
        }
    }

    async fn status(&self, status: WorklogStatus) {
        if let Some(path) = &self.path {
            self.check("status", self.store.set_status(path, status).await);
        }
    }

    async fn max_rounds(&self, max_rounds: u32) {
        if let Some(path) = &self.path {
            self.check("max_rounds", self.store.set_max_rounds(path, max_rounds).await);
        }
    }

    async fn summary(&self, summary: &str) {
        if let Some(path) = &self.path {
            self.check("summary", self.store.set_summary(path, summary).await);
        }
    }
}

/// Splits requests across employees and drives them through review rounds.
pub struct Pipeline {
    dispatcher: Arc<dyn Dispatcher>,
    worklogs: Arc<WorklogStore>,
    history: Arc<dyn HistoryStore>,
    bus: Arc<BroadcastBus>,
    config: OrchestratorConfig,
    employees: Vec<Employee>,
    monitor: Arc<WorkerMonitor>,
    interrupt: Mutex<Option<KillReason>>,
}

impl Pipeline {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        worklogs: Arc<WorklogStore>,
        history: Arc<dyn HistoryStore>,
        bus: Arc<BroadcastBus>,
        config: OrchestratorConfig,
        employees: Vec<Employee>,
    ) -> Self {
        Self {
            dispatcher,
            worklogs,
            history,
            bus,
            config,
            employees,
            monitor: Arc::new(WorkerMonitor::new()),
            interrupt: Mutex::new(None),
        }
    }

    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn employees(&self) -> &[Employee] {
        &self.employees
    }

    /// Asks the active run to stop at its next dispatch boundary. Killing
    /// the live worker is the caller's job; this covers the gaps between
    /// dispatches. The first reason wins.
    pub fn interrupt(&self, reason: KillReason) {
        self.interrupt.lock().get_or_insert(reason);
    }

    /// Forgets a pending interrupt before a new run starts.
    pub fn clear_interrupt(&self) {
        *self.interrupt.lock() = None;
    }

    /// The pending interrupt, if any.
    pub fn interrupted(&self) -> Option<KillReason> {
        *self.interrupt.lock()
    }

    /// Runs a new request: triage, then either a direct answer or a full
    /// orchestration.
    pub async fn run(&self, req: RunRequest) -> ForemanResult<RunReport> {
        if let Some(reason) = self.interrupted() {
            let log = RunLog {
                store: &self.worklogs,
                path: None,
            };
            return Ok(self
                .finish_interrupted(&log, &req.channel, 0, Vec::new(), Some(reason))
                .await);
        }
        let assessment = triage::assess(&req.prompt, self.config.triage_min_len);
        if self.employees.is_empty() || !assessment.should_orchestrate() {
            debug!(
                signals = ?assessment.signals,
                employees = self.employees.len(),
                "Answering directly"
            );
            return self.direct(req).await;
        }
        info!(signals = ?assessment.signals, "Orchestrating request");
        self.monitor.clear().await;

        // --- Plan ---
        let planner_engine = self.config.planner_engine.unwrap_or(req.engine);
        let planned = self
            .dispatcher
            .dispatch(
                &profiles::planner_prompt(&req.prompt, &self.employees),
                self.options(planner_engine, &req.channel, req.system_prompt.as_deref())
                    .main()
                    .internal()
                    .with_label("planner"),
            )
            .await?;
        if planned.kill_reason.is_some() {
            let log = RunLog {
                store: &self.worklogs,
                path: None,
            };
            return Ok(self
                .finish_interrupted(&log, &req.channel, 0, Vec::new(), planned.kill_reason)
                .await);
        }
        if !planned.is_success() && planned.text.trim().is_empty() {
            return Ok(self
                .finish_failed(&req.channel, format!("Planning failed: {}", planned.status))
                .await);
        }

        let plan = match parse::parse_plan(&planned.text) {
            Some(plan) => plan,
            None => {
                warn!("Planner reply is not a plan, using it as the answer");
                return Ok(self.finish_answer(&req.channel, planned.text.trim()).await);
            }
        };
        if let Some(answer) = plan.direct_answer {
            return Ok(self.finish_answer(&req.channel, &answer).await);
        }
        let subtasks = self.assign(plan.subtasks);
        if subtasks.is_empty() {
            return Ok(self.finish_answer(&req.channel, planned.text.trim()).await);
        }
        info!(subtasks = subtasks.len(), "Plan accepted");
        if let Some(reason) = self.interrupted() {
            let log = RunLog {
                store: &self.worklogs,
                path: None,
            };
            return Ok(self
                .finish_interrupted(&log, &req.channel, 0, Vec::new(), Some(reason))
                .await);
        }

        // --- Worklog ---
        let path = match self
            .worklogs
            .create(&title(&req.prompt), &req.prompt, self.config.max_rounds)
            .await
        {
            Ok(run) => {
                self.bus.emit(BusEvent::WorklogCreated {
                    path: run.path.display().to_string(),
                });
                Some(run.path)
            }
            Err(e) => {
                warn!(error = %e, "Could not create worklog, continuing without one");
                None
            }
        };
        let log = RunLog {
            store: &self.worklogs,
            path,
        };
        let entries: Vec<PlanEntry> = subtasks.iter().map(Subtask::to_plan_entry).collect();
        log.plan(&entries).await;

        let state = RunState {
            request: req.prompt,
            channel: req.channel,
            engine: req.engine,
            system_prompt: req.system_prompt,
            phases: subtasks.into_iter().map(AgentPhase::new).collect(),
            round: 0,
            max_rounds: self.config.max_rounds,
            resumed: false,
            outputs: HashMap::new(),
        };
        self.drive(state, &log).await
    }

    /// Continues the latest worklog run from its status matrix with a fresh
    /// round budget.
    pub async fn resume(
        &self,
        channel: ChannelKey,
        engine: EngineKind,
        system_prompt: Option<String>,
    ) -> ForemanResult<RunReport> {
        let Some(run) = self.worklogs.latest().await? else {
            return Ok(self
                .finish_failed(&channel, "There is no orchestration run to continue.".to_string())
                .await);
        };
        if run.pending().is_empty() {
            return Ok(self
                .finish_failed(&channel, "The latest run has no pending workers.".to_string())
                .await);
        }
        self.monitor.clear().await;

        let plan: HashMap<&str, &PlanEntry> =
            run.plan.iter().map(|e| (e.agent.as_str(), e)).collect();
        let phases: Vec<AgentPhase> = run
            .matrix
            .iter()
            .map(|row| {
                let subtask = plan
                    .get(row.agent.as_str())
                    .map(|e| Subtask::from_plan_entry(e))
                    .unwrap_or_else(|| Subtask {
                        agent: row.agent.clone(),
                        role: crate::types::WorkerRole::parse_lenient(&row.role),
                        task: run.request.clone(),
                        criteria: String::new(),
                        files: Vec::new(),
                    });
                AgentPhase::from_row(row, subtask)
            })
            .collect();

        let max_rounds = run.round + self.config.max_rounds;
        let log = RunLog {
            store: &self.worklogs,
            path: Some(run.path.clone()),
        };
        log.max_rounds(max_rounds).await;
        log.status(WorklogStatus::Running).await;
        let pending = phases.iter().filter(|p| !p.completed).count();
        let resumes = run
            .log
            .iter()
            .filter(|e| e.heading.starts_with("Continue "))
            .count();
        log.entry(LogEntry::new(
            format!("Continue {} from round {}", resumes + 1, run.round),
            format!("{pending} pending worker(s); round budget now {max_rounds}."),
        ))
        .await;
        info!(round = run.round, pending, max_rounds, "Continuing orchestration run");

        let state = RunState {
            request: run.request.clone(),
            channel,
            engine,
            system_prompt,
            phases,
            round: run.round,
            max_rounds,
            resumed: true,
            outputs: HashMap::new(),
        };
        self.drive(state, &log).await
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    async fn drive(&self, mut st: RunState, log: &RunLog<'_>) -> ForemanResult<RunReport> {
        for phase in &st.phases {
            let engine = self.engine_for(phase.agent(), st.engine);
            self.monitor.register(phase.agent(), phase.role(), engine).await;
            if phase.completed {
                self.monitor.complete(phase.agent()).await;
            }
        }
        log.matrix(&matrix(&st.phases), st.round).await;

        while st.round < st.max_rounds && st.phases.iter().any(|p| !p.completed) {
            let round = st.round + 1;
            let active: Vec<usize> = (0..st.phases.len())
                .filter(|&i| !st.phases[i].completed)
                .collect();
            self.bus.emit(BusEvent::RoundStart {
                round,
                max_rounds: st.max_rounds,
                agents: active.iter().map(|&i| st.phases[i].agent().to_string()).collect(),
            });
            info!(round, agents = active.len(), "Round started");

            // --- Distribute ---
            let mut outputs: Vec<(usize, String)> = Vec::with_capacity(active.len());
            for &i in &active {
                if let Some(reason) = self.interrupted() {
                    return Ok(self
                        .finish_interrupted(log, &st.channel, st.round, pending(&st.phases), Some(reason))
                        .await);
                }
                let (text, killed) = self.dispatch_worker(&st, i, round, log).await;
                if killed.is_some() {
                    return Ok(self
                        .finish_interrupted(log, &st.channel, st.round, pending(&st.phases), killed)
                        .await);
                }
                outputs.push((i, text));
            }

            // --- Review ---
            let entries: Vec<(&AgentPhase, &str)> = outputs
                .iter()
                .map(|(i, text)| (&st.phases[*i], text.as_str()))
                .collect();
            let prompt = profiles::review_prompt(round, &st.request, &entries);
            if let Some(reason) = self.interrupted() {
                return Ok(self
                    .finish_interrupted(log, &st.channel, st.round, pending(&st.phases), Some(reason))
                    .await);
            }
            let verdicts: Vec<Verdict> = match self.review(&prompt, &st).await {
                ReviewOutcome::Interrupted(reason) => {
                    return Ok(self
                        .finish_interrupted(log, &st.channel, st.round, pending(&st.phases), reason)
                        .await);
                }
                ReviewOutcome::Parsed(review) => {
                    let verdicts: Vec<Verdict> = active
                        .iter()
                        .map(|&i| verdict_for(&review, st.phases[i].agent()))
                        .collect();
                    let all_pass = verdicts.iter().all(|v| v.pass);
                    if review.all_done != all_pass {
                        debug!(round, all_done = review.all_done, all_pass, "Reviewer all_done disagrees with verdicts");
                    }
                    verdicts
                }
                ReviewOutcome::Unparsable => {
                    warn!(round, "Review unparsable after retry, failing every active worker");
                    active
                        .iter()
                        .map(|&i| Verdict::fail(st.phases[i].agent(), profiles::UNPARSABLE_REVIEW_FEEDBACK))
                        .collect()
                }
            };

            // --- Advance ---
            let mut passed = Vec::new();
            let mut failed = Vec::new();
            let mut completed = Vec::new();
            for (&i, verdict) in active.iter().zip(verdicts.iter()) {
                let phase = &mut st.phases[i];
                if !phase.apply_verdict(round, verdict.clone()) {
                    continue;
                }
                let agent = phase.agent().to_string();
                if verdict.pass {
                    passed.push(agent.clone());
                } else {
                    failed.push(agent.clone());
                }
                if phase.completed {
                    self.monitor.complete(&agent).await;
                    completed.push(agent);
                }
            }
            log.entry(LogEntry::new(format!("Round {round} - Review"), review_body(&verdicts)))
                .await;
            for (i, text) in outputs {
                st.outputs.insert(st.phases[i].agent().to_string(), text);
            }

            st.round = round;
            log.matrix(&matrix(&st.phases), round).await;
            info!(round, passed = passed.len(), failed = failed.len(), completed = completed.len(), "Round done");
            self.bus.emit(BusEvent::RoundDone {
                round,
                passed,
                failed,
                completed,
            });
        }

        if st.phases.iter().all(|p| p.completed) {
            Ok(self.finish_done(&st, log).await)
        } else {
            Ok(self.finish_partial(&st, log).await)
        }
    }

    /// Runs one worker and logs its output. Returns the text and the kill
    /// reason, if the worker was killed.
    async fn dispatch_worker(
        &self,
        st: &RunState,
        index: usize,
        round: u32,
        log: &RunLog<'_>,
    ) -> (String, Option<KillReason>) {
        let phase = &st.phases[index];
        let agent = phase.agent();
        let prompt = profiles::worker_prompt(phase, &st.request, round, st.resumed);
        let mut opts = self
            .options(self.engine_for(agent, st.engine), &st.channel, st.system_prompt.as_deref())
            .main()
            .internal()
            .with_label(agent);
        if let Some(employee) = self.employee(agent) {
            if let Some(model) = &employee.model {
                opts = opts.with_model(model.clone());
            }
            if let Some(effort) = &employee.effort {
                opts = opts.with_effort(effort.clone());
            }
        }

        self.monitor.start(agent).await;
        let started = Instant::now();
        let heading = format!("Round {round} - {agent} ({})", phase.current_phase());
        let result = match self.dispatcher.dispatch(&prompt, opts).await {
            Ok(result) => result,
            Err(e) => {
                warn!(agent, round, error = %e, "Worker dispatch failed");
                self.monitor.record_error(agent).await;
                let text = format!("(dispatch failed: {e})");
                log.entry(LogEntry::new(heading, text.clone())).await;
                return (text, None);
            }
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.monitor.record(agent, &result, elapsed).await;
        log.entry(LogEntry::new(heading, log_body(&result))).await;
        (result.text, result.kill_reason)
    }

    /// Asks the reviewer, retrying once on an unparsable reply.
    async fn review(&self, prompt: &str, st: &RunState) -> ReviewOutcome {
        let engine = self.config.reviewer_engine.unwrap_or(st.engine);
        for attempt in 1..=2 {
            let opts = self
                .options(engine, &st.channel, st.system_prompt.as_deref())
                .main()
                .internal()
                .with_label("reviewer");
            match self.dispatcher.dispatch(prompt, opts).await {
                Ok(result) if result.kill_reason.is_some() => {
                    return ReviewOutcome::Interrupted(result.kill_reason);
                }
                Ok(result) => {
                    if let Some(review) = parse::parse_review(&result.text) {
                        return ReviewOutcome::Parsed(review);
                    }
                    warn!(attempt, status = %result.status, "Reviewer reply has no verdicts");
                }
                Err(e) => warn!(attempt, error = %e, "Reviewer dispatch failed"),
            }
        }
        ReviewOutcome::Unparsable
    }

    // -----------------------------------------------------------------------
    // Endings
    // -----------------------------------------------------------------------

    async fn direct(&self, req: RunRequest) -> ForemanResult<RunReport> {
        let opts = self
            .options(req.engine, &req.channel, req.system_prompt.as_deref())
            .main()
            .resume();
        let result = self.dispatcher.dispatch(&req.prompt, opts).await?;
        let outcome = if result.kill_reason.is_some() {
            RunOutcome::Interrupted
        } else if result.is_success() {
            RunOutcome::Direct
        } else {
            RunOutcome::Failed
        };
        let text = if outcome == RunOutcome::Failed && result.text.trim().is_empty() {
            format!("Request failed: {}", result.status)
        } else {
            result.text.clone()
        };
        self.emit_done(&text, &req.channel, false, Vec::new(), None);
        Ok(RunReport {
            outcome,
            text,
            channel: req.channel,
            worklog: None,
            rounds: 0,
            pending: Vec::new(),
            workers: Vec::new(),
            kill_reason: result.kill_reason,
        })
    }

    async fn finish_answer(&self, channel: &ChannelKey, answer: &str) -> RunReport {
        self.record_answer(answer, channel).await;
        self.emit_done(answer, channel, false, Vec::new(), None);
        RunReport {
            outcome: RunOutcome::Direct,
            text: answer.to_string(),
            channel: channel.clone(),
            worklog: None,
            rounds: 0,
            pending: Vec::new(),
            workers: Vec::new(),
            kill_reason: None,
        }
    }

    async fn finish_failed(&self, channel: &ChannelKey, text: String) -> RunReport {
        warn!(reason = %text, "Run failed");
        self.emit_done(&text, channel, false, Vec::new(), None);
        RunReport {
            outcome: RunOutcome::Failed,
            text,
            channel: channel.clone(),
            worklog: None,
            rounds: 0,
            pending: Vec::new(),
            workers: self.monitor.snapshot().await,
            kill_reason: None,
        }
    }

    async fn finish_interrupted(
        &self,
        log: &RunLog<'_>,
        channel: &ChannelKey,
        rounds: u32,
        pending: Vec<String>,
        kill_reason: Option<KillReason>,
    ) -> RunReport {
        info!(reason = ?kill_reason, rounds, "Run interrupted");
        log.status(WorklogStatus::Interrupted).await;
        let text = "Run interrupted.".to_string();
        self.emit_done(&text, channel, true, pending.clone(), log.path_string());
        RunReport {
            outcome: RunOutcome::Interrupted,
            text,
            channel: channel.clone(),
            worklog: log.path.clone(),
            rounds,
            pending,
            workers: self.monitor.snapshot().await,
            kill_reason,
        }
    }

    async fn finish_done(&self, st: &RunState, log: &RunLog<'_>) -> RunReport {
        let outputs: Vec<(String, String)> = st
            .phases
            .iter()
            .filter_map(|p| {
                st.outputs
                    .get(p.agent())
                    .map(|t| (p.agent().to_string(), t.clone()))
            })
            .collect();
        let prompt = profiles::summary_prompt(&st.request, &st.phases, &outputs);
        let opts = self
            .options(st.engine, &st.channel, st.system_prompt.as_deref())
            .internal()
            .with_label("summary");
        let reply = if let Some(reason) = self.interrupted() {
            info!(reason = %reason, "Skipping summary call after interrupt");
            None
        } else {
            Some(self.dispatcher.dispatch(&prompt, opts).await)
        };
        let summary = match reply {
            None => profiles::mechanical_summary(&st.phases, st.round),
            Some(Ok(r)) if r.is_success() && !r.text.trim().is_empty() => r.text.trim().to_string(),
            Some(Ok(r)) => {
                warn!(status = %r.status, "Summary call failed, using mechanical summary");
                profiles::mechanical_summary(&st.phases, st.round)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Summary call failed, using mechanical summary");
                profiles::mechanical_summary(&st.phases, st.round)
            }
        };

        log.summary(&summary).await;
        log.status(WorklogStatus::Done).await;
        self.record_answer(&summary, &st.channel).await;
        self.emit_done(&summary, &st.channel, false, Vec::new(), log.path_string());
        info!(rounds = st.round, workers = st.phases.len(), "Orchestration done");
        RunReport {
            outcome: RunOutcome::Done,
            text: summary,
            channel: st.channel.clone(),
            worklog: log.path.clone(),
            rounds: st.round,
            pending: Vec::new(),
            workers: self.monitor.snapshot().await,
            kill_reason: None,
        }
    }

    async fn finish_partial(&self, st: &RunState, log: &RunLog<'_>) -> RunReport {
        let report = profiles::partial_report(&st.phases, st.round, st.max_rounds);
        let pending = pending(&st.phases);
        log.summary(&report).await;
        log.status(WorklogStatus::Partial).await;
        self.record_answer(&report, &st.channel).await;
        self.emit_done(&report, &st.channel, true, pending.clone(), log.path_string());
        warn!(rounds = st.round, pending = pending.len(), "Round cap reached");
        RunReport {
            outcome: RunOutcome::Partial,
            text: report,
            channel: st.channel.clone(),
            worklog: log.path.clone(),
            rounds: st.round,
            pending,
            workers: self.monitor.snapshot().await,
            kill_reason: None,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn options(&self, engine: EngineKind, channel: &ChannelKey, system_prompt: Option<&str>) -> SpawnOptions {
        let mut opts = SpawnOptions::new(engine).with_channel(channel.clone());
        if let Some(sys) = system_prompt {
            opts = opts.with_system_prompt(sys);
        }
        opts
    }

    fn employee(&self, agent: &str) -> Option<&Employee> {
        self.employees
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(agent))
    }

    fn engine_for(&self, agent: &str, default: EngineKind) -> EngineKind {
        self.employee(agent)
            .and_then(|e| e.engine)
            .unwrap_or(default)
    }

    /// Binds planned subtasks to configured employees: one subtask per
    /// worker, the employee's name and role win over the planner's.
    fn assign(&self, subtasks: Vec<Subtask>) -> Vec<Subtask> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(subtasks.len());
        for mut subtask in subtasks {
            if let Some(employee) = self.employee(&subtask.agent) {
                subtask.agent = employee.name.clone();
                subtask.role = employee.role;
            }
            if !seen.insert(subtask.agent.to_ascii_lowercase()) {
                warn!(agent = %subtask.agent, "Dropping duplicate subtask for worker");
                continue;
            }
            out.push(subtask);
        }
        out
    }

    async fn record_answer(&self, text: &str, channel: &ChannelKey) {
        if text.trim().is_empty() {
            return;
        }
        let message = Message::assistant(text).with_channel(channel.clone());
        match self.history.insert(message).await {
            Ok(_) => {
                self.bus.emit(BusEvent::NewMessage {
                    role: Role::Assistant,
                    content: text.to_string(),
                    channel: channel.clone(),
                });
            }
            Err(e) => warn!(error = %e, "Failed to record answer"),
        }
    }

    fn emit_done(
        &self,
        text: &str,
        channel: &ChannelKey,
        partial: bool,
        pending: Vec<String>,
        worklog: Option<String>,
    ) {
        self.bus.emit(BusEvent::OrchestrateDone {
            text: text.to_string(),
            channel: channel.clone(),
            partial,
            pending,
            worklog,
        });
    }
}

fn matrix(phases: &[AgentPhase]) -> Vec<MatrixRow> {
    phases.iter().map(AgentPhase::to_matrix_row).collect()
}

fn pending(phases: &[AgentPhase]) -> Vec<String> {
    phases
        .iter()
        .filter(|p| !p.completed)
        .map(AgentPhase::describe)
        .collect()
}

fn verdict_for(review: &Review, agent: &str) -> Verdict {
    review
        .verdicts
        .iter()
        .find(|v| v.agent.trim().eq_ignore_ascii_case(agent))
        .map(|v| Verdict {
            agent: agent.to_string(),
            pass: v.pass,
            feedback: v.feedback.clone(),
        })
        .unwrap_or_else(|| Verdict::fail(agent, profiles::MISSING_VERDICT_FEEDBACK))
}

fn review_body(verdicts: &[Verdict]) -> String {
    verdicts
        .iter()
        .map(|v| {
            let mark = if v.pass { "PASS" } else { "FAIL" };
            if v.feedback.is_empty() {
                format!("- {}: {mark}", v.agent)
            } else {
                format!("- {}: {mark} - {}", v.agent, v.feedback)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn log_body(result: &SpawnResult) -> String {
    let mut body = if result.text.trim().is_empty() {
        format!("_{}_", result.status)
    } else {
        result.text.trim().to_string()
    };
    if let Some(cost) = result.usage.cost_usd {
        body.push_str(&format!("\n\n_{} / {} / ${cost:.4}_", result.engine, result.model));
    }
    body
}

/// Worklog title: the request's first line, shortened.
fn title(prompt: &str) -> String {
    let first = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("run").trim();
    if first.chars().count() > 60 {
        let cut: String = first.chars().take(60).collect();
        format!("{}...", cut.trim_end())
    } else {
        first.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_title_shortening() {
        assert_eq!(title("\n  Build the thing\nmore"), "Build the thing");
        let long = "x".repeat(80);
        assert_eq!(title(&long).chars().count(), 63);
        assert_eq!(title(""), "run");
    }

    #[test]
    fn test_verdict_lookup_is_case_insensitive() {
        let review = Review {
            verdicts: vec![Verdict::pass("ana", "fine")],
            all_done: false,
        };
        let v = verdict_for(&review, "Ana");
        assert!(v.pass);
        assert_eq!(v.agent, "Ana");
        let missing = verdict_for(&review, "Bo");
        assert!(!missing.pass);
        assert_eq!(missing.feedback, profiles::MISSING_VERDICT_FEEDBACK);
    }

    #[test]
    fn test_review_body() {
        let body = review_body(&[Verdict::pass("A", ""), Verdict::fail("B", "no tests")]);
        assert_eq!(body, "- A: PASS\n- B: FAIL - no tests");
    }
}
