//! Prompt catalog: what each phase asks of a worker, how the reviewer
//! judges it, and the planner / summary prompts.

use crate::types::{AgentPhase, Employee, Phase};

/// Instructions handed to a worker for `phase`.
pub fn phase_instructions(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => PLAN_INSTRUCTIONS,
        Phase::PlanVerify => PLAN_VERIFY_INSTRUCTIONS,
        Phase::Build => BUILD_INSTRUCTIONS,
        Phase::Debug => DEBUG_INSTRUCTIONS,
        Phase::IntegrationVerify => INTEGRATION_INSTRUCTIONS,
    }
}

/// What the reviewer checks for `phase`.
pub fn phase_rubric(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => "A concrete, ordered plan that covers every criterion and names the files to touch.",
        Phase::PlanVerify => "The plan was checked against the existing code; gaps and conflicts are resolved.",
        Phase::Build => "The change is implemented, not stubbed, and matches the plan and the criteria.",
        Phase::Debug => "The work was exercised (tests, builds or manual runs) and every failure found was fixed.",
        Phase::IntegrationVerify => "The work fits with the other workers' changes and the whole request is satisfied.",
    }
}

/// Constraint added to every worker prompt of a continued run.
pub const RESUME_CONSTRAINT: &str = "\
This run is being continued from a saved worklog. Do not alter your identity, \
your role or your current phase. Pick up the work where it stopped.";

/// Feedback recorded when the reviewer response could not be parsed twice.
pub const UNPARSABLE_REVIEW_FEEDBACK: &str = "\
Review could not be parsed after a retry; this phase was not verified and must be repeated.";

/// Feedback recorded when the reviewer omitted a worker.
pub const MISSING_VERDICT_FEEDBACK: &str = "\
The reviewer returned no verdict for this worker; this phase was not verified and must be repeated.";

/// Asks the planner to either answer directly or split the request.
pub fn planner_prompt(request: &str, employees: &[Employee]) -> String {
    let roster: Vec<String> = employees
        .iter()
        .map(|e| format!("- {} (role: {})", e.name, e.role))
        .collect();
    format!(
        "{PLANNER_PROMPT}\n\nAvailable workers:\n{}\n\nRequest:\n{}",
        roster.join("\n"),
        request.trim()
    )
}

/// Prompt for one worker in one round.
pub fn worker_prompt(phase: &AgentPhase, request: &str, round: u32, resumed: bool) -> String {
    let current = phase.current_phase();
    let mut out = format!(
        "You are {}, a {} worker. Round {round}, phase {}/{}: {}.\n\n",
        phase.agent(),
        phase.role(),
        phase.current + 1,
        phase.phases.len(),
        current
    );
    if resumed {
        out.push_str(RESUME_CONSTRAINT);
        out.push_str("\n\n");
    }
    out.push_str(&format!("Overall request:\n{}\n\n", request.trim()));
    out.push_str(&format!("Your task:\n{}\n", phase.subtask.task.trim()));
    if !phase.subtask.criteria.trim().is_empty() {
        out.push_str(&format!("\nPass criteria:\n{}\n", phase.subtask.criteria.trim()));
    }
    if !phase.subtask.files.is_empty() {
        out.push_str(&format!("\nRelevant files: {}\n", phase.subtask.files.join(", ")));
    }
    out.push_str(&format!("\nPhase instructions:\n{}\n", phase_instructions(current)));
    if let Some(feedback) = phase.last_feedback() {
        out.push_str(&format!(
            "\nReviewer feedback from your last attempt:\n{}\n",
            feedback.trim()
        ));
    }
    out
}

/// Asks the reviewer to judge every participant of `round`.
pub fn review_prompt(round: u32, request: &str, entries: &[(&AgentPhase, &str)]) -> String {
    let mut out = format!("{REVIEWER_PROMPT}\n\nRequest:\n{}\n\nRound {round} results:\n", request.trim());
    for (phase, output) in entries {
        let current = phase.current_phase();
        out.push_str(&format!(
            "\n### {} ({}, phase {})\nCriteria: {}\nRubric: {}\nOutput:\n{}\n",
            phase.agent(),
            phase.role(),
            current,
            if phase.subtask.criteria.trim().is_empty() {
                "(none given)"
            } else {
                phase.subtask.criteria.trim()
            },
            phase_rubric(current),
            if output.trim().is_empty() {
                "(no output)"
            } else {
                output.trim()
            }
        ));
    }
    out
}

/// Asks for the user-facing wrap-up once every worker completed.
pub fn summary_prompt(request: &str, phases: &[AgentPhase], outputs: &[(String, String)]) -> String {
    let mut out = format!(
        "{SUMMARY_PROMPT}\n\nRequest:\n{}\n\nWorkers:\n",
        request.trim()
    );
    for p in phases {
        out.push_str(&format!("- {} ({}): {}\n", p.agent(), p.role(), p.subtask.task.trim()));
    }
    if !outputs.is_empty() {
        out.push_str("\nFinal outputs:\n");
        for (agent, text) in outputs {
            out.push_str(&format!("\n### {agent}\n{}\n", text.trim()));
        }
    }
    out
}

/// Summary used when the summarization call fails.
pub fn mechanical_summary(phases: &[AgentPhase], rounds: u32) -> String {
    let mut out = format!(
        "All {} workers completed in {rounds} round(s).\n",
        phases.len()
    );
    for p in phases {
        out.push_str(&format!(
            "\n- {} ({}): {}",
            p.agent(),
            p.role(),
            p.subtask.task.trim()
        ));
    }
    out
}

/// Report for a run that hit its round cap.
pub fn partial_report(phases: &[AgentPhase], round: u32, max_rounds: u32) -> String {
    let (done, pending): (Vec<&AgentPhase>, Vec<&AgentPhase>) =
        phases.iter().partition(|p| p.completed);
    let mut out = format!(
        "Stopped after {round}/{max_rounds} rounds with {} of {} workers incomplete.\n",
        pending.len(),
        phases.len()
    );
    if !done.is_empty() {
        out.push_str("\nCompleted:\n");
        for p in &done {
            out.push_str(&format!("- {} ({})\n", p.agent(), p.role()));
        }
    }
    out.push_str("\nPending:\n");
    for p in &pending {
        out.push_str(&format!("- {}\n", p.describe()));
    }
    out.push_str("\nSend \"continue\" to resume from the worklog.");
    out
}

const PLANNER_PROMPT: &str = "\
You are the planner for a team of AI workers. Decide whether the request \
needs the team at all.

If it can be answered directly, reply with JSON:
{\"direct_answer\": \"<your answer>\", \"subtasks\": []}

Otherwise split it across the available workers and reply with JSON:
{\"direct_answer\": null, \"subtasks\": [
  {\"agent\": \"<worker name>\", \"role\": \"frontend|backend|data|docs|custom\",
   \"task\": \"<what to do>\", \"criteria\": \"<how to tell it passed>\",
   \"files\": [\"<path hint>\"]}
]}

Rules:
1. Use each worker at most once.
2. Criteria must be checkable by a reviewer reading the worker's output.
3. Reply with the JSON object only.";

const REVIEWER_PROMPT: &str = "\
You are the reviewer. Judge each worker's output for this round against its \
criteria and the rubric of its current phase. Be strict: pass only work that \
fully meets the rubric.

Reply with JSON only:
{\"verdicts\": [{\"agent\": \"<worker name>\", \"pass\": true|false, \
\"feedback\": \"<what to fix, or why it passed>\"}], \"all_done\": true|false}

Include exactly one verdict per worker listed below.";

const SUMMARY_PROMPT: &str = "\
Every worker has finished. Write a concise summary for the user of what was \
done, where, and anything they should check. Do not invent work that is not \
in the outputs.";

const PLAN_INSTRUCTIONS: &str = "\
Write a concrete plan for your task: the steps in order, the files you will \
create or change, and how each pass criterion will be met. Do not write the \
implementation yet.";

const PLAN_VERIFY_INSTRUCTIONS: &str = "\
Check your plan against the actual codebase. Read the files involved, \
resolve conflicts with existing code and with the other workers' areas, and \
state the corrected plan.";

const BUILD_INSTRUCTIONS: &str = "\
Implement your task now. Make the real changes; no placeholders. Report \
which files you changed and how the criteria are met.";

const DEBUG_INSTRUCTIONS: &str = "\
Exercise your work: build it, run the relevant tests or commands, and fix \
every failure you find. Report what you ran and the results.";

const INTEGRATION_INSTRUCTIONS: &str = "\
Verify that your work integrates with what the other workers changed this \
run. Fix mismatched interfaces, names or assumptions and report the final \
state.";
