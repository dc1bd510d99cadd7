//! Markdown worklog of orchestration runs.
//!
//! Each run is one markdown file under the worklog directory. The file is the
//! serialization of [`WorklogRun`]: [`WorklogRun::render`] and
//! [`WorklogRun::parse`] are symmetric, so a run can be reloaded after a
//! restart and continued from its status matrix.
//!
//! Layout:
//!
//! ```text
//! # Worklog: <title>
//!
//! - Status: running
//! - Rounds: 1/3
//! - Created: 2026-01-01T00:00:00Z
//!
//! ## Request
//! ## Plan                    (### <agent> (<role>) blocks, optional `Files:` line)
//! ## Verification Criteria   (### <agent> blocks)
//! ## Agent Status Matrix     (| Agent | Role | Phase | Phase Name | Status |)
//! ## Execution Log           (### <entry> blocks)
//! ## Final Summary           (only once the run has ended)
//! ```
//!
//! Body lines that would be read as headings are escaped with a leading
//! backslash.

use chrono::{DateTime, SubsecRound, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const REQUEST: &str = "Request";
const PLAN: &str = "Plan";
const CRITERIA: &str = "Verification Criteria";
const MATRIX: &str = "Agent Status Matrix";
const LOG: &str = "Execution Log";
const SUMMARY: &str = "Final Summary";
const LATEST: &str = "latest";
const MATRIX_HEADER: &str = "| Agent | Role | Phase | Phase Name | Status |";
const MATRIX_RULE: &str = "|---|---|---|---|---|";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Overall state of a run, shown in the `- Status:` header line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorklogStatus {
    /// Rounds are still being executed.
    #[default]
    Running,
    /// Every worker completed its phases.
    Done,
    /// The round cap was hit with workers still pending.
    Partial,
    /// The run was steered or stopped.
    Interrupted,
}

impl fmt::Display for WorklogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorklogStatus::Running => "running",
            WorklogStatus::Done => "done",
            WorklogStatus::Partial => "partial",
            WorklogStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

impl FromStr for WorklogStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "running" => Ok(WorklogStatus::Running),
            "done" => Ok(WorklogStatus::Done),
            "partial" => Ok(WorklogStatus::Partial),
            "interrupted" => Ok(WorklogStatus::Interrupted),
            other => Err(ForemanError::Worklog(format!("unknown status '{other}'"))),
        }
    }
}

/// Status column of the agent status matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Not started yet.
    Pending,
    /// Working through its phases.
    InProgress,
    /// Passed its last phase.
    Done,
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RowStatus::Pending => "pending",
            RowStatus::InProgress => "in_progress",
            RowStatus::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for RowStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(RowStatus::Pending),
            "in_progress" => Ok(RowStatus::InProgress),
            "done" => Ok(RowStatus::Done),
            other => Err(ForemanError::Worklog(format!("unknown row status '{other}'"))),
        }
    }
}

/// One planned subtask as recorded under `## Plan` and
/// `## Verification Criteria`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Worker identity (employee name).
    pub agent: String,
    /// Role name, e.g. `frontend`.
    pub role: String,
    /// Task text.
    pub task: String,
    /// Acceptance criteria; empty when the planner gave none.
    pub criteria: String,
    /// File hints.
    pub files: Vec<String>,
}

/// One row of the agent status matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixRow {
    /// Worker identity.
    pub agent: String,
    /// Role name.
    pub role: String,
    /// Zero-based index of the current phase.
    pub phase_index: usize,
    /// Length of the role's phase sequence.
    pub phase_count: usize,
    /// Name of the current phase, e.g. `plan_verify`.
    pub phase_name: String,
    /// Row status.
    pub status: RowStatus,
}

impl MatrixRow {
    fn render(&self) -> String {
        format!(
            "| {} | {} | {}/{} | {} | {} |",
            cell(&self.agent),
            cell(&self.role),
            self.phase_index + 1,
            self.phase_count,
            cell(&self.phase_name),
            self.status
        )
    }

    fn parse(line: &str) -> ForemanResult<Self> {
        let inner = line
            .trim()
            .strip_prefix('|')
            .and_then(|l| l.strip_suffix('|'))
            .ok_or_else(|| ForemanError::Worklog(format!("malformed matrix row: {line}")))?;
        let cols: Vec<&str> = inner.split('|').map(str::trim).collect();
        if cols.len() != 5 {
            return Err(ForemanError::Worklog(format!(
                "matrix row has {} columns, expected 5",
                cols.len()
            )));
        }
        let (pos, count) = cols[2]
            .split_once('/')
            .ok_or_else(|| ForemanError::Worklog(format!("malformed phase '{}'", cols[2])))?;
        let pos: usize = pos
            .trim()
            .parse()
            .map_err(|_| ForemanError::Worklog(format!("malformed phase '{}'", cols[2])))?;
        let phase_count: usize = count
            .trim()
            .parse()
            .map_err(|_| ForemanError::Worklog(format!("malformed phase '{}'", cols[2])))?;
        Ok(Self {
            agent: cols[0].to_string(),
            role: cols[1].to_string(),
            phase_index: pos.saturating_sub(1),
            phase_count,
            phase_name: cols[3].to_string(),
            status: cols[4].parse()?,
        })
    }
}

/// One `### ` entry of the execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry heading, e.g. `Round 1 - Frontend (build)`.
    pub heading: String,
    /// Entry body (worker output or a note).
    pub body: String,
}

impl LogEntry {
    /// Creates an entry.
    pub fn new(heading: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            body: body.into(),
        }
    }

    /// Markdown block for this entry, with the body escaped.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("### {}\n", single_line(&self.heading));
        if !self.body.trim().is_empty() {
            out.push('\n');
            out.push_str(&escape_body(&self.body));
            out.push('\n');
        }
        out
    }
}

/// In-memory form of one worklog file.
#[derive(Debug, Clone, PartialEq)]
pub struct WorklogRun {
    /// File the run lives in. Not part of the rendered markdown.
    pub path: PathBuf,
    /// Human title (usually the first line of the request).
    pub title: String,
    /// Overall status.
    pub status: WorklogStatus,
    /// Last round started.
    pub round: u32,
    /// Round budget.
    pub max_rounds: u32,
    /// Creation time, second precision.
    pub created_at: DateTime<Utc>,
    /// Original request text.
    pub request: String,
    /// Planned subtasks.
    pub plan: Vec<PlanEntry>,
    /// Agent status matrix.
    pub matrix: Vec<MatrixRow>,
    /// Execution log entries, oldest first.
    pub log: Vec<LogEntry>,
    /// Final summary, once the run has ended.
    pub summary: Option<String>,
    /// Sections this model does not know about, preserved in order.
    pub extra: Vec<(String, String)>,
}

impl WorklogRun {
    /// A fresh `running` run at round 0.
    pub fn new(title: impl Into<String>, request: impl Into<String>, max_rounds: u32) -> Self {
        Self {
            path: PathBuf::new(),
            title: title.into(),
            status: WorklogStatus::Running,
            round: 0,
            max_rounds,
            created_at: Utc::now().trunc_subsecs(0),
            request: request.into(),
            plan: Vec::new(),
            matrix: Vec::new(),
            log: Vec::new(),
            summary: None,
            extra: Vec::new(),
        }
    }

    /// Rows that have not passed their last phase.
    pub fn pending(&self) -> Vec<MatrixRow> {
        self.matrix
            .iter()
            .filter(|r| r.status != RowStatus::Done)
            .cloned()
            .collect()
    }

    /// Renders the run as markdown.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Worklog: {}\n\n", single_line(&self.title)));
        out.push_str(&format!("- Status: {}\n", self.status));
        out.push_str(&format!("- Rounds: {}/{}\n", self.round, self.max_rounds));
        out.push_str(&format!(
            "- Created: {}\n",
            self.created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));

        push_section(&mut out, REQUEST, &escape_body(&self.request));

        let mut plan = String::new();
        for entry in &self.plan {
            if !plan.is_empty() {
                plan.push('\n');
            }
            plan.push_str(&format!(
                "### {} ({})\n",
                single_line(&entry.agent),
                single_line(&entry.role)
            ));
            if !entry.task.trim().is_empty() {
                plan.push('\n');
                plan.push_str(&escape_body(&entry.task));
                plan.push('\n');
            }
            if !entry.files.is_empty() {
                plan.push_str(&format!("\nFiles: {}\n", entry.files.join(", ")));
            }
        }
        push_section(&mut out, PLAN, plan.trim_end());

        let mut criteria = String::new();
        for entry in self.plan.iter().filter(|e| !e.criteria.trim().is_empty()) {
            if !criteria.is_empty() {
                criteria.push('\n');
            }
            criteria.push_str(&format!("### {}\n\n", single_line(&entry.agent)));
            criteria.push_str(&escape_body(&entry.criteria));
            criteria.push('\n');
        }
        push_section(&mut out, CRITERIA, criteria.trim_end());

        push_section(&mut out, MATRIX, &render_matrix(&self.matrix));

        let log: Vec<String> = self.log.iter().map(LogEntry::to_markdown).collect();
        push_section(&mut out, LOG, log.join("\n").trim_end());

        if let Some(summary) = &self.summary {
            push_section(&mut out, SUMMARY, &escape_body(summary));
        }
        for (heading, body) in &self.extra {
            push_section(&mut out, heading, body);
        }
        out
    }

    /// Parses markdown produced by [`WorklogRun::render`] (or edited by
    /// [`WorklogStore::append_section`]).
    pub fn parse(path: impl Into<PathBuf>, markdown: &str) -> ForemanResult<Self> {
        let (header, sections) = split_sections(markdown);

        let title = header
            .iter()
            .find_map(|l| l.strip_prefix("# Worklog:"))
            .map(|t| t.trim().to_string())
            .ok_or_else(|| ForemanError::Worklog("missing '# Worklog:' title".into()))?;

        let mut run = WorklogRun::new(title, String::new(), 0);
        run.path = path.into();
        for line in &header {
            if let Some(v) = line.strip_prefix("- Status:") {
                run.status = v.parse()?;
            } else if let Some(v) = line.strip_prefix("- Rounds:") {
                let (n, m) = v
                    .trim()
                    .split_once('/')
                    .ok_or_else(|| ForemanError::Worklog(format!("malformed rounds '{v}'")))?;
                run.round = n.trim().parse().unwrap_or(0);
                run.max_rounds = m.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("- Created:") {
                run.created_at = DateTime::parse_from_rfc3339(v.trim())
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| ForemanError::Worklog(format!("malformed created time: {e}")))?;
            }
        }

        let mut criteria: Vec<(String, String)> = Vec::new();
        for (heading, lines) in sections {
            match heading.as_str() {
                REQUEST => run.request = unescape_body(&lines),
                PLAN => {
                    for (head, body) in split_blocks(&lines) {
                        run.plan.push(parse_plan_block(&head, &body));
                    }
                }
                CRITERIA => {
                    for (head, body) in split_blocks(&lines) {
                        criteria.push((head.trim().to_string(), unescape_body(&body)));
                    }
                }
                MATRIX => {
                    for line in lines.iter().map(|l| l.trim()) {
                        if !line.starts_with('|') || line == MATRIX_HEADER || line.starts_with("|---") {
                            continue;
                        }
                        run.matrix.push(MatrixRow::parse(line)?);
                    }
                }
                LOG => {
                    for (head, body) in split_blocks(&lines) {
                        run.log.push(LogEntry::new(head.trim(), unescape_body(&body)));
                    }
                }
                SUMMARY => run.summary = Some(unescape_body(&lines)),
                _ => run.extra.push((heading, trim_blank(&lines).join("\n"))),
            }
        }
        for (agent, text) in criteria {
            if let Some(entry) = run.plan.iter_mut().find(|e| e.agent == agent) {
                entry.criteria = text;
            }
        }
        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory of worklog files plus the `latest` pointer.
///
/// Every mutation rewrites the whole file through a temporary file and a
/// rename, so readers never observe a half-written worklog.
#[derive(Debug, Clone)]
pub struct WorklogStore {
    dir: PathBuf,
}

impl WorklogStore {
    /// Uses `dir`, creating it if needed.
    pub async fn new(dir: PathBuf) -> ForemanResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// The worklog directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a new run file named `YYYYMMDD-HHMMSS-<slug>.md` and points
    /// `latest` at it.
    pub async fn create(
        &self,
        title: &str,
        request: &str,
        max_rounds: u32,
    ) -> ForemanResult<WorklogRun> {
        let mut run = WorklogRun::new(title, request, max_rounds);
        let stem = format!("{}-{}", run.created_at.format("%Y%m%d-%H%M%S"), slugify(title));
        let mut name = format!("{stem}.md");
        let mut n = 2;
        while self.dir.join(&name).exists() {
            name = format!("{stem}-{n}.md");
            n += 1;
        }
        run.path = self.dir.join(&name);
        self.save(&run).await?;
        write_atomic(&self.dir.join(LATEST), &name).await?;
        tracing::info!(path = %run.path.display(), "Worklog created");
        Ok(run)
    }

    /// Writes `run` to its path.
    pub async fn save(&self, run: &WorklogRun) -> ForemanResult<()> {
        write_atomic(&run.path, &run.render()).await
    }

    /// Reads and parses the run at `path`.
    pub async fn load(&self, path: &Path) -> ForemanResult<WorklogRun> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ForemanError::Worklog(format!("cannot read {}: {e}", path.display()))
        })?;
        WorklogRun::parse(path, &text)
    }

    /// The run the `latest` pointer names, if any.
    pub async fn latest(&self) -> ForemanResult<Option<WorklogRun>> {
        let pointer = self.dir.join(LATEST);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = tokio::fs::read_to_string(&pointer).await?;
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let path = self.dir.join(name);
        if !path.exists() {
            tracing::warn!(file = name, "latest pointer names a missing worklog");
            return Ok(None);
        }
        self.load(&path).await.map(Some)
    }

    /// Inserts `content` at the end of the `## heading` section, before the
    /// next `## ` heading. A missing heading is created at the end of the
    /// file. Returns `false` when the section already holds `content`.
    pub async fn append_section(
        &self,
        path: &Path,
        heading: &str,
        content: &str,
    ) -> ForemanResult<bool> {
        let text = tokio::fs::read_to_string(path).await?;
        match insert_under_heading(&text, heading, content) {
            Some(updated) => {
                write_atomic(path, &updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Appends one entry to the execution log.
    pub async fn append_log(&self, path: &Path, entry: &LogEntry) -> ForemanResult<bool> {
        self.append_section(path, LOG, entry.to_markdown().trim_end()).await
    }

    /// Replaces the matrix and the round counter.
    pub async fn replace_matrix(
        &self,
        path: &Path,
        rows: &[MatrixRow],
        round: u32,
    ) -> ForemanResult<()> {
        self.update(path, |run| {
            run.matrix = rows.to_vec();
            run.round = round;
        })
        .await
    }

    /// Records the plan.
    pub async fn set_plan(&self, path: &Path, plan: &[PlanEntry]) -> ForemanResult<()> {
        self.update(path, |run| run.plan = plan.to_vec()).await
    }

    /// Sets the overall status.
    pub async fn set_status(&self, path: &Path, status: WorklogStatus) -> ForemanResult<()> {
        self.update(path, |run| run.status = status).await
    }

    /// Sets the round budget, used when a run is continued.
    pub async fn set_max_rounds(&self, path: &Path, max_rounds: u32) -> ForemanResult<()> {
        self.update(path, |run| run.max_rounds = max_rounds).await
    }

    /// Writes the final summary.
    pub async fn set_summary(&self, path: &Path, summary: &str) -> ForemanResult<()> {
        self.update(path, |run| run.summary = Some(summary.to_string()))
            .await
    }

    /// Matrix rows that are not `done`.
    pub async fn parse_pending(&self, path: &Path) -> ForemanResult<Vec<MatrixRow>> {
        Ok(self.load(path).await?.pending())
    }

    async fn update<F>(&self, path: &Path, f: F) -> ForemanResult<()>
    where
        F: FnOnce(&mut WorklogRun),
    {
        let mut run = self.load(path).await?;
        f(&mut run);
        self.save(&run).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn write_atomic(path: &Path, contents: &str) -> ForemanResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn push_section(out: &mut String, heading: &str, body: &str) {
    out.push_str(&format!("\n## {heading}\n"));
    if !body.trim().is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
}

fn render_matrix(rows: &[MatrixRow]) -> String {
    let mut out = format!("{MATRIX_HEADER}\n{MATRIX_RULE}");
    for row in rows {
        out.push('\n');
        out.push_str(&row.render());
    }
    out
}

fn cell(s: &str) -> String {
    single_line(s).replace('|', "/")
}

fn single_line(s: &str) -> String {
    s.lines().map(str::trim).collect::<Vec<_>>().join(" ")
}

fn escape_body(body: &str) -> String {
    body.lines()
        .map(|l| {
            if l.starts_with('#') || l.starts_with('\\') {
                format!("\\{l}")
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape_body(lines: &[String]) -> String {
    trim_blank(lines)
        .iter()
        .map(|l| l.strip_prefix('\\').unwrap_or(l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn trim_blank(lines: &[String]) -> &[String] {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(start, |i| i + 1);
    &lines[start..end]
}

/// Splits into the pre-section header and `(heading, lines)` pairs.
fn split_sections(markdown: &str) -> (Vec<String>, Vec<(String, Vec<String>)>) {
    let mut header = Vec::new();
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for line in markdown.lines() {
        if let Some(h) = line.strip_prefix("## ") {
            sections.push((h.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(line.to_string());
        } else {
            header.push(line.to_string());
        }
    }
    (header, sections)
}

/// Splits section lines into `### ` blocks. Text before the first block is
/// dropped.
fn split_blocks(lines: &[String]) -> Vec<(String, Vec<String>)> {
    let mut blocks: Vec<(String, Vec<String>)> = Vec::new();
    for line in lines {
        if let Some(h) = line.strip_prefix("### ") {
            blocks.push((h.to_string(), Vec::new()));
        } else if let Some((_, body)) = blocks.last_mut() {
            body.push(line.clone());
        }
    }
    blocks
}

fn parse_plan_block(head: &str, body: &[String]) -> PlanEntry {
    let head = head.trim();
    let (agent, role) = match head.rsplit_once(" (") {
        Some((agent, rest)) => (agent.to_string(), rest.trim_end_matches(')').to_string()),
        None => (head.to_string(), String::new()),
    };
    let body = trim_blank(body);
    let (task_lines, files) = match body.last().and_then(|l| l.strip_prefix("Files: ")) {
        Some(files) => (
            &body[..body.len() - 1],
            files
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        ),
        None => (body, Vec::new()),
    };
    PlanEntry {
        agent,
        role,
        task: unescape_body(task_lines),
        criteria: String::new(),
        files,
    }
}

fn insert_under_heading(text: &str, heading: &str, content: &str) -> Option<String> {
    let marker = format!("## {heading}");
    let lines: Vec<&str> = text.lines().collect();
    let content = content.trim_end();

    let Some(start) = lines.iter().position(|l| l.trim_end() == marker) else {
        let mut out = text.trim_end().to_string();
        out.push_str(&format!("\n\n{marker}\n\n{content}\n"));
        return Some(out);
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("## "))
        .map_or(lines.len(), |i| start + 1 + i);

    // Only a whole-line block equal to `content` counts as already present.
    let wanted: Vec<&str> = content.lines().map(str::trim_end).collect();
    if !wanted.is_empty()
        && lines[start + 1..end]
            .windows(wanted.len())
            .any(|w| w.iter().map(|l| l.trim_end()).eq(wanted.iter().copied()))
    {
        return None;
    }

    let mut body: Vec<&str> = lines[start + 1..end].to_vec();
    while body.last().is_some_and(|l| l.trim().is_empty()) {
        body.pop();
    }

    let mut out: Vec<&str> = lines[..=start].to_vec();
    out.extend(body);
    out.push("");
    out.extend(content.lines());
    if end < lines.len() {
        out.push("");
        out.extend(&lines[end..]);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    Some(joined)
}

fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "run".into()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> WorklogRun {
        let mut run = WorklogRun::new("Build the dashboard", "Build a dashboard\n# with a heading", 3);
        run.path = PathBuf::from("/tmp/x.md");
        run.round = 2;
        run.plan = vec![
            PlanEntry {
                agent: "Frontend".into(),
                role: "frontend".into(),
                task: "Render the charts".into(),
                criteria: "Charts load under 1s".into(),
                files: vec!["src/app.tsx".into(), "src/chart.tsx".into()],
            },
            PlanEntry {
                agent: "Writer".into(),
                role: "docs".into(),
                task: "Document it".into(),
                criteria: String::new(),
                files: vec![],
            },
        ];
        run.matrix = vec![
            MatrixRow {
                agent: "Frontend".into(),
                role: "frontend".into(),
                phase_index: 1,
                phase_count: 5,
                phase_name: "plan_verify".into(),
                status: RowStatus::InProgress,
            },
            MatrixRow {
                agent: "Writer".into(),
                role: "docs".into(),
                phase_index: 1,
                phase_count: 2,
                phase_name: "build".into(),
                status: RowStatus::Done,
            },
        ];
        run.log = vec![LogEntry::new("Round 1 - Frontend (plan)", "## Steps\n1. do it")];
        run
    }

    #[test]
    fn test_render_parse_symmetric() {
        let run = sample();
        let md = run.render();
        let back = WorklogRun::parse("/tmp/x.md", &md).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn test_render_header_and_matrix() {
        let md = sample().render();
        assert!(md.starts_with("# Worklog: Build the dashboard\n"));
        assert!(md.contains("- Status: running\n"));
        assert!(md.contains("- Rounds: 2/3\n"));
        assert!(md.contains(MATRIX_HEADER));
        assert!(md.contains("| Frontend | frontend | 2/5 | plan_verify | in_progress |"));
        // Body headings are escaped so they do not split sections.
        assert!(md.contains("\\## Steps"));
        assert!(!md.contains("## Final Summary"));
    }

    #[test]
    fn test_pending_rows() {
        let pending = sample().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].agent, "Frontend");
    }

    #[test]
    fn test_parse_requires_title() {
        assert!(matches!(
            WorklogRun::parse("x.md", "- Status: done\n"),
            Err(ForemanError::Worklog(_))
        ));
    }

    #[test]
    fn test_insert_under_heading_before_next_section() {
        let text = "# Worklog: t\n\n## Execution Log\n\n### a\n\n## Final Summary\n\nok\n";
        let out = insert_under_heading(text, "Execution Log", "### b").unwrap();
        let a = out.find("### a").unwrap();
        let b = out.find("### b").unwrap();
        let s = out.find("## Final Summary").unwrap();
        assert!(a < b && b < s);
        // Second insert is a no-op.
        assert!(insert_under_heading(&out, "Execution Log", "### b").is_none());
    }

    #[test]
    fn test_insert_creates_missing_heading_at_eof() {
        let text = "# Worklog: t\n\n## Request\n\nhi\n";
        let out = insert_under_heading(text, "Notes", "remember").unwrap();
        assert!(out.ends_with("## Notes\n\nremember\n"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Build the Dashboard!"), "build-the-dashboard");
        assert_eq!(slugify("???"), "run");
    }

    #[tokio::test]
    async fn test_create_sets_latest_and_avoids_collisions() {
        let tmp = TempDir::new().unwrap();
        let store = WorklogStore::new(tmp.path().to_path_buf()).await.unwrap();
        let a = store.create("same", "req", 3).await.unwrap();
        let b = store.create("same", "req", 3).await.unwrap();
        assert_ne!(a.path, b.path);
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.path, b.path);
        assert_eq!(latest.request, "req");
        assert_eq!(latest.max_rounds, 3);
    }

    #[tokio::test]
    async fn test_latest_none_when_empty() {
        let tmp = TempDir::new().unwrap();
        let store = WorklogStore::new(tmp.path().to_path_buf()).await.unwrap();
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_log_is_idempotent_and_parseable() {
        let tmp = TempDir::new().unwrap();
        let store = WorklogStore::new(tmp.path().to_path_buf()).await.unwrap();
        let run = store.create("log test", "req", 2).await.unwrap();
        let entry = LogEntry::new("Round 1 - A (build)", "done it");
        assert!(store.append_log(&run.path, &entry).await.unwrap());
        assert!(!store.append_log(&run.path, &entry).await.unwrap());
        let loaded = store.load(&run.path).await.unwrap();
        assert_eq!(loaded.log, vec![entry]);
    }

    #[tokio::test]
    async fn test_append_log_keeps_entry_that_is_a_prefix_of_another() {
        let tmp = TempDir::new().unwrap();
        let store = WorklogStore::new(tmp.path().to_path_buf()).await.unwrap();
        let run = store.create("prefix", "req", 2).await.unwrap();
        let long = LogEntry::new("Round 1 - A (build)", "done it");
        let short = LogEntry::new("Round 1 - A (build)", "done");
        assert!(store.append_log(&run.path, &long).await.unwrap());
        assert!(store.append_log(&run.path, &short).await.unwrap());
        let loaded = store.load(&run.path).await.unwrap();
        assert_eq!(loaded.log, vec![long, short]);
    }

    #[tokio::test]
    async fn test_status_summary_and_matrix_updates() {
        let tmp = TempDir::new().unwrap();
        let store = WorklogStore::new(tmp.path().to_path_buf()).await.unwrap();
        let run = store.create("upd", "req", 3).await.unwrap();
        store
            .replace_matrix(&run.path, &sample().matrix, 2)
            .await
            .unwrap();
        store.set_status(&run.path, WorklogStatus::Partial).await.unwrap();
        store.set_summary(&run.path, "half done").await.unwrap();

        let loaded = store.load(&run.path).await.unwrap();
        assert_eq!(loaded.status, WorklogStatus::Partial);
        assert_eq!(loaded.round, 2);
        assert_eq!(loaded.summary.as_deref(), Some("half done"));
        let pending = store.parse_pending(&run.path).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
