#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_core::{ChannelKey, EngineKind, Message, Origin};
use foreman_session::*;

/// Helper: a worklog store in a temp directory.
async fn temp_worklogs() -> (WorklogStore, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = WorklogStore::new(tmp.path().join("worklogs")).await.unwrap();
    (store, tmp)
}

fn row(agent: &str, role: &str, index: usize, count: usize, name: &str, status: RowStatus) -> MatrixRow {
    MatrixRow {
        agent: agent.into(),
        role: role.into(),
        phase_index: index,
        phase_count: count,
        phase_name: name.into(),
        status,
    }
}

// ---------------------------------------------------------------------------
// Worklog: a full run lifecycle survives reload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_worklog_lifecycle_round_trip() {
    let (store, _tmp) = temp_worklogs().await;
    let run = store
        .create("Ship the release", "Ship the release:\n1. build\n2. docs", 3)
        .await
        .unwrap();

    store
        .set_plan(
            &run.path,
            &[PlanEntry {
                agent: "Backend".into(),
                role: "backend".into(),
                task: "Cut the release branch".into(),
                criteria: "CI is green".into(),
                files: vec!["Cargo.toml".into()],
            }],
        )
        .await
        .unwrap();

    let matrix = vec![
        row("Backend", "backend", 2, 5, "build", RowStatus::InProgress),
        row("Docs", "docs", 1, 2, "build", RowStatus::Done),
    ];
    store.replace_matrix(&run.path, &matrix, 1).await.unwrap();
    store
        .append_log(
            &run.path,
            &LogEntry::new("Round 1 - Backend (plan)", "# Plan\n- branch\n- tag"),
        )
        .await
        .unwrap();

    let loaded = store.latest().await.unwrap().unwrap();
    assert_eq!(loaded.path, run.path);
    assert_eq!(loaded.round, 1);
    assert_eq!(loaded.matrix, matrix);
    assert_eq!(loaded.plan[0].criteria, "CI is green");
    assert_eq!(loaded.plan[0].files, vec!["Cargo.toml".to_string()]);
    assert_eq!(loaded.log.len(), 1);
    assert_eq!(loaded.log[0].body, "# Plan\n- branch\n- tag");

    // Render of the loaded run parses back to the same value.
    let again = WorklogRun::parse(&loaded.path, &loaded.render()).unwrap();
    assert_eq!(again, loaded);
}

// ---------------------------------------------------------------------------
// Worklog: pending rows are exactly the unfinished workers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parse_pending_names_unfinished_workers() {
    let (store, _tmp) = temp_worklogs().await;
    let run = store.create("five workers", "req", 2).await.unwrap();
    let matrix = vec![
        row("A", "frontend", 4, 5, "integration_verify", RowStatus::Done),
        row("B", "backend", 2, 5, "build", RowStatus::InProgress),
        row("C", "data", 3, 4, "integration_verify", RowStatus::Done),
        row("D", "docs", 0, 2, "plan", RowStatus::Pending),
        row("E", "custom", 0, 1, "build", RowStatus::Done),
    ];
    store.replace_matrix(&run.path, &matrix, 2).await.unwrap();

    let pending: Vec<String> = store
        .parse_pending(&run.path)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.agent)
        .collect();
    assert_eq!(pending, vec!["B".to_string(), "D".to_string()]);
}

// ---------------------------------------------------------------------------
// Worklog: hand-added sections are preserved
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_section_survives_updates() {
    let (store, _tmp) = temp_worklogs().await;
    let run = store.create("notes", "req", 1).await.unwrap();
    assert!(store
        .append_section(&run.path, "Reviewer Notes", "looks fine")
        .await
        .unwrap());
    store.set_status(&run.path, WorklogStatus::Done).await.unwrap();

    let loaded = store.load(&run.path).await.unwrap();
    assert_eq!(loaded.status, WorklogStatus::Done);
    assert_eq!(
        loaded.extra,
        vec![("Reviewer Notes".to_string(), "looks fine".to_string())]
    );
}

// ---------------------------------------------------------------------------
// History and bindings share a data directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_history_and_binding_in_same_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();
    let history = FileHistoryStore::new(dir.clone()).await.unwrap();
    let bindings = FileBindingStore::new(dir).await.unwrap();

    let channel = ChannelKey::new(Origin::Telegram, Some("7".into()));
    history
        .insert(Message::user("hello").with_channel(channel.clone()))
        .await
        .unwrap();
    bindings
        .save(Some(&SessionBinding::new(EngineKind::Codex, "thread-9")))
        .await
        .unwrap();

    let recent = history.recent(10).await.unwrap();
    assert_eq!(recent[0].channel, channel);
    let binding = bindings.load().await.unwrap().unwrap();
    assert_eq!(binding.resumable_for(EngineKind::Codex), Some("thread-9"));
}
