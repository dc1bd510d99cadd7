//! Supervisor tests against a scripted launcher: retries, fallback, missing
//! binaries, steering and the single main slot.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use foreman_agent::{
    ChildControl, EngineRegistry, IdleHook, KillReason, LaunchedProcess, ProcessLauncher,
    RetryPolicy, RunStatus, SleepFn, SpawnOptions, Supervisor, SupervisorConfig,
};
use foreman_core::{BroadcastBus, BusEvent, EngineKind, ForemanError, Message, Role};
use foreman_session::{
    BindingStore, HistoryStore, MemoryBindingStore, MemoryHistoryStore, SessionBinding,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

// --- Scripted launcher ---

#[derive(Clone, Default)]
struct Script {
    stdout: String,
    stderr: String,
    exit: Option<i32>,
    block: bool,
    ignores_terminate: bool,
}

impl Script {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit: Some(0),
            ..Self::default()
        }
    }

    fn fail(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit: Some(1),
            ..Self::default()
        }
    }

    fn blocking(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            block: true,
            ..Self::default()
        }
    }

    /// Blocks and only exits on a forced kill.
    fn stubborn(stdout: impl Into<String>) -> Self {
        Self {
            ignores_terminate: true,
            ..Self::blocking(stdout)
        }
    }
}

struct Launch {
    binary: String,
    args: Vec<String>,
    stdin: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct FakeLauncher {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    missing: HashSet<String>,
    launches: Mutex<Vec<Launch>>,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl FakeLauncher {
    fn with_missing(binaries: &[&str]) -> Self {
        Self {
            missing: binaries.iter().map(|b| (*b).to_string()).collect(),
            ..Self::default()
        }
    }

    fn script(&self, binary: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(binary.to_string())
            .or_default()
            .push_back(script);
    }

    fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    fn launched_binaries(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.binary.clone())
            .collect()
    }

    fn args(&self, index: usize) -> Vec<String> {
        self.launches.lock().unwrap()[index].args.clone()
    }

    fn stdin(&self, index: usize) -> String {
        let launches = self.launches.lock().unwrap();
        let bytes = launches[index].stdin.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn locate(&self, binary: &str) -> Option<PathBuf> {
        (!self.missing.contains(binary)).then(|| PathBuf::from(binary))
    }

    async fn launch(&self, program: &Path, args: &[String]) -> io::Result<LaunchedProcess> {
        let binary = program.to_string_lossy().into_owned();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&binary)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::other(format!("no script left for {binary}")))?;
        let stdin = Arc::new(Mutex::new(Vec::new()));
        self.launches.lock().unwrap().push(Launch {
            binary,
            args: args.to_vec(),
            stdin: Arc::clone(&stdin),
        });
        Ok(LaunchedProcess {
            stdin: Some(Box::new(Capture(stdin))),
            stdout: Box::new(io::Cursor::new(script.stdout.into_bytes())),
            stderr: Box::new(io::Cursor::new(script.stderr.into_bytes())),
            child: Box::new(FakeChild {
                exit: script.exit,
                block: script.block,
                ignores_terminate: script.ignores_terminate,
                release: Arc::new(Notify::new()),
                terminates: Arc::clone(&self.terminates),
                kills: Arc::clone(&self.kills),
            }),
        })
    }
}

struct Capture(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for Capture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct FakeChild {
    exit: Option<i32>,
    block: bool,
    ignores_terminate: bool,
    release: Arc<Notify>,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ChildControl for FakeChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if self.block {
            self.release.notified().await;
            return Ok(None);
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.ignores_terminate {
            self.release.notify_one();
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.release.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct CountingHook(AtomicUsize);

#[async_trait]
impl IdleHook for CountingHook {
    async fn on_main_idle(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Fixture ---

struct Fixture {
    supervisor: Arc<Supervisor>,
    launcher: Arc<FakeLauncher>,
    history: Arc<MemoryHistoryStore>,
    bindings: Arc<MemoryBindingStore>,
    events: Arc<Mutex<Vec<BusEvent>>>,
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl Fixture {
    fn new(launcher: FakeLauncher) -> Self {
        Self::with_config(launcher, SupervisorConfig::default())
    }

    fn with_config(launcher: FakeLauncher, config: SupervisorConfig) -> Self {
        Self::build(launcher, config, false)
    }

    /// Backoff sleeps are recorded and then never finish.
    fn with_stuck_sleep(launcher: FakeLauncher) -> Self {
        Self::build(launcher, SupervisorConfig::default(), true)
    }

    fn build(launcher: FakeLauncher, config: SupervisorConfig, stuck_sleep: bool) -> Self {
        let launcher = Arc::new(launcher);
        let history = Arc::new(MemoryHistoryStore::new());
        let bindings = Arc::new(MemoryBindingStore::new());
        let bus = BroadcastBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe(move |env| sink.lock().unwrap().push(env.event.clone()));

        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);
        let sleep: SleepFn = Arc::new(move |d: Duration| {
            recorded.lock().unwrap().push(d);
            if stuck_sleep {
                Box::pin(std::future::pending::<()>()) as Pin<Box<dyn Future<Output = ()> + Send>>
            } else {
                Box::pin(async {}) as Pin<Box<dyn Future<Output = ()> + Send>>
            }
        });

        let supervisor = Supervisor::new(
            config,
            EngineRegistry::with_builtin(),
            launcher.clone() as Arc<dyn ProcessLauncher>,
            history.clone() as Arc<dyn HistoryStore>,
            bindings.clone() as Arc<dyn BindingStore>,
            bus,
        )
        .with_sleep(sleep);

        Self {
            supervisor: Arc::new(supervisor),
            launcher,
            history,
            bindings,
            events,
            delays,
        }
    }

    fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count<F: Fn(&BusEvent) -> bool>(&self, f: F) -> usize {
        self.events().iter().filter(|e| f(e)).count()
    }

    async fn wait_for_launches(&self, n: usize) {
        for _ in 0..400 {
            if self.launcher.launch_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} launches");
    }
}

fn claude_answer(session: &str, text: &str) -> String {
    format!(
        "{{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"{session}\"}}\n\
         {{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"{text}\"}}]}}}}\n\
         {{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"{session}\",\"total_cost_usd\":0.01,\"usage\":{{\"input_tokens\":10,\"output_tokens\":2}}}}\n"
    )
}

fn codex_answer(thread: &str, text: &str) -> String {
    format!(
        "{{\"type\":\"thread.started\",\"thread_id\":\"{thread}\"}}\n\
         {{\"type\":\"item.completed\",\"item\":{{\"id\":\"i0\",\"type\":\"agent_message\",\"text\":\"{text}\"}}}}\n\
         {{\"type\":\"turn.completed\",\"usage\":{{\"input_tokens\":5,\"output_tokens\":1}}}}\n"
    )
}

const RATE_LIMITED: &str = "Error: 429 Too Many Requests";

// --- Retry and fallback ---

#[tokio::test]
async fn test_rate_limit_retries_then_succeeds() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("claude", Script::ok(claude_answer("s-1", "done")));
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("fix it", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.text, "done");
    assert_eq!(result.attempts, 3);
    assert_eq!(fx.count(|e| matches!(e, BusEvent::AgentRetry { .. })), 2);
    assert_eq!(fx.count(|e| matches!(e, BusEvent::AgentFallback { .. })), 0);
    assert_eq!(
        *fx.delays.lock().unwrap(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    // Success clears the degraded state.
    assert!(fx.supervisor.fallback_state(EngineKind::Claude).await.is_none());
}

#[tokio::test]
async fn test_answer_mentioning_a_429_lookalike_is_not_retried() {
    let launcher = FakeLauncher::default();
    launcher.script(
        "claude",
        Script {
            stdout: claude_answer("s-1", "The dev server now listens on port 4290."),
            exit: Some(2),
            ..Script::default()
        },
    );
    launcher.script("claude", Script::ok(claude_answer("s-2", "second")));
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("move the port", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.text, "The dev server now listens on port 4290.");
    assert_eq!(result.attempts, 1);
    assert_eq!(fx.launcher.launch_count(), 1);
    assert!(fx.delays.lock().unwrap().is_empty());
    assert_eq!(fx.count(|e| matches!(e, BusEvent::AgentRetry { .. })), 0);
}

#[tokio::test]
async fn test_rate_limit_text_in_answer_ignored_when_stderr_explains_exit() {
    let launcher = FakeLauncher::default();
    launcher.script(
        "claude",
        Script {
            stdout: claude_answer("s-1", "Added a retry when the API is overloaded."),
            stderr: "warning: tests skipped".into(),
            exit: Some(1),
            ..Script::default()
        },
    );
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("add retry", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(fx.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fall_back_once() {
    let launcher = FakeLauncher::default();
    for _ in 0..3 {
        launcher.script("claude", Script::fail(RATE_LIMITED));
    }
    launcher.script("codex", Script::ok(codex_answer("t-1", "from codex")));
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("fix it", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.engine, EngineKind::Codex);
    assert_eq!(result.text, "from codex");
    assert_eq!(
        fx.launcher.launched_binaries(),
        vec!["claude", "claude", "claude", "codex"]
    );
    let fallbacks: Vec<_> = fx
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BusEvent::AgentFallback { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(fallbacks, vec![(EngineKind::Claude, EngineKind::Codex)]);

    let state = fx
        .supervisor
        .fallback_state(EngineKind::Claude)
        .await
        .unwrap();
    assert_eq!(state.retries_left, 0);
    assert_eq!(state.fallback, Some(EngineKind::Codex));
}

#[tokio::test]
async fn test_retry_budget_persists_across_spawns() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("codex", Script::ok(codex_answer("t-1", "a")));
    // Second spawn: claude is still degraded with no retries left.
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("codex", Script::ok(codex_answer("t-2", "b")));
    let fx = Fixture::new(launcher);

    fx.supervisor
        .spawn("one", SpawnOptions::new(EngineKind::Claude))
        .await
        .unwrap();
    let second = fx
        .supervisor
        .spawn("two", SpawnOptions::new(EngineKind::Claude))
        .await
        .unwrap();

    assert_eq!(second.engine, EngineKind::Codex);
    assert_eq!(second.attempts, 2);
    assert_eq!(fx.delays.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_non_zero_exit_with_text_counts_as_completed() {
    let launcher = FakeLauncher::default();
    launcher.script(
        "claude",
        Script {
            stdout: claude_answer("s-1", "partial but useful"),
            stderr: "warning: something odd".into(),
            exit: Some(2),
            block: false,
            ignores_terminate: false,
        },
    );
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("go", SpawnOptions::new(EngineKind::Claude))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.exit_code, Some(2));
}

#[tokio::test]
async fn test_failure_without_fallback_reports_summary() {
    let launcher = FakeLauncher::default();
    launcher.script("codex", Script::fail("error: not logged in, run codex login"));
    let config = SupervisorConfig {
        fallback_order: vec![EngineKind::Codex],
        ..SupervisorConfig::default()
    };
    let fx = Fixture::with_config(launcher, config);

    let result = fx
        .supervisor
        .spawn("go", SpawnOptions::new(EngineKind::Codex))
        .await
        .unwrap();
    match result.status {
        RunStatus::Failed { summary } => {
            assert!(summary.starts_with("codex exited with 1:"));
            assert!(summary.contains("log in again"));
        }
        other => panic!("unexpected status {other:?}"),
    }
}

// --- Missing binaries ---

#[tokio::test]
async fn test_missing_tool_without_fallback() {
    let config = SupervisorConfig {
        fallback_order: vec![EngineKind::Claude],
        ..SupervisorConfig::default()
    };
    let fx = Fixture::with_config(FakeLauncher::with_missing(&["claude"]), config);

    let result = fx
        .supervisor
        .spawn("hello", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::MissingTool);
    assert_eq!(result.exit_code, Some(127));
    assert_eq!(fx.launcher.launch_count(), 0);
    assert!(!fx.supervisor.is_main_busy());
}

#[tokio::test]
async fn test_missing_tool_falls_back() {
    let launcher = FakeLauncher::with_missing(&["claude"]);
    launcher.script("codex", Script::ok(codex_answer("t-1", "covered")));
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("hello", SpawnOptions::new(EngineKind::Claude))
        .await
        .unwrap();
    assert_eq!(result.engine, EngineKind::Codex);
    assert_eq!(result.text, "covered");
    assert_eq!(fx.count(|e| matches!(e, BusEvent::AgentFallback { .. })), 1);
}

// --- Context, history and sessions ---

#[tokio::test]
async fn test_fresh_codex_gets_context_on_stdin() {
    let launcher = FakeLauncher::default();
    launcher.script("codex", Script::ok(codex_answer("t-1", "ok")));
    let fx = Fixture::new(launcher);
    fx.history.insert(Message::user("earlier question")).await.unwrap();
    fx.history.insert(Message::assistant("earlier answer")).await.unwrap();
    fx.history.insert(Message::user("now this")).await.unwrap();

    fx.supervisor
        .spawn(
            "now this",
            SpawnOptions::new(EngineKind::Codex).with_system_prompt("You are terse."),
        )
        .await
        .unwrap();

    let stdin = fx.launcher.stdin(0);
    assert!(stdin.starts_with("You are terse."));
    assert!(stdin.contains("earlier question"));
    assert!(stdin.ends_with("now this"));
    // The prompt itself is not repeated inside the history block.
    assert_eq!(stdin.matches("now this").count(), 1);
}

#[tokio::test]
async fn test_claude_context_rides_on_system_prompt_flag() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::ok(claude_answer("s-1", "ok")));
    let fx = Fixture::new(launcher);

    fx.supervisor
        .spawn(
            "question",
            SpawnOptions::new(EngineKind::Claude).with_system_prompt("Be brief."),
        )
        .await
        .unwrap();

    let args = fx.launcher.args(0);
    let pos = args
        .iter()
        .position(|a| a == "--append-system-prompt")
        .unwrap();
    assert!(args[pos + 1].contains("Be brief."));
    assert_eq!(fx.launcher.stdin(0), "question");
}

#[tokio::test]
async fn test_main_run_binds_session_and_resume_uses_it() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::ok(claude_answer("s-42", "first")));
    launcher.script("claude", Script::ok(claude_answer("s-42", "second")));
    let fx = Fixture::new(launcher);

    fx.supervisor
        .spawn("one", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();
    let bound = fx.bindings.load().await.unwrap().unwrap();
    assert_eq!(bound.engine, EngineKind::Claude);
    assert_eq!(bound.session_id, "s-42");

    fx.supervisor
        .spawn("two", SpawnOptions::new(EngineKind::Claude).main().resume())
        .await
        .unwrap();
    let args = fx.launcher.args(1);
    assert!(args.windows(2).any(|w| w == ["--resume", "s-42"]));
    assert!(!args.contains(&"--append-system-prompt".to_string()));
}

#[tokio::test]
async fn test_resume_ignored_for_other_engine() {
    let launcher = FakeLauncher::default();
    launcher.script("codex", Script::ok(codex_answer("t-1", "fresh")));
    let fx = Fixture::new(launcher);
    fx.bindings
        .save(Some(&SessionBinding::new(EngineKind::Claude, "s-1")))
        .await
        .unwrap();

    fx.supervisor
        .spawn("go", SpawnOptions::new(EngineKind::Codex).main().resume())
        .await
        .unwrap();
    assert!(!fx.launcher.args(0).contains(&"resume".to_string()));
}

#[tokio::test]
async fn test_internal_runs_stay_out_of_history() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::ok(claude_answer("s-1", "visible")));
    launcher.script("claude", Script::ok(claude_answer("s-2", "hidden")));
    let fx = Fixture::new(launcher);

    fx.supervisor
        .spawn("a", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();
    fx.supervisor
        .spawn("b", SpawnOptions::new(EngineKind::Claude).main().internal())
        .await
        .unwrap();

    let history = fx.history.all().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::Assistant);
    assert_eq!(history[0].content, "visible");
    assert_eq!(history[0].engine, Some(EngineKind::Claude));
    // The internal run did not move the binding.
    assert_eq!(
        fx.supervisor.binding().await.unwrap().session_id,
        "s-1".to_string()
    );
}

#[tokio::test]
async fn test_reset_clears_binding_and_fallbacks() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::fail("segfault"));
    launcher.script("codex", Script::ok(codex_answer("t-1", "ok")));
    let fx = Fixture::new(launcher);

    let result = fx
        .supervisor
        .spawn("a", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();
    assert_eq!(result.engine, EngineKind::Codex);
    assert_eq!(
        fx.supervisor.binding().await.unwrap().engine,
        EngineKind::Codex
    );
    assert!(fx.supervisor.fallback_state(EngineKind::Claude).await.is_some());

    fx.supervisor.reset().await.unwrap();
    assert!(fx.supervisor.binding().await.is_none());
    assert!(fx.bindings.load().await.unwrap().is_none());
    assert!(fx.supervisor.fallback_state(EngineKind::Claude).await.is_none());
}

// --- Main slot, steering and the idle hook ---

#[tokio::test]
async fn test_second_main_spawn_is_busy() {
    let launcher = FakeLauncher::default();
    launcher.script(
        "claude",
        Script::blocking(claude_answer("s-1", "long running")),
    );
    launcher.script("codex", Script::ok(codex_answer("t-1", "side answer")));
    let fx = Fixture::new(launcher);

    let sup = Arc::clone(&fx.supervisor);
    let main = tokio::spawn(async move {
        sup.spawn("long", SpawnOptions::new(EngineKind::Claude).main())
            .await
    });
    fx.wait_for_launches(1).await;
    assert!(fx.supervisor.is_main_busy());

    let busy = fx
        .supervisor
        .spawn("again", SpawnOptions::new(EngineKind::Claude).main())
        .await;
    assert!(matches!(busy, Err(ForemanError::Busy)));

    // Auxiliary workers run alongside the main one.
    let aux = fx
        .supervisor
        .spawn("side", SpawnOptions::new(EngineKind::Codex))
        .await
        .unwrap();
    assert_eq!(aux.text, "side answer");

    assert!(fx.supervisor.kill_and_wait(KillReason::Stop).await);
    let result = main.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.kill_reason, Some(KillReason::Stop));
    assert!(!fx.supervisor.is_main_busy());
}

#[tokio::test]
async fn test_steer_keeps_partial_text_and_skips_idle_hook() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::blocking(claude_answer("s-1", "halfway")));
    let fx = Fixture::new(launcher);
    let hook = Arc::new(CountingHook::default());
    let weak: Weak<dyn IdleHook> = Arc::downgrade(&hook) as Weak<dyn IdleHook>;
    assert!(fx.supervisor.set_idle_hook(weak));

    let sup = Arc::clone(&fx.supervisor);
    let main = tokio::spawn(async move {
        sup.spawn("long", SpawnOptions::new(EngineKind::Claude).main())
            .await
    });
    fx.wait_for_launches(1).await;
    assert!(fx.supervisor.kill_and_wait(KillReason::Steer).await);

    let result = main.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.text, "[interrupted] halfway");
    assert_eq!(hook.0.load(Ordering::SeqCst), 0);

    let history = fx.history.all().await;
    assert_eq!(history.last().unwrap().content, "[interrupted] halfway");
}

#[tokio::test]
async fn test_kill_escalates_when_terminate_is_ignored() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::stubborn(claude_answer("s-1", "stuck")));
    let config = SupervisorConfig {
        kill_grace_ms: 20,
        ..SupervisorConfig::default()
    };
    let fx = Fixture::with_config(launcher, config);

    let sup = Arc::clone(&fx.supervisor);
    let main = tokio::spawn(async move {
        sup.spawn("long", SpawnOptions::new(EngineKind::Claude).main())
            .await
    });
    fx.wait_for_launches(1).await;
    assert!(fx.supervisor.kill_and_wait(KillReason::Stop).await);

    let result = tokio::time::timeout(Duration::from_secs(5), main)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.kill_reason, Some(KillReason::Stop));
    assert_eq!(fx.launcher.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(fx.launcher.kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_graceful_terminate_skips_forced_kill() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::blocking(claude_answer("s-1", "partial")));
    let fx = Fixture::new(launcher);

    let sup = Arc::clone(&fx.supervisor);
    let main = tokio::spawn(async move {
        sup.spawn("long", SpawnOptions::new(EngineKind::Claude).main())
            .await
    });
    fx.wait_for_launches(1).await;
    assert!(fx.supervisor.kill_and_wait(KillReason::Stop).await);
    main.await.unwrap().unwrap();

    assert_eq!(fx.launcher.terminates.load(Ordering::SeqCst), 1);
    assert_eq!(fx.launcher.kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_kill_during_backoff_cancels_the_retry() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::fail(RATE_LIMITED));
    launcher.script("claude", Script::ok(claude_answer("s-1", "too late")));
    let fx = Fixture::with_stuck_sleep(launcher);

    let sup = Arc::clone(&fx.supervisor);
    let main = tokio::spawn(async move {
        sup.spawn("fix it", SpawnOptions::new(EngineKind::Claude).main())
            .await
    });
    for _ in 0..400 {
        if !fx.delays.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fx.delays.lock().unwrap().len(), 1);
    assert!(fx.supervisor.kill_and_wait(KillReason::Stop).await);

    let result = tokio::time::timeout(Duration::from_secs(5), main)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.kill_reason, Some(KillReason::Stop));
    assert_eq!(fx.launcher.launch_count(), 1);
    assert!(!fx.supervisor.is_main_busy());
}

#[tokio::test]
async fn test_idle_hook_fires_after_normal_completion() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::ok(claude_answer("s-1", "ok")));
    launcher.script("codex", Script::ok(codex_answer("t-1", "aux")));
    let fx = Fixture::new(launcher);
    let hook = Arc::new(CountingHook::default());
    let weak: Weak<dyn IdleHook> = Arc::downgrade(&hook) as Weak<dyn IdleHook>;
    fx.supervisor.set_idle_hook(weak);

    fx.supervisor
        .spawn("a", SpawnOptions::new(EngineKind::Claude).main())
        .await
        .unwrap();
    fx.supervisor
        .spawn("b", SpawnOptions::new(EngineKind::Codex))
        .await
        .unwrap();

    // Only the main worker reports idleness.
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_with_nothing_running() {
    let fx = Fixture::new(FakeLauncher::default());
    assert!(!fx.supervisor.kill(KillReason::Stop).await);
    assert!(!fx.supervisor.kill_and_wait(KillReason::Steer).await);
}

#[tokio::test]
async fn test_done_event_carries_cost() {
    let launcher = FakeLauncher::default();
    launcher.script("claude", Script::ok(claude_answer("s-1", "ok")));
    let fx = Fixture::new(launcher);
    fx.supervisor
        .spawn("a", SpawnOptions::new(EngineKind::Claude).internal())
        .await
        .unwrap();

    let done = fx
        .events()
        .into_iter()
        .find_map(|e| match e {
            BusEvent::AgentDone {
                cost_usd, internal, ..
            } => Some((cost_usd, internal)),
            _ => None,
        })
        .unwrap();
    assert_eq!(done, (Some(0.01), true));
}

#[tokio::test]
async fn test_custom_retry_policy() {
    let launcher = FakeLauncher::default();
    launcher.script("gemini", Script::fail("RESOURCE_EXHAUSTED: quota"));
    launcher.script("gemini", Script::fail("RESOURCE_EXHAUSTED: quota"));
    let config = SupervisorConfig {
        retry: RetryPolicy {
            max_retries: 1,
            backoff_base_ms: 10,
            backoff_max_ms: 10,
        },
        fallback_order: vec![EngineKind::Gemini],
        ..SupervisorConfig::default()
    };
    let fx = Fixture::with_config(launcher, config);

    let result = fx
        .supervisor
        .spawn("a", SpawnOptions::new(EngineKind::Gemini))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::RateLimited);
    assert_eq!(*fx.delays.lock().unwrap(), vec![Duration::from_millis(10)]);
}
