mod config;

use crate::config::ForemanConfig;
use clap::{Parser, Subcommand, ValueEnum};
use foreman_agent::{
    Dispatcher, EngineRegistry, KillReason, ProcessLauncher, Supervisor, TokioLauncher,
};
use foreman_core::{BroadcastBus, BusEvent, ChannelKey, EngineKind, Origin};
use foreman_orchestrator::{InboundMessage, Pipeline, QueueCoordinator, SubmitOutcome};
use foreman_session::{FileBindingStore, FileHistoryStore, HistoryStore, WorklogStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman: drive AI coding CLIs as a supervised team")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Round budget per run (overrides config)
    #[arg(long)]
    max_rounds: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a request and print the final answer
    Run {
        /// The request text
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
        /// Engine for this request (overrides config)
        #[arg(short, long)]
        engine: Option<EngineKind>,
        /// Originating front end
        #[arg(long, value_enum, default_value_t = OriginArg::Cli)]
        origin: OriginArg,
        /// Channel id within the origin
        #[arg(long)]
        channel: Option<String>,
    },
    /// Resume the latest orchestration run
    Continue {
        #[arg(short, long)]
        engine: Option<EngineKind>,
    },
    /// Print the latest worklog
    Worklog {
        /// Only list workers that still have phases left
        #[arg(long)]
        pending: bool,
    },
    /// List engines, binary availability and fallback order
    Engines,
}

#[derive(Clone, Copy, ValueEnum)]
enum OriginArg {
    Web,
    Telegram,
    Cli,
}

impl From<OriginArg> for Origin {
    fn from(arg: OriginArg) -> Self {
        match arg {
            OriginArg::Web => Origin::Web,
            OriginArg::Telegram => Origin::Telegram,
            OriginArg::Cli => Origin::Cli,
        }
    }
}

/// Everything a submitting command needs, wired together.
struct Runtime {
    bus: Arc<BroadcastBus>,
    supervisor: Arc<Supervisor>,
    queue: Arc<QueueCoordinator>,
}

async fn build_runtime(config: &ForemanConfig) -> anyhow::Result<Runtime> {
    let data_dir = &config.data_dir;
    let history: Arc<dyn HistoryStore> =
        Arc::new(FileHistoryStore::new(data_dir.join("history")).await?);
    let bindings = Arc::new(FileBindingStore::new(data_dir.clone()).await?);
    let worklogs = Arc::new(WorklogStore::new(data_dir.join("worklogs")).await?);
    let bus = BroadcastBus::new();
    let launcher = match &config.work_dir {
        Some(dir) => TokioLauncher::with_working_dir(dir),
        None => TokioLauncher::new(),
    };

    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_config(),
        EngineRegistry::with_builtin(),
        Arc::new(launcher),
        history.clone(),
        bindings,
        bus.clone(),
    ));
    let dispatcher: Arc<dyn Dispatcher> = supervisor.clone();
    let pipeline = Arc::new(Pipeline::new(
        dispatcher,
        worklogs,
        history.clone(),
        bus.clone(),
        config.orchestrator.clone(),
        config.employees.clone(),
    ));
    let queue = QueueCoordinator::with_system_prompt(
        pipeline,
        history,
        bus.clone(),
        config.active_engine,
        config.system_prompt.clone(),
    );
    supervisor.set_idle_hook(queue.idle_hook());
    info!(
        data_dir = %data_dir.display(),
        engine = %config.active_engine,
        employees = config.employees.len(),
        "Runtime ready"
    );
    Ok(Runtime {
        bus,
        supervisor,
        queue,
    })
}

/// Submits `msg`, streams bus events to stderr as JSON lines and prints the
/// final answer. Ctrl-C stops the main worker.
async fn submit_and_wait(runtime: Runtime, msg: InboundMessage) -> anyhow::Result<()> {
    let (_listener, mut events) = runtime.bus.subscribe_channel();
    match runtime.queue.submit(msg).await? {
        SubmitOutcome::Started => {}
        SubmitOutcome::Reset => {
            println!("Session reset.");
            return Ok(());
        }
        SubmitOutcome::Queued { pending } => {
            info!(pending, "Request queued behind a running worker");
        }
        SubmitOutcome::Rejected { reason } => anyhow::bail!("request rejected: {reason}"),
    }

    let mut answer = None;
    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else { break };
                eprintln!("{}", serde_json::to_string(&envelope)?);
                if let BusEvent::OrchestrateDone { text, .. } = envelope.event {
                    answer = Some(text);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping worker");
                runtime.supervisor.kill(KillReason::Shutdown).await;
                runtime.queue.stop().await;
            }
        }
    }
    runtime.queue.wait_idle().await;
    if let Some(text) = answer {
        println!("{text}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ForemanConfig::load(&cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(rounds) = cli.max_rounds {
        config.orchestrator.max_rounds = rounds;
    }

    match cli.command {
        Commands::Run {
            prompt,
            engine,
            origin,
            channel,
        } => {
            if let Some(engine) = engine {
                config.active_engine = engine;
            }
            let runtime = build_runtime(&config).await?;
            let msg = InboundMessage::new(prompt.join(" "))
                .with_channel(ChannelKey::new(origin.into(), channel));
            submit_and_wait(runtime, msg).await?;
        }
        Commands::Continue { engine } => {
            if let Some(engine) = engine {
                config.active_engine = engine;
            }
            let runtime = build_runtime(&config).await?;
            submit_and_wait(runtime, InboundMessage::new("continue")).await?;
        }
        Commands::Worklog { pending } => {
            let store = WorklogStore::new(config.data_dir.join("worklogs")).await?;
            let Some(run) = store.latest().await? else {
                println!("No worklog yet.");
                return Ok(());
            };
            if pending {
                let rows = run.pending();
                if rows.is_empty() {
                    println!("No pending workers in {}.", run.path.display());
                }
                for row in rows {
                    println!(
                        "{} ({}) - phase {}/{} {}",
                        row.agent,
                        row.role,
                        row.phase_index + 1,
                        row.phase_count,
                        row.phase_name
                    );
                }
            } else {
                println!("{}", run.render());
            }
        }
        Commands::Engines => {
            let sup = config.supervisor_config();
            let launcher = TokioLauncher::new();
            let registry = EngineRegistry::with_builtin();
            println!("Engines:");
            for kind in EngineKind::ALL {
                let spec = sup.engine(kind);
                let found = launcher
                    .locate(&spec.binary)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "not found".to_string());
                let marker = if kind == config.active_engine { "*" } else { " " };
                let adapter = if registry.get(kind).is_some() { "" } else { " (no adapter)" };
                println!(
                    "{marker} {:<9} model {:<28} binary {found}{adapter}",
                    kind.as_str(),
                    spec.default_model
                );
            }
            let order: Vec<String> = sup.fallback_order.iter().map(ToString::to_string).collect();
            println!("\nFallback order: {}", order.join(" -> "));
        }
    }

    Ok(())
}
