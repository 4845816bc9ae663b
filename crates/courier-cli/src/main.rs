//! courier CLI - dispatch エンジンの起動と操作

mod modules;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use courier_core::config::BrokerKind;
use courier_core::domain::MetaValue;
use courier_core::{AppBuilder, Config, CourierError, DispatchCounts, Metadata, Route, Task, telemetry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "courier", about = "Broker-driven task dispatcher", version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the input queue until Ctrl-C
    Serve {
        #[arg(long, value_enum)]
        broker: Option<BrokerArg>,
        /// Global worker slots
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Encode and publish one task
    Submit {
        /// Target module identifier
        task_type: String,
        /// Payload as UTF-8 text
        #[arg(long, default_value = "")]
        payload: String,
        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Metadata entry `key=value`; integers and true/false are typed
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, MetaValue)>,
        /// `any`, `broadcast` or `node:<id>`
        #[arg(long, default_value = "any")]
        route: Route,
        /// Wait up to this many seconds for the reply on this node's reply queue
        #[arg(long)]
        wait: Option<u64>,
    },
    /// List registered modules
    Modules,
    /// Run the engine over the in-memory broker with a few seeded tasks
    Demo,
}

#[derive(Clone, Copy, ValueEnum)]
enum BrokerArg {
    Memory,
    Pgmq,
}

impl From<BrokerArg> for BrokerKind {
    fn from(arg: BrokerArg) -> Self {
        match arg {
            BrokerArg::Memory => BrokerKind::Memory,
            BrokerArg::Pgmq => BrokerKind::Pgmq,
        }
    }
}

fn parse_meta(raw: &str) -> Result<(String, MetaValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty metadata key in `{raw}`"));
    }
    let value = if let Ok(n) = value.parse::<i64>() {
        MetaValue::Int(n)
    } else if let Ok(b) = value.parse::<bool>() {
        MetaValue::Bool(b)
    } else {
        MetaValue::Str(value.to_string())
    };
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "courier exited with an error");
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<CourierError>().map_or(1, CourierError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).map_err(CourierError::from)?;

    match cli.command {
        Command::Serve { broker, concurrency } => {
            if let Some(broker) = broker {
                config.broker.kind = broker.into();
            }
            if let Some(concurrency) = concurrency {
                config.workers.concurrency = concurrency;
            }
            cmd_serve(config).await
        }
        Command::Submit {
            task_type,
            payload,
            id,
            meta,
            route,
            wait,
        } => {
            let task = build_task(task_type, payload, id, meta)?;
            cmd_submit(config, task, route, wait.map(Duration::from_secs)).await
        }
        Command::Modules => cmd_modules(config),
        Command::Demo => cmd_demo(config).await,
    }
}

/// Cancels the returned token on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        trigger.cancel();
    });
    token
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    telemetry::init_logging(&config.logging)?;
    if config.broker.kind == BrokerKind::Memory {
        tracing::warn!("in-memory broker is process-local; only tasks submitted in this process will arrive");
    }

    let app = AppBuilder::new()
        .register_all(modules::discover())
        .map_err(CourierError::from)?
        .config(config)
        .build()?;

    let counts = app.run(shutdown_on_ctrl_c()).await?;
    print_counts(&counts)
}

fn build_task(
    task_type: String,
    payload: String,
    id: Option<String>,
    meta: Vec<(String, MetaValue)>,
) -> anyhow::Result<Task> {
    let metadata: Metadata = meta.into_iter().collect();
    metadata
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid --meta: {e}"))?;
    let task = match id {
        Some(id) => Task::new(id, task_type, payload.into_bytes()),
        None => Task::generated(task_type, payload.into_bytes()),
    };
    Ok(task.with_metadata(metadata))
}

async fn cmd_submit(config: Config, task: Task, route: Route, wait: Option<Duration>) -> anyhow::Result<()> {
    telemetry::init_logging(&config.logging)?;
    if config.broker.kind == BrokerKind::Memory {
        tracing::warn!("submitting to the in-memory broker; the task is lost when this process exits");
    }
    let app = AppBuilder::new().config(config).build()?;

    let Some(wait) = wait else {
        let delivered = app.submit_to(&task, &route).await?;
        println!("submitted {} via {route} to {delivered} queue(s)", task.id());
        return Ok(());
    };

    let id = app.request(task, &route).await?;
    println!("submitted {id} via {route}; waiting for the reply on node {}", app.node_id());
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("no reply for {id} within {}s", wait.as_secs());
        }
        // 他のタスク宛ての返信は読み捨てる
        match app.next_reply(remaining.min(Duration::from_secs(1))).await? {
            Some(reply) if reply.task_id == id => {
                let json = serde_json::to_string_pretty(&reply).context("serialize reply")?;
                println!("{json}");
                return Ok(());
            }
            Some(other) => tracing::debug!(task.id = %other.task_id, "skipping reply for another task"),
            None => {}
        }
    }
}

fn cmd_modules(config: Config) -> anyhow::Result<()> {
    let app = AppBuilder::new()
        .register_all(modules::discover())
        .map_err(CourierError::from)?
        .config(config)
        .build()?;

    let policy = app.policy();
    println!("{:<12} {:>11} {:>10}  capabilities", "module", "concurrency", "timeout");
    for module in app.registry().modules() {
        let caps = module.capabilities();
        let flags: Vec<&str> = [
            (caps.synchronous, "synchronous"),
            (caps.idempotent, "idempotent"),
            (caps.retryable, "retryable"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        let concurrency = module.concurrency_limit().unwrap_or(policy.concurrency);
        let timeout = module.timeout().unwrap_or(policy.task_timeout);
        println!(
            "{:<12} {:>11} {:>10}  {}",
            module.identifier().as_str(),
            concurrency,
            format!("{}ms", timeout.as_millis()),
            flags.join(",")
        );
    }
    Ok(())
}

/// Seeds echo / sleep / fail / unknown tasks and runs until every one is settled.
async fn cmd_demo(mut config: Config) -> anyhow::Result<()> {
    telemetry::init_logging(&config.logging)?;
    config.broker.kind = BrokerKind::Memory;
    config.workers.task_timeout_ms = 1_000;
    config.retry.base_delay_ms = 100;
    config.retry.max_retries = 2;

    let app = AppBuilder::new()
        .register_all(modules::discover())
        .map_err(CourierError::from)?
        .config(config)
        .build()?;

    let seeded = [
        Task::generated("echo", b"hello".to_vec()),
        Task::generated("echo", b"world".to_vec()),
        Task::generated("sleep", b"200".to_vec()),
        Task::generated("sleep", b"5000".to_vec()),
        Task::generated("fail", Vec::new()),
        Task::generated("nonexistent", Vec::new()),
    ];
    for task in &seeded {
        app.submit(task).await?;
    }

    let shutdown = shutdown_on_ctrl_c();
    let run = app.run(shutdown.clone());
    tokio::pin!(run);

    let total = seeded.len() as u64;
    let counts = loop {
        tokio::select! {
            counts = &mut run => break counts?,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                let c = app.counts();
                if c.completed + c.failed + c.rejected >= total {
                    shutdown.cancel();
                }
            }
        }
    };
    print_counts(&counts)
}

fn print_counts(counts: &DispatchCounts) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(counts).context("serialize dispatch counts")?;
    println!("{json}");
    Ok(())
}
