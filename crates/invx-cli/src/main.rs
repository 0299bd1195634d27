//! 🚀 invx-cli: the front door, the bouncer, the maitre d' of invx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//!
//! Two ways in:
//! - `invx lambda` (the default): hand the supervisor to the function runtime and serve
//!   invocations until the sandbox is frozen or reaped.
//! - `invx replay --event event.json [--dry-run]`: run one captured payload through the
//!   pipeline from a terminal and print what happened. `--dry-run` swaps the queue and
//!   the cluster for in-memory doubles, so only the blob store is real. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use invx::backends::{BlobStoreBackend, InMemoryCluster, InMemoryQueue};
use invx::{AppConfig, InvocationReport, Supervisor};
use lambda_runtime::{LambdaEvent, service_fn};
use serde_json::Value;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "invx.toml";

#[derive(Debug, Parser)]
#[command(name = "invx", version, about = "🪣➡️🔍 Index cloud inventory snapshots as they land")]
struct Cli {
    /// TOML config layered over env vars. Defaults to ./invx.toml when it exists.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve invocations from the function runtime (default).
    Lambda,
    /// Run one captured invocation payload and print a summary.
    Replay {
        /// JSON file holding the invocation payload.
        #[arg(long)]
        event: PathBuf,
        /// Keep requeues and bulk writes in memory.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 the function runtime's log sink doesn't speak ANSI
    let in_function_runtime = std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(!in_function_runtime)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: the search cluster isn't reachable. Check the endpoint in \
                 ES_DOMAIN_ENDPOINT / search.elasticsearch.url and the network path to it."
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = resolve_config_file(cli.config.as_deref())?;
    let app_config = invx::load_config(config_file.as_deref())
        .context("💀 In invx-cli, we couldn't load the configuration. Check the env vars and the TOML file.")?;

    match cli.command.unwrap_or(Command::Lambda) {
        Command::Lambda => serve(app_config).await,
        Command::Replay { event, dry_run } => replay(app_config, &event, dry_run).await,
    }
}

/// 🔒 An explicit `--config` must exist. The default file is optional.
fn resolve_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!("💀 Couldn't check whether config file '{}' exists", path.display())
            })?;
            if !exists {
                anyhow::bail!(
                    "💀 Config file '{}' does not exist. Relative paths resolve against the current directory.",
                    path.display()
                );
            }
            Ok(Some(path.to_path_buf()))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            Ok(default.is_file().then(|| default.to_path_buf()))
        }
    }
}

/// λ Build the supervisor once, then let the runtime call us.
async fn serve(app_config: AppConfig) -> Result<()> {
    let supervisor = Supervisor::from_config(app_config).await?;
    if supervisor.cluster().is_in_memory() || supervisor.queue().is_in_memory() {
        anyhow::bail!(
            "💀 Refusing to serve invocations with in-memory backends. Set ES_DOMAIN_ENDPOINT and SQS_QUEUE_URL \
             (or search.elasticsearch / queue.sqs in the config)."
        );
    }
    info!("🚀 Supervisor ready, waiting for invocations");

    let supervisor_ref = &supervisor;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_invocation(supervisor_ref, event).await
    }))
    .await
    .map_err(|err| anyhow::anyhow!(err))
}

async fn handle_invocation(
    supervisor: &Supervisor,
    event: LambdaEvent<Value>,
) -> Result<InvocationReport, lambda_runtime::Error> {
    let LambdaEvent { payload, context } = event;
    let span = info_span!("invocation", request_id = %context.request_id);
    supervisor
        .supervise_invocation(&payload)
        .instrument(span)
        .await
        .map_err(|err| {
            error!("💀 Invocation failed, leaving it for redelivery: {:#}", err);
            err.into()
        })
}

/// 🔁 One payload from disk, one table on stdout.
async fn replay(app_config: AppConfig, event: &Path, dry_run: bool) -> Result<()> {
    let raw = tokio::fs::read_to_string(event)
        .await
        .with_context(|| format!("💀 Couldn't read event file '{}'", event.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("💀 Event file '{}' is not JSON", event.display()))?;

    let supervisor = if dry_run {
        let blob_store = BlobStoreBackend::from_config(&app_config.blob_store).await?;
        Supervisor::new(
            app_config,
            blob_store,
            InMemoryQueue::default().into(),
            InMemoryCluster::default().into(),
        )
    } else {
        Supervisor::from_config(app_config).await?
    };

    let report = supervisor
        .supervise_invocation(&payload)
        .instrument(info_span!("replay", event = %event.display(), dry_run))
        .await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["📊 stage", "count"]);
    for (label, count) in report.rows() {
        table.add_row(vec![label.to_string(), count.to_string()]);
    }
    println!("{table}");
    Ok(())
}
