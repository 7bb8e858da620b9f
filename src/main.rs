use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use storage_portal::config::{
    DEFAULT_DISPATCH_TIMEOUT, DEFAULT_MARKER_LINGER, DEFAULT_MAX_CONCURRENT_UNITS,
    DEFAULT_RPC_ATTEMPTS, DEFAULT_RPC_TIMEOUT, DEFAULT_WAIT_TIMEOUT, ElectionPolicy, PortalConfig, RunnerConfig,
    WaitPolicy, WorkerConfig,
};
use storage_portal::endpoint::resolver::EndpointResolver;
use storage_portal::portal::protocol::{
    ENDPOINT_SUBMIT_TASK, SubmitTaskRequest, SubmitTaskResponse, TaskSpec,
};
use storage_portal::portal::service::Portal;
use storage_portal::runner::registry::JobHandlerRegistry;
use storage_portal::task::types::ReplyStatus;
use storage_portal::worker::worker::Worker;

/// Coordinates storage tasks across a cluster of worker nodes
#[derive(Parser, Debug)]
#[command(name = "storage-portal")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RUST_LOG=debug  Adjust log verbosity (default: info)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the portal: message bus plus registration RPC server
    Portal {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 7000)]
        rpc_port: u16,

        #[arg(long, default_value_t = 7010)]
        bus_port: u16,

        /// Deadline for collecting replies; 0 waits indefinitely
        #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT.as_secs())]
        wait_timeout_secs: u64,

        #[arg(long, value_enum, default_value_t = WaitPolicy::AllReplies)]
        wait_policy: WaitPolicy,

        #[arg(long, value_enum, default_value_t = ElectionPolicy::FirstRegistered)]
        election: ElectionPolicy,

        /// How long to keep watching for a late done marker after a wait gave up
        #[arg(long, default_value_t = DEFAULT_MARKER_LINGER.as_secs())]
        marker_linger_secs: u64,
    },

    /// Run a worker node that executes tasks announced by the portal
    Worker {
        /// Portal RPC address (host:port)
        #[arg(long, default_value = "127.0.0.1:7000")]
        portal: String,

        /// Stable node id (random when omitted)
        #[arg(long)]
        node_id: Option<String>,

        /// Address advertised to the portal
        #[arg(long, default_value = "127.0.0.1")]
        advertise: String,

        #[arg(long, default_value_t = DEFAULT_DISPATCH_TIMEOUT.as_secs())]
        dispatch_timeout_secs: u64,

        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_UNITS)]
        max_concurrent_units: usize,

        #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT.as_millis() as u64)]
        rpc_timeout_ms: u64,

        #[arg(long, default_value_t = DEFAULT_RPC_ATTEMPTS)]
        rpc_attempts: usize,
    },

    /// Submit a task described in a JSON file and wait for the outcome
    Submit {
        /// Portal RPC address (host:port)
        #[arg(long, default_value = "127.0.0.1:7000")]
        portal: String,

        /// JSON task: {"id"?, "endpoints": [...], "job": {"type", "body"}}
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Portal {
            host,
            rpc_port,
            bus_port,
            wait_timeout_secs,
            wait_policy,
            election,
            marker_linger_secs,
        } => {
            let config = PortalConfig {
                host,
                rpc_port,
                bus_port,
                wait_timeout: (wait_timeout_secs > 0)
                    .then(|| Duration::from_secs(wait_timeout_secs)),
                wait_policy,
                election,
                marker_linger: Duration::from_secs(marker_linger_secs),
                ..PortalConfig::default()
            };
            run_portal(config).await
        }
        Command::Worker {
            portal,
            node_id,
            advertise,
            dispatch_timeout_secs,
            max_concurrent_units,
            rpc_timeout_ms,
            rpc_attempts,
        } => {
            let config = WorkerConfig {
                node_id,
                advertise_addr: advertise,
                portal_addr: portal,
                rpc_timeout: Duration::from_millis(rpc_timeout_ms),
                rpc_attempts,
                runner: RunnerConfig {
                    dispatch_timeout: Duration::from_secs(dispatch_timeout_secs),
                    max_concurrent_units,
                },
            };
            run_worker(config).await
        }
        Command::Submit {
            portal,
            file,
            timeout_ms,
        } => submit(&portal, &file, timeout_ms).await,
    }
}

async fn run_portal(config: PortalConfig) -> anyhow::Result<()> {
    let portal = Portal::start(config).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    portal.drain().await?;
    portal.shutdown();
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    let worker = Worker::new(
        config,
        EndpointResolver::new(),
        JobHandlerRegistry::with_builtins(),
    );
    worker.connect().await?;
    tracing::info!("Node ID: {}", worker.node_id());

    tokio::signal::ctrl_c().await?;

    worker.shutdown().await
}

async fn submit(portal: &str, file: &PathBuf, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let raw = tokio::fs::read(file).await?;
    let task: TaskSpec = serde_json::from_slice(&raw)
        .map_err(|e| anyhow::anyhow!("invalid task file {}: {}", file.display(), e))?;

    let response = reqwest::Client::new()
        .post(format!("http://{}{}", portal, ENDPOINT_SUBMIT_TASK))
        .json(&SubmitTaskRequest { task, timeout_ms })
        .send()
        .await?;
    let status = response.status();
    let body: SubmitTaskResponse = response.json().await?;

    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() || body.status == ReplyStatus::Failed {
        return Err(anyhow::anyhow!(
            "task failed ({}/{} replies): {}",
            body.received,
            body.expected,
            body.message
        ));
    }
    Ok(())
}
