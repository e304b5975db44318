use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use buckdesk::config::{ReapPolicy, SupervisorConfig, WorkerCommand, DEFAULT_PORT};
use buckdesk::desk::Supervisor;
use buckdesk::routing::{Client, DeskSpec};
use buckdesk::scheduler::{priority, Job};
use buckdesk::shutdown::install_shutdown_handler;
use buckdesk::transport::{EnvelopeCodec, DEFAULT_MAX_MESSAGE_SIZE};
use buckdesk::worker::{JobExecutor, Registry, WorkerLoop};

#[derive(Parser, Debug)]
#[command(name = "buckdesk")]
#[command(version)]
#[command(about = "Content-addressed job routing with supervised worker pools")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a supervisor until SIGINT or SIGTERM
    Desk(DeskArgs),

    /// Worker process entry point (launched by a supervisor)
    Drawer(DrawerArgs),

    /// Build a job and send it to the desk that owns it
    Submit(SubmitArgs),

    /// Push a routing table to every desk in it
    Notify {
        #[command(flatten)]
        route: RouteArgs,
    },
}

// =============================================================================
// Desk Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DeskArgs {
    /// Host to listen on
    #[arg(long, env = "BUCKDESK_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "BUCKDESK_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Channels this desk serves (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "default")]
    channels: Vec<String>,

    /// Number of worker processes
    #[arg(long, env = "BUCKDESK_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Only check worker liveness when a slot is about to be used
    #[arg(long)]
    lazy_reap: bool,

    /// Target bundles each worker loads before polling (comma-separated)
    #[arg(long, value_delimiter = ',')]
    preload: Vec<String>,

    /// Initial routing table; omit to wait for a topology notice
    #[arg(long = "desk", value_name = "SPEC")]
    desks: Vec<DeskSpec>,

    /// Upper bound of one tick's waits, in milliseconds
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,

    /// Largest accepted frame, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

// =============================================================================
// Drawer Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DrawerArgs {
    /// Target bundles to load before polling (comma-separated)
    #[arg(long, value_delimiter = ',')]
    preload: Vec<String>,

    /// Routing table used to submit child jobs
    #[arg(long)]
    signature: Option<String>,

    /// Largest accepted frame, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

// =============================================================================
// Client Arguments (shared by submit and notify)
// =============================================================================

#[derive(Parser, Debug)]
struct RouteArgs {
    /// Desk spec: a port, host:port[/channels], or JSON object. Repeatable.
    #[arg(long = "desk", value_name = "SPEC", required = true)]
    desks: Vec<DeskSpec>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    route: RouteArgs,

    /// Target bundles needed to validate the target (comma-separated)
    #[arg(long, value_delimiter = ',')]
    preload: Vec<String>,

    /// Job priority; higher runs first
    #[arg(long, default_value_t = priority::NORMAL, allow_negative_numbers = true)]
    priority: i32,

    #[arg(long, default_value = "default")]
    channel: String,

    /// Execution context shared by the job and its children
    #[arg(long)]
    context: Option<String>,

    /// Time limit in seconds
    #[arg(long)]
    time_limit: Option<u64>,

    /// Bytes of memory the job may add to its worker
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Target name
    target: String,

    /// Arguments, parsed as JSON where possible. `name=value` makes every
    /// argument named.
    args: Vec<String>,
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    job_id: String,
    desk: String,
    context: String,
}

#[derive(Serialize)]
struct NotifyOutput {
    signature: String,
    notified: usize,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn init_tracing() {
    // stdout is the result pipe of a worker, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_desk(args: DeskArgs) -> Result<(), Box<dyn std::error::Error>> {
    let worker = WorkerCommand::default().with_preload(args.preload);
    let config = SupervisorConfig::new(args.host, args.port)
        .with_channels(args.channels)
        .with_pool_size(args.workers)
        .with_reap(if args.lazy_reap {
            ReapPolicy::Lazy
        } else {
            ReapPolicy::Eager
        })
        .with_worker(worker)
        .with_tick_timeout(Duration::from_millis(args.tick_ms));
    let config = SupervisorConfig {
        max_message_size: args.max_message_size,
        ..config
    };

    let mut desk = Supervisor::bind(config).await?;
    install_shutdown_handler(desk.stop_token())?;

    if !args.desks.is_empty() {
        desk.set_client(Client::new(args.desks)).await;
    }

    tracing::info!(
        desk_id = %desk.id(),
        port = ?desk.local_port(),
        "Desk ready"
    );

    desk.start(|result, _| {
        tracing::info!(
            job_id = %result.job.id(),
            target = result.job.target(),
            success = result.success,
            value = %result.value,
            exception = ?result.exception,
            error = ?result.error,
            "Job finished"
        );
    })
    .await;

    Ok(())
}

async fn run_drawer(args: DrawerArgs) -> i32 {
    let registry = match Registry::with_bundles(args.preload.as_slice()) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "Worker start-up failed");
            return e.exit_code();
        }
    };
    let executor = JobExecutor::new(Arc::new(registry)).with_process_limits();
    let mut worker = WorkerLoop::stdio(executor, EnvelopeCodec::new(args.max_message_size));

    if let Some(signature) = args.signature {
        match Client::from_signature(&signature) {
            Ok(client) => worker = worker.with_client(client),
            Err(e) => tracing::warn!(error = %e, "Ignoring bad signature"),
        }
    }

    worker.serve().await
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn handle_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::with_bundles(args.preload.as_slice())?;

    let named = !args.args.is_empty() && args.args.iter().all(|a| a.contains('='));
    let mut builder = Job::call(args.target)
        .priority(args.priority)
        .channel(args.channel);
    for raw in &args.args {
        builder = match raw.split_once('=').filter(|_| named) {
            Some((name, value)) => builder.named(name, parse_arg(value)),
            None => builder.arg(parse_arg(raw)),
        };
    }
    if let Some(context) = args.context {
        builder = builder.context(context);
    }
    if let Some(seconds) = args.time_limit {
        builder = builder.time_limit(Duration::from_secs(seconds));
    }
    if let Some(bytes) = args.memory_limit {
        builder = builder.memory_limit(bytes);
    }
    let job = builder.build(&registry)?;

    let mut client = Client::new(args.route.desks);
    let desk = client.route(&job)?.endpoint();
    client.send_buck(&job).await?;

    match args.route.output {
        OutputFormat::Json => {
            let output = SubmitOutput {
                job_id: job.id().to_string(),
                desk,
                context: job.context().to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted to {}", desk);
            println!("Job ID: {}", job.id());
        }
    }
    Ok(())
}

async fn handle_notify(route: RouteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::new(route.desks);
    let notified = client.notify_desks().await?;

    match route.output {
        OutputFormat::Json => {
            let output = NotifyOutput {
                signature: client.signature(),
                notified,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Notified {} of {} desks", notified, client.desks().len());
            println!("Signature: {}", client.signature());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Desk(desk_args) => run_desk(desk_args).await?,
        Commands::Drawer(drawer_args) => {
            let code = run_drawer(drawer_args).await;
            std::process::exit(code);
        }
        Commands::Submit(submit_args) => handle_submit(submit_args).await?,
        Commands::Notify { route } => handle_notify(route).await?,
    }

    Ok(())
}
