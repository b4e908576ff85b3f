use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use shuttle::{ExitCode, OperationFlags, SandboxLayout, ShuttleConfig, ShuttleError};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod terminal;

#[derive(Parser, Debug)]
#[command(name = "sync-shuttle")]
#[command(about = "Sandboxed push, pull and relay of files between machines over rsync and SSH")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Sandbox root (default: ~/.sync-shuttle)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Configuration file path (default: <base-dir>/config/sync-shuttle.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level; RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Never prompt; --force alone authorizes overwrites
    #[arg(short, long, global = true)]
    yes: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

/// Flags shared by every transfer
#[derive(Args, Debug, Clone, Copy, Default)]
struct TransferFlags {
    /// Report what would happen without writing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Overwrite existing files, archiving the previous versions first
    #[arg(short, long)]
    force: bool,

    /// Hand the transferred data to the archival store afterwards
    #[arg(long)]
    archive: bool,
}

impl From<TransferFlags> for OperationFlags {
    fn from(flags: TransferFlags) -> Self {
        OperationFlags {
            dry_run: flags.dry_run,
            force: flags.force,
            archive: flags.archive,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a file or directory to a server's inbox for this machine
    Push {
        #[arg(short, long)]
        server: String,
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        flags: TransferFlags,
    },
    /// Fetch a server's outbox into local/inbox/<server>
    Pull {
        #[arg(short, long)]
        server: String,
        /// Destination inside the sandbox
        #[arg(short, long)]
        dest: Option<PathBuf>,
        #[command(flatten)]
        flags: TransferFlags,
    },
    /// Pull from one server and push what arrived to another
    Relay {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Only relay these files, relative to local/inbox/<from>
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: TransferFlags,
    },
    /// Place a file or directory in an outbox for peers to pull
    Share {
        #[arg(short, long, conflicts_with = "global", required_unless_present = "global")]
        server: Option<String>,
        /// Share with every peer
        #[arg(long)]
        global: bool,
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        flags: TransferFlags,
    },
    /// Create the sandbox tree and a default configuration
    Init,
    /// Show recent operations from the ledger
    Status {
        #[arg(short = 'N', long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage server profiles
    Servers {
        #[command(subcommand)]
        action: ServerActions,
    },
    /// Inspect or prune pre-overwrite archives
    Archive {
        #[command(subcommand)]
        action: ArchiveActions,
    },
}

#[derive(Subcommand, Debug)]
enum ServerActions {
    /// List configured servers
    List,
    /// Show one server profile
    Show { id: String },
    /// Add a disabled server profile
    Add {
        id: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        port: Option<u32>,
        #[arg(long)]
        remote_base: Option<String>,
        #[arg(long)]
        identity_file: Option<PathBuf>,
        /// Enable the profile right away
        #[arg(long)]
        enable: bool,
    },
    /// Remove a server profile
    Remove { id: String },
    /// Check identifiers and remote roots of every profile
    Validate,
}

#[derive(Subcommand, Debug)]
enum ArchiveActions {
    /// List archive entries, oldest first
    List,
    /// Remove archive entries older than the retention window
    Prune {
        /// Retention in days (default: settings.archive_retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Everything the handlers need besides the command itself
struct Invocation {
    layout: SandboxLayout,
    config_path: PathBuf,
    assume_yes: bool,
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_of(&e)
        }
    };

    std::process::exit(code.as_i32());
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        command,
        base_dir,
        config,
        log_level,
        yes,
        json,
    } = cli;

    let base_dir = match base_dir {
        Some(dir) => dir,
        None => default_base_dir()?,
    };
    let layout = SandboxLayout::new(&base_dir);
    let config_path = config.unwrap_or_else(|| layout.config_file());

    let loaded = ShuttleConfig::load_or_default(&config_path).await;
    let level = log_level
        .or_else(|| loaded.as_ref().ok().map(|c| c.settings.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level)?;

    let config = loaded.with_context(|| format!("cannot load configuration '{}'", config_path.display()))?;
    layout
        .ensure()
        .await
        .with_context(|| format!("cannot prepare sandbox at '{}'", base_dir.display()))?;

    let invocation = Invocation {
        layout,
        config_path,
        assume_yes: yes,
        json,
    };
    let result = commands::dispatch(command, config, &invocation).await;

    if let Err(e) = invocation.layout.clear_tmp().await {
        warn!("failed to clear tmp directory: {}", e);
    }
    result
}

fn default_base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".sync-shuttle"))
        .ok_or_else(|| anyhow!("cannot determine the home directory; pass --base-dir"))
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives(level))),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow!("cannot initialize logging: {}", e))?;

    Ok(())
}

/// The library and this binary, both at `level`
fn default_directives(level: tracing::Level) -> String {
    format!("shuttle={level},{}={level}", env!("CARGO_CRATE_NAME"))
}

/// Exit status for an error, from the first `ShuttleError` in its chain
fn exit_code_of(error: &anyhow::Error) -> ExitCode {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ShuttleError>())
        .map(ShuttleError::exit_code)
        .unwrap_or(ExitCode::General)
}
