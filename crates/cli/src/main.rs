//! Palisade CLI - Operator interface for the Palisade plugin runtime.

mod commands;
mod discovery;
mod output;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "palisade")]
#[command(
    author,
    version,
    about = "Load, sandbox and supervise plugins"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Options shared by every command.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Plugin root (searched upward for a `plugins/` directory if not specified)
    #[arg(short, long, global = true, env = "PALISADE_PLUGIN_ROOT")]
    pub root: Option<PathBuf>,

    /// Runtime config file (defaults to palisade.json in the plugin root)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Command that starts a sandbox worker
    #[arg(long, global = true, env = "PALISADE_WORKER")]
    pub worker: Option<String>,

    /// Secret used to sign and verify trusted plugins
    #[arg(long, global = true, env = "PALISADE_SIGNING_KEY", hide_env_values = true)]
    pub signing_key: Option<String>,

    /// File holding the signing secret
    #[arg(long, global = true, conflicts_with = "signing_key")]
    pub signing_key_file: Option<PathBuf>,

    /// Require a valid signature for every trusted plugin
    #[arg(long, global = true)]
    pub strict_trust: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered plugins
    List {
        /// Show detailed information
        #[arg(short, long)]
        detailed: bool,
    },

    /// Validate every manifest and the dependency graph
    Validate,

    /// Show the dependency graph and load waves
    Graph {
        /// Output format (ascii, dot)
        #[arg(short, long, default_value = "ascii")]
        format: String,
    },

    /// Run the static import scanner on a plugin
    Scan {
        /// Plugin name or directory
        plugin: String,
    },

    /// Sign a trusted plugin
    Sign {
        /// Plugin name or directory
        plugin: String,
    },

    /// Verify a plugin signature
    Verify {
        /// Plugin name or directory
        plugin: String,
    },

    /// Boot every plugin and keep them running until Ctrl-C
    Run,

    /// Boot, call one action and print the response
    Call {
        /// Target plugin
        plugin: String,

        /// Action to invoke
        action: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
    },

    /// Boot and hot-reload plugins whose files change
    Watch {
        /// Quiet period before a reload, in milliseconds
        #[arg(long, default_value = "300")]
        debounce_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "palisade=debug" } else { "palisade=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = settings::runtime_config(&cli.global)?;

    match cli.command {
        Commands::List { detailed } => commands::list::execute(&config, detailed),
        Commands::Validate => commands::validate::execute(&config),
        Commands::Graph { format } => commands::graph::execute(&config, &format),
        Commands::Scan { plugin } => commands::scan::execute(&config, &plugin),
        Commands::Sign { plugin } => commands::sign::sign(&config, &plugin),
        Commands::Verify { plugin } => commands::sign::verify(&config, &plugin),
        Commands::Run => commands::run::execute(config).await,
        Commands::Call {
            plugin,
            action,
            payload,
        } => commands::call::execute(config, &plugin, &action, &payload).await,
        Commands::Watch { debounce_ms } => commands::watch::execute(config, debounce_ms).await,
    }
}
