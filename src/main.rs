mod config;
mod metrics;
mod ports;
mod proctree;
mod retry;
mod runner;
mod signals;
mod store;
mod supervisor;
mod sync;

use clap::{Args, Parser, Subcommand};
use config::BenchConfig;
use metrics::Role;
use runner::BenchmarkLoop;
use signals::SignalHandler;
use std::path::{Path, PathBuf};
use store::ResultStore;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "counterbench.toml";

/// Repeatable hardware-counter benchmarks of a client/server program pair.
///
/// Run `server` on one host and `client` on the other. Each iteration runs the
/// measured program under the counter wrapper and appends one CSV row.
#[derive(Parser, Debug)]
#[command(name = "counterbench", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the measured server once per iteration and record its counters
    Server(RunArgs),
    /// Run the measured client command once per iteration and record its counters
    Client(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Override iteration count (default: from config)
    #[arg(value_name = "ITERATIONS")]
    iterations: Option<u32>,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Result file (default: generated under results_dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (discovery attempts, sync polling, retry decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Command {
    fn split(self) -> (Role, RunArgs) {
        match self {
            Command::Server(args) => (Role::Server, args),
            Command::Client(args) => (Role::Client, args),
        }
    }
}

fn init_logging(args: &RunArgs) {
    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn load_config(args: &RunArgs) -> Result<BenchConfig, config::ConfigError> {
    let allow_missing = args.config == Path::new(DEFAULT_CONFIG);
    let mut config = BenchConfig::load(&args.config, allow_missing)?;
    if let Some(n) = args.iterations {
        config.run.iterations = n;
    }
    config.validate()?;
    Ok(config)
}

fn fail(message: impl std::fmt::Display) -> ! {
    tracing::error!("{message}");
    eprintln!("error: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (role, args) = cli.command.split();
    init_logging(&args);
    tracing::debug!(?args, role = role.as_str(), "parsed CLI arguments");

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => fail(e),
    };

    if args.dry_run {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(e),
        }
        return;
    }

    let output = args.output.clone().unwrap_or_else(|| {
        let label = store::output_label(
            config.server.config_file_arg(),
            config.run.test_name.as_deref(),
        );
        store::output_path(&config.run.results_dir, role, &label, chrono::Local::now())
    });
    let store = match ResultStore::open(&output, &config.perf.events) {
        Ok(s) => s,
        Err(e) => fail(e),
    };

    let (_handler, shutdown) = match SignalHandler::install() {
        Ok(pair) => pair,
        Err(e) => fail(format!("failed to install signal handlers: {e}")),
    };

    tracing::info!(
        role = role.as_str(),
        iterations = config.run.iterations,
        output = %output.display(),
        "counterbench starting"
    );
    let bench = BenchmarkLoop::new(config, store, shutdown);
    match bench.run(role).await {
        Ok(summary) => {
            if summary.cancelled {
                tracing::warn!(recorded = summary.recorded, "interrupted, stopping early");
            }
            tracing::info!(
                recorded = summary.recorded,
                aborted = summary.aborted,
                retries = summary.retries,
                output = %summary.output.display(),
                "run finished"
            );
        }
        Err(e) => fail(e),
    }
}
