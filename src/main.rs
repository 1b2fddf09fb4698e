use clap::{Parser, ValueEnum};
use provision::core::{format_error_with_help, Tier};
use provision::orchestrator::CancellationFlag;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::provision::ProvisionOptions;

#[derive(Parser)]
#[command(name = "provision")]
#[command(about = "Tiered, air-gap friendly dependency provisioning")]
#[command(version)]
struct Cli {
    /// Tier manifest file
    #[arg(short, long)]
    manifest: PathBuf,

    /// Tier to provision; earlier tiers are not run implicitly
    #[arg(short, long, value_enum, ignore_case = true, default_value = "all")]
    tier: TierArg,

    /// Artifact cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory for the ledger, run lock and last report
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Never reach the network; cache misses fail
    #[arg(long)]
    offline: bool,

    /// Resolve and print the plan without fetching or installing
    #[arg(long)]
    dry_run: bool,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum concurrent downloads per tier
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Treat a tier's failure as a warning (repeatable)
    #[arg(long, value_parser = Tier::from_str)]
    optional: Vec<Tier>,

    /// Print the run report as JSON
    #[arg(long, conflicts_with = "quiet")]
    json: bool,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TierArg {
    Global,
    Wheelhouse,
    Local,
    All,
}

impl TierArg {
    fn tiers(self) -> Vec<Tier> {
        match self {
            TierArg::Global => vec![Tier::Global],
            TierArg::Wheelhouse => vec![Tier::Wheelhouse],
            TierArg::Local => vec![Tier::Local],
            TierArg::All => Tier::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; stopping at the next stage boundary");
            on_signal.cancel();
        }
    });

    let options = ProvisionOptions {
        manifest: cli.manifest,
        tiers: cli.tier.tiers(),
        config: cli.config,
        cache_dir: cli.cache_dir,
        state_dir: cli.state_dir,
        offline: cli.offline,
        dry_run: cli.dry_run,
        jobs: cli.jobs,
        optional: cli.optional,
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli::provision::run(options, cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("\n{}", format_error_with_help(&e));
            ExitCode::from(e.exit_code())
        }
    }
}
