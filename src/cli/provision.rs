use super::report::render_report;
use provision::config::Config;
use provision::core::{format_error_with_help, ProvisionResult, Tier};
use provision::di::ServiceContainer;
use provision::manifest::ManifestStore;
use provision::orchestrator::{CancellationFlag, Orchestrator, RunOptions};
use std::path::PathBuf;

pub struct ProvisionOptions {
    pub manifest: PathBuf,
    pub tiers: Vec<Tier>,
    pub config: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub offline: bool,
    pub dry_run: bool,
    pub jobs: Option<usize>,
    pub optional: Vec<Tier>,
    pub json: bool,
    pub quiet: bool,
}

/// Apply command-line overrides on top of the loaded configuration.
pub fn effective_config(options: &ProvisionOptions) -> ProvisionResult<Config> {
    let mut config = Config::load(options.config.as_deref())?;

    if let Some(dir) = &options.cache_dir {
        config.cache_dir = Some(dir.to_string_lossy().into_owned());
    }
    if let Some(dir) = &options.state_dir {
        config.state_dir = Some(dir.to_string_lossy().into_owned());
    }
    if options.offline {
        config.offline = true;
    }
    if let Some(jobs) = options.jobs {
        config.fetch.max_concurrent = jobs;
    }
    for tier in &options.optional {
        if !config.optional_tiers.contains(tier) {
            config.optional_tiers.push(*tier);
        }
    }

    config.validate()?;
    Ok(config)
}

/// Run the pipeline and print the report. Returns the process exit code.
pub async fn run(options: ProvisionOptions, cancel: CancellationFlag) -> ProvisionResult<u8> {
    let config = effective_config(&options)?;
    let manifest = ManifestStore::open(&options.manifest)?;

    let services = ServiceContainer::new(config)?;
    let orchestrator = Orchestrator::new(services, manifest).with_cancellation(cancel);

    let mut run_options = RunOptions::new(options.tiers.clone());
    run_options.dry_run = options.dry_run;
    run_options.show_progress = !options.quiet && !options.json;

    let outcome = orchestrator.run(&run_options).await?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else if !options.quiet {
        print!("{}", render_report(&outcome.report));
    }
    if let Some(error) = &outcome.error {
        eprintln!("\n{}", format_error_with_help(error));
    }

    Ok(outcome.exit_code())
}
