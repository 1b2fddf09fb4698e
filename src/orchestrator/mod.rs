//! Drives manifest, resolver, fetcher, installer and verifier once per tier,
//! in tier order, through the [`ProvisioningRun`] state machine.
//!
//! Tiers never overlap: a tier's install stage starts only after every fetch
//! of that tier has finished, and the next tier starts only after the
//! previous one passed verification (or was optional and skipped). The
//! first failure of a non-optional tier ends the run; later tiers get no
//! ledger records at all.

pub mod lock;
pub mod report;
pub mod state;

pub use lock::RunLock;
pub use report::{PackageReport, RunReport, TierOutcome, TierReport};
pub use state::{ProvisioningRun, RunState};

use crate::cache::ArtifactRecord;
use crate::core::{ProvisionError, ProvisionResult, Stage, Tier};
use crate::di::ServiceContainer;
use crate::fetcher::parallel::ParallelFetcher;
use crate::fetcher::sources::FindLinksSource;
use crate::fetcher::Fetcher;
use crate::index::local::LocalDirIndex;
use crate::index::CompositeIndex;
use crate::installer::InstalledMarker;
use crate::ledger::{InstallStatus, Ledger};
use crate::manifest::ManifestStore;
use crate::resolver::{EnvironmentState, Resolver};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared flag for requesting cancellation from outside the run (Ctrl-C).
/// Checked at stage boundaries only, so an in-flight fetch always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Tiers to process; tiers the manifest does not declare are ignored
    pub tiers: Vec<Tier>,
    /// Resolve only: nothing is fetched, installed or recorded
    pub dry_run: bool,
    pub show_progress: bool,
}

impl RunOptions {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self {
            tiers,
            dry_run: false,
            show_progress: false,
        }
    }

    pub fn all() -> Self {
        Self::new(Tier::ALL.to_vec())
    }
}

/// What a run produced. `error` is the first fatal error, annotated with
/// the tier and stage it surfaced in.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub error: Option<ProvisionError>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        self.error.as_ref().map(|e| e.exit_code()).unwrap_or(0)
    }
}

struct RunContext {
    run: ProvisioningRun,
    ledger: Option<Ledger>,
    env: EnvironmentState,
    /// Installs an interrupted run left PENDING
    revisit: HashSet<(Tier, String)>,
    fetcher: Arc<Fetcher>,
}

pub struct Orchestrator {
    services: ServiceContainer,
    manifest: ManifestStore,
    cancel: CancellationFlag,
}

impl Orchestrator {
    pub fn new(services: ServiceContainer, manifest: ManifestStore) -> Self {
        Self {
            services,
            manifest,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Execute one provisioning run.
    ///
    /// `Err` means the run could not start (lock held, unreadable state);
    /// failures during the run are reported through [`RunOutcome`].
    pub async fn run(&self, options: &RunOptions) -> ProvisionResult<RunOutcome> {
        let config = self.services.config();
        let started_at = Utc::now();
        let run_id = format!(
            "{}-{}",
            started_at.format("%Y%m%dT%H%M%S%.6fZ"),
            std::process::id()
        );
        let state_dir = config.get_state_dir()?;

        let tiers: Vec<Tier> = Tier::ALL
            .into_iter()
            .filter(|t| options.tiers.contains(t))
            .filter(|t| {
                let declared = self.manifest.is_declared(*t);
                if !declared {
                    debug!("{} is not declared in {}", t, self.manifest.source().display());
                }
                declared
            })
            .collect();

        let scopes: Vec<&Path> = tiers
            .iter()
            .map(|t| self.services.installer.scopes().dir(*t))
            .collect();
        let _locks = if options.dry_run {
            Vec::new()
        } else {
            RunLock::acquire_run(&state_dir, &scopes)?
        };
        let ledger = if options.dry_run {
            None
        } else {
            Some(Ledger::open(&state_dir, &run_id)?)
        };
        let revisit = match &ledger {
            Some(ledger) => ledger.pending_from_previous()?,
            None => HashSet::new(),
        };
        if !revisit.is_empty() {
            warn!(
                "{} install(s) left pending by an earlier run will be redone",
                revisit.len()
            );
        }

        let mut ctx = RunContext {
            run: ProvisioningRun::new(run_id.clone(), tiers.clone()),
            ledger,
            env: self.initial_environment(&revisit)?,
            revisit,
            fetcher: Arc::new(self.services.fetcher()?),
        };
        let mut tier_reports: Vec<TierReport> = tiers
            .iter()
            .map(|t| TierReport::new(*t, config.is_optional(*t)))
            .collect();

        info!(
            "run {}: tiers [{}]{}{}",
            run_id,
            tiers.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", "),
            if config.offline { " offline" } else { "" },
            if options.dry_run { " dry-run" } else { "" }
        );

        let mut first_error = None;
        ctx.run.start()?;
        for (position, tier) in tiers.iter().copied().enumerate() {
            let report = &mut tier_reports[position];
            match self.process_tier(&mut ctx, tier, options, report).await {
                Ok(()) => {
                    report.outcome = if options.dry_run {
                        TierOutcome::Planned
                    } else {
                        TierOutcome::Done
                    };
                    info!("{} tier complete", tier);
                }
                Err(error) => {
                    let stage = ctx
                        .run
                        .state()
                        .active()
                        .map(|(_, s)| s)
                        .unwrap_or(Stage::Resolving);
                    report.failed_stage = Some(stage);
                    report.failed_package = error.package().map(str::to_string);
                    report.error = Some(error.to_string());

                    let cancelled = matches!(error, ProvisionError::Cancelled);
                    if report.optional && !cancelled {
                        warn!("optional {} tier failed while {}: {}", tier, stage, error);
                        report.outcome = TierOutcome::Skipped;
                        ctx.run.skip_tier()?;
                    } else {
                        report.outcome = TierOutcome::Failed;
                        ctx.run.fail()?;
                        first_error = Some(error.staged(tier, stage));
                        break;
                    }
                }
            }
        }

        let records = ctx
            .ledger
            .as_ref()
            .map(|l| l.terminal_records())
            .unwrap_or_default();
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            offline: config.offline,
            final_state: ctx.run.state().to_string(),
            checkpoint: ctx.run.checkpoint(),
            exit_code: first_error.as_ref().map(|e| e.exit_code()).unwrap_or(0),
            error: first_error.as_ref().map(|e| e.to_string()),
            tiers: tier_reports,
            records,
        };
        if !options.dry_run {
            report.save(&state_dir)?;
        }
        info!("run {} finished in state {}", report.run_id, report.final_state);

        Ok(RunOutcome {
            report,
            error: first_error,
        })
    }

    /// Packages already installed in each scope. Installs an earlier run
    /// left PENDING, and markers whose payload is gone, are not trusted.
    fn initial_environment(
        &self,
        revisit: &HashSet<(Tier, String)>,
    ) -> ProvisionResult<EnvironmentState> {
        let installer = self.services.installer();
        let mut env = EnvironmentState::new();
        for tier in Tier::ALL {
            for marker in installer.installed(tier)? {
                if revisit.contains(&(tier, marker.name.clone()))
                    || !installer.payload_present(tier, &marker)
                {
                    continue;
                }
                env.record(tier, marker.name, marker.version);
            }
        }
        Ok(env)
    }

    fn check_cancelled(&self) -> ProvisionResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        Ok(())
    }

    /// Narrower tiers see the wheelhouse scope before anything else.
    fn index_for(&self, tier: Tier) -> CompositeIndex {
        let index = self.services.index();
        if tier > Tier::Wheelhouse {
            let scope = self.services.installer.scopes().dir(Tier::Wheelhouse);
            index.with_local_first(Arc::new(LocalDirIndex::new(scope, "wheelhouse")))
        } else {
            index
        }
    }

    fn fetcher_for(&self, tier: Tier, base: &Arc<Fetcher>) -> Arc<Fetcher> {
        if tier > Tier::Wheelhouse {
            let scope = self.services.installer.scopes().dir(Tier::Wheelhouse);
            Arc::new(base.with_local_first(Arc::new(FindLinksSource::new(scope))))
        } else {
            Arc::clone(base)
        }
    }

    async fn process_tier(
        &self,
        ctx: &mut RunContext,
        tier: Tier,
        options: &RunOptions,
        report: &mut TierReport,
    ) -> ProvisionResult<()> {
        let config = self.services.config();

        self.check_cancelled()?;
        info!("{}: resolving", tier);
        let specs = self.manifest.load(tier);
        let resolver = Resolver::new(Arc::new(self.index_for(tier)));
        let resolution = resolver.resolve(tier, &specs, &ctx.env).await?;
        report.packages = resolution
            .packages
            .iter()
            .map(|p| PackageReport::planned(&p.name, &p.version.to_string()))
            .chain(resolution.inherited.iter().map(|p| {
                PackageReport::inherited(&p.name, &p.version.to_string(), p.from)
            }))
            .collect();
        if options.dry_run {
            for package in &resolution.packages {
                ctx.env.record(tier, package.name.clone(), package.version.clone());
            }
            ctx.run.skip_tier()?;
            return Ok(());
        }

        self.check_cancelled()?;
        ctx.run.advance()?;
        info!("{}: fetching {} artifact(s)", tier, resolution.packages.len());
        let fetcher = self.fetcher_for(tier, &ctx.fetcher);
        let records = ParallelFetcher::new(
            self.services.cache().clone(),
            fetcher,
            config.fetch.max_concurrent,
        )
        .with_progress(options.show_progress)
        .fetch_all(&resolution.packages)
        .await?;
        for record in &records {
            if let Some(package) = report.package_mut(&record.name) {
                package.digest = Some(record.digest.clone());
            }
        }

        self.check_cancelled()?;
        ctx.run.advance()?;
        info!("{}: installing", tier);
        let markers = self.install_tier(ctx, tier, &records, report)?;

        self.check_cancelled()?;
        ctx.run.advance()?;
        if config.verify.skip {
            info!("{}: verification skipped", tier);
        } else {
            info!("{}: verifying", tier);
            let verification = self.services.verifier().verify(tier, &markers).await?;
            for check in &verification.checks {
                if let Some(package) = report.package_mut(&check.name) {
                    package.verified = Some(check.passed());
                    if check.failure.is_some() {
                        package.error = check.failure.clone();
                    }
                }
            }
            verification.into_result()?;
        }

        for package in &resolution.packages {
            ctx.env.record(tier, package.name.clone(), package.version.clone());
        }
        ctx.run.advance()?;
        Ok(())
    }

    /// Install every fetched artifact, writing PENDING then a terminal ledger
    /// record for each. A failure rolls the tier's scope back when
    /// `rollback_on_failure` is set.
    fn install_tier(
        &self,
        ctx: &mut RunContext,
        tier: Tier,
        records: &[ArtifactRecord],
        report: &mut TierReport,
    ) -> ProvisionResult<Vec<InstalledMarker>> {
        let installer = self.services.installer();
        let ledger = ctx
            .ledger
            .as_mut()
            .ok_or_else(|| ProvisionError::Ledger("no ledger for this run".to_string()))?;
        let mut journal = installer.begin(tier);
        let mut markers = Vec::with_capacity(records.len());

        for record in records {
            let force = ctx.revisit.contains(&(tier, record.name.clone()));
            ledger.begin(tier, &record.name, &record.version.to_string())?;

            match installer.install(&mut journal, record, force) {
                Ok(outcome) => {
                    ledger.complete(tier, &record.name, InstallStatus::Installed, None)?;
                    if let Some(package) = report.package_mut(&record.name) {
                        package.status = Some(InstallStatus::Installed);
                        package.unchanged = outcome.was_noop();
                    }
                    markers.push(outcome.marker().clone());
                }
                Err(error) => {
                    ledger.complete(
                        tier,
                        &record.name,
                        InstallStatus::Failed,
                        Some(error.to_string()),
                    )?;
                    if let Some(package) = report.package_mut(&record.name) {
                        package.status = Some(InstallStatus::Failed);
                        package.error = Some(error.to_string());
                    }
                    if self.services.config().rollback_on_failure {
                        match installer.rollback(journal) {
                            Ok(count) => {
                                info!("{}: rolled back {} package(s)", tier, count);
                                report.rolled_back = true;
                            }
                            Err(e) => warn!("{}: rollback failed: {}", tier, e),
                        }
                    } else if let Err(e) = installer.commit(journal) {
                        warn!("{}: failed to clean up backups: {}", tier, e);
                    }
                    return Err(error);
                }
            }
        }

        installer.commit(journal)?;
        Ok(markers)
    }
}
