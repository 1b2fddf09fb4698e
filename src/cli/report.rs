use provision::ledger::InstallStatus;
use provision::orchestrator::{PackageReport, RunReport, TierOutcome, TierReport};
use std::fmt::Write;

/// Human-readable summary of a run, one block per tier.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();

    if report.dry_run {
        let _ = writeln!(out, "Dry run {} (nothing installed)", report.run_id);
    } else {
        let _ = writeln!(out, "Run {}", report.run_id);
    }
    if report.offline {
        let _ = writeln!(out, "Mode: offline");
    }

    for tier in &report.tiers {
        out.push('\n');
        render_tier(&mut out, tier);
    }

    out.push('\n');
    if report.is_success() {
        let _ = writeln!(out, "✓ {}", report.final_state);
    } else {
        let _ = writeln!(
            out,
            "❌ {} (exit code {})",
            report.final_state, report.exit_code
        );
    }
    if let Some(checkpoint) = report.checkpoint {
        let _ = writeln!(out, "Last verified tier: {}", checkpoint);
    }

    out
}

fn render_tier(out: &mut String, tier: &TierReport) {
    let optional = if tier.optional { " (optional)" } else { "" };
    let _ = writeln!(
        out,
        "{}{}: {}",
        tier.tier,
        optional,
        outcome_label(tier.outcome)
    );

    if tier.packages.is_empty() && tier.outcome != TierOutcome::NotRun {
        let _ = writeln!(out, "  (no packages)");
    }
    for package in &tier.packages {
        let _ = writeln!(out, "  {}", package_line(package));
    }

    if let Some(stage) = tier.failed_stage {
        match &tier.failed_package {
            Some(name) => {
                let _ = writeln!(out, "  failed while {} {}", stage, name);
            }
            None => {
                let _ = writeln!(out, "  failed while {}", stage);
            }
        }
    }
    if let Some(error) = &tier.error {
        let _ = writeln!(out, "  error: {}", error);
    }
    if tier.rolled_back {
        let _ = writeln!(out, "  rolled back partial installs");
    }
}

fn outcome_label(outcome: TierOutcome) -> &'static str {
    match outcome {
        TierOutcome::Done => "done",
        TierOutcome::Failed => "failed",
        TierOutcome::Skipped => "skipped",
        TierOutcome::Planned => "planned",
        TierOutcome::NotRun => "not run",
    }
}

fn package_line(package: &PackageReport) -> String {
    let id = format!("{}=={}", package.name, package.version);

    if let Some(from) = package.inherited_from {
        return format!("= {} (provided by {})", id, from);
    }

    let mut line = match (package.status, package.verified) {
        (Some(InstallStatus::Failed), _) | (_, Some(false)) => format!("✗ {}", id),
        (Some(InstallStatus::Installed), _) if package.unchanged => {
            format!("✓ {} (already installed)", id)
        }
        (Some(InstallStatus::Installed), _) => format!("✓ {}", id),
        _ => format!("- {}", id),
    };
    if let Some(error) = &package.error {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}
