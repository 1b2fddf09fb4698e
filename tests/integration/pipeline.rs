//! End-to-end runs of the pipeline over mock providers

use super::common::{tier_records, Harness};
use provision::core::{ProvisionError, Tier};
use provision::ledger::{InstallStatus, Ledger, LEDGER_FILE};
use provision::orchestrator::{RunOptions, TierOutcome};
use std::fs;
use std::time::Duration;

const EXAMPLE: &str = "\
[global]
pytest==8.0.0

[wheelhouse]
pandas>=2.0,<3.0

[local]
myapp-cli==1.2.0
";

fn example() -> Harness {
    let h = Harness::new(EXAMPLE);
    h.publish("pytest", "8.0.0", &[]);
    h.publish("pandas", "2.1.0", &[]);
    h.publish("pandas", "2.2.1", &[]);
    h.publish("pandas", "3.0.0", &[]);
    h.publish("myapp-cli", "1.2.0", &["pandas>=2.0"]);
    h
}

#[tokio::test]
async fn test_example_run_installs_every_tier() {
    let h = example();

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    let report = &outcome.report;
    assert_eq!(report.final_state, "DONE");
    assert_eq!(report.checkpoint, Some(Tier::Local));

    let installed: Vec<(Tier, &str)> = report
        .records
        .iter()
        .map(|r| (r.tier, r.name.as_str()))
        .collect();
    assert_eq!(
        installed,
        vec![
            (Tier::Global, "pytest"),
            (Tier::Wheelhouse, "pandas"),
            (Tier::Local, "myapp-cli"),
        ]
    );
    assert!(report
        .records
        .iter()
        .all(|r| r.status == InstallStatus::Installed));

    // pandas comes from the wheelhouse, not a second copy in LOCAL
    let wheelhouse = report.tier(Tier::Wheelhouse).unwrap();
    assert_eq!(wheelhouse.packages[0].version, "2.2.1");
    let local = report.tier(Tier::Local).unwrap();
    assert_eq!(local.packages.len(), 2);
    assert_eq!(local.packages[0].name, "myapp-cli");
    assert_eq!(local.packages[1].name, "pandas");
    assert_eq!(local.packages[1].inherited_from, Some(Tier::Wheelhouse));

    let scopes = h.scopes();
    assert!(scopes.payload_dir(Tier::Global).join("pytest-8.0.0.artifact").is_file());
    assert!(scopes.payload_dir(Tier::Wheelhouse).join("pandas-2.2.1.artifact").is_file());
    assert!(scopes.payload_dir(Tier::Local).join("myapp-cli-1.2.0.artifact").is_file());
    assert!(!scopes.payload_dir(Tier::Local).join("pandas-2.2.1.artifact").exists());
    assert_eq!(h.source.download_count(), 3);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = example();
    h.orchestrator().run(&RunOptions::all()).await.unwrap();
    let downloads = h.source.download_count();

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.source.download_count(), downloads);
    assert_eq!(outcome.report.records.len(), 3);
    for tier in &outcome.report.tiers {
        for package in tier.packages.iter().filter(|p| p.inherited_from.is_none()) {
            assert_eq!(package.status, Some(InstallStatus::Installed));
            assert!(package.unchanged, "{} was reinstalled", package.name);
        }
    }

    // Six terminal events over two runs, plus their PENDING counterparts
    let ledger = h.ledger();
    assert_eq!(ledger.len(), 12);
    assert!(ledger.iter().all(|r| r.status != InstallStatus::Failed));
}

#[tokio::test]
async fn test_resolution_is_deterministic() {
    let manifest = "[global]\npandas>=2.0,<3.0\n";
    let mut digests = Vec::new();
    for _ in 0..2 {
        let h = Harness::new(manifest);
        h.publish("pandas", "2.1.0", &[]);
        h.publish("pandas", "2.2.1", &["numpy>=1.22"]);
        h.publish("pandas", "3.0.0", &[]);
        h.publish("numpy", "1.21.0", &[]);
        h.publish("numpy", "1.26.4", &[]);

        let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();
        assert_eq!(outcome.exit_code(), 0);
        let packages: Vec<(String, String, Option<String>)> = outcome
            .report
            .tier(Tier::Global)
            .unwrap()
            .packages
            .iter()
            .map(|p| (p.name.clone(), p.version.clone(), p.digest.clone()))
            .collect();
        digests.push(packages);
    }

    assert_eq!(digests[0], digests[1]);
    let versions: Vec<(&str, &str)> = digests[0]
        .iter()
        .map(|(n, v, _)| (n.as_str(), v.as_str()))
        .collect();
    assert_eq!(versions, vec![("pandas", "2.2.1"), ("numpy", "1.26.4")]);
}

#[tokio::test]
async fn test_tiers_are_verified_in_order() {
    let h = example();

    h.orchestrator().run(&RunOptions::all()).await.unwrap();

    let probed: Vec<Tier> = h.probe.probed().into_iter().map(|(t, _)| t).collect();
    assert_eq!(probed, vec![Tier::Global, Tier::Wheelhouse, Tier::Local]);

    let ledger = h.ledger();
    let tiers: Vec<Tier> = ledger.iter().map(|r| r.tier).collect();
    let mut sorted = tiers.clone();
    sorted.sort();
    assert_eq!(tiers, sorted);
}

#[tokio::test]
async fn test_tampered_cache_fails_fetch() {
    let h = Harness::new("[global]\npytest==7.4.0\n");
    h.publish("pytest", "7.4.0", &[]);
    h.orchestrator().run(&RunOptions::all()).await.unwrap();

    fs::write(
        h.cache_dir().join("artifacts").join("pytest-7.4.0.artifact"),
        b"not what was first seen",
    )
    .unwrap();
    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.report.final_state, "FAILED(GLOBAL, fetching)");
    assert!(outcome
        .report
        .error
        .as_deref()
        .unwrap()
        .contains("digest mismatch"));
    assert!(outcome.report.records.is_empty());
    assert_eq!(h.source.download_count(), 1);
}

#[tokio::test]
async fn test_failed_tier_stops_later_tiers() {
    let h = Harness::new("[global]\npytest==7.4.0\n[wheelhouse]\nghost==1.0\n[local]\nsix>=1.0\n");
    h.publish("pytest", "7.4.0", &[]);
    h.publish("six", "1.16.0", &[]);

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 2);
    let report = &outcome.report;
    assert_eq!(report.final_state, "FAILED(WHEELHOUSE, resolving)");
    assert_eq!(report.checkpoint, Some(Tier::Global));

    let wheelhouse = report.tier(Tier::Wheelhouse).unwrap();
    assert_eq!(wheelhouse.outcome, TierOutcome::Failed);
    assert_eq!(wheelhouse.failed_package.as_deref(), Some("ghost"));
    assert_eq!(report.tier(Tier::Local).unwrap().outcome, TierOutcome::NotRun);

    let ledger = h.ledger();
    assert_eq!(tier_records(&ledger, Tier::Global).len(), 2);
    assert!(tier_records(&ledger, Tier::Local).is_empty());
    assert!(!h.scopes().dir(Tier::Local).join(".provision/installed").exists());
}

#[tokio::test]
async fn test_optional_tier_failure_is_skipped() {
    let mut h = Harness::new("[global]\npytest==7.4.0\n[local]\nghost==1.0\n");
    h.config.optional_tiers = vec![Tier::Local];
    h.publish("pytest", "7.4.0", &[]);

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.final_state, "DONE");
    assert_eq!(outcome.report.checkpoint, Some(Tier::Global));
    let local = outcome.report.tier(Tier::Local).unwrap();
    assert!(local.optional);
    assert_eq!(local.outcome, TierOutcome::Skipped);
    assert!(local.error.as_deref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_install_failure_rolls_back_tier() {
    let h = Harness::new("[global]\nalpha==1.0\nbeta==1.0\n");
    h.publish("alpha", "1.0", &[]);
    h.publish("beta", "1.0", &[]);
    let site = h.scopes().payload_dir(Tier::Global);
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("beta-1.0.artifact"), b"owned by someone else").unwrap();

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 4);
    assert_eq!(outcome.report.final_state, "FAILED(GLOBAL, installing)");
    let global = outcome.report.tier(Tier::Global).unwrap();
    assert!(global.rolled_back);
    assert_eq!(global.failed_package.as_deref(), Some("beta"));

    // alpha's payload is gone again, the foreign file is untouched
    assert!(!site.join("alpha-1.0.artifact").exists());
    assert_eq!(
        fs::read(site.join("beta-1.0.artifact")).unwrap(),
        b"owned by someone else"
    );

    // The ledger keeps what happened
    let statuses: Vec<(&str, InstallStatus)> = outcome
        .report
        .records
        .iter()
        .map(|r| (r.name.as_str(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![("alpha", InstallStatus::Installed), ("beta", InstallStatus::Failed)]
    );
}

#[tokio::test]
async fn test_verification_failure_keeps_payload() {
    let h = Harness::new("[global]\npytest==7.4.0\n");
    h.publish("pytest", "7.4.0", &[]);
    h.probe.fail_for("pytest", "No module named 'pytest'");

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();

    assert_eq!(outcome.exit_code(), 5);
    assert_eq!(outcome.report.final_state, "FAILED(GLOBAL, verifying)");
    let package = &outcome.report.tier(Tier::Global).unwrap().packages[0];
    assert_eq!(package.status, Some(InstallStatus::Installed));
    assert_eq!(package.verified, Some(false));
    assert!(h
        .scopes()
        .payload_dir(Tier::Global)
        .join("pytest-7.4.0.artifact")
        .is_file());
}

#[tokio::test]
async fn test_interrupted_install_is_redone() {
    let h = Harness::new("[global]\npytest==7.4.0\n");
    h.publish("pytest", "7.4.0", &[]);
    h.orchestrator().run(&RunOptions::all()).await.unwrap();

    // A run that died between PENDING and its terminal record
    let mut interrupted = Ledger::open(&h.state_dir(), "interrupted").unwrap();
    interrupted.begin(Tier::Global, "pytest", "7.4.0").unwrap();
    drop(interrupted);

    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    let package = &outcome.report.tier(Tier::Global).unwrap().packages[0];
    assert_eq!(package.status, Some(InstallStatus::Installed));
    assert!(!package.unchanged);

    // Settled now: a further run trusts the install again
    let outcome = h.orchestrator().run(&RunOptions::all()).await.unwrap();
    assert!(outcome.report.tier(Tier::Global).unwrap().packages[0].unchanged);
}

#[tokio::test]
async fn test_single_tier_selection_uses_installed_wider_tiers() {
    let h = example();
    h.orchestrator()
        .run(&RunOptions::new(vec![Tier::Global, Tier::Wheelhouse]))
        .await
        .unwrap();

    let outcome = h
        .orchestrator()
        .run(&RunOptions::new(vec![Tier::Local]))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.tiers.len(), 1);
    let local = outcome.report.tier(Tier::Local).unwrap();
    assert_eq!(local.packages[1].inherited_from, Some(Tier::Wheelhouse));
    assert_eq!(outcome.report.records.len(), 1);
}

#[tokio::test]
async fn test_concurrent_run_on_same_scopes_is_rejected() {
    let h = Harness::new("[global]\npytest==7.4.0\n[wheelhouse]\npandas==2.2.1\n");
    h.publish("pytest", "7.4.0", &[]);
    h.publish("pandas", "2.2.1", &[]);
    h.source.set_delay(Duration::from_millis(200));
    let other_state = h.temp.path().join("state-b");
    let mut other = h.config.clone();
    other.state_dir = Some(other_state.to_string_lossy().into_owned());

    let first = h.orchestrator();
    let second = h.orchestrator_for(other);
    let options = RunOptions::all();
    let (a, b) = tokio::join!(first.run(&options), second.run(&options));

    assert_eq!(a.unwrap().exit_code(), 0);
    let err = b.unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert!(matches!(err, ProvisionError::RunLocked { .. }));
    // The rejected run touched nothing
    assert!(!other_state.join(LEDGER_FILE).exists());
    assert_eq!(h.source.download_count(), 2);
}
