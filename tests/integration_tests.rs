//! Integration tests for the flora binary.
//!
//! Every pipeline run here uses `--dry-run`, so no external program is needed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use flora::services::StoreContent;
use flora::units::WorkUnit;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn flora() -> Command {
    cargo_bin_cmd!("flora")
}

/// Write a config with a seeded in-memory store and one input sequence.
fn write_pipeline(dir: &Path, phases: &str) -> PathBuf {
    let fasta = dir.join("a.fa");
    fs::write(&fasta, ">a\nACGTACGT\n").unwrap();

    let seed = StoreContent::default()
        .with_children(0, vec![WorkUnit::new(1, 40), WorkUnit::new(2, 30)])
        .with_children(1, vec![WorkUnit::new(3, 25)]);
    let seed_path = dir.join("seed.json");
    fs::write(&seed_path, serde_json::to_string(&seed).unwrap()).unwrap();

    let config = format!(
        r#"
[pipeline]
work_dir = "{work}"
sequences = ["{fasta}"]
species_tree = "(a:0.1,b:0.2);"

[store]
seed_tree = "{seed}"
dump_poll_interval_ms = 1
max_dump_polls = 5

[secondary_store]
descriptor = "memory://secondary"

{phases}
"#,
        work = dir.join("work").display(),
        fasta = fasta.display(),
        seed = seed_path.display(),
    );
    let path = dir.join("flora.toml");
    fs::write(&path, config).unwrap();
    path
}

const ALL_PHASES: &str = r#"
[phases.bar]
run_bar = true
max_group_size = 50

[phases.normal]
iterations = 1

[phases.avg]
build_avgs = true

[phases.reference]
build_reference = true
reference = "a"

[phases.check]
run_check = true

[phases.hal]
build_hal = true
build_fasta = true
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_flora_help() {
        flora()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("checkpoints"));
    }

    #[test]
    fn test_flora_version() {
        flora().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        flora().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_validate_clean() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(dir.path(), ALL_PHASES);

        flora()
            .arg("--config")
            .arg(&config)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(
            dir.path(),
            "[phases.bar]\nmin_unit_size = 500\nmax_group_size = 100\n\n[phases.nonsense]\nx = 1\n",
        );

        flora()
            .arg("--config")
            .arg(&config)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("phases.nonsense"))
            .stdout(predicate::str::contains("below min_unit_size"));
    }

    #[test]
    fn test_config_show_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();

        flora()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("showing defaults"))
            .stdout(predicate::str::contains("flora-work"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flora.toml");
        fs::write(&path, "[pipeline\nwork_dir = 3").unwrap();

        flora()
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Plan Tests
// =============================================================================

mod plan_command {
    use super::*;

    #[test]
    fn test_plan_groups_units() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(
            dir.path(),
            "[phases.normal]\nmin_unit_size = 20\nmax_group_size = 200\n",
        );

        flora()
            .arg("--config")
            .arg(&config)
            .args(["plan", "--phase", "normal", "--units", "1:100,2:50,3:900,4:10"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1,2"))
            .stdout(predicate::str::contains("oversize"))
            .stdout(predicate::str::contains("NormalWrapper"))
            .stdout(predicate::str::contains("Dropped below min_unit_size 20: 4"));
    }

    #[test]
    fn test_plan_rejects_non_recursive_phase() {
        let dir = TempDir::new().unwrap();

        flora()
            .current_dir(dir.path())
            .args(["plan", "--phase", "setup", "--units", "1:10"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not walk the work tree"));
    }

    #[test]
    fn test_plan_rejects_duplicate_units() {
        let dir = TempDir::new().unwrap();

        flora()
            .current_dir(dir.path())
            .args(["plan", "--units", "1:10,1:20"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Pipeline Run Tests
// =============================================================================

mod pipeline_run {
    use super::*;

    #[test]
    fn test_dry_run_completes_and_records_checkpoints() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(dir.path(), ALL_PHASES);
        let journal = dir.path().join("journal.json");

        flora()
            .arg("--config")
            .arg(&config)
            .args(["run", "--dry-run", "--journal"])
            .arg(&journal)
            .assert()
            .success()
            .stdout(predicate::str::contains("tasks ("))
            .stdout(predicate::str::contains("Pipeline complete"));

        assert!(journal.exists());
        let records: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&journal).unwrap()).unwrap();
        assert!(records.as_array().is_some_and(|r| !r.is_empty()));

        flora()
            .arg("--config")
            .arg(&config)
            .arg("checkpoints")
            .assert()
            .success()
            .stdout(predicate::str::contains("caf"))
            .stdout(predicate::str::contains("avg"))
            .stdout(predicate::str::contains("check"))
            .stdout(predicate::str::contains("Resume point: hal"));
    }

    #[test]
    fn test_resume_after_complete_run_does_nothing_more() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(dir.path(), ALL_PHASES);

        flora()
            .arg("--config")
            .arg(&config)
            .args(["run", "--dry-run"])
            .assert()
            .success();

        flora()
            .arg("--config")
            .arg(&config)
            .args(["run", "--dry-run", "--resume"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Resuming after checkpoint 'hal'"))
            .stdout(predicate::str::contains("0 tasks"));
    }

    #[test]
    fn test_checkpoints_empty_before_run() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(dir.path(), ALL_PHASES);

        flora()
            .arg("--config")
            .arg(&config)
            .arg("checkpoints")
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpoints recorded"));
    }

    #[test]
    fn test_missing_sequence_fails_run() {
        let dir = TempDir::new().unwrap();
        let config = write_pipeline(dir.path(), "");
        fs::remove_file(dir.path().join("a.fa")).unwrap();

        flora()
            .arg("--config")
            .arg(&config)
            .args(["run", "--dry-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Pipeline failed"));
    }
}
