use anyhow::{Context, Result};
use std::path::Path;

use flora::checkpoint::CheckpointLedger;
use flora::config::PipelineConfig;

pub fn cmd_checkpoints(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load_or_default(config_path)?;
    let ledger = CheckpointLedger::new(config.ledger_path());
    let entries = ledger
        .entries()
        .with_context(|| format!("Failed to read {}", ledger.path().display()))?;

    if entries.is_empty() {
        println!("No checkpoints recorded in {}", ledger.path().display());
        return Ok(());
    }

    println!(
        "{:<8} {:<10} {:<26} SNAPSHOT",
        "LABEL", "STATUS", "TIMESTAMP"
    );
    println!("{}", "-".repeat(72));
    for entry in &entries {
        let snapshot = entry
            .snapshot
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<10} {:<26} {}",
            entry.label,
            entry.status,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            snapshot
        );
    }

    if let Some(last) = entries.iter().rev().find(|e| e.is_completed()) {
        println!();
        println!("Resume point: {}", last.label);
    }

    Ok(())
}
