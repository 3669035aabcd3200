use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use flora::config::PipelineConfig;
use flora::context::PipelineContext;
use flora::orchestrator::PhaseController;
use flora::services::{ComputeTool, DryRunTool, ProcessTool};

pub async fn cmd_run(
    config_path: &Path,
    dry_run: bool,
    resume: bool,
    max_parallel: Option<usize>,
    journal: Option<&Path>,
) -> Result<()> {
    let config = PipelineConfig::load_or_default(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let work_dir = config.pipeline.work_dir.clone();
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    let tool: Arc<dyn ComputeTool> = if dry_run {
        Arc::new(DryRunTool)
    } else {
        Arc::new(
            ProcessTool::new(config.pipeline.tool_command.clone(), &work_dir)
                .with_timeout(config.pipeline.tool_timeout_secs.map(Duration::from_secs)),
        )
    };
    let max_parallel = max_parallel.unwrap_or(config.pipeline.max_parallel).max(1);

    let controller = PhaseController::build(Arc::new(config), tool, max_parallel)?;

    let (ctx, restore) = if resume {
        match controller.resume_point()? {
            Some((record, ctx)) => {
                println!("Resuming after checkpoint '{}'", record.label);
                (ctx, Some(record))
            }
            None => {
                println!("No completed checkpoint found, starting from the beginning");
                (PipelineContext::new(), None)
            }
        }
    } else {
        controller
            .ledger()
            .reset()
            .context("Failed to reset the checkpoint ledger")?;
        (PipelineContext::new(), None)
    };

    let result = controller.run(ctx, restore).await;

    let dispatcher = controller.dispatcher();
    if let Some(path) = journal {
        dispatcher.journal().save(path)?;
    }
    if dry_run {
        println!("{}", dispatcher.journal().summary());
    }

    let ctx = result.context("Pipeline failed")?;

    println!();
    if ctx.outputs().is_empty() {
        println!("Pipeline complete. No outputs recorded.");
        return Ok(());
    }
    println!("Pipeline complete.");
    println!("{:<20} {:>12}  PATH", "OUTPUT", "SIZE");
    println!("{}", "-".repeat(60));
    for (kind, artifact) in ctx.outputs() {
        println!(
            "{:<20} {:>12}  {}",
            kind.as_str(),
            artifact.size,
            artifact.path.display()
        );
    }

    Ok(())
}
