use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::steps::RootSteps;
use super::traversal::RecursionEngine;
use crate::checkpoint::{
    CheckpointLedger, CheckpointManager, CheckpointRecord, DumpPolicy, context_path,
};
use crate::config::{AttributeBag, AttributeSource, PipelineConfig, StoreKind, resolve};
use crate::context::{OutputKind, PipelineContext};
use crate::coordinator::ServiceCoordinator;
use crate::dispatch::Dispatcher;
use crate::errors::{ConfigError, PipelineResult};
use crate::jobs::{Checkpointable, PhaseJob, Recursable, RecursionPlan};
use crate::phase::{CheckpointGroup, PhaseName, PhaseSpec};
use crate::resources::ResourcePredictor;
use crate::services::{
    ArchiveSink, CommandStoreService, ComputeTool, FileArchive, MemoryStore, StoreContent,
    StoreService, ToolUnitStore, UnitStore, suffix,
};

/// What the controller does after a phase finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Next,
    /// Re-enter the same phase; used by iterative phases.
    Repeat,
}

/// In-memory copies of the phase bags. Injected values live here only and
/// never reach the configuration on disk.
struct PhaseBags(BTreeMap<PhaseName, AttributeBag>);

impl PhaseBags {
    fn from_config(config: &PipelineConfig) -> Self {
        Self(
            PhaseName::SEQUENCE
                .iter()
                .map(|&phase| (phase, config.phase_bag(phase).clone()))
                .collect(),
        )
    }

    fn get(&self, phase: PhaseName) -> &AttributeBag {
        static EMPTY: AttributeBag = AttributeBag::empty();
        self.0.get(&phase).unwrap_or(&EMPTY)
    }

    fn get_mut(&mut self, phase: PhaseName) -> &mut AttributeBag {
        self.0.entry(phase).or_default()
    }
}

/// Walks the fixed phase sequence, one checkpoint group at a time.
pub struct PhaseController {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    engine: RecursionEngine,
    steps: RootSteps,
    checkpoints: CheckpointManager,
    secondary: ServiceCoordinator,
    snapshot_dir: PathBuf,
}

impl PhaseController {
    /// Wire stores, dispatcher and archive from configuration.
    pub fn build(
        config: Arc<PipelineConfig>,
        tool: Arc<dyn ComputeTool>,
        max_parallel: usize,
    ) -> PipelineResult<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tool),
            ResourcePredictor::new(Arc::clone(&config)),
            max_parallel,
        ));
        let archive: Option<Arc<dyn ArchiveSink>> = config
            .pipeline
            .intermediate_results_url
            .clone()
            .map(|prefix| Arc::new(FileArchive::new(prefix)) as Arc<dyn ArchiveSink>);

        let (primary, units) = primary_store(&config, tool)?;
        let secondary = secondary_store(&config);
        let snapshot_dir = config.snapshot_dir(&config.store);

        let checkpoints = CheckpointManager::new(
            primary,
            Arc::clone(&dispatcher),
            CheckpointLedger::new(config.ledger_path()),
            snapshot_dir.clone(),
            DumpPolicy::from_section(&config.store),
        )
        .with_archive(archive.clone());

        Ok(Self {
            engine: RecursionEngine::new(Arc::clone(&config), Arc::clone(&dispatcher), units),
            steps: RootSteps::new(Arc::clone(&config), Arc::clone(&dispatcher), archive),
            secondary: ServiceCoordinator::new(secondary, Arc::clone(&dispatcher)),
            checkpoints,
            dispatcher,
            config,
            snapshot_dir,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &CheckpointLedger {
        self.checkpoints.ledger()
    }

    /// The last completed checkpoint and the context saved with it.
    pub fn resume_point(&self) -> PipelineResult<Option<(CheckpointRecord, PipelineContext)>> {
        let Some(entry) = self.ledger().last_completed()? else {
            return Ok(None);
        };
        let ctx = PipelineContext::load(&context_path(&self.snapshot_dir, &entry.label))?;
        Ok(Some((entry.to_record(), ctx)))
    }

    /// Run the pipeline. With `resume`, start at the group after that checkpoint
    /// and restore the primary store from its snapshot.
    pub async fn run(
        &self,
        ctx: PipelineContext,
        resume: Option<CheckpointRecord>,
    ) -> PipelineResult<PipelineContext> {
        let mut bags = PhaseBags::from_config(&self.config);

        let (mut ctx, mut group) = match &resume {
            Some(record) => {
                let done = CheckpointGroup::from_label(&record.label).ok_or_else(|| {
                    ConfigError::Invalid(format!("unknown checkpoint label '{}'", record.label))
                })?;
                info!(checkpoint = %record.label, "resuming after checkpoint");
                (ctx, done.next())
            }
            None => {
                let (ctx, _) = self
                    .run_phase(PhaseName::TrimBlast, ctx, &mut bags)
                    .await?;
                (ctx, CheckpointGroup::ALL.first().copied())
            }
        };

        let mut restore = resume;
        while let Some(current) = group {
            let bags_ref = &mut bags;
            let (next, record) = self
                .checkpoints
                .run_checkpointed(
                    current.checkpoint_label(),
                    ctx,
                    restore.as_ref(),
                    move |ctx| {
                        let bags = bags_ref;
                        self.run_group(current, ctx, bags)
                    },
                )
                .await?;
            ctx = next;
            restore = Some(record);
            group = current.next();
        }

        info!(
            outputs = ctx.outputs().len(),
            tasks = self.dispatcher.journal().records().len(),
            "pipeline finished"
        );
        Ok(ctx)
    }

    async fn run_group(
        &self,
        group: CheckpointGroup,
        mut ctx: PipelineContext,
        bags: &mut PhaseBags,
    ) -> PipelineResult<PipelineContext> {
        let phases = group.checkpoint_phases();
        let mut index = 0;
        while let Some(&phase) = phases.get(index) {
            let (next, transition) = self.run_phase(phase, ctx, bags).await?;
            ctx = next;
            if transition == Transition::Next {
                index += 1;
            }
        }
        Ok(ctx)
    }

    async fn run_phase(
        &self,
        phase: PhaseName,
        mut ctx: PipelineContext,
        bags: &mut PhaseBags,
    ) -> PipelineResult<(PipelineContext, Transition)> {
        self.inject(phase, &ctx, bags);
        let caf = bags.get(PhaseName::Caf).clone();
        let bag = bags.get_mut(phase);
        let spec = PhaseSpec::from_bag(phase, bag)?;
        let plan = PhaseJob::new(spec.clone()).recursion_plan();
        info!(phase = %phase, recurses = spec.recurses, "phase started");

        let mut transition = Transition::Next;
        match phase {
            PhaseName::TrimBlast => ctx = self.steps.trim_blast(ctx, bag, &caf).await?,
            PhaseName::Setup => ctx = self.steps.setup(ctx, bag).await?,
            PhaseName::Caf => ctx = self.steps.caf(ctx, bag, spec.recurses).await?,
            PhaseName::Bar | PhaseName::Avg | PhaseName::Check => {
                if let Some(plan) = plan {
                    ctx = self.walk_into(plan, bag, ctx).await?;
                }
            }
            PhaseName::Normal => {
                if let Some(plan) = plan {
                    let remaining = spec.tunables.iterations.saturating_sub(1);
                    bag.set("iterations", i64::from(remaining));
                    bag.set("normalised", true);
                    ctx = self.walk_into(plan, bag, ctx).await?.with_normalised(true);
                    info!(phase = %phase, remaining, "normalisation pass done");
                    transition = Transition::Repeat;
                }
            }
            PhaseName::Reference => {
                if let Some(plan) = plan {
                    let params: &AttributeBag = bag;
                    ctx = self
                        .secondary
                        .with_secondary_service(ctx, |ctx| self.walk_into(plan, params, ctx))
                        .await?;
                    ctx = self
                        .walk_into(RecursionPlan::coordinates_down(), params, ctx)
                        .await?;
                    ctx = self.steps.extract_reference(ctx, params).await?;
                }
            }
            PhaseName::Hal => {
                let source = AttributeSource::new("phases.hal", bag);
                if resolve(&[(source, "build_fasta")], false)? {
                    ctx = self.steps.generate_fasta(ctx, bag).await?;
                }
                if let Some(plan) = plan {
                    let params: &AttributeBag = bag;
                    ctx = self
                        .secondary
                        .with_secondary_service(ctx, |ctx| self.walk_into(plan, params, ctx))
                        .await?;
                    self.steps.export(&ctx, OutputKind::Hal, suffix::HAL).await?;
                }
            }
        }

        info!(phase = %phase, "phase finished");
        Ok((ctx, transition))
    }

    /// Values a phase reads from the running pipeline rather than the config.
    fn inject(&self, phase: PhaseName, ctx: &PipelineContext, bags: &mut PhaseBags) {
        let reference = bags.get(PhaseName::Reference).get("reference").cloned();
        let bag = bags.get_mut(phase);
        if let Some(store) = ctx.primary_store() {
            bag.set("store", store.as_str());
        }
        match phase {
            PhaseName::Check => bag.set("check_normalised", ctx.normalised()),
            PhaseName::Hal => {
                if let Some(reference) = reference {
                    bag.set("reference", reference);
                }
            }
            _ => {}
        }
    }

    async fn walk_into(
        &self,
        plan: RecursionPlan,
        params: &AttributeBag,
        ctx: PipelineContext,
    ) -> PipelineResult<PipelineContext> {
        let artifacts = self.engine.walk(plan, params, &ctx).await?;
        Ok(ctx.with_artifacts(&artifacts))
    }
}

fn primary_store(
    config: &PipelineConfig,
    tool: Arc<dyn ComputeTool>,
) -> PipelineResult<(Arc<dyn StoreService>, Arc<dyn UnitStore>)> {
    let section = &config.store;
    let snapshot_dir = config.snapshot_dir(section);
    match section.kind {
        StoreKind::Memory => {
            let seed = match &section.seed_tree {
                Some(path) => StoreContent::load(path)?,
                None => StoreContent::default(),
            };
            let store = Arc::new(MemoryStore::new(
                section.descriptor.clone(),
                section.live,
                snapshot_dir,
                seed,
            ));
            let service: Arc<dyn StoreService> = store.clone();
            let units: Arc<dyn UnitStore> = store;
            Ok((service, units))
        }
        StoreKind::Command => {
            let service: Arc<dyn StoreService> = Arc::new(CommandStoreService::new(
                section.clone(),
                snapshot_dir,
                config.pipeline.work_dir.clone(),
            ));
            let units: Arc<dyn UnitStore> = Arc::new(ToolUnitStore::new(tool));
            Ok((service, units))
        }
    }
}

fn secondary_store(config: &PipelineConfig) -> Arc<dyn StoreService> {
    let section = &config.secondary_store;
    let snapshot_dir = config.snapshot_dir(section);
    match section.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new(
            section.descriptor.clone(),
            section.live,
            snapshot_dir,
            StoreContent::default(),
        )),
        StoreKind::Command => Arc::new(CommandStoreService::new(
            section.clone(),
            snapshot_dir,
            config.pipeline.work_dir.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TaskStatus;
    use crate::errors::{ExternalToolError, PipelineError};
    use crate::jobs::JobKind;
    use crate::services::{ToolInvocation, ToolOutput};
    use crate::units::WorkUnit;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every program run and fails the one named in `fail_on`.
    #[derive(Default)]
    struct RecordingTool {
        calls: Mutex<Vec<ToolInvocation>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingTool {
        fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.program.clone())
                .collect()
        }

        fn calls(&self, program: &str) -> Vec<ToolInvocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ComputeTool for RecordingTool {
        async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.fail_on == Some(invocation.program.as_str()) {
                return Err(ExternalToolError::NonZeroExit {
                    program: invocation.program.clone(),
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            Ok(ToolOutput::default())
        }
    }

    fn write_workspace(dir: &Path, phases: &str) -> Arc<PipelineConfig> {
        let fasta = dir.join("a.fa");
        std::fs::write(&fasta, ">a\nACGTACGT\n").unwrap();
        let seed = StoreContent::default()
            .with_children(0, vec![WorkUnit::new(1, 40), WorkUnit::new(2, 30)])
            .with_children(1, vec![WorkUnit::new(3, 25)]);
        let seed_path = dir.join("seed.json");
        std::fs::write(&seed_path, serde_json::to_string(&seed).unwrap()).unwrap();

        let toml = format!(
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
        Arc::new(PipelineConfig::parse(&toml).unwrap())
    }

    const ALL_ON: &str = r#"
[phases.bar]
run_bar = true
max_group_size = 50

[phases.normal]
iterations = 2

[phases.avg]
build_avgs = true

[phases.reference]
build_reference = true
reference = "human"

[phases.check]
run_check = true

[phases.hal]
build_hal = true
build_fasta = true
"#;

    #[tokio::test]
    async fn test_full_run_visits_every_phase_in_order() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), ALL_ON);
        let tool = Arc::new(RecordingTool::default());
        let controller = PhaseController::build(config, tool.clone(), 2).unwrap();
        let ctx = controller.run(PipelineContext::new(), None).await.unwrap();

        let programs = tool.programs();
        let first = |name: &str| programs.iter().position(|p| p == name).unwrap();
        assert_eq!(first("blast"), 0);
        assert!(first("setup") < first("caf-prepare"));
        assert!(first("caf") < first("bar"));
        assert!(first("bar") < first("normalise"));
        assert!(first("normalise") < first("avg"));
        assert!(first("avg") < first("reference"));
        assert!(first("coords-up") < first("coords-down"));
        assert!(first("coords-down") < first("extract-reference"));
        assert!(first("extract-reference") < first("check"));
        assert!(first("check") < first("fasta"));
        assert!(first("fasta") < first("hal-up"));

        assert!(ctx.normalised());
        assert_eq!(ctx.last_checkpoint().unwrap().label, "hal");
        let labels: Vec<String> = controller
            .ledger()
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.label)
            .collect();
        assert_eq!(labels, vec!["caf", "avg", "check", "hal"]);
    }

    #[tokio::test]
    async fn test_normal_recurses_exactly_iteration_count() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), ALL_ON);
        let tool = Arc::new(RecordingTool::default());
        let controller = PhaseController::build(config, tool.clone(), 2).unwrap();
        controller.run(PipelineContext::new(), None).await.unwrap();

        let root_walks = controller
            .dispatcher()
            .journal()
            .records()
            .into_iter()
            .filter(|r| r.kind == JobKind::NormalRecursion && r.units == "1 0")
            .count();
        assert_eq!(root_walks, 2);

        let check = tool.calls("check");
        assert!(
            check
                .iter()
                .all(|c| c.params["check_normalised"] == serde_json::json!(true))
        );
        let hal = tool.calls("hal-up");
        assert!(
            hal.iter()
                .all(|c| c.params["reference"] == serde_json::json!("human"))
        );
    }

    #[tokio::test]
    async fn test_gated_phases_default_off() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), "");
        let tool = Arc::new(RecordingTool::default());
        let controller = PhaseController::build(config, tool.clone(), 2).unwrap();
        let ctx = controller.run(PipelineContext::new(), None).await.unwrap();

        assert_eq!(tool.programs(), vec!["blast", "setup", "caf-prepare", "caf"]);
        assert!(!ctx.normalised());
        assert_eq!(controller.ledger().entries().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline_and_keeps_last_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), ALL_ON);
        let tool = Arc::new(RecordingTool {
            fail_on: Some("reference"),
            ..Default::default()
        });
        let controller = PhaseController::build(config, tool.clone(), 2).unwrap();
        let err = controller
            .run(PipelineContext::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Tool(_)));
        assert!(!tool.programs().contains(&"hal-up".to_string()));

        let (record, ctx) = controller.resume_point().unwrap().unwrap();
        assert_eq!(record.label, "avg");
        assert!(record.snapshot.is_some());
        assert!(ctx.normalised());
        assert!(
            controller
                .dispatcher()
                .journal()
                .records()
                .iter()
                .any(|r| r.status == TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_resume_reenters_after_last_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), ALL_ON);
        let failing = Arc::new(RecordingTool {
            fail_on: Some("check"),
            ..Default::default()
        });
        let controller = PhaseController::build(config.clone(), failing, 2).unwrap();
        controller
            .run(PipelineContext::new(), None)
            .await
            .unwrap_err();

        let tool = Arc::new(RecordingTool::default());
        let controller = PhaseController::build(config, tool.clone(), 2).unwrap();
        let (record, ctx) = controller.resume_point().unwrap().unwrap();
        assert_eq!(record.label, "avg");
        let ctx = controller.run(ctx, Some(record)).await.unwrap();

        let programs = tool.programs();
        assert!(!programs.contains(&"blast".to_string()));
        assert!(!programs.contains(&"bar".to_string()));
        assert_eq!(programs.first().map(String::as_str), Some("reference"));
        assert_eq!(ctx.last_checkpoint().unwrap().label, "hal");
    }

    #[tokio::test]
    async fn test_unknown_resume_label_rejected() {
        let dir = TempDir::new().unwrap();
        let config = write_workspace(dir.path(), "");
        let controller =
            PhaseController::build(config, Arc::new(RecordingTool::default()), 1).unwrap();
        let err = controller
            .run(
                PipelineContext::new(),
                Some(CheckpointRecord::new("nonsense", None)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Invalid(_))));
    }
}
