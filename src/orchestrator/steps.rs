//! Whole-input steps that run once at the root: blast preparation, setup,
//! caf, reference extraction and fasta generation, plus output exports.

use anyhow::Context;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::divergence::{identity_threshold, longest_path};
use crate::config::{AttributeBag, AttributeSource, PipelineConfig, resolve, resolve_required};
use crate::context::{OutputKind, PipelineContext};
use crate::dispatch::Dispatcher;
use crate::errors::{ConfigError, PipelineResult};
use crate::jobs::{JobKind, ResourceEstimable, RootStepJob, UnitJob};
use crate::services::{ArchiveSink, ArtifactHandle, ToolInvocation, suffix};
use crate::units::{ROOT_UNIT, WorkUnit};

/// Directory under the work dir holding id-prefixed inputs.
pub const RENAMED_INPUTS_DIR: &str = "renamed_inputs";

pub struct RootSteps {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    archive: Option<Arc<dyn ArchiveSink>>,
}

impl RootSteps {
    pub fn new(
        config: Arc<PipelineConfig>,
        dispatcher: Arc<Dispatcher>,
        archive: Option<Arc<dyn ArchiveSink>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            archive,
        }
    }

    /// Measure and rename the inputs, derive the identity filter, run blast.
    pub async fn trim_blast(
        &self,
        ctx: PipelineContext,
        params: &AttributeBag,
        caf: &AttributeBag,
    ) -> PipelineResult<PipelineContext> {
        let sequences = &self.config.pipeline.sequences;
        let mut total_input_size = 0;
        for path in sequences {
            total_input_size += tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .with_context(|| format!("Failed to stat sequence file {}", path.display()))?;
        }
        let inputs = sequences.clone();
        let out_dir = self.config.work_path(Path::new(RENAMED_INPUTS_DIR));
        let renamed = tokio::task::spawn_blocking(move || prefix_unique_ids(&inputs, &out_dir))
            .await
            .context("Sequence renaming task failed")??;

        let divergence = self.divergence()?;
        let identity = identity_filter(caf, divergence)?;
        info!(
            sequences = sequences.len(),
            total_input_size,
            divergence = ?divergence,
            identity = ?identity,
            "inputs prepared"
        );

        let mut ctx = ctx
            .with_total_input_size(total_input_size)
            .with_sequences(renamed)
            .with_identity_filter(identity);
        if let Some(divergence) = divergence {
            ctx = ctx.with_divergence(divergence);
        }

        let caf_source = AttributeSource::new("phases.caf", caf);
        let mut blast_arguments: String = resolve(&[(caf_source, "blast_arguments")], String::new())?;
        if let Some(identity) = identity {
            blast_arguments.push_str(&format!(" --identity={}", identity));
        }

        let invocation = self.root_invocation(JobKind::Blast, &ctx, params).map(|inv| {
            inv.with_param("blast_arguments", blast_arguments.trim())
                .with_param("sequences", path_list(ctx.sequences()))
                .with_param("outgroups", self.config.pipeline.outgroups.clone())
        });
        let artifacts = self
            .run_root(&RootStepJob { kind: JobKind::Blast }, &ctx, invocation)
            .await?;
        Ok(ctx.with_artifacts(&artifacts))
    }

    /// Longest root-to-leaf path of the species tree, padded when there are no outgroups.
    fn divergence(&self) -> PipelineResult<Option<f64>> {
        let Some(tree) = &self.config.pipeline.species_tree else {
            return Ok(None);
        };
        let mut divergence = longest_path(tree)?;
        if self.config.pipeline.outgroups.is_empty() {
            let constants = AttributeSource::new("constants", &self.config.constants);
            divergence += resolve(&[(constants, "distance_to_add_to_root_alignment")], 0.0)?;
        }
        Ok(Some(divergence))
    }

    pub async fn setup(
        &self,
        ctx: PipelineContext,
        params: &AttributeBag,
    ) -> PipelineResult<PipelineContext> {
        let invocation = self.root_invocation(JobKind::Setup, &ctx, params).map(|inv| {
            inv.with_param("sequences", path_list(ctx.sequences()))
                .with_param("species_tree", self.config.pipeline.species_tree.clone())
                .with_param("outgroups", self.config.pipeline.outgroups.clone())
                .with_param(
                    "outgroup_fragments",
                    output_path(&ctx, OutputKind::OutgroupFragments),
                )
        });
        let artifacts = self
            .run_root(&RootStepJob { kind: JobKind::Setup }, &ctx, invocation)
            .await?;
        Ok(ctx.with_artifacts(&artifacts))
    }

    /// Convert blast output for caf, then run caf over the whole tree at the root.
    pub async fn caf(
        &self,
        ctx: PipelineContext,
        params: &AttributeBag,
        run_wrapper: bool,
    ) -> PipelineResult<PipelineContext> {
        let invocation = self
            .root_invocation(JobKind::CafPhase, &ctx, params)
            .map(|inv| self.caf_inputs(inv, &ctx));
        let prepared = self
            .run_root(&RootStepJob { kind: JobKind::CafPhase }, &ctx, invocation)
            .await?;
        let ctx = ctx.with_artifacts(&prepared);
        if !run_wrapper {
            return Ok(ctx);
        }

        let root = WorkUnit::new(ROOT_UNIT, ctx.total_input_size());
        let invocation = self
            .root_invocation(JobKind::CafWrapper, &ctx, params)
            .map(|inv| self.caf_inputs(inv, &ctx));
        let artifacts = self
            .run_root(
                &UnitJob::new(JobKind::CafWrapper, vec![root], true),
                &ctx,
                invocation,
            )
            .await?;
        Ok(ctx.with_artifacts(&artifacts))
    }

    fn caf_inputs(&self, invocation: ToolInvocation, ctx: &PipelineContext) -> ToolInvocation {
        invocation
            .with_param("alignments", output_path(ctx, OutputKind::Alignments))
            .with_param(
                "ingroup_coverage",
                output_path(ctx, OutputKind::IngroupCoverage),
            )
            .with_param("constraints", output_path(ctx, OutputKind::Constraints))
            .with_param("identity", ctx.identity_filter())
    }

    /// Write the reference sequence out of the store and export it.
    pub async fn extract_reference(
        &self,
        ctx: PipelineContext,
        params: &AttributeBag,
    ) -> PipelineResult<PipelineContext> {
        let invocation = self.root_invocation(JobKind::ExtractReference, &ctx, params);
        let artifacts = self
            .run_root(
                &RootStepJob {
                    kind: JobKind::ExtractReference,
                },
                &ctx,
                invocation,
            )
            .await?;
        let ctx = ctx.with_artifacts(&artifacts);
        self.export(&ctx, OutputKind::Reference, suffix::REFERENCE)
            .await?;
        Ok(ctx)
    }

    pub async fn generate_fasta(
        &self,
        ctx: PipelineContext,
        params: &AttributeBag,
    ) -> PipelineResult<PipelineContext> {
        let invocation = self.root_invocation(JobKind::FastaGenerator, &ctx, params);
        let artifacts = self
            .run_root(
                &RootStepJob {
                    kind: JobKind::FastaGenerator,
                },
                &ctx,
                invocation,
            )
            .await?;
        let ctx = ctx.with_artifacts(&artifacts);
        self.export(&ctx, OutputKind::HalFasta, suffix::HAL_FASTA)
            .await?;
        Ok(ctx)
    }

    /// Copy an accumulated output to the archive. No-op without an archive or output.
    pub async fn export(
        &self,
        ctx: &PipelineContext,
        kind: OutputKind,
        suffix: &str,
    ) -> PipelineResult<Option<PathBuf>> {
        let Some(archive) = &self.archive else {
            return Ok(None);
        };
        let Some(output) = ctx.output(kind) else {
            debug!(output = %kind, "nothing to export");
            return Ok(None);
        };
        let destination = archive.export(&output.path, suffix).await?;
        info!(output = %kind, destination = %destination.display(), "output exported");
        Ok(Some(destination))
    }

    fn root_invocation(
        &self,
        kind: JobKind,
        ctx: &PipelineContext,
        params: &AttributeBag,
    ) -> Option<ToolInvocation> {
        Some(
            ToolInvocation::for_job(kind)?
                .with_store(ctx.primary_store())
                .with_secondary_store(ctx.secondary_store())
                .with_units([ROOT_UNIT])
                .with_params(params),
        )
    }

    async fn run_root(
        &self,
        job: &dyn ResourceEstimable,
        ctx: &PipelineContext,
        invocation: Option<ToolInvocation>,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        match invocation {
            Some(invocation) => Ok(self.dispatcher.run(job, ctx, invocation).await?.artifacts),
            None => {
                self.dispatcher.reserve(job, ctx, "1 0")?;
                Ok(Vec::new())
            }
        }
    }
}

/// The blast identity threshold, when the caf bag asks for identity filtering.
fn identity_filter(caf: &AttributeBag, divergence: Option<f64>) -> PipelineResult<Option<u32>> {
    let source = AttributeSource::new("phases.caf", caf);
    if !resolve(&[(source, "filter_by_identity")], false)? {
        return Ok(None);
    }
    let ratio: f64 = resolve_required(&[(source, "identity_ratio")])?;
    let minimum_distance: f64 = resolve_required(&[(source, "minimum_distance")])?;
    let divergence = divergence.ok_or_else(|| ConfigError::Missing {
        location: "pipeline".to_string(),
        key: "species_tree".to_string(),
    })?;
    Ok(Some(identity_threshold(divergence, ratio, minimum_distance)))
}

/// Copy each FASTA file into `out_dir`, prefixing every header with `id=<n>|`
/// where `n` is the file's position in `sequences`.
pub fn prefix_unique_ids(sequences: &[PathBuf], out_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut renamed = Vec::with_capacity(sequences.len());
    for (index, source) in sequences.iter().enumerate() {
        let name = source
            .file_name()
            .with_context(|| format!("Sequence path {} has no file name", source.display()))?;
        let target = out_dir.join(name);
        let input = fs::File::open(source)
            .with_context(|| format!("Failed to open sequence file {}", source.display()))?;
        let output = fs::File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;

        let mut writer = BufWriter::new(output);
        for line in BufReader::new(input).lines() {
            let line = line.with_context(|| format!("Failed to read {}", source.display()))?;
            match line.strip_prefix('>') {
                Some(header) => writeln!(writer, ">id={}|{}", index, header.trim_start())?,
                None => writeln!(writer, "{}", line)?,
            }
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", target.display()))?;
        renamed.push(target);
    }
    Ok(renamed)
}

fn path_list(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn output_path(ctx: &PipelineContext, kind: OutputKind) -> Option<String> {
    ctx.output(kind).map(|a| a.path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ExternalToolError, PipelineError};
    use crate::resources::ResourcePredictor;
    use crate::services::{ComputeTool, DryRunTool, FileArchive, ToolOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingTool {
        dir: PathBuf,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ComputeTool for RecordingTool {
        async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
            self.calls.lock().unwrap().push(invocation.clone());
            let kind = match invocation.program.as_str() {
                "blast" => "alignments",
                "extract-reference" => "reference",
                "fasta" => "hal_fasta",
                _ => return Ok(ToolOutput::default()),
            };
            let path = self.dir.join(kind);
            std::fs::write(&path, kind).unwrap();
            Ok(ToolOutput {
                messages: Vec::new(),
                artifacts: vec![ArtifactHandle::new(kind, path, kind.len() as u64)],
            })
        }
    }

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        let a = dir.join("a.fa");
        let b = dir.join("b.fa");
        std::fs::write(&a, ">chr1 human\nACGT\n>chr2\nGG\n").unwrap();
        std::fs::write(&b, ">scaffold_9\nTTTT\n").unwrap();
        vec![a, b]
    }

    fn config(dir: &Path, extra: &str) -> Arc<PipelineConfig> {
        let inputs = write_inputs(dir);
        let toml = format!(
            r#"
[pipeline]
work_dir = "{}"
sequences = ["{}", "{}"]
intermediate_results_url = "{}/archive/run"
species_tree = "((a:0.05,b:0.05):0.05,c:0.1);"
{}
"#,
            dir.join("work").display(),
            inputs[0].display(),
            inputs[1].display(),
            dir.display(),
            extra
        );
        Arc::new(PipelineConfig::parse(&toml).unwrap())
    }

    fn steps(config: Arc<PipelineConfig>, tool: Arc<dyn ComputeTool>) -> RootSteps {
        let dispatcher = Arc::new(Dispatcher::new(
            tool,
            ResourcePredictor::new(config.clone()),
            2,
        ));
        let archive = config
            .pipeline
            .intermediate_results_url
            .clone()
            .map(|prefix| Arc::new(FileArchive::new(prefix)) as Arc<dyn ArchiveSink>);
        RootSteps::new(config, dispatcher, archive)
    }

    #[test]
    fn test_prefix_unique_ids_rewrites_headers() {
        let dir = TempDir::new().unwrap();
        let inputs = write_inputs(dir.path());
        let out = dir.path().join("renamed");
        let renamed = prefix_unique_ids(&inputs, &out).unwrap();
        assert_eq!(renamed, vec![out.join("a.fa"), out.join("b.fa")]);
        assert_eq!(
            std::fs::read_to_string(&renamed[0]).unwrap(),
            ">id=0|chr1 human\nACGT\n>id=0|chr2\nGG\n"
        );
        assert_eq!(
            std::fs::read_to_string(&renamed[1]).unwrap(),
            ">id=1|scaffold_9\nTTTT\n"
        );
    }

    #[tokio::test]
    async fn test_trim_blast_sets_sizes_and_identity() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "");
        let tool = Arc::new(RecordingTool {
            dir: dir.path().to_path_buf(),
            calls: Mutex::new(Vec::new()),
        });
        let caf = AttributeBag::new()
            .with("filter_by_identity", true)
            .with("identity_ratio", 1.0)
            .with("minimum_distance", 0.0)
            .with("blast_arguments", "--chunk 1000");
        let ctx = steps(config, tool.clone())
            .trim_blast(PipelineContext::new(), &AttributeBag::new(), &caf)
            .await
            .unwrap();

        // ">chr1 human\nACGT\n>chr2\nGG\n" + ">scaffold_9\nTTTT\n"
        assert_eq!(ctx.total_input_size(), 26 + 17);
        assert_eq!(ctx.sequences().len(), 2);
        // longest path 0.1, no outgroups, no padding configured
        assert!((ctx.divergence().unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(ctx.identity_filter(), Some(90));
        assert!(ctx.output(OutputKind::Alignments).is_some());

        let calls = tool.calls.lock().unwrap();
        assert_eq!(
            calls[0].params["blast_arguments"],
            serde_json::json!("--chunk 1000 --identity=90")
        );
    }

    #[tokio::test]
    async fn test_identity_filter_requires_its_attributes() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "");
        let caf = AttributeBag::new().with("filter_by_identity", true);
        let err = steps(config, Arc::new(DryRunTool))
            .trim_blast(PipelineContext::new(), &AttributeBag::new(), &caf)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::Missing { ref key, .. }) if key == "identity_ratio"
        ));
    }

    #[tokio::test]
    async fn test_missing_sequence_file_fails() {
        let dir = TempDir::new().unwrap();
        let toml = format!(
            "[pipeline]\nwork_dir = \"{}\"\nsequences = [\"{}/nope.fa\"]\n",
            dir.path().display(),
            dir.path().display()
        );
        let config = Arc::new(PipelineConfig::parse(&toml).unwrap());
        let err = steps(config, Arc::new(DryRunTool))
            .trim_blast(PipelineContext::new(), &AttributeBag::new(), &AttributeBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Other(_)));
    }

    #[tokio::test]
    async fn test_extract_reference_exports_to_archive() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "");
        let tool = Arc::new(RecordingTool {
            dir: dir.path().to_path_buf(),
            calls: Mutex::new(Vec::new()),
        });
        let ctx = steps(config, tool)
            .extract_reference(
                PipelineContext::new(),
                &AttributeBag::new().with("reference", "human"),
            )
            .await
            .unwrap();
        assert!(ctx.output(OutputKind::Reference).is_some());
        let exported = dir.path().join("archive").join("run.reference.fa");
        assert_eq!(std::fs::read_to_string(exported).unwrap(), "reference");
    }

    #[tokio::test]
    async fn test_caf_runs_wrapper_at_root() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "");
        let tool = Arc::new(RecordingTool {
            dir: dir.path().to_path_buf(),
            calls: Mutex::new(Vec::new()),
        });
        steps(config, tool.clone())
            .caf(
                PipelineContext::new().with_total_input_size(42),
                &AttributeBag::new(),
                true,
            )
            .await
            .unwrap();
        let programs: Vec<String> = tool
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect();
        assert_eq!(programs, vec!["caf-prepare", "caf"]);
    }
}
