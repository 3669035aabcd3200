use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::journal::{DispatchJournal, ExecutionTimer, TaskRecord};
use crate::context::PipelineContext;
use crate::errors::{PipelineError, PipelineResult, ResourceEstimationError};
use crate::jobs::ResourceEstimable;
use crate::resources::{ResourcePredictor, ResourceRequest};
use crate::services::{ComputeTool, ToolInvocation, ToolOutput};

/// Submits tasks: estimates resources, bounds concurrency, journals outcomes.
///
/// Estimation happens before a permit is taken, so a bad resource model
/// fails the submission without running anything.
pub struct Dispatcher {
    tool: Arc<dyn ComputeTool>,
    predictor: ResourcePredictor,
    permits: Arc<Semaphore>,
    journal: DispatchJournal,
}

impl Dispatcher {
    pub fn new(tool: Arc<dyn ComputeTool>, predictor: ResourcePredictor, max_parallel: usize) -> Self {
        Self {
            tool,
            predictor,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            journal: DispatchJournal::new(),
        }
    }

    pub fn journal(&self) -> &DispatchJournal {
        &self.journal
    }

    pub fn tool(&self) -> Arc<dyn ComputeTool> {
        Arc::clone(&self.tool)
    }

    /// Submit a task that runs no program, such as a recursion step or a store service.
    pub fn reserve(
        &self,
        job: &dyn ResourceEstimable,
        ctx: &PipelineContext,
        units: &str,
    ) -> Result<ResourceRequest, ResourceEstimationError> {
        let request = self.predictor.estimate(job, ctx.total_input_size())?;
        debug!(
            job = %job.kind(),
            phase = %job.phase(),
            units,
            memory = %request.describe_memory(),
            "reserved"
        );
        self.journal
            .record(TaskRecord::reserved(job.kind(), job.phase(), units, request));
        Ok(request)
    }

    /// Run the program behind `job`. A failing program fails the task unmodified.
    pub async fn run(
        &self,
        job: &dyn ResourceEstimable,
        ctx: &PipelineContext,
        invocation: ToolInvocation,
    ) -> PipelineResult<ToolOutput> {
        let request = self.predictor.estimate(job, ctx.total_input_size())?;
        let record = TaskRecord::reserved(job.kind(), job.phase(), &invocation.units, request);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("dispatcher closed: {}", e)))?;

        info!(
            job = %job.kind(),
            phase = %job.phase(),
            units = %invocation.units,
            memory = %request.describe_memory(),
            preemptable = request.preemptable,
            "dispatching"
        );

        let timer = ExecutionTimer::start();
        match self.tool.run(&invocation).await {
            Ok(output) => {
                self.journal
                    .record(record.completed(output.artifacts.len(), timer.elapsed()));
                Ok(output)
            }
            Err(e) => {
                self.journal
                    .record(record.failed(&e.to_string(), timer.elapsed()));
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dispatch::TaskStatus;
    use crate::errors::ExternalToolError;
    use crate::jobs::{JobKind, RootStepJob, UnitJob};
    use crate::services::DryRunTool;
    use crate::units::WorkUnit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dispatcher(tool: Arc<dyn ComputeTool>, toml: &str, max_parallel: usize) -> Dispatcher {
        let config = Arc::new(PipelineConfig::parse(toml).unwrap());
        Dispatcher::new(tool, ResourcePredictor::new(config), max_parallel)
    }

    struct CountingTool {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ComputeTool for CountingTool {
        async fn run(&self, _invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::default())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ComputeTool for FailingTool {
        async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ExternalToolError> {
            Err(ExternalToolError::NonZeroExit {
                program: invocation.program.clone(),
                code: 1,
                stderr: "bad input".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let tool = Arc::new(CountingTool {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let d = dispatcher(tool.clone(), "", 2);
        let ctx = PipelineContext::new();
        let job = UnitJob::new(JobKind::NormalWrapper, vec![WorkUnit::new(1, 10)], false);
        let runs = (0..6).map(|_| {
            let invocation = ToolInvocation::for_job(JobKind::NormalWrapper).unwrap();
            d.run(&job, &ctx, invocation)
        });
        futures::future::try_join_all(runs).await.unwrap();
        assert!(tool.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(d.journal().summary().completed, 6);
    }

    #[tokio::test]
    async fn test_tool_failure_is_propagated_and_journaled() {
        let d = dispatcher(Arc::new(FailingTool), "", 1);
        let invocation = ToolInvocation::for_job(JobKind::Blast).unwrap();
        let err = d
            .run(&RootStepJob { kind: JobKind::Blast }, &PipelineContext::new(), invocation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Tool(ExternalToolError::NonZeroExit { code: 1, .. })
        ));
        let records = d.journal().records();
        assert_eq!(records[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_bad_model_fails_before_running() {
        let d = dispatcher(
            Arc::new(FailingTool),
            r#"
[jobs.NormalWrapper]
memory_poly = "1 x"
"#,
            1,
        );
        let job = UnitJob::new(JobKind::NormalWrapper, vec![WorkUnit::new(1, 10)], false);
        let invocation = ToolInvocation::for_job(JobKind::NormalWrapper).unwrap();
        let err = d
            .run(&job, &PipelineContext::new(), invocation)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Resource(_)));
        assert!(d.journal().records().is_empty());
    }

    #[test]
    fn test_reserve_journals_request() {
        let d = dispatcher(Arc::new(DryRunTool), "", 1);
        let ctx = PipelineContext::new().with_total_input_size(1_000);
        let request = d
            .reserve(&UnitJob::new(JobKind::BarRecursion, vec![], true), &ctx, "1 0")
            .unwrap();
        assert_eq!(request.memory, Some(2_000_000_000));
        assert_eq!(d.journal().summary().reserved, 1);
    }
}
