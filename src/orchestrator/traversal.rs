//! Recursive walk of the work tree for one phase.
//!
//! Each level is a recursion job over a list of units. It asks the store for
//! the children of those units, decomposes them into child recursions, and
//! regroups its own units into wrapper jobs. The phase's `RecursionPlan`
//! decides the order of the two and which follow-up runs once both finished.

use futures::future::{BoxFuture, FutureExt, try_join, try_join_all};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AttributeBag, AttributeSource, PipelineConfig, resolve};
use crate::context::PipelineContext;
use crate::dispatch::Dispatcher;
use crate::errors::PipelineResult;
use crate::jobs::{
    JobKind, MergeJob, ResourceEstimable, RecursionPlan, SubItemJob, TraversalOrder, UnitJob,
    WrapperStep,
};
use crate::phase::PhaseName;
use crate::recursion::{
    DispatchGroup, ExtendingDispatch, GroupingThresholds, SubItem, decompose, plan_extension,
    secondary_layout, split_secondary,
};
use crate::services::{ArtifactHandle, ToolInvocation, UnitStore};
use crate::units::{ROOT_UNIT, WorkUnit, encode_unit_names};

/// Inputs shared by every level of one walk.
struct Walk<'a> {
    plan: RecursionPlan,
    phase: PhaseName,
    params: &'a AttributeBag,
    ctx: &'a PipelineContext,
    thresholds: GroupingThresholds,
    very_large_size: u64,
}

pub struct RecursionEngine {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    units: Arc<dyn UnitStore>,
}

impl RecursionEngine {
    pub fn new(
        config: Arc<PipelineConfig>,
        dispatcher: Arc<Dispatcher>,
        units: Arc<dyn UnitStore>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            units,
        }
    }

    /// Walk the whole tree from the root unit and return the root level's artifacts.
    ///
    /// `params` is the in-memory phase bag passed to every program.
    pub async fn walk(
        &self,
        plan: RecursionPlan,
        params: &AttributeBag,
        ctx: &PipelineContext,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let phase = plan.recursion.phase();
        let thresholds = GroupingThresholds::resolve(&self.config, phase, plan.recursion)?;
        let very_large_size = self.very_large_size(phase, plan)?;
        let walk = Walk {
            plan,
            phase,
            params,
            ctx,
            thresholds,
            very_large_size,
        };

        info!(
            phase = %phase,
            recursion = %plan.recursion,
            max_group_size = thresholds.max_group_size,
            "walking work tree"
        );
        let root = WorkUnit::new(ROOT_UNIT, ctx.total_input_size());
        self.level(&walk, vec![root], true, true).await
    }

    fn very_large_size(&self, phase: PhaseName, plan: RecursionPlan) -> PipelineResult<u64> {
        let tunables = self.config.phase_spec(phase)?.tunables;
        let WrapperStep::Extending { oversize, .. } = plan.wrapper else {
            return Ok(tunables.very_large_size);
        };
        let location = format!("jobs.{}", oversize);
        let job = AttributeSource::new(&location, self.config.job_bag(oversize));
        Ok(resolve(&[(job, "very_large_size")], tunables.very_large_size)?)
    }

    fn level<'a>(
        &'a self,
        walk: &'a Walk<'a>,
        units: Vec<WorkUnit>,
        oversize: bool,
        top: bool,
    ) -> BoxFuture<'a, PipelineResult<Vec<ArtifactHandle>>> {
        self.run_level(walk, units, oversize, top).boxed()
    }

    async fn run_level(
        &self,
        walk: &Walk<'_>,
        units: Vec<WorkUnit>,
        oversize: bool,
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let names = encode_unit_names(units.iter().map(|u| u.id));
        self.dispatcher.reserve(
            &UnitJob::new(walk.plan.recursion, units.clone(), oversize),
            walk.ctx,
            &names,
        )?;

        let children = self
            .units
            .child_units(walk.ctx.primary_store(), &units)
            .await?;
        let child_groups = decompose(&children, &walk.thresholds)?;
        // A level's own units passed the size filter when its parent grouped them.
        let wrapper_groups = decompose(&units, &walk.thresholds.without_minimum())?;
        debug!(
            phase = %walk.phase,
            units = %names,
            children = children.len(),
            child_groups = child_groups.len(),
            wrapper_groups = wrapper_groups.len(),
            "level decomposed"
        );

        let wrappers = self.run_step(walk, walk.plan.wrapper, &wrapper_groups, top);
        let descend = self.descend(walk, child_groups);
        let mut artifacts = match walk.plan.order {
            TraversalOrder::ChildrenFirst => {
                descend.await?;
                wrappers.await?
            }
            TraversalOrder::WrappersFirst => {
                let artifacts = wrappers.await?;
                descend.await?;
                artifacts
            }
            TraversalOrder::Concurrent => try_join(wrappers, descend).await?.0,
        };

        if let Some(step) = walk.plan.follow_up {
            artifacts.extend(self.run_step(walk, step, &wrapper_groups, top).await?);
        }
        Ok(artifacts)
    }

    /// Child recursions run in parallel. Their artifacts stay at their own level.
    async fn descend(&self, walk: &Walk<'_>, groups: Vec<DispatchGroup>) -> PipelineResult<()> {
        let subtrees: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let oversize = group.is_oversize();
                self.level(walk, group.units().to_vec(), oversize, false)
            })
            .collect();
        try_join_all(subtrees).await?;
        Ok(())
    }

    async fn run_step(
        &self,
        walk: &Walk<'_>,
        step: WrapperStep,
        groups: &[DispatchGroup],
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let runs: Vec<_> = groups
            .iter()
            .map(|group| self.run_group(walk, step, group, top))
            .collect();
        let outputs = try_join_all(runs).await?;
        Ok(outputs.into_iter().flatten().collect())
    }

    async fn run_group(
        &self,
        walk: &Walk<'_>,
        step: WrapperStep,
        group: &DispatchGroup,
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        match step {
            WrapperStep::Primary { kind } => {
                self.dispatch_units(walk, kind, group.units(), group.is_oversize(), top)
                    .await
            }
            WrapperStep::Secondary { kind } => {
                let units = group.units();
                let max = walk.thresholds.max_secondary_group_size;
                let layout = match self
                    .units
                    .secondary_layout(walk.ctx.primary_store(), units, max)
                    .await?
                {
                    Some(layout) => layout,
                    None => secondary_layout(units, max),
                };
                let pieces = split_secondary(units, &layout)?;
                let runs: Vec<_> = pieces
                    .iter()
                    .map(|piece| self.dispatch_units(walk, kind, piece, group.is_oversize(), top))
                    .collect();
                let outputs = try_join_all(runs).await?;
                Ok(outputs.into_iter().flatten().collect())
            }
            WrapperStep::Extending { normal, oversize } => match group {
                DispatchGroup::Oversize(unit) => self.extend(walk, oversize, *unit, top).await,
                DispatchGroup::Batch(units) => {
                    self.dispatch_units(walk, normal, units, false, top).await
                }
            },
        }
    }

    async fn dispatch_units(
        &self,
        walk: &Walk<'_>,
        kind: JobKind,
        units: &[WorkUnit],
        oversize: bool,
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let job = UnitJob::new(kind, units.to_vec(), oversize);
        self.run_or_reserve(walk, &job, units, top, |inv| inv).await
    }

    /// Diagnose an oversize unit, precompute its sub-items, then merge.
    async fn extend(
        &self,
        walk: &Walk<'_>,
        kind: JobKind,
        unit: WorkUnit,
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let diagnose = UnitJob::new(kind, vec![unit], true);
        let messages = match self.invocation(walk, kind, &[unit], top) {
            Some(invocation) => self.dispatcher.run(&diagnose, walk.ctx, invocation).await?.messages,
            None => Vec::new(),
        };
        let items = messages
            .iter()
            .map(|line| SubItem::parse(line))
            .collect::<Result<Vec<_>, _>>()?;
        let item_count = items.len();
        let dispatches = plan_extension(
            items,
            walk.thresholds.max_group_size,
            walk.very_large_size,
        );
        info!(
            unit = unit.id,
            sub_items = item_count,
            dispatches = dispatches.len(),
            "extending oversize unit"
        );

        let runs: Vec<_> = dispatches
            .iter()
            .map(|dispatch| self.end_align(walk, unit, dispatch, top))
            .collect();
        let outputs = try_join_all(runs).await?;
        let precomputed: Vec<ArtifactHandle> = outputs.into_iter().flatten().collect();

        let merge = MergeJob {
            kind: JobKind::BarWithPrecomputed,
            units: vec![unit],
            precomputed_size: precomputed.iter().map(|a| a.size).sum(),
        };
        let paths: Vec<String> = precomputed
            .iter()
            .map(|a| a.path.display().to_string())
            .collect();
        self.run_or_reserve(walk, &merge, &[unit], top, |inv| {
            inv.with_param("precomputed", paths)
        })
        .await
    }

    async fn end_align(
        &self,
        walk: &Walk<'_>,
        unit: WorkUnit,
        dispatch: &ExtendingDispatch,
        top: bool,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let job = SubItemJob {
            kind: JobKind::BarEndAligner,
            units: vec![unit],
            items: dispatch.items().to_vec(),
            oversize: dispatch.is_isolated(),
        };
        let ids: Vec<u64> = dispatch.items().iter().map(|i| i.id).collect();
        let isolated = dispatch.is_isolated();
        self.run_or_reserve(walk, &job, &[unit], top, |inv| {
            inv.with_param("sub_items", ids)
                .with_param("isolated", isolated)
        })
        .await
    }

    /// Run the job's program, or only reserve the job when its kind runs none.
    async fn run_or_reserve(
        &self,
        walk: &Walk<'_>,
        job: &dyn ResourceEstimable,
        units: &[WorkUnit],
        top: bool,
        extra: impl FnOnce(ToolInvocation) -> ToolInvocation,
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        match self.invocation(walk, job.kind(), units, top) {
            Some(invocation) => Ok(self
                .dispatcher
                .run(job, walk.ctx, extra(invocation))
                .await?
                .artifacts),
            None => {
                let names = encode_unit_names(units.iter().map(|u| u.id));
                self.dispatcher.reserve(job, walk.ctx, &names)?;
                Ok(Vec::new())
            }
        }
    }

    fn invocation(
        &self,
        walk: &Walk<'_>,
        kind: JobKind,
        units: &[WorkUnit],
        top: bool,
    ) -> Option<ToolInvocation> {
        Some(
            ToolInvocation::for_job(kind)?
                .with_store(walk.ctx.primary_store())
                .with_secondary_store(walk.ctx.secondary_store())
                .with_units(units.iter().map(|u| u.id))
                .with_param("top_level", top)
                .with_params(walk.params),
        )
    }
}
