//! Scoped lifetime of the secondary store.

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::dispatch::Dispatcher;
use crate::errors::PipelineResult;
use crate::jobs::{JobKind, StoreServiceJob};
use crate::services::StoreService;

/// Starts the secondary store before a recursive dispatch and always tears it down after.
pub struct ServiceCoordinator {
    service: Arc<dyn StoreService>,
    dispatcher: Arc<Dispatcher>,
}

impl ServiceCoordinator {
    pub fn new(service: Arc<dyn StoreService>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            service,
            dispatcher,
        }
    }

    /// Run `body` with the secondary connection in its context.
    ///
    /// Teardown happens whether `body` succeeds or fails; a body error wins
    /// over a teardown error. The returned context has no secondary connection.
    pub async fn with_secondary_service<F, Fut>(
        &self,
        ctx: PipelineContext,
        body: F,
    ) -> PipelineResult<PipelineContext>
    where
        F: FnOnce(PipelineContext) -> Fut,
        Fut: Future<Output = PipelineResult<PipelineContext>>,
    {
        if !self.service.requires_live_service() {
            let ctx = body(ctx.with_secondary_store(Some(self.service.descriptor()))).await?;
            return Ok(ctx.with_secondary_store(None));
        }

        let descriptor = self.service.descriptor();
        self.dispatcher.reserve(
            &StoreServiceJob {
                kind: JobKind::SecondaryStore,
            },
            &ctx,
            descriptor.as_str(),
        )?;

        let connection = self.service.start(None).await?;
        info!(store = %connection, "secondary store started");

        let result = body(ctx.with_secondary_store(Some(connection))).await;
        let stopped = self.service.stop().await;
        info!(store = %descriptor, "secondary store stopped");

        match (result, stopped) {
            (Ok(ctx), Ok(())) => Ok(ctx.with_secondary_store(None)),
            (Ok(_), Err(stop_err)) => Err(stop_err.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop_err)) => {
                warn!(store = %descriptor, error = %stop_err, "teardown failed after phase error");
                Err(e)
            }
        }
    }
}
