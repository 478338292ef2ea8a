//! Execution unit: runs one handler's event sequence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::ResultSink;
use crate::error::HandlerError;
use crate::handlers::{EventContext, Handler};
use crate::timeline::TimelineHandler;
use crate::timeline::working_hours::{sleep_or_cancel, wait_for_window};

/// Everything one execution unit needs.
#[derive(Clone)]
pub struct UnitContext {
    pub job_id: Uuid,
    pub definition: Arc<TimelineHandler>,
    pub handler: Arc<dyn Handler>,
    pub sink: Arc<dyn ResultSink>,
    pub cancel: CancellationToken,
}

/// Why a unit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    Completed { executions: usize },
    Cancelled { executions: usize },
}

impl UnitExit {
    pub fn executions(self) -> usize {
        match self {
            UnitExit::Completed { executions } | UnitExit::Cancelled { executions } => executions,
        }
    }
}

/// Marker for a pass interrupted by cancellation; carries executions done so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted(pub usize);

/// Run the events once, in order. Returns the number of handler invocations.
///
/// A failing event is logged and the pass moves on to the next event.
pub async fn run_pass(ctx: &UnitContext) -> Result<usize, Interrupted> {
    let definition = ctx.definition.as_ref();
    let mut executions = 0;

    for event in &definition.events {
        if !wait_for_window(definition, &ctx.cancel).await {
            return Err(Interrupted(executions));
        }
        if !sleep_or_cancel(event.delay_before.resolve(), &ctx.cancel).await {
            return Err(Interrupted(executions));
        }
        if ctx.cancel.is_cancelled() {
            return Err(Interrupted(executions));
        }

        let result = ctx
            .handler
            .execute(EventContext::new(definition, event, &ctx.cancel))
            .await;
        executions += 1;

        match result {
            Ok(outcome) if outcome.is_skipped() => {}
            Ok(outcome) => ctx.sink.report(&outcome.records).await,
            Err(HandlerError::Cancelled) => return Err(Interrupted(executions)),
            Err(e) => {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    handler = %definition.handler_type,
                    trackable_id = %event.trackable_id,
                    "Event failed: {}",
                    e
                );
            }
        }

        if !sleep_or_cancel(event.delay_after.resolve(), &ctx.cancel).await {
            return Err(Interrupted(executions));
        }
    }

    Ok(executions)
}

/// Run the handler until its events are done (or forever when looping),
/// stopping at the first cancellation boundary.
pub async fn run_unit(ctx: UnitContext) -> UnitExit {
    let definition = ctx.definition.clone();
    if definition.events.is_empty() {
        tracing::warn!(
            job_id = %ctx.job_id,
            handler = %definition.handler_type,
            "Handler has no events"
        );
        return UnitExit::Completed { executions: 0 };
    }

    tracing::info!(
        job_id = %ctx.job_id,
        handler = %definition.handler_type,
        looping = definition.looping,
        "Execution unit started"
    );

    let mut total = 0;
    let exit = loop {
        match run_pass(&ctx).await {
            Ok(executions) => total += executions,
            Err(Interrupted(executions)) => {
                break UnitExit::Cancelled {
                    executions: total + executions,
                };
            }
        }
        if !definition.looping {
            break UnitExit::Completed { executions: total };
        }
        if ctx.cancel.is_cancelled() {
            break UnitExit::Cancelled { executions: total };
        }
        tokio::task::yield_now().await;
    };

    tracing::info!(
        job_id = %ctx.job_id,
        handler = %definition.handler_type,
        ?exit,
        "Execution unit finished"
    );
    exit
}
