//! Handler execution contract and built-in activity generators.
//!
//! A handler executes one timeline event at a time. The scheduler owns the
//! event loop, the working-hours gate and the delays; a handler only has to
//! perform the activity and observe the cancellation token promptly.

pub mod command;
pub mod curl;
pub mod registry;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::timeline::{TimelineEvent, TimelineHandler, TimelineRecord};

pub use command::{CommandHandler, ShellKind};
pub use curl::CurlHandler;
pub use registry::{HandlerFactory, HandlerRegistry};

/// Everything a handler gets for one event.
#[derive(Clone, Copy)]
pub struct EventContext<'a> {
    pub handler: &'a TimelineHandler,
    pub event: &'a TimelineEvent,
    pub cancel: &'a CancellationToken,
}

impl<'a> EventContext<'a> {
    pub fn new(
        handler: &'a TimelineHandler,
        event: &'a TimelineEvent,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            handler,
            event,
            cancel,
        }
    }

    /// Build a result record for a command executed on behalf of this event.
    pub fn record(&self, command_arg: &str, result: impl Into<String>) -> TimelineRecord {
        TimelineRecord {
            handler: self.handler.handler_type.to_string(),
            command: self.event.command.clone(),
            command_arg: command_arg.to_string(),
            trackable_id: self.event.trackable_id.clone(),
            result: result.into(),
        }
    }
}

/// What an event execution produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    /// One record per command actually executed. Empty when the event was skipped.
    pub records: Vec<TimelineRecord>,
}

impl HandlerOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn is_skipped(&self) -> bool {
        self.records.is_empty()
    }
}

/// Contract every activity generator implements.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Execute one event. Must return `HandlerError::Cancelled` soon after the
    /// context's token is cancelled.
    async fn execute(&self, ctx: EventContext<'_>) -> Result<HandlerOutcome, HandlerError>;
}
