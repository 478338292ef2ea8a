//! Timeline model, ingestion and the working-hours gate.

pub mod ingest;
pub mod model;
pub mod working_hours;

pub use ingest::{DropDocument, assign_trackable_ids, load_timeline, save_timeline};
pub use model::{
    Delay, HandlerType, ScheduleType, TimeOfDay, Timeline, TimelineEvent, TimelineHandler,
    TimelineRecord, TimelineStatus,
};
