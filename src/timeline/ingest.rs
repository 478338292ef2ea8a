//! Ingestion of timelines and ad-hoc handlers from files and sockets.

use std::path::Path;

use uuid::Uuid;

use crate::error::TimelineError;
use crate::timeline::model::{Timeline, TimelineHandler};

/// A document dropped into the listener directory.
#[derive(Debug, Clone, PartialEq)]
pub enum DropDocument {
    Timeline(Timeline),
    Handler(TimelineHandler),
}

impl DropDocument {
    /// Handlers contained in the document, in order.
    pub fn into_handlers(self) -> Vec<TimelineHandler> {
        match self {
            DropDocument::Timeline(timeline) => timeline.handlers,
            DropDocument::Handler(handler) => vec![handler],
        }
    }
}

/// Give every event without a trackable id a fresh one. Returns how many were assigned.
pub fn assign_trackable_ids(handler: &mut TimelineHandler) -> usize {
    let mut assigned = 0;
    for event in handler
        .events
        .iter_mut()
        .filter(|e| e.trackable_id.trim().is_empty())
    {
        event.trackable_id = Uuid::new_v4().to_string();
        assigned += 1;
    }
    assigned
}

/// Assign ids across a whole timeline, and give the timeline itself an id if it has none.
pub fn prepare_timeline(timeline: &mut Timeline) -> usize {
    if timeline.id.is_nil() {
        timeline.id = Uuid::new_v4();
    }
    timeline.handlers.iter_mut().map(assign_trackable_ids).sum()
}

/// Parse a full timeline document.
pub fn parse_timeline(raw: &str) -> Result<Timeline, TimelineError> {
    if raw.trim().is_empty() {
        return Err(TimelineError::Empty);
    }
    let mut timeline: Timeline = serde_json::from_str(raw)?;
    prepare_timeline(&mut timeline);
    Ok(timeline)
}

/// Parse one socket message as a single handler.
///
/// Anything after the last closing brace (delimiters, stray bytes) is dropped.
pub fn parse_handler(raw: &str) -> Result<TimelineHandler, TimelineError> {
    let trimmed = match raw.rfind('}') {
        Some(end) => &raw[..=end],
        None => raw.trim(),
    };
    if trimmed.trim().is_empty() {
        return Err(TimelineError::Empty);
    }
    let mut handler: TimelineHandler = serde_json::from_str(trimmed)?;
    assign_trackable_ids(&mut handler);
    Ok(handler)
}

/// Parse a dropped file, which may hold either a full timeline or a single handler.
pub fn parse_drop_document(raw: &str) -> Result<DropDocument, TimelineError> {
    if raw.trim().is_empty() {
        return Err(TimelineError::Empty);
    }
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let is_timeline = value.as_object().is_some_and(|obj| {
        ["TimeLineHandlers", "timeLineHandlers", "handlers"]
            .iter()
            .any(|key| obj.contains_key(*key))
    });

    if is_timeline {
        let mut timeline: Timeline = serde_json::from_value(value)?;
        prepare_timeline(&mut timeline);
        Ok(DropDocument::Timeline(timeline))
    } else {
        let mut handler: TimelineHandler = serde_json::from_value(value)?;
        assign_trackable_ids(&mut handler);
        Ok(DropDocument::Handler(handler))
    }
}

/// Read and parse the timeline file at `path`.
pub fn load_timeline(path: &Path) -> Result<Timeline, TimelineError> {
    let raw = std::fs::read_to_string(path).map_err(|source| TimelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_timeline(&raw)
}

/// Overwrite the timeline file at `path`.
pub fn save_timeline(path: &Path, timeline: &Timeline) -> Result<(), TimelineError> {
    let body = serde_json::to_string_pretty(timeline)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| TimelineError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, body).map_err(|source| TimelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}
