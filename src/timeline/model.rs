//! Timeline data model.
//!
//! Field names serialize in PascalCase (the format timeline files are written
//! in); camelCase spellings are accepted as aliases on input.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::TimelineError;

/// Seconds in one day.
pub const SECONDS_PER_DAY: u32 = 86_400;

/// A script of handlers to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Timeline {
    #[serde(default, alias = "id")]
    pub id: Uuid,
    #[serde(default, alias = "status")]
    pub status: TimelineStatus,
    #[serde(
        default,
        rename = "TimeLineHandlers",
        alias = "timeLineHandlers",
        alias = "handlers"
    )]
    pub handlers: Vec<TimelineHandler>,
}

impl Timeline {
    /// Wrap a single ad-hoc handler in a fresh, running timeline.
    pub fn adhoc(handler: TimelineHandler) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TimelineStatus::Run,
            handlers: vec![handler],
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TimelineStatus::Run
    }

    /// Number of handlers of the given type.
    pub fn count_of(&self, handler_type: &HandlerType) -> usize {
        self.handlers
            .iter()
            .filter(|h| &h.handler_type == handler_type)
            .count()
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TimelineStatus::Run,
            handlers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineStatus {
    #[default]
    Run,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleType {
    #[default]
    Other,
    Cron,
}

/// One activity stream: a handler type plus its ordered events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimelineHandler {
    #[serde(alias = "handlerType")]
    pub handler_type: HandlerType,
    /// Seed value handed to the handler (start page, shell, ...).
    #[serde(default, alias = "initial")]
    pub initial: String,
    #[serde(default, alias = "utcTimeOn")]
    pub utc_time_on: TimeOfDay,
    #[serde(default, alias = "utcTimeOff")]
    pub utc_time_off: TimeOfDay,
    /// Optional `[start, end, start, end, ...]` pairs further restricting activity.
    #[serde(default, alias = "utcTimeBlocks", skip_serializing_if = "Vec::is_empty")]
    pub utc_time_blocks: Vec<TimeOfDay>,
    #[serde(default, alias = "handlerArgs")]
    pub handler_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "Loop", alias = "loop")]
    pub looping: bool,
    #[serde(default, alias = "scheduleType")]
    pub schedule_type: ScheduleType,
    #[serde(default, alias = "schedule", skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(
        default,
        rename = "TimeLineEvents",
        alias = "timeLineEvents",
        alias = "events"
    )]
    pub events: Vec<TimelineEvent>,
}

impl TimelineHandler {
    pub fn new(handler_type: HandlerType) -> Self {
        Self {
            handler_type,
            initial: String::new(),
            utc_time_on: TimeOfDay::MIDNIGHT,
            utc_time_off: TimeOfDay::MIDNIGHT,
            utc_time_blocks: Vec::new(),
            handler_args: serde_json::Map::new(),
            looping: false,
            schedule_type: ScheduleType::Other,
            schedule: None,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: TimelineEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn is_cron(&self) -> bool {
        self.schedule_type == ScheduleType::Cron
    }

    /// Integer handler argument, accepting numbers or numeric strings.
    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        match self.handler_args.get(key)? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// One unit of work within a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimelineEvent {
    /// Correlation key for result reporting. Assigned at ingestion when empty.
    #[serde(default, alias = "trackableId", deserialize_with = "null_as_empty")]
    pub trackable_id: String,
    #[serde(default, alias = "command", deserialize_with = "null_as_empty")]
    pub command: String,
    #[serde(default, alias = "commandArgs", deserialize_with = "string_list")]
    pub command_args: Vec<String>,
    #[serde(default, alias = "delayBefore")]
    pub delay_before: Delay,
    #[serde(default, alias = "delayAfter")]
    pub delay_after: Delay,
}

impl TimelineEvent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delays(mut self, before_ms: u64, after_ms: u64) -> Self {
        self.delay_before = Delay::Millis(before_ms);
        self.delay_after = Delay::Millis(after_ms);
        self
    }
}

/// Delay in milliseconds, either fixed or drawn uniformly from a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delay {
    Millis(u64),
    Random {
        #[serde(default)]
        random: bool,
        #[serde(default)]
        min: u64,
        #[serde(default)]
        max: u64,
    },
}

impl Default for Delay {
    fn default() -> Self {
        Delay::Millis(0)
    }
}

impl Delay {
    /// Concrete duration for one execution.
    pub fn resolve(&self) -> Duration {
        match *self {
            Delay::Millis(ms) => Duration::from_millis(ms),
            Delay::Random { random: true, min, max } => {
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
            }
            Delay::Random { min, .. } => Duration::from_millis(min),
        }
    }
}

/// Activity type tag. Unknown names are kept verbatim so that they are
/// rejected when launched rather than when the timeline is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HandlerType {
    BrowserChrome,
    BrowserFirefox,
    Command,
    Bash,
    Curl,
    Notepad,
    Outlook,
    Word,
    Excel,
    PowerPoint,
    Pidgin,
    Ssh,
    Sftp,
    Watcher,
    Other(String),
}

impl HandlerType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BrowserChrome => "BrowserChrome",
            Self::BrowserFirefox => "BrowserFirefox",
            Self::Command => "Command",
            Self::Bash => "Bash",
            Self::Curl => "Curl",
            Self::Notepad => "Notepad",
            Self::Outlook => "Outlook",
            Self::Word => "Word",
            Self::Excel => "Excel",
            Self::PowerPoint => "PowerPoint",
            Self::Pidgin => "Pidgin",
            Self::Ssh => "Ssh",
            Self::Sftp => "Sftp",
            Self::Watcher => "Watcher",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for HandlerType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "browserchrome" => Self::BrowserChrome,
            "browserfirefox" => Self::BrowserFirefox,
            "command" => Self::Command,
            "bash" => Self::Bash,
            "curl" => Self::Curl,
            "notepad" => Self::Notepad,
            "outlook" => Self::Outlook,
            "word" => Self::Word,
            "excel" => Self::Excel,
            "powerpoint" => Self::PowerPoint,
            "pidgin" => Self::Pidgin,
            "ssh" => Self::Ssh,
            "sftp" => Self::Sftp,
            "watcher" => Self::Watcher,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

impl From<String> for HandlerType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<HandlerType> for String {
    fn from(t: HandlerType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UTC time of day, serialized as `HH:MM:SS`. `24:00:00` is accepted as end of day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u32);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_hms(hours: u32, minutes: u32, seconds: u32) -> Self {
        Self((hours * 3600 + minutes * 60 + seconds).min(SECONDS_PER_DAY))
    }

    pub fn now_utc() -> Self {
        Self(Utc::now().num_seconds_from_midnight())
    }

    pub fn seconds(self) -> u32 {
        self.0
    }

    pub fn is_midnight(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for TimeOfDay {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TimelineError::InvalidTimeOfDay(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid());
        }

        let mut values = [0u32; 3];
        for (slot, part) in values.iter_mut().zip(&parts) {
            // Fractional seconds are dropped.
            let whole = part.split('.').next().unwrap_or_default();
            *slot = whole.parse().map_err(|_| invalid())?;
        }

        let [h, m, sec] = values;
        if m > 59 || sec > 59 || h > 24 || (h == 24 && (m > 0 || sec > 0)) {
            return Err(invalid());
        }
        Ok(Self::from_hms(h, m, sec))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, rem) = (self.0 / 3600, self.0 % 3600);
        write!(f, "{:02}:{:02}:{:02}", h, rem / 60, rem % 60)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(Self::MIDNIGHT),
            Some(s) if s.trim().is_empty() => Ok(Self::MIDNIGHT),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Result record sent back to the control plane for one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimelineRecord {
    pub handler: String,
    pub command: String,
    pub command_arg: String,
    pub trackable_id: String,
    pub result: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Command arguments arrive as arbitrary JSON scalars; keep them as strings.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
        .collect())
}
