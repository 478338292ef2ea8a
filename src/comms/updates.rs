//! Polling fallback: update retrieval and result submission over plain HTTP.
//!
//! Works whether or not the persistent channel is up. Both loops sleep their
//! configured cycle with ±25% jitter so a fleet of agents does not poll in lockstep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::identity::MachineIdentity;
use crate::config::{AgentConfig, ControlPlaneUrls};
use crate::error::{TimelineError, TransportError};
use crate::scheduler::Orchestrator;
use crate::timeline::ingest::prepare_timeline;
use crate::timeline::{Timeline, load_timeline, save_timeline};

/// Suffix given to result logs whose upload failed.
pub const NOT_POSTED_SUFFIX: &str = ".not_posted.log";

/// Kinds of update the control plane hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    RequestForTimeline,
    Timeline,
    TimelinePartial,
    Health,
    #[serde(other)]
    Unknown,
}

/// One pending update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientUpdate {
    #[serde(default, alias = "id")]
    pub id: Option<serde_json::Value>,
    #[serde(rename = "Type", alias = "type")]
    pub update_type: UpdateType,
    #[serde(default, alias = "update")]
    pub update: serde_json::Value,
}

/// Parse a timeline carried either as a JSON object or as a JSON-encoded string.
pub fn timeline_from_payload(payload: &serde_json::Value) -> Result<Timeline, TimelineError> {
    let mut timeline: Timeline = match payload {
        serde_json::Value::String(raw) => serde_json::from_str(raw)?,
        other => serde_json::from_value(other.clone())?,
    };
    prepare_timeline(&mut timeline);
    Ok(timeline)
}

/// Run every handler of a partial timeline ad hoc. Returns how many launched.
pub async fn run_timeline_partial(
    orchestrator: &Orchestrator,
    payload: &serde_json::Value,
) -> Result<usize, TimelineError> {
    let timeline = timeline_from_payload(payload)?;
    let mut launched = 0;
    for handler in timeline.handlers {
        let handler_type = handler.handler_type.clone();
        match orchestrator.run_command_for(timeline.id, handler).await {
            Ok(_) => launched += 1,
            Err(e) => tracing::warn!(
                handler = %handler_type,
                "Partial timeline handler not launched: {}",
                e
            ),
        }
    }
    Ok(launched)
}

/// Scale `base` by a random factor in [0.75, 1.25].
pub fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

/// HTTP client for the polling endpoints.
pub struct UpdatesClient {
    client: reqwest::Client,
    identity: Arc<MachineIdentity>,
    urls: ControlPlaneUrls,
    orchestrator: Arc<Orchestrator>,
    timeline_path: PathBuf,
    health_file: PathBuf,
    results_log: PathBuf,
}

impl UpdatesClient {
    pub fn new(
        config: &AgentConfig,
        client: reqwest::Client,
        identity: Arc<MachineIdentity>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            client,
            identity,
            urls: config.urls(),
            orchestrator,
            timeline_path: config.timeline.location.clone(),
            health_file: config.health_file(),
            results_log: config.results_log(),
        }
    }

    /// Fetch and apply one pending update. `Ok(None)` when there is nothing to do.
    pub async fn check_updates(&self) -> Result<Option<UpdateType>, TransportError> {
        let response = self
            .client
            .get(&self.urls.updates)
            .headers(self.identity.headers())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: self.urls.updates.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let update: ClientUpdate = serde_json::from_str(&body)?;
        let update_type = update.update_type.clone();
        self.apply_update(update).await?;
        Ok(Some(update_type))
    }

    /// Act on one update.
    pub async fn apply_update(&self, update: ClientUpdate) -> Result<(), TransportError> {
        tracing::info!(update_type = ?update.update_type, "Applying client update");
        let invalid = |e: TimelineError| TransportError::InvalidMessage(e.to_string());

        match update.update_type {
            UpdateType::RequestForTimeline => self.post_timeline().await,
            UpdateType::Timeline => {
                let timeline = timeline_from_payload(&update.update).map_err(invalid)?;
                // The timeline watcher picks up the rewritten file and reloads.
                save_timeline(&self.timeline_path, &timeline).map_err(invalid)?;
                tracing::info!(timeline_id = %timeline.id, "Local timeline replaced");
                Ok(())
            }
            UpdateType::TimelinePartial => {
                let launched = run_timeline_partial(&self.orchestrator, &update.update)
                    .await
                    .map_err(invalid)?;
                tracing::info!(launched, "Partial timeline launched");
                Ok(())
            }
            UpdateType::Health => {
                let parent = self.health_file.parent();
                if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let body = serde_json::to_vec_pretty(&update.update)?;
                tokio::fs::write(&self.health_file, body).await?;
                Ok(())
            }
            UpdateType::Unknown => {
                tracing::warn!("Ignoring update of unknown type");
                Ok(())
            }
        }
    }

    /// Send the running timeline (or the local file) to the control plane.
    pub async fn post_timeline(&self) -> Result<(), TransportError> {
        let timeline = match self.orchestrator.current_timeline().await {
            Some(timeline) => timeline.as_ref().clone(),
            None => load_timeline(&self.timeline_path)
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?,
        };

        let response = self
            .client
            .post(&self.urls.timeline)
            .headers(self.identity.headers())
            .json(&timeline)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: self.urls.timeline.clone(),
                status: response.status().as_u16(),
            });
        }
        tracing::info!(timeline_id = %timeline.id, "Timeline posted");
        Ok(())
    }

    /// Upload the results log plus any earlier failed uploads. Returns files posted.
    pub async fn post_results(&self) -> Result<usize, TransportError> {
        let mut pending = self.not_posted_logs();

        if self.results_log.exists() {
            let staged = unique_sibling(&self.results_log, ".posting.log");
            tokio::fs::rename(&self.results_log, &staged).await?;
            pending.push(staged);
        }

        let mut posted = 0;
        for path in pending {
            match self.post_log(&path).await {
                Ok(()) => {
                    tokio::fs::remove_file(&path).await?;
                    posted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Results not posted: {}", e);
                    if !path.to_string_lossy().ends_with(NOT_POSTED_SUFFIX) {
                        let target = unique_sibling(&self.results_log, NOT_POSTED_SUFFIX);
                        tokio::fs::rename(&path, target).await?;
                    }
                }
            }
        }
        Ok(posted)
    }

    async fn post_log(&self, path: &Path) -> Result<(), TransportError> {
        let log = tokio::fs::read_to_string(path).await?;
        if log.trim().is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.urls.results)
            .headers(self.identity.headers())
            .json(&serde_json::json!({ "Log": log }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                url: self.urls.results.clone(),
                status: response.status().as_u16(),
            })
        }
    }

    /// Earlier failed uploads sitting next to the results log.
    fn not_posted_logs(&self) -> Vec<PathBuf> {
        let dir = self
            .results_log
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let pattern = dir.join(format!("*{}", NOT_POSTED_SUFFIX));
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                tracing::warn!("Invalid results glob: {}", e);
                Vec::new()
            }
        }
    }

    /// Poll for updates until shutdown.
    pub fn spawn_updates_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.check_updates().await {
                    Ok(Some(update_type)) => tracing::debug!(?update_type, "Update handled"),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Update check failed: {}", e),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(jittered(interval)) => {}
                }
            }
            tracing::debug!("Update polling stopped");
        })
    }

    /// Post results until shutdown.
    pub fn spawn_results_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(jittered(interval)) => {}
                }
                match self.post_results().await {
                    Ok(0) => {}
                    Ok(posted) => tracing::info!(posted, "Results posted"),
                    Err(e) => tracing::warn!("Result posting failed: {}", e),
                }
            }
            tracing::debug!("Result posting stopped");
        })
    }
}

/// `<dir>/<stem>-<uuid><suffix>` next to `path`.
fn unique_sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    path.with_file_name(format!("{}-{}{}", stem, Uuid::new_v4(), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_type_parsing() {
        let update: ClientUpdate =
            serde_json::from_str(r#"{"Id": 4, "Type": "Health", "Update": {"ok": true}}"#).unwrap();
        assert_eq!(update.update_type, UpdateType::Health);

        let unknown: ClientUpdate = serde_json::from_str(r#"{"type": "Survey"}"#).unwrap();
        assert_eq!(unknown.update_type, UpdateType::Unknown);
    }

    #[test]
    fn timeline_payload_as_string_or_object() {
        let object = serde_json::json!({
            "TimeLineHandlers": [{"HandlerType": "Command", "TimeLineEvents": [{"Command": "x"}]}]
        });
        let from_object = timeline_from_payload(&object).unwrap();
        assert!(!from_object.handlers[0].events[0].trackable_id.is_empty());

        let string = serde_json::Value::String(object.to_string());
        let from_string = timeline_from_payload(&string).unwrap();
        assert_eq!(from_string.handlers.len(), 1);
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(100));
            assert!(d >= Duration::from_secs(75) && d <= Duration::from_secs(125));
        }
    }

    #[test]
    fn unique_sibling_names() {
        let path = Path::new("/tmp/instance/clientupdates.log");
        let sibling = unique_sibling(path, NOT_POSTED_SUFFIX);
        let name = sibling.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("clientupdates-"));
        assert!(name.ends_with(".not_posted.log"));
        assert_eq!(sibling.parent(), path.parent());
    }
}
