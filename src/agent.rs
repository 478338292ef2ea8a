//! Wires every component from configuration and runs until shutdown.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::comms::{
    Connection, ConnectionSettings, MachineIdentity, Reporter, ResultSink, UpdatesClient,
    delivery_queue,
};
use crate::config::AgentConfig;
use crate::error::{Result, TransportError};
use crate::handlers::HandlerRegistry;
use crate::listeners::{DirectoryListener, SocketListener};
use crate::safety_net::{Reaper, SafetyNet};
use crate::scheduler::{Orchestrator, SchedulerSettings};
use crate::watch::{StopWatcher, TimelineWatcher, WatcherHandle, watch_dir_for};

/// Upper bound on waiting for background tasks after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Timeout for control plane HTTP requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A running agent.
pub struct Agent {
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    watchers: Vec<WatcherHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Build and start every enabled component.
    pub async fn start(config: AgentConfig) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut watchers = Vec::new();
        let mut tasks = Vec::new();

        std::fs::create_dir_all(&config.instance_directory)?;
        let identity = Arc::new(MachineIdentity::detect(config.id_file()));
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TransportError::from)?;

        let (reporter, queue) = if config.sockets.is_enabled {
            let (sender, receiver) = delivery_queue();
            (Reporter::queue(sender), Some(receiver))
        } else {
            (Reporter::log(config.results_log()), None)
        };
        let sink: Arc<dyn ResultSink> = Arc::new(reporter);

        let mut orchestrator = Orchestrator::new(
            SchedulerSettings::from_config(&config),
            Arc::new(HandlerRegistry::with_builtins()),
            sink,
        );
        if config.resource_control.manage_processes {
            orchestrator = orchestrator.with_reaper(Reaper::system());
        }
        let orchestrator = Arc::new(orchestrator);

        if config.handlers_is_enabled {
            match orchestrator.start_from_file().await {
                Ok(launched) => tracing::info!(launched, "Initial timeline started"),
                Err(e) => tracing::warn!(
                    path = %config.timeline.location.display(),
                    "Initial timeline not started: {}",
                    e
                ),
            }
        } else {
            tracing::info!("Handlers disabled, timeline not started");
        }

        std::fs::create_dir_all(watch_dir_for(&config.timeline.location))?;
        let timeline_watcher = Arc::new(TimelineWatcher::new(
            orchestrator.clone(),
            config.timeline.location.clone(),
        ));
        watchers.push(timeline_watcher.spawn(shutdown.clone())?);

        let stop_watcher = Arc::new(StopWatcher::new(
            orchestrator.clone(),
            config.stop_sentinel_path(),
            shutdown.clone(),
        ));
        watchers.push(stop_watcher.spawn()?);

        if config.listener.port != 0 {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listener.port));
            let listener = SocketListener::bind(addr, orchestrator.clone()).await?;
            tasks.push(listener.spawn(shutdown.clone()));
        }

        if !config.listener.directory.as_os_str().is_empty() {
            let listener = Arc::new(DirectoryListener::new(
                orchestrator.clone(),
                config.listener.directory.clone(),
                &config.listener.pattern,
            )?);
            watchers.push(listener.spawn(shutdown.clone())?);
        }

        if identity.id().is_none() {
            let identity = identity.clone();
            let client = client.clone();
            let url = config.urls().id;
            tasks.push(tokio::spawn(async move {
                match identity.ensure_id(&client, &url).await {
                    Ok(id) => tracing::info!(client_id = %id, "Client id registered"),
                    Err(e) => tracing::warn!("Client id not available yet: {}", e),
                }
            }));
        }

        if let Some(queue) = queue {
            let connection = Arc::new(Connection::new(
                ConnectionSettings::from_config(&config),
                identity.clone(),
                orchestrator.clone(),
            ));
            tasks.push(connection.spawn(queue, shutdown.clone()));
        }

        let updates = Arc::new(UpdatesClient::new(
            &config,
            client,
            identity,
            orchestrator.clone(),
        ));
        if config.client_updates.is_enabled {
            tasks.push(
                updates
                    .clone()
                    .spawn_updates_loop(config.client_updates.interval(), shutdown.clone()),
            );
        }
        if config.client_results.is_enabled && !config.sockets.is_enabled {
            let interval = config.client_results.interval();
            tasks.push(updates.spawn_results_loop(interval, shutdown.clone()));
        }

        if config.resource_control.manage_processes {
            let safety_net = Arc::new(SafetyNet::new(
                orchestrator.clone(),
                Reaper::system(),
                config.resource_control.safety_net_interval(),
            ));
            tasks.push(safety_net.spawn(shutdown.clone()));
        }

        tracing::info!(
            watchers = watchers.len(),
            tasks = tasks.len(),
            "Agent started"
        );

        Ok(Self {
            orchestrator,
            shutdown,
            watchers,
            tasks,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Cancelling this token shuts the agent down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the stop sentinel fires or the process is interrupted, then
    /// stop every job and background task.
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("Interrupt received"),
                Err(e) => {
                    tracing::warn!("Interrupt handler unavailable: {}", e);
                    self.shutdown.cancelled().await;
                }
            },
        }

        tracing::info!("Shutting down");
        self.shutdown.cancel();
        self.orchestrator.terminate().await;

        for watcher in &self.watchers {
            watcher.abort();
        }
        let all_tasks = futures::future::join_all(self.tasks);
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, all_tasks).await;
        if joined.is_err() {
            tracing::warn!("Background tasks did not finish within {:?}", SHUTDOWN_GRACE);
        }

        tracing::info!("Agent stopped");
        Ok(())
    }
}
