//! Orchestrator: owns the active timeline and the job registry, and exposes the
//! start / stop / reload lifecycle plus ad-hoc command injection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::comms::ResultSink;
use crate::config::AgentConfig;
use crate::error::JobError;
use crate::handlers::HandlerRegistry;
use crate::safety_net::Reaper;
use crate::scheduler::cron::{parse_schedule, run_cron};
use crate::scheduler::registry::{Job, JobKind, JobRegistry};
use crate::scheduler::unit::{UnitContext, run_unit};
use crate::timeline::ingest::{assign_trackable_ids, prepare_timeline};
use crate::timeline::{Timeline, TimelineHandler, load_timeline};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    Reloading,
    Stopping,
    Terminated,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Timeline file re-read on reload.
    pub timeline_path: PathBuf,
    /// Upper bound on waiting for cancelled jobs to exit.
    pub stop_grace: Duration,
    /// Pause between stop and start on reload.
    pub reload_settle: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            timeline_path: config.timeline.location.clone(),
            stop_grace: config.resource_control.stop_grace(),
            reload_settle: config.resource_control.reload_settle(),
        }
    }
}

/// The scheduler.
pub struct Orchestrator {
    settings: SchedulerSettings,
    handlers: Arc<HandlerRegistry>,
    sink: Arc<dyn ResultSink>,
    reaper: Option<Reaper>,
    jobs: JobRegistry,
    state: RwLock<OrchestratorState>,
    current: RwLock<Option<Arc<Timeline>>>,
    /// Serializes start / stop / reload.
    lifecycle: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        settings: SchedulerSettings,
        handlers: Arc<HandlerRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            settings,
            handlers,
            sink,
            reaper: None,
            jobs: JobRegistry::new(),
            state: RwLock::new(OrchestratorState::Idle),
            current: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Run the hard-kill cleanup after every stop.
    pub fn with_reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// The active timeline, if one was started.
    pub async fn current_timeline(&self) -> Option<Arc<Timeline>> {
        self.current.read().await.clone()
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
    }

    /// Start a timeline. Returns the number of jobs launched.
    ///
    /// A timeline with status `Stop` becomes current but launches nothing.
    pub async fn start(&self, timeline: Timeline) -> Result<usize, JobError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return Err(JobError::ShuttingDown);
        }
        Ok(self.start_locked(timeline).await)
    }

    /// Load the configured timeline file and start it.
    pub async fn start_from_file(&self) -> Result<usize, JobError> {
        let timeline = load_timeline(&self.settings.timeline_path)?;
        self.start(timeline).await
    }

    /// Replaces the current timeline wholesale: its jobs are stopped first.
    async fn start_locked(&self, mut timeline: Timeline) -> usize {
        prepare_timeline(&mut timeline);
        let previous = self.current.read().await.as_ref().map(|t| t.id);
        if let Some(previous) = previous {
            let jobs = self.jobs.take_for_timeline(previous).await;
            if !jobs.is_empty() {
                tracing::info!(
                    timeline_id = %previous,
                    jobs = jobs.len(),
                    "Stopping replaced timeline"
                );
                self.shutdown_jobs(jobs).await;
            }
        }

        let timeline = Arc::new(timeline);
        *self.current.write().await = Some(timeline.clone());

        if !timeline.is_running() {
            tracing::info!(
                timeline_id = %timeline.id,
                "Timeline status is Stop, no handlers launched"
            );
            self.set_state(OrchestratorState::Running).await;
            return 0;
        }

        let mut launched = 0;
        for definition in &timeline.handlers {
            match self.launch(timeline.id, definition.clone()).await {
                Ok(_) => launched += 1,
                Err(e) => {
                    tracing::warn!(
                        timeline_id = %timeline.id,
                        handler = %definition.handler_type,
                        "Failed to launch handler: {}",
                        e
                    );
                }
            }
        }

        self.set_state(OrchestratorState::Running).await;
        tracing::info!(
            timeline_id = %timeline.id,
            launched,
            handlers = timeline.handlers.len(),
            "Timeline started"
        );
        launched
    }

    /// Run one ad-hoc handler alongside the loaded timeline.
    pub async fn run_command(&self, handler: TimelineHandler) -> Result<Uuid, JobError> {
        self.run_command_for(Uuid::new_v4(), handler).await
    }

    /// Run one ad-hoc handler, attributing it to `timeline_id`.
    ///
    /// Waits for any stop or reload in progress, so the job is never left
    /// behind by one.
    pub async fn run_command_for(
        &self,
        timeline_id: Uuid,
        handler: TimelineHandler,
    ) -> Result<Uuid, JobError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return Err(JobError::ShuttingDown);
        }
        let job_id = self.launch(timeline_id, handler).await?;
        tracing::info!(job_id = %job_id, timeline_id = %timeline_id, "Ad-hoc command launched");
        Ok(job_id)
    }

    /// Register one ad-hoc handler with the cron sub-scheduler.
    pub async fn run_command_cron(&self, mut handler: TimelineHandler) -> Result<Uuid, JobError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return Err(JobError::ShuttingDown);
        }
        assign_trackable_ids(&mut handler);
        self.launch_cron(Uuid::new_v4(), Arc::new(handler)).await
    }

    /// Launch one handler as a job (or cron registration).
    async fn launch(
        &self,
        timeline_id: Uuid,
        mut definition: TimelineHandler,
    ) -> Result<Uuid, JobError> {
        assign_trackable_ids(&mut definition);
        let definition = Arc::new(definition);
        if definition.is_cron() {
            return self.launch_cron(timeline_id, definition).await;
        }

        let handler = self.handlers.create(&definition)?;
        let sink = self.sink.clone();
        let job_id = self
            .jobs
            .launch(timeline_id, definition.clone(), JobKind::Unit, move |job_id, cancel| {
                let ctx = UnitContext {
                    job_id,
                    definition,
                    handler,
                    sink,
                    cancel,
                };
                async move {
                    run_unit(ctx).await;
                }
            })
            .await;

        tracing::debug!(job_id = %job_id, timeline_id = %timeline_id, "Launched job");
        Ok(job_id)
    }

    async fn launch_cron(
        &self,
        timeline_id: Uuid,
        definition: Arc<TimelineHandler>,
    ) -> Result<Uuid, JobError> {
        let expression = definition
            .schedule
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| JobError::MissingSchedule {
                handler_type: definition.handler_type.to_string(),
            })?;
        let schedule = parse_schedule(expression)?;
        let handler = self.handlers.create(&definition)?;
        let sink = self.sink.clone();

        let job_id = self
            .jobs
            .launch(timeline_id, definition.clone(), JobKind::Cron, move |job_id, cancel| {
                let ctx = UnitContext {
                    job_id,
                    definition,
                    handler,
                    sink,
                    cancel,
                };
                async move {
                    run_cron(ctx, schedule).await;
                }
            })
            .await;

        tracing::debug!(job_id = %job_id, timeline_id = %timeline_id, "Launched cron job");
        Ok(job_id)
    }

    /// Cancel every job, wait for them (bounded), then hard-kill leftover processes.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return;
        }
        self.stop_locked().await;
        self.set_state(OrchestratorState::Idle).await;
    }

    async fn stop_locked(&self) {
        self.set_state(OrchestratorState::Stopping).await;
        let jobs = self.jobs.take_all().await;
        let count = jobs.len();
        self.shutdown_jobs(jobs).await;
        self.cleanup_processes().await;
        tracing::info!(jobs = count, "Orchestrator stopped");
    }

    /// Cancel only the jobs of one timeline. Returns how many were stopped.
    pub async fn stop_timeline(&self, timeline_id: Uuid) -> usize {
        let jobs = self.jobs.take_for_timeline(timeline_id).await;
        let count = jobs.len();
        self.shutdown_jobs(jobs).await;

        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|t| t.id == timeline_id) {
            *current = None;
        }
        tracing::info!(timeline_id = %timeline_id, jobs = count, "Timeline stopped");
        count
    }

    /// Cancel a single job by id.
    pub async fn stop_job(&self, job_id: Uuid) -> Result<(), JobError> {
        let job = self
            .jobs
            .remove_by_job_id(job_id)
            .await
            .ok_or(JobError::NotFound { id: job_id })?;
        self.shutdown_jobs(vec![job]).await;
        tracing::info!(job_id = %job_id, "Job stopped");
        Ok(())
    }

    /// Stop, let the host settle, re-read the timeline file and start it again.
    pub async fn reload(&self) -> Result<usize, JobError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return Err(JobError::ShuttingDown);
        }

        self.stop_locked().await;
        self.set_state(OrchestratorState::Reloading).await;
        tokio::time::sleep(self.settings.reload_settle).await;

        match load_timeline(&self.settings.timeline_path) {
            Ok(timeline) => Ok(self.start_locked(timeline).await),
            Err(e) => {
                tracing::error!(
                    path = %self.settings.timeline_path.display(),
                    "Reload failed, timeline not restarted: {}",
                    e
                );
                self.set_state(OrchestratorState::Idle).await;
                Err(e.into())
            }
        }
    }

    /// Final stop. No further commands are accepted.
    pub async fn terminate(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == OrchestratorState::Terminated {
            return;
        }
        self.stop_locked().await;
        self.set_state(OrchestratorState::Terminated).await;
    }

    async fn cleanup_processes(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.cleanup_processes().await;
        }
    }

    async fn shutdown_jobs(&self, jobs: Vec<Job>) {
        for job in &jobs {
            job.cancel.cancel();
        }

        let grace = self.settings.stop_grace;
        let waits = jobs.into_iter().map(|job| async move {
            let id = job.id;
            let handle = job.into_handle();
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(job_id = %id, "Job ended abnormally: {}", e),
                Err(_) => {
                    abort.abort();
                    let error = JobError::StopTimeout { id, grace };
                    tracing::warn!(job_id = %id, "{}, aborted", error);
                }
            }
        });
        futures::future::join_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::NullSink;
    use crate::safety_net::tests::FakeProcesses;
    use crate::scheduler::unit::tests::{CollectingSink, CountingHandler};
    use crate::timeline::{HandlerType, ScheduleType, TimelineEvent, TimelineStatus};

    fn settings(path: PathBuf) -> SchedulerSettings {
        SchedulerSettings {
            timeline_path: path,
            stop_grace: Duration::from_secs(2),
            reload_settle: Duration::from_millis(10),
        }
    }

    fn blocking_handler() -> TimelineHandler {
        // Loops with a long delay, so it only ends through cancellation.
        let mut event = TimelineEvent::new("tick");
        event.delay_after = crate::timeline::Delay::Millis(60_000);
        TimelineHandler::new(HandlerType::Command).with_event(event).looping(true)
    }

    fn registry_with(counting: Arc<CountingHandler>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerType::Command, move |_| {
            Ok(counting.clone() as Arc<dyn crate::handlers::Handler>)
        });
        Arc::new(registry)
    }

    fn orchestrator_with(counting: Arc<CountingHandler>) -> Orchestrator {
        Orchestrator::new(
            settings(PathBuf::from("unused.json")),
            registry_with(counting),
            Arc::new(NullSink),
        )
    }

    fn timeline(handlers: Vec<TimelineHandler>) -> Timeline {
        Timeline {
            id: Uuid::new_v4(),
            status: TimelineStatus::Run,
            handlers,
        }
    }

    #[tokio::test]
    async fn stop_status_launches_nothing() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let mut t = timeline(vec![blocking_handler()]);
        t.status = TimelineStatus::Stop;

        assert_eq!(orchestrator.start(t).await.unwrap(), 0);
        assert!(orchestrator.jobs().is_empty().await);
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.current_timeline().await.is_some());
    }

    #[tokio::test]
    async fn launch_error_does_not_block_others() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let t = timeline(vec![
            TimelineHandler::new(HandlerType::Other("Teleport".into())),
            blocking_handler(),
            TimelineHandler::new(HandlerType::Command)
                .looping(false)
                .with_event(TimelineEvent::new("x")),
        ]);
        assert_eq!(orchestrator.start(t).await.unwrap(), 2);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_then_start_leaves_only_new_jobs() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let first = timeline(vec![blocking_handler(), blocking_handler()]);
        orchestrator.start(first).await.unwrap();
        assert_eq!(orchestrator.jobs().len().await, 2);

        tokio::time::timeout(Duration::from_secs(5), orchestrator.stop())
            .await
            .unwrap();
        assert!(orchestrator.jobs().is_empty().await);
        assert_eq!(orchestrator.state().await, OrchestratorState::Idle);

        let second = timeline(vec![blocking_handler()]);
        let second_id = second.id;
        orchestrator.start(second).await.unwrap();

        let jobs = orchestrator.jobs().all().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs.iter().all(|j| j.timeline_id == second_id));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_timeline_only_touches_that_timeline() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let main = timeline(vec![blocking_handler()]);
        orchestrator.start(main).await.unwrap();

        let other = Uuid::new_v4();
        orchestrator.run_command_for(other, blocking_handler()).await.unwrap();
        assert_eq!(orchestrator.jobs().len().await, 2);

        assert_eq!(orchestrator.stop_timeline(other).await, 1);
        assert_eq!(orchestrator.jobs().len().await, 1);
        assert!(orchestrator.current_timeline().await.is_some());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_job_cancels_one_job() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let keep = orchestrator.run_command(blocking_handler()).await.unwrap();
        let victim = orchestrator.run_command(blocking_handler()).await.unwrap();

        orchestrator.stop_job(victim).await.unwrap();
        assert!(orchestrator.jobs().contains(keep).await);
        assert!(!orchestrator.jobs().contains(victim).await);
        assert!(matches!(
            orchestrator.stop_job(victim).await,
            Err(JobError::NotFound { .. })
        ));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_runs_process_cleanup() {
        let fake = Arc::new(FakeProcesses::with("chrome", &[(4001, 10), (4002, 20)]));
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()))
            .with_reaper(Reaper::new(fake.clone()));
        orchestrator.start(timeline(vec![blocking_handler()])).await.unwrap();
        orchestrator.stop().await;
        assert_eq!(fake.killed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cron_handler_requires_schedule() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let mut cron =
            TimelineHandler::new(HandlerType::Command).with_event(TimelineEvent::new("x"));
        cron.schedule_type = ScheduleType::Cron;

        let err = orchestrator.run_command_cron(cron.clone()).await.unwrap_err();
        assert!(matches!(err, JobError::MissingSchedule { .. }));

        cron.schedule = Some("bogus".into());
        let err = orchestrator.run_command_cron(cron.clone()).await.unwrap_err();
        assert!(matches!(err, JobError::Timeline(_)));

        cron.schedule = Some("0 0 0 1 1 *".into());
        let id = orchestrator.run_command_cron(cron).await.unwrap();
        let jobs = orchestrator.jobs().all().await;
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].kind, JobKind::Cron);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn reload_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.json");
        let orchestrator = Orchestrator::new(
            settings(path.clone()),
            registry_with(Arc::new(CountingHandler::new())),
            Arc::new(NullSink),
        );

        crate::timeline::save_timeline(&path, &timeline(vec![blocking_handler()])).unwrap();
        orchestrator.start_from_file().await.unwrap();
        let before = orchestrator.jobs().all().await[0].timeline_id;

        let next = timeline(vec![blocking_handler(), blocking_handler()]);
        crate::timeline::save_timeline(&path, &next).unwrap();
        let launched = tokio::time::timeout(Duration::from_secs(5), orchestrator.reload())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(launched, 2);

        let jobs = orchestrator.jobs().all().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.timeline_id != before));
        orchestrator.terminate().await;
        assert!(matches!(
            orchestrator.run_command(blocking_handler()).await,
            Err(JobError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn events_without_trackable_id_get_one_before_running() {
        let sink = Arc::new(CollectingSink::default());
        let orchestrator = Orchestrator::new(
            settings(PathBuf::from("unused.json")),
            registry_with(Arc::new(CountingHandler::new())),
            sink.clone(),
        );
        let once = || {
            TimelineHandler::new(HandlerType::Command)
                .looping(false)
                .with_event(TimelineEvent::new("echo hi"))
        };

        orchestrator.start(Timeline::adhoc(once())).await.unwrap();
        orchestrator.run_command(once()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.records.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("records never arrived");

        let records = sink.records.lock().unwrap().clone();
        assert!(records.iter().all(|r| !r.trackable_id.is_empty()));
        assert_ne!(records[0].trackable_id, records[1].trackable_id);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn start_replaces_running_timeline() {
        let orchestrator = orchestrator_with(Arc::new(CountingHandler::new()));
        let adhoc = orchestrator.run_command(blocking_handler()).await.unwrap();
        orchestrator
            .start(timeline(vec![blocking_handler(), blocking_handler()]))
            .await
            .unwrap();

        let second = timeline(vec![blocking_handler()]);
        let second_id = second.id;
        tokio::time::timeout(Duration::from_secs(5), orchestrator.start(second))
            .await
            .unwrap()
            .unwrap();

        let jobs = orchestrator.jobs().all().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs.iter().filter(|j| j.timeline_id == second_id).count(), 1);
        assert!(orchestrator.jobs().contains(adhoc).await);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn adhoc_command_racing_terminate_is_refused() {
        let orchestrator = Arc::new(orchestrator_with(Arc::new(CountingHandler::new())));
        orchestrator
            .start(timeline(vec![blocking_handler(), blocking_handler()]))
            .await
            .unwrap();

        let terminating = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.terminate().await }
        });
        while orchestrator.state().await == OrchestratorState::Running {
            tokio::task::yield_now().await;
        }

        let launched = orchestrator.run_command(blocking_handler()).await;
        assert!(matches!(launched, Err(JobError::ShuttingDown)));
        terminating.await.unwrap();
        assert!(orchestrator.jobs().is_empty().await);
    }
}
