use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accounting::{AccountingSynchronizer, FinishedStore};
use crate::api::run_api;
use crate::config::{BridgeConfig, RetrievalMethod};
use crate::error::{GridError, Result};
use crate::events::{EventTranslator, Notification, NotificationGate};
use crate::job::{
    FinishedRecord, JobEvent, JobFilter, JobHandle, JobTracker, LifecycleState, Lookup, TrackedJob,
};
use crate::master::{EventSource, LivenessMonitor, MasterProbe, TcpProbe};
use crate::resolver::FinishedJobResolver;
use crate::submit::{CommandRunner, ProcessRunner, SubmissionPipeline, SubmitRequest};

const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// Wires the liveness monitor, event translation, accounting and submission
/// together and answers the orchestrator's requests.
pub struct Bridge {
    config: RwLock<BridgeConfig>,
    pub monitor: Arc<LivenessMonitor>,
    pub gate: NotificationGate,
    pub translator: EventTranslator,
    pub tracker: Arc<RwLock<JobTracker>>,
    pub store: FinishedStore,
    resolver: RwLock<FinishedJobResolver>,
    job_filter: RwLock<JobFilter>,
    pipeline: SubmissionPipeline,
    events_out: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    synchronizer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Bridge {
    /// Build a bridge talking to a real qmaster and real `qsub`/`qdel`.
    pub async fn connect(
        config: BridgeConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<JobEvent>)> {
        let probe = Arc::new(TcpProbe::new(
            config.cluster.qmaster_addr.clone(),
            config.monitor.probe_timeout(),
        ));
        let runner = Arc::new(ProcessRunner::new(Duration::from_millis(
            config.submit.command_timeout_ms,
        )));
        Self::new(config, probe, runner, Vec::new()).await
    }

    /// Build a bridge from explicit collaborators. `sources` are subscribed in
    /// addition to the HTTP notification gate.
    pub async fn new(
        config: BridgeConfig,
        probe: Arc<dyn MasterProbe>,
        runner: Arc<dyn CommandRunner>,
        sources: Vec<Arc<dyn EventSource>>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<JobEvent>)> {
        let store = FinishedStore::open(
            &config.sync.database_path,
            config.sync.pool_size,
            Duration::from_millis(config.accounting.reconnect_delay_ms),
        )
        .await?;
        let resolver = FinishedJobResolver::from_config(&config, store.clone())?;

        let gate = NotificationGate::new();
        let mut all_sources: Vec<Arc<dyn EventSource>> = vec![Arc::new(gate.clone())];
        all_sources.extend(sources);
        let monitor = Arc::new(LivenessMonitor::new(
            probe,
            all_sources,
            config.monitor.probe_interval(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let translator = EventTranslator::new(events_tx).with_monitor(monitor.clone());
        let pipeline = SubmissionPipeline::new(runner, monitor.clone(), config.submit.clone());
        let (events_out, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        let bridge = Self {
            job_filter: RwLock::new(JobFilter::parse(&config.job_filter)),
            config: RwLock::new(config),
            monitor,
            gate,
            translator,
            tracker: Arc::new(RwLock::new(JobTracker::new())),
            store,
            resolver: RwLock::new(resolver),
            pipeline,
            events_out,
            shutdown: CancellationToken::new(),
            synchronizer: Mutex::new(None),
        };

        Ok((Arc::new(bridge), events_rx))
    }

    /// Run every long-lived task until `shutdown` fires.
    ///
    /// Spawns the liveness probe loop, the event-recording loop, the accounting
    /// synchronizer (when finished jobs come from the local log) and the HTTP
    /// API (when an address is configured), then waits for all of them.
    pub async fn run(
        self: Arc<Self>,
        events_rx: mpsc::UnboundedReceiver<JobEvent>,
        shutdown: CancellationToken,
    ) {
        let config = self.config.read().await.clone();
        let mut tasks = Vec::new();

        // Preference changes start and stop the synchronizer under this token.
        let forward = self.shutdown.clone();
        let upstream = shutdown.clone();
        tokio::spawn(async move {
            upstream.cancelled().await;
            forward.cancel();
        });

        tasks.push(tokio::spawn(self.monitor.clone().run(shutdown.clone())));

        let recorder = self.clone();
        let recorder_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            recorder.record_events(events_rx, recorder_shutdown).await;
        }));

        if config.retrieval_method == RetrievalMethod::LocalLog {
            if let Err(e) = self.start_synchronizer(&config).await {
                tracing::error!(error = %e, "Failed to start accounting synchronizer");
            }
        }

        if let Some(addr) = config.api_addr {
            tasks.push(tokio::spawn(run_api(addr, self.clone(), shutdown.clone())));
        }

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Bridge task panicked");
            }
        }

        self.stop_synchronizer().await;
        self.resolver.read().await.close();
        self.store.close();
        tracing::info!("Bridge stopped");
    }

    /// Start tailing the accounting log unless already running. The
    /// synchronizer gets its own connection pool, which it closes on exit.
    async fn start_synchronizer(&self, config: &BridgeConfig) -> Result<()> {
        let mut running = self.synchronizer.lock().await;
        if running.is_some() || self.shutdown.is_cancelled() {
            return Ok(());
        }

        let store = FinishedStore::open(
            &config.sync.database_path,
            config.sync.pool_size,
            Duration::from_millis(config.accounting.reconnect_delay_ms),
        )
        .await?;
        let synchronizer =
            AccountingSynchronizer::new(store, config.accounting_file(), config.sync.clone());
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(synchronizer.run(token.clone()));
        *running = Some((token, handle));
        Ok(())
    }

    async fn stop_synchronizer(&self) {
        let running = self.synchronizer.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Accounting synchronizer panicked");
            }
        }
    }

    /// Feed translated events into the tracker, persist terminal ones and
    /// republish everything to observers.
    async fn record_events(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.record_event(event).await;
        }
    }

    pub async fn record_event(&self, event: JobEvent) {
        self.tracker.write().await.apply(&event);

        if let Some(record) = event.finished_record() {
            match self.store.persist(&record).await {
                Ok(true) => tracing::debug!(job_id = %record.handle, exit_status = record.exit_status, "Finished job recorded"),
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id = %record.handle, error = %e, "Failed to record finished job"),
            }
        }

        // No subscribers is fine.
        let _ = self.events_out.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events_out.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.monitor.is_alive()
    }

    /// Validate and submit a job. Returns the identifier printed by qsub.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        let submission = request.validate()?;
        let job_id = self.pipeline.submit(&submission).await?;

        match leading_job_number(&job_id) {
            Some(job) => {
                let registered = self.tracker.write().await.register_submitted(
                    JobHandle::new(job),
                    submission.name.clone(),
                    submission.variables.clone(),
                );
                if !registered {
                    tracing::warn!(job_id = %job_id, "Job tracker at capacity, submission not tracked");
                }
            }
            None => tracing::warn!(job_id = %job_id, "Submitted job id has no job number"),
        }

        Ok(job_id)
    }

    /// Current lifecycle state of a job, falling back to accounting for jobs
    /// the event stream no longer tracks. Accounting also overrides tracked
    /// jobs whose finish event never arrived.
    pub async fn job_status(&self, handle: &JobHandle) -> LifecycleState {
        let lookup = self.tracker.read().await.lookup(handle);

        let missing_state = match lookup {
            Lookup::Active(state) => {
                return match self.finished(handle).await {
                    Ok(Some(_)) => {
                        tracing::debug!(job_id = %handle, "Finish event missed, dropping tracked job");
                        self.tracker.write().await.forget(handle);
                        LifecycleState::Finished
                    }
                    Ok(None) => state,
                    Err(e) => {
                        tracing::warn!(job_id = %handle, error = %e, "Accounting lookup failed");
                        state
                    }
                };
            }
            Lookup::InferredFinished => return LifecycleState::Finished,
            // A later task of a running array that is not reported yet.
            Lookup::NeedsAccounting => LifecycleState::Queued,
            Lookup::Untracked => LifecycleState::NotFound,
        };

        match self.finished(handle).await {
            Ok(Some(_)) => LifecycleState::Finished,
            Ok(None) => missing_state,
            Err(e) => {
                tracing::warn!(job_id = %handle, error = %e, "Accounting lookup failed");
                LifecycleState::Unknown
            }
        }
    }

    pub async fn finished(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        self.resolver.read().await.resolve(handle).await
    }

    pub async fn kill(&self, job_id: &str, user: Option<&str>, force: bool) -> Result<()> {
        self.pipeline.kill_job(job_id, user, force).await
    }

    /// Tracked jobs matching `filter`, or the configured filter when `None`.
    pub async fn list_jobs(&self, filter: Option<&str>) -> Vec<TrackedJob> {
        let parsed;
        let configured = self.job_filter.read().await;
        let filter = match filter {
            Some(spec) => {
                parsed = JobFilter::parse(spec);
                &parsed
            }
            None => &*configured,
        };
        self.tracker
            .read()
            .await
            .filtered(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Accept a pushed notification. Refused while the master is considered
    /// down, since the gate's subscription is closed then.
    pub fn ingest(&self, notification: Notification) -> Result<()> {
        if !self.gate.is_open() {
            return Err(GridError::MasterUnavailable);
        }
        self.translator.handle(notification);
        Ok(())
    }

    /// JSON form of [`Bridge::ingest`].
    pub fn ingest_raw(&self, raw: &str) -> Result<()> {
        if !self.gate.is_open() {
            return Err(GridError::MasterUnavailable);
        }
        self.translator.handle_raw(raw)
    }

    /// Apply orchestrator preferences, rebuilding the resolver and job filter
    /// and starting or stopping the accounting synchronizer to match the
    /// retrieval method. On error the previous settings stay in effect.
    pub async fn apply_preferences(&self, prefs: &HashMap<String, String>) -> Result<()> {
        let mut config = self.config.read().await.clone();
        config.apply_preferences(prefs)?;

        let resolver = FinishedJobResolver::from_config(&config, self.store.clone())?;
        match config.retrieval_method {
            RetrievalMethod::LocalLog => {
                if let Err(e) = self.start_synchronizer(&config).await {
                    resolver.close();
                    return Err(e);
                }
            }
            RetrievalMethod::ExternalAccounting => self.stop_synchronizer().await,
        }

        let previous = std::mem::replace(&mut *self.resolver.write().await, resolver);
        previous.close();
        *self.job_filter.write().await = JobFilter::parse(&config.job_filter);
        tracing::info!(
            method = ?config.retrieval_method,
            use_array_jobs = config.use_array_jobs,
            "Preferences applied"
        );
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn synchronizer_running(&self) -> bool {
        self.synchronizer.lock().await.is_some()
    }

    pub async fn retrieval_method(&self) -> RetrievalMethod {
        self.resolver.read().await.method()
    }
}

/// `4711` → 4711, `812.1-10:1` → 812.
fn leading_job_number(job_id: &str) -> Option<u64> {
    let digits: &str = job_id
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits.parse().ok()
}
