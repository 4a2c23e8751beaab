//! Caller-facing facade and composition root.

use crate::channels::ChannelHub;
use crate::cleanup::{CleanupReport, CleanupScheduler};
use crate::config::{CleanupConfig, Config};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::orchestration::{
    AgentLifecycleManager, MonitorQuery, OrchestrationEngine, ProgressUpdate, RunMonitor,
    RunRequest, TaskGraphManager, UPDATE_BUFFER,
};
use crate::planner::{KeywordClassifier, Planner};
use crate::ports::{ComplexityClassifier, CoordinationChannel, KnowledgeSearch, ProcessSpawner};
use crate::run::{RunId, RunOutcome, RunRegistry, RunState};
use crate::spawner::CommandSpawner;
use crate::store::{EntityStore, MemoryStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A run in flight.
pub struct RunHandle {
    pub run_id: RunId,
    /// Intermediate updates are dropped while the buffer is full. The
    /// final update waits for room, so a caller holding this receiver
    /// must keep reading it until it closes.
    pub progress: mpsc::Receiver<ProgressUpdate>,
    pub outcome: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Wait for the outcome, ignoring progress.
    pub async fn wait(self) -> RunOutcome {
        let RunHandle {
            progress, outcome, ..
        } = self;
        drop(progress);
        match outcome.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::failure(Error::TaskJoin(e.to_string()).to_string()),
        }
    }
}

/// Swappable collaborators; anything left unset gets the reference adapter.
pub struct ConductorBuilder {
    config: Config,
    store: Option<Arc<dyn EntityStore>>,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    channels: Option<Arc<dyn CoordinationChannel>>,
    planner: Option<Arc<dyn Planner>>,
    classifier: Option<Arc<dyn ComplexityClassifier>>,
    knowledge: Option<Arc<dyn KnowledgeSearch>>,
}

impl ConductorBuilder {
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn channels(mut self, channels: Arc<dyn CoordinationChannel>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ComplexityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn knowledge(mut self, knowledge: Arc<dyn KnowledgeSearch>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn build(self) -> Conductor {
        let config = self.config;
        let store: Arc<dyn EntityStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let spawner: Arc<dyn ProcessSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(CommandSpawner::from_config(&config)),
        };
        let channels: Arc<dyn CoordinationChannel> = match self.channels {
            Some(channels) => channels,
            None => Arc::new(ChannelHub::new()),
        };
        let classifier: Arc<dyn ComplexityClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(KeywordClassifier),
        };

        let bus = Arc::new(EventBus::new());
        let runs = Arc::new(RunRegistry::new());
        let graph = Arc::new(TaskGraphManager::new(Arc::clone(&store), Arc::clone(&bus)));
        let lifecycle = Arc::new(AgentLifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            spawner,
            &config.waiter,
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            Arc::clone(&lifecycle),
            Arc::clone(&channels),
            config.cleanup.clone(),
        ));

        let mut engine = OrchestrationEngine::new(
            Arc::clone(&graph),
            Arc::clone(&lifecycle),
            Arc::clone(&cleanup),
            Arc::clone(&channels),
            Arc::clone(&bus),
            Arc::clone(&runs),
            config.engine.clone(),
        )
        .with_classifier(classifier);
        if let Some(planner) = self.planner {
            engine = engine.with_planner(planner);
        }
        if let Some(knowledge) = self.knowledge {
            engine = engine.with_knowledge(knowledge);
        }

        let monitor = RunMonitor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&runs),
            Arc::clone(&channels),
            config.engine.monitor_poll(),
        );

        debug!("conductor assembled");
        Conductor {
            config,
            store,
            bus,
            channels,
            graph,
            lifecycle,
            cleanup,
            engine: Arc::new(engine),
            monitor,
        }
    }
}

/// Entry point for callers: runs, monitoring, and cleanup.
pub struct Conductor {
    config: Config,
    store: Arc<dyn EntityStore>,
    bus: Arc<EventBus>,
    channels: Arc<dyn CoordinationChannel>,
    graph: Arc<TaskGraphManager>,
    lifecycle: Arc<AgentLifecycleManager>,
    cleanup: Arc<CleanupScheduler>,
    engine: Arc<OrchestrationEngine>,
    monitor: RunMonitor,
}

impl Conductor {
    /// Assemble with every reference adapter.
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ConductorBuilder {
        ConductorBuilder {
            config,
            store: None,
            spawner: None,
            channels: None,
            planner: None,
            classifier: None,
            knowledge: None,
        }
    }

    /// Register a run and drive it on a background task.
    ///
    /// # Errors
    /// Only request validation fails here; everything later is reported
    /// in the run's outcome.
    pub fn start_run(&self, request: RunRequest) -> Result<RunHandle> {
        let run_id = self.engine.prepare(&request)?;
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let engine = Arc::clone(&self.engine);
        let outcome = tokio::spawn(async move { engine.execute(run_id, &request, Some(tx)).await });
        info!(run = %run_id.short(), "run started");
        Ok(RunHandle {
            run_id,
            progress: rx,
            outcome,
        })
    }

    /// Run to completion.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        self.engine.run(request).await
    }

    /// Current state of a run, active or archived.
    pub fn run_status(&self, run_id: RunId) -> Result<RunState> {
        self.engine
            .runs()
            .get(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    pub async fn monitor(&self, query: MonitorQuery) -> Result<mpsc::Receiver<ProgressUpdate>> {
        self.monitor.monitor(query).await
    }

    /// One sweep with the configured thresholds.
    pub async fn sweep(&self, dry_run: bool) -> CleanupReport {
        self.cleanup
            .sweep(&self.cleanup.default_options().dry_run(dry_run))
            .await
    }

    pub fn cleanup_thresholds(&self) -> &CleanupConfig {
        self.cleanup.thresholds()
    }

    /// Sweep periodically at the configured interval until `cancel` fires.
    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.cleanup).spawn_periodic(
            self.config.cleanup.sweep_interval(),
            self.cleanup.default_options(),
            cancel,
        )
    }

    /// Stop event delivery; returns the number of subscriptions dropped.
    pub async fn shutdown(&self) -> usize {
        self.bus.shutdown().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn channels(&self) -> &Arc<dyn CoordinationChannel> {
        &self.channels
    }

    pub fn graph(&self) -> &Arc<TaskGraphManager> {
        &self.graph
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }
}
