//! Daemon assembly.
//!
//! Builds the event bus, the pool manager, the work decoder and one scheduler
//! per policy, and runs each as its own task until shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::bus::EventBus;
use crate::config::Config;
use crate::pool::{
    ConfigPoolProvider, DefaultSessionFactory, JsonFilePoolProvider, PoolManager, SessionFactory,
};
use crate::pool_cmd::PoolCommand;
use crate::scheduler::{
    self, PriorityPolicy, RoundRobinMode, RoundRobinPolicy, Scheduler, PRIORITY, ROUND_ROBIN,
};
use crate::tracing::prelude::*;
use crate::work::{WorkDecoder, DECODER_SUBSCRIPTIONS};

const COMMAND_QUEUE: usize = 16;

pub struct Daemon {
    config: Config,
    bus: EventBus,
    factory: Arc<dyn SessionFactory>,
    cmd_tx: mpsc::Sender<PoolCommand>,
    cmd_rx: mpsc::Receiver<PoolCommand>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        Self {
            config,
            bus: EventBus::new(),
            factory: Arc::new(DefaultSessionFactory),
            cmd_tx,
            cmd_rx,
        }
    }

    /// Use a different way of opening pool sessions.
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// The bus devices publish their events on.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Command queue into the running pool manager.
    pub fn pool_commands(&self) -> mpsc::Sender<PoolCommand> {
        self.cmd_tx.clone()
    }

    /// Spawn every component. They run until `running` is cancelled.
    pub fn start(self, running: CancellationToken) -> anyhow::Result<TaskTracker> {
        self.config.validate().context("invalid configuration")?;

        let mut manager = PoolManager::new(self.bus.clone(), self.factory, self.cmd_rx);
        manager.register_provider(Box::new(ConfigPoolProvider::new(self.config.pools.clone())));
        if let Some(path) = &self.config.daemon.pools_file {
            manager.register_provider(Box::new(JsonFilePoolProvider::new(path)));
        }

        let default = self.config.schedulers.default.as_str();
        let priority = Scheduler::new(PriorityPolicy::default(), default == PRIORITY, self.bus.clone());
        let round_robin = Scheduler::new(
            RoundRobinPolicy::new(RoundRobinMode::from_config(&self.config.schedulers.round_robin)),
            default == ROUND_ROBIN,
            self.bus.clone(),
        );

        // Subscribe before spawning so no early event is missed
        let decoder_events = self.bus.subscribe(DECODER_SUBSCRIPTIONS);
        let priority_events = self.bus.subscribe(scheduler::SUBSCRIPTIONS);
        let round_robin_events = self.bus.subscribe(scheduler::SUBSCRIPTIONS);

        let tracker = TaskTracker::new();
        tracker.spawn(WorkDecoder::new(self.bus.clone()).run(running.clone(), decoder_events));
        tracker.spawn(priority.run(running.clone(), priority_events));
        tracker.spawn(round_robin.run(running.clone(), round_robin_events));
        tracker.spawn({
            let running = running.clone();
            async move {
                if let Err(e) = manager.run(running).await {
                    error!(error = %e, "Pool manager failed");
                }
            }
        });
        tracker.close();

        info!(default_scheduler = default, "Started.");
        Ok(tracker)
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let running = CancellationToken::new();
        let tracker = self.start(running.clone())?;

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }

        trace!("Shutting down.");
        running.cancel();

        tracker.wait().await;
        info!("Exiting.");
        Ok(())
    }
}
