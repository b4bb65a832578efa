//! Pool registry and session event relay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use super::{Pool, PoolConfig, PoolHandle, PoolId, PoolProvider, SessionEvent, SessionFactory};
use crate::bus::{BusEvent, EventBus, ShareOutcome};
use crate::error::{Error, Result};
use crate::pool_cmd::{PoolCommand, PoolSummary};
use crate::tracing::prelude::*;

/// Extra identifiers tried when a generated pool ID collides.
pub const MAX_ID_ATTEMPTS: usize = 10;

type IdSource = Box<dyn FnMut() -> PoolId + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

struct ProviderEntry {
    provider: Box<dyn PoolProvider>,
    disabled: bool,
}

/// Owns every configured pool.
///
/// Pools come from registered providers or from [`PoolCommand::Add`]. The
/// manager gives each a unique ID, creates its session, and turns the
/// session's events into bus events. After [`stop`](Self::stop) every
/// mutating operation fails until [`start`](Self::start) is called again.
pub struct PoolManager {
    bus: EventBus,
    factory: Arc<dyn SessionFactory>,
    cmd_rx: mpsc::Receiver<PoolCommand>,
    pools: HashMap<PoolId, PoolHandle>,
    sessions: StreamMap<PoolId, UnboundedReceiverStream<SessionEvent>>,
    providers: Vec<ProviderEntry>,
    next_id: IdSource,
    state: State,
}

impl PoolManager {
    pub fn new(
        bus: EventBus,
        factory: Arc<dyn SessionFactory>,
        cmd_rx: mpsc::Receiver<PoolCommand>,
    ) -> Self {
        Self {
            bus,
            factory,
            cmd_rx,
            pools: HashMap::new(),
            sessions: StreamMap::new(),
            providers: Vec::new(),
            next_id: Box::new(PoolId::generate),
            state: State::Idle,
        }
    }

    /// Replace the source of generated pool IDs.
    pub fn with_id_source(mut self, source: impl FnMut() -> PoolId + Send + 'static) -> Self {
        self.next_id = Box::new(source);
        self
    }

    /// Register a pool provider, polling it right away if already running.
    ///
    /// Returns how many of its pools were added.
    pub fn register_provider(&mut self, provider: Box<dyn PoolProvider>) -> usize {
        self.providers.push(ProviderEntry {
            provider,
            disabled: false,
        });
        if self.state != State::Running {
            return 0;
        }
        let index = self.providers.len() - 1;
        self.poll_provider(index)
    }

    /// Begin accepting pools and poll every provider.
    pub fn start(&mut self) {
        self.state = State::Running;
        for index in 0..self.providers.len() {
            self.poll_provider(index);
        }
        info!(pools = self.pools.len(), "Pool manager started.");
    }

    fn poll_provider(&mut self, index: usize) -> usize {
        let entry = &mut self.providers[index];
        if entry.disabled {
            return 0;
        }

        let name = entry.provider.name().to_owned();
        let configs = match entry.provider.get() {
            Ok(configs) => configs,
            Err(e) => {
                error!(provider = %name, error = %e, "Pool provider failed, disabling it");
                entry.disabled = true;
                return 0;
            }
        };

        let mut added = 0;
        for config in configs {
            match self.add_pool(config) {
                Ok(_) => added += 1,
                Err(e) => warn!(provider = %name, error = %e, "Skipping pool"),
            }
        }
        added
    }

    /// Disconnect every pool and reject further changes.
    pub fn stop(&mut self) {
        for pool in self.pools.values() {
            pool.disconnect();
            if pool.set_online(false) {
                self.bus.publish(BusEvent::PoolOffline(pool.clone()));
            }
        }
        self.state = State::Stopped;
        info!("Pool manager stopped.");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            State::Stopped => Err(Error::Pool("pool manager is stopped".into())),
            _ => Ok(()),
        }
    }

    fn unique_id(&mut self, requested: Option<PoolId>) -> Result<PoolId> {
        let mut id = requested.unwrap_or_else(|| (self.next_id)());
        for _ in 0..MAX_ID_ATTEMPTS {
            if !self.pools.contains_key(&id) {
                return Ok(id);
            }
            id = (self.next_id)();
        }
        if self.pools.contains_key(&id) {
            return Err(Error::Config("cannot create unique pool ID".into()));
        }
        Ok(id)
    }

    /// Validate, register and (unless disabled) connect a pool.
    pub fn add_pool(&mut self, config: PoolConfig) -> Result<PoolId> {
        self.ensure_running()?;
        config.validate()?;

        let id = self.unique_id(config.id.clone())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = self.factory.create(&id, &config, events_tx)?;
        let pool = Arc::new(Pool::new(id.clone(), config, session));

        info!(pool = %id, url = %pool.url(), priority = pool.priority(), "Pool added");
        self.sessions
            .insert(id.clone(), UnboundedReceiverStream::new(events_rx));
        self.pools.insert(id.clone(), pool.clone());

        if !pool.is_disabled() {
            if let Err(e) = pool.connect() {
                error!(pool = %id, error = %e, "Failed to connect");
            }
        }
        Ok(id)
    }

    /// Re-enable and connect a pool. Returns false for an unknown ID.
    pub fn enable(&mut self, id: &PoolId) -> Result<bool> {
        self.ensure_running()?;
        let Some(pool) = self.pools.get(id) else {
            return Ok(false);
        };
        if pool.is_disabled() {
            pool.set_disabled(false);
            info!(pool = %id, "Pool enabled");
            if let Err(e) = pool.connect() {
                error!(pool = %id, error = %e, "Failed to connect");
            }
        }
        Ok(true)
    }

    /// Disconnect a pool but keep it registered. Returns false for an
    /// unknown ID.
    pub fn disable(&mut self, id: &PoolId) -> Result<bool> {
        self.ensure_running()?;
        let Some(pool) = self.pools.get(id).cloned() else {
            return Ok(false);
        };
        if !pool.is_disabled() {
            pool.set_disabled(true);
            info!(pool = %id, "Pool disabled");
            pool.disconnect();
            self.take_offline(&pool);
        }
        Ok(true)
    }

    /// Disconnect and forget a pool. Returns false for an unknown ID.
    pub fn remove(&mut self, id: &PoolId) -> Result<bool> {
        self.ensure_running()?;
        let Some(pool) = self.pools.remove(id) else {
            return Ok(false);
        };
        self.sessions.remove(id);
        pool.disconnect();
        pool.retire();
        self.take_offline(&pool);
        info!(pool = %id, "Pool removed");
        Ok(true)
    }

    fn take_offline(&self, pool: &PoolHandle) {
        if pool.set_online(false) {
            self.bus.publish(BusEvent::PoolOffline(pool.clone()));
        }
    }

    pub fn pool(&self, id: &PoolId) -> Option<&PoolHandle> {
        self.pools.get(id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &PoolHandle> {
        self.pools.values()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Update pool state from a session event and publish the matching bus
    /// event.
    pub(crate) fn handle_session_event(&mut self, id: &PoolId, event: SessionEvent) {
        let Some(pool) = self.pools.get(id).cloned() else {
            trace!(pool = %id, ?event, "Event for unknown pool");
            return;
        };

        match event {
            SessionEvent::Online => {
                pool.set_online(true);
                info!(pool = %id, url = %pool.url(), "Pool online");
                self.bus.publish(BusEvent::PoolOnline(pool));
            }
            SessionEvent::Offline => {
                if pool.set_online(false) {
                    warn!(pool = %id, url = %pool.url(), "Pool offline");
                    self.bus.publish(BusEvent::PoolOffline(pool));
                }
            }
            SessionEvent::DifficultyChanged(difficulty) => {
                debug!(pool = %id, difficulty, "Difficulty changed");
                pool.set_difficulty(difficulty);
                self.bus.publish(BusEvent::PoolDifficultyChanged(pool));
            }
            SessionEvent::NewJob(job) => {
                trace!(pool = %id, job = %job.id, clean = job.clean_jobs, "Job received");
                pool.set_job(job);
                self.bus.publish(BusEvent::PoolNewJob(pool));
            }
            SessionEvent::ShareAccepted(share_id) => {
                pool.record_accepted();
                self.bus.publish(BusEvent::PoolShareAccepted(ShareOutcome {
                    pool,
                    share_id,
                    reason: None,
                }));
            }
            SessionEvent::ShareRejected { share_id, reason } => {
                pool.record_rejected();
                self.bus.publish(BusEvent::PoolShareRejected(ShareOutcome {
                    pool,
                    share_id,
                    reason,
                }));
            }
            SessionEvent::Error(message) => {
                warn!(pool = %id, %message, "Session error");
            }
        }
    }

    fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Add {
                config,
                response_tx,
            } => {
                let _ = response_tx.send(self.add_pool(config));
            }
            PoolCommand::Enable { id, response_tx } => {
                let _ = response_tx.send(self.enable(&id));
            }
            PoolCommand::Disable { id, response_tx } => {
                let _ = response_tx.send(self.disable(&id));
            }
            PoolCommand::Remove { id, response_tx } => {
                let _ = response_tx.send(self.remove(&id));
            }
            PoolCommand::RegisterProvider {
                provider,
                response_tx,
            } => {
                let _ = response_tx.send(self.register_provider(provider));
            }
            PoolCommand::List { response_tx } => {
                let mut pools: Vec<PoolSummary> = self.pools.values().map(Into::into).collect();
                pools.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
                let _ = response_tx.send(pools);
            }
        }
    }

    /// Start, then relay session events and execute commands until
    /// cancelled.
    pub async fn run(&mut self, running: CancellationToken) -> Result<()> {
        self.start();

        loop {
            tokio::select! {
                Some((id, event)) = self.sessions.next() => {
                    self.handle_session_event(&id, event);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd);
                }
                _ = running.cancelled() => break,
            }
        }

        self.stop();
        Ok(())
    }
}
