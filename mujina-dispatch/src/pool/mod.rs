//! Mining pool connectivity.
//!
//! A [`Pool`] pairs a protocol session with the pool's mutable state (online
//! flag, difficulty, current job) and its [`WorkCache`]. Sessions are
//! pluggable through [`SessionFactory`]; they report what happens on the wire
//! as [`SessionEvent`]s, which the [`PoolManager`] relays onto the event bus.

mod dummy;
mod manager;
mod provider;

pub use dummy::{DefaultSessionFactory, DummySession};
pub use manager::{PoolManager, MAX_ID_ATTEMPTS};
pub use provider::{ConfigPoolProvider, JsonFilePoolProvider, PoolProvider};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use crate::config::PoolConfig;
use crate::error::Result;
use crate::tracing::prelude::*;
use crate::work::{Algorithm, Job, WorkCache, WorkError, WorkItem, WorkUpdate};

/// Pool identifier, 32 lowercase hex characters when generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-assigned identifier for a submitted share.
pub type ShareId = u64;

/// Shared handle to a pool.
pub type PoolHandle = Arc<Pool>;

/// A share ready to go to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: u32,
}

/// What a pool session reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected and authorized
    Online,

    /// Connection lost or closed
    Offline,

    /// Pool set a new share difficulty
    DifficultyChanged(f64),

    /// Pool sent a job
    NewJob(Job),

    /// Pool accepted a share
    ShareAccepted(ShareId),

    /// Pool rejected a share
    ShareRejected {
        share_id: ShareId,
        reason: Option<String>,
    },

    /// Non-fatal session error worth logging
    Error(String),
}

/// Channel a session reports on.
pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// A protocol session with one pool.
///
/// Methods are called with the pool's session lock held and must not block;
/// implementations do their I/O on their own tasks and report back through
/// the [`SessionEventSender`] they were created with.
pub trait PoolSession: Send {
    /// Start connecting. Success is reported later as [`SessionEvent::Online`].
    fn connect(&mut self) -> Result<()>;

    /// Close the connection. No further events are expected afterward.
    fn disconnect(&mut self);

    /// Send a share, returning the ID its verdict will carry.
    fn submit(&mut self, share: SubmitParams) -> Result<ShareId>;
}

/// Creates sessions for pool configurations.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        id: &PoolId,
        config: &PoolConfig,
        events: SessionEventSender,
    ) -> Result<Box<dyn PoolSession>>;
}

#[derive(Debug)]
struct PoolState {
    online: bool,
    difficulty: f64,
    job: Option<Job>,
}

/// Share counters for one pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    lost: AtomicU64,
}

impl PoolStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

/// A configured pool.
pub struct Pool {
    id: PoolId,
    config: PoolConfig,
    disabled: AtomicBool,
    retired: AtomicBool,
    state: Mutex<PoolState>,
    session: Mutex<Box<dyn PoolSession>>,
    work: Mutex<WorkCache>,
    stats: PoolStats,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("url", &self.config.url)
            .field("priority", &self.config.priority)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub(crate) fn new(id: PoolId, config: PoolConfig, session: Box<dyn PoolSession>) -> Self {
        Self {
            work: Mutex::new(WorkCache::new(id.clone(), config.algorithm)),
            disabled: AtomicBool::new(config.disabled),
            retired: AtomicBool::new(false),
            state: Mutex::new(PoolState {
                online: false,
                difficulty: 1.0,
                job: None,
            }),
            session: Mutex::new(session),
            stats: PoolStats::default(),
            id,
            config,
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Lower is preferred.
    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Set once the pool has been removed from its manager. Handles still
    /// held elsewhere must treat a retired pool as gone.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn difficulty(&self) -> f64 {
        self.state.lock().difficulty
    }

    /// ID of the job the work cache is serving.
    pub fn job_id(&self) -> Option<String> {
        self.work.lock().job_id().map(str::to_owned)
    }

    pub fn height(&self) -> Option<u32> {
        self.work.lock().height()
    }

    pub fn coin_difficulty(&self) -> Option<f64> {
        self.work.lock().coin_difficulty()
    }

    /// Whether the work cache can produce work.
    pub fn has_work(&self) -> bool {
        self.work.lock().has_job()
    }

    pub(crate) fn set_online(&self, online: bool) -> bool {
        std::mem::replace(&mut self.state.lock().online, online)
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_difficulty(&self, difficulty: f64) {
        self.state.lock().difficulty = difficulty;
    }

    pub(crate) fn set_job(&self, job: Job) {
        self.state.lock().job = Some(job);
    }

    pub(crate) fn record_accepted(&self) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.stats.lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed the latest job and difficulty into the work cache.
    pub fn refresh_work(&self) -> std::result::Result<WorkUpdate, WorkError> {
        let (job, difficulty) = {
            let state = self.state.lock();
            (state.job.clone(), state.difficulty)
        };
        match job {
            Some(job) => self.work.lock().update(&job, difficulty),
            None => Ok(WorkUpdate::Unchanged),
        }
    }

    /// Take one work item and schedule a cache refill behind it.
    ///
    /// Returns `None` when the pool is offline, retired, or has no job yet.
    pub fn take_work(self: &Arc<Self>) -> Option<WorkItem> {
        if !self.is_online() || self.is_retired() {
            return None;
        }
        let item = self.work.lock().get()?;
        self.schedule_refill();
        Some(item)
    }

    fn schedule_refill(self: &Arc<Self>) {
        let weak: Weak<Pool> = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(pool) = weak.upgrade() {
                        if !pool.is_retired() {
                            pool.work.lock().refill();
                        }
                    }
                });
            }
            // Outside a runtime, refill inline
            Err(_) => self.work.lock().refill(),
        }
    }

    pub fn submit(&self, share: SubmitParams) -> Result<ShareId> {
        self.session.lock().submit(share)
    }

    pub(crate) fn connect(&self) -> Result<()> {
        debug!(pool = %self.id, url = %self.config.url, "Connecting");
        self.session.lock().connect()
    }

    pub(crate) fn disconnect(&self) {
        debug!(pool = %self.id, url = %self.config.url, "Disconnecting");
        self.session.lock().disconnect();
    }
}
