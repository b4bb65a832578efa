//! Device scheduling.
//!
//! A [`Scheduler`] owns the devices it admits and the online pools it knows
//! about, and decides which pool's work each device gets. The decisions are
//! delegated to a [`Policy`]; everything policies have in common (admission,
//! share tracking, dispatch) lives in [`SchedulerCore`].
//!
//! Admission: a device goes to the scheduler named by its affinity, or to the
//! default scheduler when it names none. Since every scheduler applies the
//! same rule to the same device, a device ends up in at most one scheduler.
//!
//! Shares: a solution is submitted to its pool and remembered as pending until
//! the pool accepts or rejects it. Pending shares older than
//! [`SHARE_TIMEOUT`] are counted as lost, oldest first.

mod priority;
mod rotation;
mod round_robin;

pub use priority::PriorityPolicy;
pub use round_robin::{RoundRobinMode, RoundRobinPolicy};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus, EventKind, EventReceiver, ShareOutcome};
use crate::pool::{PoolHandle, PoolId, ShareId, SubmitParams};
use crate::tracing::prelude::*;
use crate::work::WorkItem;

/// Name of the priority scheduler.
pub const PRIORITY: &str = "priority";

/// Name of the round-robin scheduler.
pub const ROUND_ROBIN: &str = "round-robin";

/// Age after which an unanswered share is counted as lost.
pub const SHARE_TIMEOUT: Duration = Duration::from_secs(300);

/// Events every scheduler subscribes to.
pub const SUBSCRIPTIONS: &[EventKind] = &[
    EventKind::PoolOnline,
    EventKind::PoolOffline,
    EventKind::JobDecoded,
    EventKind::PoolDifficultyChanged,
    EventKind::PoolShareAccepted,
    EventKind::PoolShareRejected,
    EventKind::DeviceConnected,
    EventKind::DeviceDisconnected,
    EventKind::DeviceIdle,
    EventKind::SolutionFound,
];

/// Stable device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mining device as schedulers see it.
pub trait Device: Send + Sync {
    fn id(&self) -> &DeviceId;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "Miner"
    }

    /// Has nothing to hash.
    fn is_idle(&self) -> bool;

    /// Hashing.
    fn is_busy(&self) -> bool;

    /// Name of the scheduler this device wants, if any.
    fn scheduler_affinity(&self) -> Option<&str>;

    /// Hand the device new work, or `None` to stop it.
    fn send_work(&self, work: Option<WorkItem>);
}

/// Shared handle to a device.
pub type DeviceHandle = Arc<dyn Device>;

/// A device's report of a solved nonce.
#[derive(Debug, Clone)]
pub struct Solution {
    pub device_id: DeviceId,

    /// Work the nonce was found in
    pub work: WorkItem,

    /// The winning nonce; a report without one is malformed
    pub nonce: Option<u32>,

    /// Difficulty the solution achieved, if the device computed it
    pub difficulty: Option<f64>,
}

/// Share counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub accepted: u64,
    pub rejected: u64,
    pub lost: u64,
}

struct DeviceEntry {
    handle: DeviceHandle,
    stats: DeviceStats,
}

#[derive(Debug, Clone)]
struct PendingShare {
    device_id: DeviceId,
    pool_id: PoolId,
    job_id: String,
    share_id: Option<ShareId>,
    submitted_at: Instant,
}

/// State shared by every scheduling policy.
pub struct SchedulerCore {
    name: String,
    default: bool,
    devices: HashMap<DeviceId, DeviceEntry>,
    // Online pools in the order they came online
    pools: Vec<PoolHandle>,
    pending: VecDeque<PendingShare>,
    accepted_by_pool: HashMap<PoolId, u64>,
}

impl SchedulerCore {
    fn new(name: &str, default: bool) -> Self {
        Self {
            name: name.to_owned(),
            default,
            devices: HashMap::new(),
            pools: Vec::new(),
            pending: VecDeque::new(),
            accepted_by_pool: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    /// Whether this scheduler should take a device.
    pub fn admits(&self, device: &dyn Device) -> bool {
        match device.scheduler_affinity() {
            Some(name) => name == self.name,
            None => self.default,
        }
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceHandle> {
        self.devices.get(id).map(|entry| &entry.handle)
    }

    pub fn has_device(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Handles of every admitted device, sorted by ID.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        let mut devices: Vec<DeviceHandle> =
            self.devices.values().map(|e| e.handle.clone()).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_stats(&self, id: &DeviceId) -> Option<DeviceStats> {
        self.devices.get(id).map(|entry| entry.stats)
    }

    pub fn pool(&self, id: &PoolId) -> Option<&PoolHandle> {
        self.pools.iter().find(|p| p.id() == id)
    }

    /// Known online pools, in the order they came online.
    pub fn pools(&self) -> &[PoolHandle] {
        &self.pools
    }

    /// Shares accepted by a pool through this scheduler.
    pub fn accepted_by_pool(&self, id: &PoolId) -> u64 {
        self.accepted_by_pool.get(id).copied().unwrap_or(0)
    }

    pub fn pending_shares(&self) -> usize {
        self.pending.len()
    }

    /// Send a device the next work item from a pool.
    ///
    /// Returns false without touching the device when the pool is offline or
    /// has no job.
    pub fn dispatch(&self, device: &DeviceHandle, pool: &PoolHandle) -> bool {
        let Some(work) = pool.take_work() else {
            return false;
        };
        debug!(
            pool = %pool.id(),
            job_id = %work.job_id,
            device = %device.id(),
            "Dispatching work"
        );
        device.send_work(Some(work));
        true
    }

    /// Count every pending share older than [`SHARE_TIMEOUT`] as lost.
    fn prune_lost_shares(&mut self, now: Instant) -> usize {
        let mut lost = 0;
        while self
            .pending
            .front()
            .is_some_and(|s| now.saturating_duration_since(s.submitted_at) >= SHARE_TIMEOUT)
        {
            let Some(share) = self.pending.pop_front() else {
                break;
            };
            if let Some(pool) = self.pool(&share.pool_id) {
                pool.record_lost();
            }
            if let Some(entry) = self.devices.get_mut(&share.device_id) {
                entry.stats.lost += 1;
            }
            debug!(
                pool = %share.pool_id,
                job_id = %share.job_id,
                device = %share.device_id,
                "Found lost share"
            );
            lost += 1;
        }
        lost
    }

    fn take_pending(&mut self, pool: &PoolId, share_id: ShareId) -> Option<PendingShare> {
        let index = self
            .pending
            .iter()
            .position(|s| &s.pool_id == pool && s.share_id == Some(share_id))?;
        self.pending.remove(index)
    }
}

/// A scheduling strategy.
///
/// Hooks run on the scheduler's task after the core has updated its maps:
/// `device_added` after the device is admitted, `device_removed` after it is
/// dropped, `pool_added`/`pool_removed` after the pool list changed.
pub trait Policy: Send {
    /// Scheduler name, matched against device affinities.
    fn name(&self) -> &'static str;

    /// Pool the device is currently bound to.
    fn assignment(&self, device: &DeviceId) -> Option<&PoolId>;

    fn device_added(&mut self, core: &mut SchedulerCore, device: &DeviceHandle);

    fn device_removed(&mut self, core: &mut SchedulerCore, device: &DeviceHandle);

    fn device_idle(&mut self, core: &mut SchedulerCore, device: &DeviceHandle);

    fn pool_added(&mut self, core: &mut SchedulerCore, pool: &PoolHandle);

    fn pool_removed(&mut self, core: &mut SchedulerCore, pool: &PoolHandle);

    /// A pool's work cache was rebuilt for a new job.
    fn new_job(&mut self, core: &mut SchedulerCore, pool: &PoolHandle);

    fn difficulty_changed(&mut self, _core: &mut SchedulerCore, _pool: &PoolHandle) {}

    fn share_accepted(&mut self, _core: &mut SchedulerCore, _pool: &PoolId) {}

    /// Period of [`tick`](Self::tick), if the policy needs one.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    fn tick(&mut self, _core: &mut SchedulerCore, _now: Instant) {}
}

/// A scheduler running one policy.
pub struct Scheduler<P: Policy> {
    core: SchedulerCore,
    policy: P,
    bus: EventBus,
}

impl<P: Policy> Scheduler<P> {
    pub fn new(policy: P, default: bool, bus: EventBus) -> Self {
        Self {
            core: SchedulerCore::new(policy.name(), default),
            policy,
            bus,
        }
    }

    pub fn core(&self) -> &SchedulerCore {
        &self.core
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Pool a device is bound to.
    pub fn assignment(&self, device: &DeviceId) -> Option<&PoolId> {
        self.policy.assignment(device)
    }

    pub fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::PoolOnline(pool) => self.on_pool_online(pool),
            BusEvent::PoolOffline(pool) => self.on_pool_offline(pool),
            BusEvent::JobDecoded(pool) => {
                if self.core.pool(pool.id()).is_some() {
                    self.policy.new_job(&mut self.core, &pool);
                }
            }
            BusEvent::PoolDifficultyChanged(pool) => {
                if self.core.pool(pool.id()).is_some() {
                    self.policy.difficulty_changed(&mut self.core, &pool);
                }
            }
            BusEvent::PoolShareAccepted(outcome) => self.on_share_outcome(&outcome, true),
            BusEvent::PoolShareRejected(outcome) => self.on_share_outcome(&outcome, false),
            BusEvent::DeviceConnected(device) => self.on_device_online(device),
            BusEvent::DeviceDisconnected(device) => self.on_device_offline(device),
            BusEvent::DeviceIdle(device) => {
                if self.core.has_device(device.id()) {
                    self.policy.device_idle(&mut self.core, &device);
                }
            }
            BusEvent::SolutionFound(solution) => self.on_solution(solution),
            BusEvent::PoolNewJob(_) | BusEvent::SchedulerReady(_) => {}
        }
    }

    fn on_device_online(&mut self, device: DeviceHandle) {
        if !self.core.admits(device.as_ref()) || self.core.has_device(device.id()) {
            return;
        }
        info!(
            device = %device.id(),
            name = device.name(),
            scheduler = self.core.name(),
            "Device attached to scheduler"
        );
        self.core.devices.insert(
            device.id().clone(),
            DeviceEntry {
                handle: device.clone(),
                stats: DeviceStats::default(),
            },
        );
        self.policy.device_added(&mut self.core, &device);
    }

    fn on_device_offline(&mut self, device: DeviceHandle) {
        if self.core.devices.remove(device.id()).is_none() {
            return;
        }
        info!(
            device = %device.id(),
            name = device.name(),
            scheduler = self.core.name(),
            "Device released by scheduler"
        );
        self.policy.device_removed(&mut self.core, &device);
    }

    fn on_pool_online(&mut self, pool: PoolHandle) {
        self.core.prune_lost_shares(Instant::now());
        if self.core.pool(pool.id()).is_none() {
            self.core.pools.push(pool.clone());
        }
        self.policy.pool_added(&mut self.core, &pool);
    }

    fn on_pool_offline(&mut self, pool: PoolHandle) {
        self.core.prune_lost_shares(Instant::now());
        let before = self.core.pools.len();
        self.core.pools.retain(|p| p.id() != pool.id());
        if self.core.pools.len() != before {
            self.policy.pool_removed(&mut self.core, &pool);
        }
    }

    fn on_share_outcome(&mut self, outcome: &ShareOutcome, accepted: bool) {
        self.core.prune_lost_shares(Instant::now());
        let Some(share) = self.core.take_pending(outcome.pool.id(), outcome.share_id) else {
            return;
        };

        if let Some(entry) = self.core.devices.get_mut(&share.device_id) {
            if accepted {
                entry.stats.accepted += 1;
            } else {
                entry.stats.rejected += 1;
            }
        }

        if accepted {
            *self
                .core
                .accepted_by_pool
                .entry(share.pool_id.clone())
                .or_default() += 1;
            self.policy.share_accepted(&mut self.core, &share.pool_id);
        } else {
            warn!(
                pool = %share.pool_id,
                job_id = %share.job_id,
                device = %share.device_id,
                reason = outcome.reason.as_deref().unwrap_or("none given"),
                "Share rejected"
            );
        }
    }

    fn on_solution(&mut self, solution: Solution) {
        if !self.core.has_device(&solution.device_id) {
            return;
        }
        let Some(nonce) = solution.nonce else {
            warn!(device = %solution.device_id, "Caught solution without a nonce");
            return;
        };
        let work = &solution.work;
        let pool = match self.core.pool(&work.pool_id) {
            Some(pool) if pool.is_online() => pool.clone(),
            _ => {
                warn!(
                    pool = %work.pool_id,
                    job_id = %work.job_id,
                    "Solution found for job while pool is offline"
                );
                return;
            }
        };

        let now = Instant::now();
        self.core.prune_lost_shares(now);

        info!(
            pool = %pool.id(),
            job_id = %work.job_id,
            device = %solution.device_id,
            nonce = format!("{nonce:08x}"),
            difficulty = ?solution.difficulty,
            "Solution found"
        );

        let share_id = match pool.submit(SubmitParams {
            job_id: work.job_id.clone(),
            extranonce2: work.extranonce2_hex(),
            ntime: work.ntime_hex(),
            nonce,
        }) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(pool = %pool.id(), error = %e, "Share submission failed");
                None
            }
        };

        self.core.pending.push_back(PendingShare {
            device_id: solution.device_id,
            pool_id: pool.id().clone(),
            job_id: work.job_id.clone(),
            share_id,
            submitted_at: now,
        });
    }

    pub async fn run(mut self, running: CancellationToken, mut events: EventReceiver) {
        let mut ticker = self.policy.tick_interval().map(|period| {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        self.bus
            .publish(BusEvent::SchedulerReady(self.core.name().to_owned()));
        info!(
            scheduler = self.core.name(),
            default = self.core.is_default(),
            "Scheduler ready"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                now = next_tick(&mut ticker) => {
                    self.policy.tick(&mut self.core, now);
                }
                _ = running.cancelled() => break,
            }
        }
        trace!(scheduler = self.core.name(), "Scheduler exiting");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => future::pending().await,
    }
}
