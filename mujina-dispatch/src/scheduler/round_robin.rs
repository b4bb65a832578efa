//! Round-robin policy.
//!
//! Devices are spread over every online pool with work, moving to the next
//! pool in the rotation depending on the mode:
//!
//! - [`RoundRobinMode::Idle`]: whenever the device runs out of work.
//! - [`RoundRobinMode::Timed`]: after mining one pool for a fixed interval.
//! - [`RoundRobinMode::LoadBalance`]: when one pool's accepted shares pull
//!   ahead of another's; idle devices keep their pool.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::rotation::Rotation;
use super::{DeviceHandle, DeviceId, Policy, SchedulerCore, ROUND_ROBIN};
use crate::config::RoundRobinConfig;
use crate::pool::{PoolHandle, PoolId};
use crate::tracing::prelude::*;

/// Shortest allowed timed-switch interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// How often timed switching is checked.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Accepted-share lead that makes load balancing move a device.
pub const LOAD_BALANCE_MARGIN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundRobinMode {
    Idle,
    Timed(Duration),
    LoadBalance,
}

impl RoundRobinMode {
    /// A nonzero interval wins over load balancing.
    pub fn from_config(config: &RoundRobinConfig) -> Self {
        match config.interval {
            Some(secs) if secs > 0 => {
                let mut interval = Duration::from_secs(secs);
                if interval < MIN_INTERVAL {
                    warn!(
                        interval = secs,
                        minimum = MIN_INTERVAL.as_secs(),
                        "Timed interval is below allowed minimum, using minimum"
                    );
                    interval = MIN_INTERVAL;
                }
                Self::Timed(interval)
            }
            _ if config.load_balance => Self::LoadBalance,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
pub struct RoundRobinPolicy {
    mode: RoundRobinMode,
    rotation: Rotation,
    // Pool each device last received work for, and since when
    switched: HashMap<DeviceId, (PoolId, Instant)>,
}

impl RoundRobinPolicy {
    pub fn new(mode: RoundRobinMode) -> Self {
        Self {
            mode,
            rotation: Rotation::default(),
            switched: HashMap::new(),
        }
    }

    pub fn mode(&self) -> RoundRobinMode {
        self.mode
    }

    fn assigned(&mut self, core: &SchedulerCore, device_id: &DeviceId, pool_id: &PoolId) {
        if self.switched.get(device_id).map(|(p, _)| p) != Some(pool_id) {
            self.switched
                .insert(device_id.clone(), (pool_id.clone(), Instant::now()));
            info!(device = %device_id, pool = %pool_id, "Device switched pool");
        }
        if let (Some(device), Some(pool)) = (core.device(device_id), core.pool(pool_id)) {
            core.dispatch(device, pool);
        }
    }

    fn refeed(&self, core: &SchedulerCore, device: &DeviceHandle) {
        let pool = self
            .rotation
            .assignment(device.id())
            .and_then(|id| core.pool(id));
        if let Some(pool) = pool {
            core.dispatch(device, pool);
        }
    }

    fn rotate(&mut self, core: &SchedulerCore, device_id: &DeviceId) {
        if let Some(pool) = self.rotation.assign(device_id) {
            self.assigned(core, device_id, &pool);
        }
    }

    fn join(&mut self, core: &SchedulerCore, pool: &PoolHandle) {
        for (device, pool) in self.rotation.add_pool(pool.id()) {
            self.assigned(core, &device, &pool);
        }
    }

    fn balance(&mut self, core: &SchedulerCore) {
        if self.rotation.pool_count() < 2 {
            return;
        }
        let counts: Vec<(PoolId, u64)> = self
            .rotation
            .pools()
            .iter()
            .map(|id| (id.clone(), core.accepted_by_pool(id)))
            .collect();
        let (Some((leader, most)), Some((laggard, least))) = (
            counts.iter().max_by_key(|(_, n)| *n),
            counts.iter().min_by_key(|(_, n)| *n),
        ) else {
            return;
        };
        if most - least <= LOAD_BALANCE_MARGIN {
            return;
        }

        let donors = self.rotation.devices_on(leader);
        if donors.len() <= self.rotation.devices_on(laggard).len() {
            return;
        }
        let Some(device) = donors.last() else {
            return;
        };
        debug!(
            device = %device,
            from = %leader,
            to = %laggard,
            lead = most - least,
            "Balancing accepted shares"
        );
        if self.rotation.assign_to(device, laggard) {
            self.assigned(core, device, laggard);
        }
    }
}

impl Policy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn assignment(&self, device: &DeviceId) -> Option<&PoolId> {
        self.rotation.assignment(device)
    }

    fn device_added(&mut self, core: &mut SchedulerCore, device: &DeviceHandle) {
        if let Some(pool) = self.rotation.add_device(device.id()) {
            self.assigned(core, device.id(), &pool);
        }
    }

    fn device_removed(&mut self, _core: &mut SchedulerCore, device: &DeviceHandle) {
        self.rotation.remove_device(device.id());
        self.switched.remove(device.id());
    }

    fn device_idle(&mut self, core: &mut SchedulerCore, device: &DeviceHandle) {
        match self.mode {
            RoundRobinMode::Idle if self.rotation.pool_count() > 1 => {
                debug!(device = %device.id(), "Switching idle device");
                self.rotate(core, device.id());
            }
            _ => self.refeed(core, device),
        }
    }

    fn pool_added(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        // Pools may announce themselves before their first job
        if pool.is_online() && pool.has_work() {
            self.join(core, pool);
        }
    }

    fn pool_removed(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        for device in self.rotation.remove_pool(pool.id()) {
            self.rotate(core, &device);
        }
    }

    fn new_job(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        if !self.rotation.contains_pool(pool.id()) {
            if pool.is_online() {
                self.join(core, pool);
            }
            return;
        }
        for id in self.rotation.devices_on(pool.id()) {
            if let Some(device) = core.device(&id) {
                core.dispatch(device, pool);
            }
        }
    }

    fn share_accepted(&mut self, core: &mut SchedulerCore, _pool: &PoolId) {
        if self.mode == RoundRobinMode::LoadBalance {
            self.balance(core);
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        match self.mode {
            RoundRobinMode::Timed(_) => Some(TICK_INTERVAL),
            _ => None,
        }
    }

    fn tick(&mut self, core: &mut SchedulerCore, now: Instant) {
        let RoundRobinMode::Timed(interval) = self.mode else {
            return;
        };
        if self.rotation.pool_count() < 2 {
            return;
        }
        let due: Vec<DeviceId> = self
            .switched
            .iter()
            .filter(|(_, (_, since))| now.saturating_duration_since(*since) >= interval)
            .map(|(device, _)| device.clone())
            .collect();
        for device in due {
            debug!(device = %device, "Switching device after interval");
            self.rotate(core, &device);
        }
    }
}
