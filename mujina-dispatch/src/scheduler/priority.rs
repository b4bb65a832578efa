//! Priority failover policy.
//!
//! Pools are ranked by their configured priority, 0 being the best. Devices
//! mine the active tier: every online pool with work that shares the best
//! priority among such pools. When the tier holds several pools, idle devices
//! rotate through them.

use std::collections::HashMap;

use super::{DeviceHandle, DeviceId, Policy, SchedulerCore, PRIORITY};
use crate::pool::{PoolHandle, PoolId};
use crate::tracing::prelude::*;

#[derive(Debug, Default)]
pub struct PriorityPolicy {
    assignments: HashMap<DeviceId, PoolId>,
}

/// Online pools with work at the best priority, in the order they came online.
fn active_tier(core: &SchedulerCore) -> Vec<PoolHandle> {
    let mut pools: Vec<PoolHandle> = core
        .pools()
        .iter()
        .filter(|p| p.is_online() && p.has_work())
        .cloned()
        .collect();
    pools.sort_by_key(|p| p.priority());

    let Some(best) = pools.first().map(|p| p.priority()) else {
        return pools;
    };
    pools.retain(|p| p.priority() == best);
    pools
}

impl PriorityPolicy {
    fn feed(&mut self, core: &SchedulerCore, device: &DeviceHandle, pool: &PoolHandle) {
        if !core.dispatch(device, pool) {
            return;
        }
        let previous = self
            .assignments
            .insert(device.id().clone(), pool.id().clone());
        if previous.as_ref() != Some(pool.id()) {
            info!(
                device = %device.id(),
                pool = %pool.id(),
                priority = pool.priority(),
                "Device switched pool"
            );
        }
    }
}

impl Policy for PriorityPolicy {
    fn name(&self) -> &'static str {
        PRIORITY
    }

    fn assignment(&self, device: &DeviceId) -> Option<&PoolId> {
        self.assignments.get(device)
    }

    fn device_added(&mut self, core: &mut SchedulerCore, device: &DeviceHandle) {
        if let Some(head) = active_tier(core).first() {
            self.feed(core, device, head);
        }
    }

    fn device_removed(&mut self, _core: &mut SchedulerCore, device: &DeviceHandle) {
        self.assignments.remove(device.id());
    }

    fn device_idle(&mut self, core: &mut SchedulerCore, device: &DeviceHandle) {
        let tier = active_tier(core);
        let current = self
            .assignments
            .get(device.id())
            .and_then(|id| tier.iter().position(|p| p.id() == id));

        let next = match (tier.len(), current) {
            (0, _) => return,
            (1, _) | (_, None) => 0,
            (len, Some(index)) => (index + 1) % len,
        };
        self.feed(core, device, &tier[next]);
    }

    fn pool_added(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        self.new_job(core, pool);
    }

    fn pool_removed(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        let orphans: Vec<DeviceId> = self
            .assignments
            .iter()
            .filter(|(_, bound)| *bound == pool.id())
            .map(|(device, _)| device.clone())
            .collect();
        if orphans.is_empty() {
            return;
        }

        let head = active_tier(core).into_iter().next();
        for id in orphans {
            self.assignments.remove(&id);
            let (Some(head), Some(device)) = (&head, core.device(&id).cloned()) else {
                continue;
            };
            debug!(device = %id, from = %pool.id(), to = %head.id(), "Failing over");
            self.feed(core, &device, head);
        }
    }

    fn new_job(&mut self, core: &mut SchedulerCore, pool: &PoolHandle) {
        let tier = active_tier(core);
        if !tier.iter().any(|p| p.id() == pool.id()) {
            return;
        }

        for device in core.devices() {
            let eligible = device.is_idle()
                || match self.assignments.get(device.id()) {
                    None => true,
                    Some(bound) => bound == pool.id() || !tier.iter().any(|p| p.id() == bound),
                };
            if eligible {
                self.feed(core, &device, pool);
            }
        }
    }
}
