//! Device-to-pool rotation bookkeeping.
//!
//! Tracks which pool each device is bound to and hands out the next pool in
//! insertion order on request. Pure bookkeeping: callers act on the
//! assignments it returns.

use std::collections::HashMap;

use crate::pool::PoolId;
use crate::scheduler::DeviceId;

#[derive(Debug, Default)]
pub(crate) struct Rotation {
    devices: Vec<DeviceId>,
    pools: Vec<PoolId>,
    assignments: HashMap<DeviceId, PoolId>,
}

impl Rotation {
    /// Add a device and bind it to a pool if it has none.
    pub fn add_device(&mut self, device: &DeviceId) -> Option<PoolId> {
        if !self.devices.contains(device) {
            self.devices.push(device.clone());
        }
        match self.assignments.get(device) {
            Some(pool) => Some(pool.clone()),
            None => self.assign(device),
        }
    }

    pub fn remove_device(&mut self, device: &DeviceId) {
        self.devices.retain(|d| d != device);
        self.assignments.remove(device);
    }

    /// Add a pool (idempotent) and bind every unassigned device.
    pub fn add_pool(&mut self, pool: &PoolId) -> Vec<(DeviceId, PoolId)> {
        if !self.pools.contains(pool) {
            self.pools.push(pool.clone());
        }
        self.unassigned()
            .into_iter()
            .filter_map(|device| {
                let pool = self.assign(&device)?;
                Some((device, pool))
            })
            .collect()
    }

    /// Remove a pool, returning the devices that lost their binding.
    pub fn remove_pool(&mut self, pool: &PoolId) -> Vec<DeviceId> {
        let Some(index) = self.pools.iter().position(|p| p == pool) else {
            return Vec::new();
        };
        self.pools.remove(index);

        let orphans: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|d| self.assignments.get(*d) == Some(pool))
            .cloned()
            .collect();
        for device in &orphans {
            self.assignments.remove(device);
        }
        orphans
    }

    /// Bind a device to the pool after its current one, wrapping around.
    pub fn assign(&mut self, device: &DeviceId) -> Option<PoolId> {
        let next = match self.pools.len() {
            0 => return None,
            1 => 0,
            len => self
                .assignments
                .get(device)
                .and_then(|current| self.pools.iter().position(|p| p == current))
                .map_or(0, |index| (index + 1) % len),
        };
        let pool = self.pools[next].clone();
        self.assignments.insert(device.clone(), pool.clone());
        Some(pool)
    }

    /// Bind a device to a specific pool in the rotation.
    pub fn assign_to(&mut self, device: &DeviceId, pool: &PoolId) -> bool {
        if !self.pools.contains(pool) || !self.devices.contains(device) {
            return false;
        }
        self.assignments.insert(device.clone(), pool.clone());
        true
    }

    pub fn unassigned(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| !self.assignments.contains_key(*d))
            .cloned()
            .collect()
    }

    /// Devices bound to a pool, in the order they were added.
    pub fn devices_on(&self, pool: &PoolId) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| self.assignments.get(*d) == Some(pool))
            .cloned()
            .collect()
    }

    pub fn assignment(&self, device: &DeviceId) -> Option<&PoolId> {
        self.assignments.get(device)
    }

    pub fn pools(&self) -> &[PoolId] {
        &self.pools
    }

    pub fn contains_pool(&self, pool: &PoolId) -> bool {
        self.pools.contains(pool)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    fn pool(id: &str) -> PoolId {
        PoolId::new(id)
    }

    #[test]
    fn test_device_without_pools_stays_unassigned() {
        let mut rr = Rotation::default();
        assert_eq!(rr.add_device(&dev("d1")), None);
        assert_eq!(rr.unassigned(), [dev("d1")]);
    }

    #[test]
    fn test_adding_pool_binds_waiting_devices() {
        let mut rr = Rotation::default();
        rr.add_device(&dev("d1"));
        rr.add_device(&dev("d2"));

        let assigned = rr.add_pool(&pool("a"));
        assert_eq!(
            assigned,
            [(dev("d1"), pool("a")), (dev("d2"), pool("a"))]
        );
        assert!(rr.unassigned().is_empty());

        // Idempotent
        assert!(rr.add_pool(&pool("a")).is_empty());
        assert_eq!(rr.pool_count(), 1);
    }

    #[test]
    fn test_assign_cycles_through_pools() {
        let mut rr = Rotation::default();
        rr.add_pool(&pool("a"));
        rr.add_pool(&pool("b"));
        rr.add_pool(&pool("c"));
        assert_eq!(rr.add_device(&dev("d1")), Some(pool("a")));

        assert_eq!(rr.assign(&dev("d1")), Some(pool("b")));
        assert_eq!(rr.assign(&dev("d1")), Some(pool("c")));
        assert_eq!(rr.assign(&dev("d1")), Some(pool("a")));
    }

    #[test]
    fn test_single_pool_assign_is_stable() {
        let mut rr = Rotation::default();
        rr.add_pool(&pool("a"));
        rr.add_device(&dev("d1"));
        assert_eq!(rr.assign(&dev("d1")), Some(pool("a")));
    }

    #[test]
    fn test_remove_pool_orphans_its_devices() {
        let mut rr = Rotation::default();
        rr.add_pool(&pool("a"));
        rr.add_device(&dev("d1"));
        rr.add_pool(&pool("b"));
        rr.add_device(&dev("d2"));
        rr.assign(&dev("d2"));
        assert_eq!(rr.assignment(&dev("d2")), Some(&pool("b")));

        assert_eq!(rr.remove_pool(&pool("a")), [dev("d1")]);
        assert_eq!(rr.assignment(&dev("d1")), None);
        assert_eq!(rr.devices_on(&pool("b")), [dev("d2")]);
        assert!(rr.remove_pool(&pool("a")).is_empty());
    }

    #[test]
    fn test_remove_device_clears_binding() {
        let mut rr = Rotation::default();
        rr.add_pool(&pool("a"));
        rr.add_device(&dev("d1"));
        rr.remove_device(&dev("d1"));
        assert!(rr.devices_on(&pool("a")).is_empty());
        assert!(!rr.assign_to(&dev("d1"), &pool("a")));
    }
}
