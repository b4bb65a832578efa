//! Self-sizing per-pool cache of work items.
//!
//! Every job swap is a chance to learn how much work the current set of
//! devices actually pulls between jobs. Generating a header costs a coinbase
//! hash and a merkle fold, so the cache pre-builds that many items when the
//! job arrives and refills one behind each consumer. The sizing rules:
//!
//! - If the cache ran dry during the last job, grow by the number of times it
//!   did.
//! - Otherwise, if far more was produced than consumed, shrink: halve when the
//!   size exceeded total consumption, else step down by one.
//! - Never go below one.

use std::time::{Duration, Instant};

use super::job::{Job, JobTemplate};
use super::{Algorithm, WorkError, WorkItem};
use crate::difficulty;
use crate::pool::PoolId;
use crate::tracing::prelude::*;

/// What [`WorkCache::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUpdate {
    /// Same job, same difficulty
    Unchanged,

    /// Same job, but the share target was recomputed
    TargetRefreshed,

    /// A new job was decoded and the cache rebuilt
    NewJob,
}

/// Counters for the job currently being served.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkCacheStats {
    pub cache_size: usize,
    pub cached: usize,
    pub produced: usize,
    pub consumed: usize,
    pub drained: usize,
    pub avg_lifespan: Option<Duration>,
}

/// Work cache for one pool.
pub struct WorkCache {
    pool_id: PoolId,
    algorithm: Algorithm,
    template: Option<JobTemplate>,
    cache: Vec<WorkItem>,
    cache_size: usize,
    extranonce2: u32,

    // Difficulty the current targets were built for
    difficulty: Option<f64>,
    target: [u8; 32],
    target64: u64,

    last_update: Option<Instant>,
    avg_lifespan: Option<Duration>,
    produced: usize,
    consumed: usize,
    drained: usize,
}

impl WorkCache {
    pub fn new(pool_id: PoolId, algorithm: Algorithm) -> Self {
        Self {
            pool_id,
            algorithm,
            template: None,
            cache: Vec::new(),
            cache_size: 1,
            extranonce2: 0,
            difficulty: None,
            target: [0; 32],
            target64: 0,
            last_update: None,
            avg_lifespan: None,
            produced: 0,
            consumed: 0,
            drained: 0,
        }
    }

    /// Bring the cache in line with the pool's current job and difficulty.
    ///
    /// The share target is recomputed whenever the difficulty changed. The
    /// cache is only rebuilt when the job ID differs from the one already
    /// being served; calling this again with the same job is a no-op. A job
    /// that fails to decode leaves the previous one in place.
    pub fn update(&mut self, job: &Job, difficulty: f64) -> Result<WorkUpdate, WorkError> {
        self.update_at(job, difficulty, Instant::now())
    }

    fn update_at(
        &mut self,
        job: &Job,
        difficulty: f64,
        now: Instant,
    ) -> Result<WorkUpdate, WorkError> {
        let mut outcome = WorkUpdate::Unchanged;

        if self.difficulty != Some(difficulty) {
            let scaled = difficulty / f64::from(self.algorithm.multiplier());
            self.target = difficulty::difficulty_to_target(scaled);
            self.target64 = difficulty::difficulty_to_target64(scaled);
            self.difficulty = Some(difficulty);
            trace!(pool = %self.pool_id, difficulty, "Share target updated");
            outcome = WorkUpdate::TargetRefreshed;
        }

        if self.job_id() == Some(job.id.as_str()) {
            return Ok(outcome);
        }

        let template = JobTemplate::try_from(job)?;
        self.template = Some(template);
        self.extranonce2 = 0;

        if let Some(last) = self.last_update {
            let lifespan = now.saturating_duration_since(last);
            self.avg_lifespan = Some(match self.avg_lifespan {
                Some(avg) => (avg + lifespan) / 2,
                None => lifespan,
            });
            debug!(
                pool = %self.pool_id,
                lifespan = ?self.avg_lifespan,
                cache_size = self.cache_size,
                consumed = self.consumed,
                produced = self.produced,
                drained = self.drained,
                "Work counters at job change"
            );
            self.resize();
        }
        self.cache_size = self.cache_size.max(1);

        self.cache.clear();
        while self.cache.len() < self.cache_size {
            self.generate();
        }

        self.last_update = Some(now);
        self.drained = 0;
        self.produced = 0;
        self.consumed = 0;

        Ok(WorkUpdate::NewJob)
    }

    fn resize(&mut self) {
        if self.drained > 0 {
            self.cache_size += self.drained;
        } else if (self.consumed as i64)
            < self.produced as i64 - self.cache_size as i64 - 1
        {
            if self.cache_size > self.consumed {
                self.cache_size >>= 1;
            } else {
                self.cache_size -= 1;
            }
        }
    }

    /// Take one work item, generating on demand if the cache ran dry.
    ///
    /// Returns `None` before the first job has been decoded. Callers are
    /// expected to schedule a [`refill`](Self::refill) afterward.
    pub fn get(&mut self) -> Option<WorkItem> {
        self.template.as_ref()?;
        if self.cache.is_empty() {
            self.drained += 1;
            self.generate();
        }
        self.consumed += 1;
        self.cache.pop()
    }

    /// Generate one item for the current job.
    pub fn refill(&mut self) {
        if self.template.is_some() {
            trace!(pool = %self.pool_id, job = ?self.job_id(), "Refilling work cache");
            self.generate();
        }
    }

    fn generate(&mut self) {
        let Some(template) = &self.template else {
            return;
        };

        let extranonce2 = self.extranonce2;
        let coinbase = template.coinbase(extranonce2);
        let root = self.algorithm.merkle_root(&coinbase, &template.branches);

        self.cache.push(WorkItem {
            pool_id: self.pool_id.clone(),
            job_id: template.id.clone(),
            height: template.height,
            header: template.header(&root),
            extranonce2,
            extranonce2_size: template.extranonce2_size,
            ntime: template.ntime(),
            target: self.target,
            target64: self.target64,
            multiplier: self.algorithm.multiplier(),
        });
        self.extranonce2 = self.extranonce2.wrapping_add(1);
        self.produced += 1;
    }

    /// Whether a job has been decoded and work can be produced.
    pub fn has_job(&self) -> bool {
        self.template.is_some()
    }

    /// ID of the job currently being served.
    pub fn job_id(&self) -> Option<&str> {
        self.template.as_ref().map(|t| t.id.as_str())
    }

    /// Block height of the current job.
    pub fn height(&self) -> Option<u32> {
        self.template.as_ref().map(|t| t.height)
    }

    /// Network difficulty encoded in the current job's `bits`.
    pub fn coin_difficulty(&self) -> Option<f64> {
        self.template.as_ref().map(|t| t.coin_difficulty)
    }

    /// Number of ready items.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn stats(&self) -> WorkCacheStats {
        WorkCacheStats {
            cache_size: self.cache_size,
            cached: self.cache.len(),
            produced: self.produced,
            consumed: self.consumed,
            drained: self.drained,
            avg_lifespan: self.avg_lifespan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_job;

    fn cache() -> WorkCache {
        WorkCache::new(PoolId::new("aa"), Algorithm::Sha256d)
    }

    #[test]
    fn test_get_before_first_job() {
        let mut cache = cache();
        assert!(cache.get().is_none());
        assert!(!cache.has_job());
        cache.refill();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_first_job_fills_one_item() {
        let mut cache = cache();
        let outcome = cache.update(&sample_job("1"), 1.0).unwrap();
        assert_eq!(outcome, WorkUpdate::NewJob);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.job_id(), Some("1"));

        let item = cache.get().unwrap();
        assert_eq!(item.job_id, "1");
        assert_eq!(item.height, 881_423);
        assert_eq!(item.extranonce2, 0);
        assert_eq!(item.target, difficulty::difficulty_to_target(1.0));
        assert_eq!(&item.header[76..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_update_same_job_is_idempotent() {
        let mut cache = cache();
        let job = sample_job("1");
        cache.update(&job, 1.0).unwrap();
        let before = cache.stats();

        assert_eq!(cache.update(&job, 1.0).unwrap(), WorkUpdate::Unchanged);
        assert_eq!(cache.stats(), before);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_difficulty_change_refreshes_target_only() {
        let mut cache = cache();
        let job = sample_job("1");
        cache.update(&job, 1.0).unwrap();
        let cached = cache.len();

        assert_eq!(
            cache.update(&job, 16.0).unwrap(),
            WorkUpdate::TargetRefreshed
        );
        assert_eq!(cache.len(), cached);

        cache.refill();
        let fresh = cache.get().unwrap();
        assert_eq!(fresh.target, difficulty::difficulty_to_target(16.0));
    }

    #[test]
    fn test_multiplier_scales_target() {
        let mut cache = WorkCache::new(PoolId::new("aa"), Algorithm::Keccak);
        cache.update(&sample_job("1"), 256.0).unwrap();
        let item = cache.get().unwrap();
        assert_eq!(item.multiplier, 0x80);
        assert_eq!(item.target, difficulty::difficulty_to_target(2.0));
        assert_eq!(item.target64, difficulty::difficulty_to_target64(2.0));
    }

    #[test]
    fn test_items_are_unique() {
        let mut cache = cache();
        cache.update(&sample_job("1"), 1.0).unwrap();
        let a = cache.get().unwrap();
        let b = cache.get().unwrap();
        assert_ne!(a.extranonce2, b.extranonce2);
        assert_ne!(a.header, b.header);
    }

    #[test]
    fn test_bad_job_keeps_previous() {
        let mut cache = cache();
        cache.update(&sample_job("1"), 1.0).unwrap();

        let mut bad = sample_job("2");
        bad.prev_hash = "nothex".into();
        assert!(cache.update(&bad, 1.0).is_err());
        assert_eq!(cache.job_id(), Some("1"));
        assert!(cache.get().is_some());
    }

    #[test]
    fn test_drain_grows_cache() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.update_at(&sample_job("7"), 1.0, t0).unwrap();
        assert_eq!(cache.cache_size(), 1);

        // Two consumers, no refills in between: the second get drains
        assert!(cache.get().is_some());
        assert!(cache.get().is_some());
        assert_eq!(cache.stats().drained, 1);

        cache
            .update_at(&sample_job("8"), 1.0, t0 + Duration::from_secs(10))
            .unwrap();
        assert_eq!(cache.cache_size(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().avg_lifespan, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_overproduction_shrinks_cache() {
        let mut cache = cache();
        let t0 = Instant::now();
        cache.update_at(&sample_job("1"), 1.0, t0).unwrap();
        cache.get();
        cache.get();
        cache
            .update_at(&sample_job("2"), 1.0, t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(cache.cache_size(), 2);

        // Refill 6, consume 1: 1 < 6 - 2 - 1 and size > consumed
        cache.get();
        for _ in 0..6 {
            cache.refill();
        }
        cache
            .update_at(&sample_job("3"), 1.0, t0 + Duration::from_secs(2))
            .unwrap();
        assert_eq!(cache.cache_size(), 1);

        // Idle job: nothing consumed, nothing extra produced; size stays at floor
        cache
            .update_at(&sample_job("4"), 1.0, t0 + Duration::from_secs(3))
            .unwrap();
        assert_eq!(cache.cache_size(), 1);
    }

    #[test]
    fn test_overproduction_steps_down_when_consumed() {
        let mut cache = cache();
        cache.cache_size = 4;
        let t0 = Instant::now();
        cache.update_at(&sample_job("1"), 1.0, t0).unwrap();
        assert_eq!(cache.len(), 4);

        // Consume 4 (refilling behind each), then overproduce
        for _ in 0..4 {
            cache.get();
            cache.refill();
        }
        for _ in 0..6 {
            cache.refill();
        }
        // produced 4 + 6 = 10, consumed 4: 4 < 10 - 4 - 1, size 4 not > 4
        cache
            .update_at(&sample_job("2"), 1.0, t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(cache.cache_size(), 3);
    }
}
