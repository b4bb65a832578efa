//! Task that keeps every pool's work cache current.

use tokio_util::sync::CancellationToken;

use super::WorkUpdate;
use crate::bus::{BusEvent, EventBus, EventKind, EventReceiver};
use crate::pool::PoolHandle;
use crate::tracing::prelude::*;

/// Events the decoder needs.
pub const SUBSCRIPTIONS: &[EventKind] = &[EventKind::PoolNewJob, EventKind::PoolDifficultyChanged];

/// Rebuilds a pool's work cache on job and difficulty changes and announces
/// fresh jobs as [`BusEvent::JobDecoded`].
pub struct WorkDecoder {
    bus: EventBus,
}

impl WorkDecoder {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::PoolNewJob(pool) | BusEvent::PoolDifficultyChanged(pool) => {
                self.refresh(&pool)
            }
            _ => {}
        }
    }

    fn refresh(&self, pool: &PoolHandle) {
        if pool.is_retired() {
            return;
        }

        match pool.refresh_work() {
            Ok(WorkUpdate::NewJob) => {
                info!(
                    pool = %pool.id(),
                    job = pool.job_id().as_deref().unwrap_or("-"),
                    height = ?pool.height(),
                    difficulty = pool.difficulty(),
                    "New job"
                );
                self.bus.publish(BusEvent::JobDecoded(pool.clone()));
            }
            Ok(WorkUpdate::TargetRefreshed) => {
                debug!(pool = %pool.id(), difficulty = pool.difficulty(), "Share target changed");
            }
            Ok(WorkUpdate::Unchanged) => {}
            Err(e) => {
                warn!(pool = %pool.id(), error = %e, "Discarding malformed job");
            }
        }
    }

    pub async fn run(self, running: CancellationToken, mut events: EventReceiver) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = running.cancelled() => break,
            }
        }
        trace!("Work decoder exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::testing::sample_job;

    #[tokio::test]
    async fn test_new_job_publishes_job_decoded_once() {
        let bus = EventBus::new();
        let mut decoded = bus.subscribe(&[EventKind::JobDecoded]);
        let decoder = WorkDecoder::new(bus.clone());

        let pool = testing::pool("aa", 0);
        pool.set_difficulty(1.0);
        pool.set_job(sample_job("1"));

        decoder.handle_event(BusEvent::PoolNewJob(pool.clone()));
        decoder.handle_event(BusEvent::PoolNewJob(pool.clone()));

        assert!(matches!(decoded.try_recv(), Ok(BusEvent::JobDecoded(p)) if p.id() == pool.id()));
        assert!(decoded.try_recv().is_err());
        assert!(pool.has_work());
    }

    #[tokio::test]
    async fn test_difficulty_change_alone_does_not_announce() {
        let bus = EventBus::new();
        let mut decoded = bus.subscribe(&[EventKind::JobDecoded]);
        let decoder = WorkDecoder::new(bus.clone());

        let pool = testing::pool("aa", 0);
        pool.set_difficulty(1.0);
        pool.set_job(sample_job("1"));
        decoder.handle_event(BusEvent::PoolNewJob(pool.clone()));
        let _ = decoded.try_recv();

        pool.set_difficulty(2.0);
        decoder.handle_event(BusEvent::PoolDifficultyChanged(pool.clone()));
        assert!(decoded.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_job_is_dropped() {
        let bus = EventBus::new();
        let mut decoded = bus.subscribe(&[EventKind::JobDecoded]);
        let decoder = WorkDecoder::new(bus.clone());

        let pool = testing::pool("aa", 0);
        let mut job = sample_job("1");
        job.coinbase1 = "xyz".into();
        pool.set_job(job);

        decoder.handle_event(BusEvent::PoolNewJob(pool.clone()));
        assert!(decoded.try_recv().is_err());
        assert!(!pool.has_work());
    }
}
