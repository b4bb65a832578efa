//! Local pool session that invents its own jobs.
//!
//! Useful for exercising devices and schedulers without pool connectivity: a
//! `dummy://` pool comes online immediately, sends a fresh synthetic job on a
//! fixed interval, and accepts every share it is given. The jobs are well
//! formed (the coinbase even carries a block height) but can never produce a
//! real block.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{
    PoolConfig, PoolId, PoolSession, SessionEvent, SessionEventSender, SessionFactory, ShareId,
    SubmitParams,
};
use crate::difficulty;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::work::Job;

/// URL scheme served by [`DummySession`].
pub const DUMMY_SCHEME: &str = "dummy";

const JOB_INTERVAL: Duration = Duration::from_secs(30);
const SHARE_DIFFICULTY: f64 = 1.0;
const NETWORK_DIFFICULTY: f64 = 1_000_000.0;
const BLOCK_HEIGHT: u32 = 800_000;

/// Generates synthetic jobs. Job ids keep counting across reconnects.
struct JobGenerator {
    block_height: u32,
    job_id_counter: u64,
    bits: u32,
}

impl JobGenerator {
    fn new(network_difficulty: f64) -> Self {
        Self {
            block_height: BLOCK_HEIGHT,
            job_id_counter: 0,
            bits: difficulty::difficulty_to_bits(network_difficulty),
        }
    }

    fn next_job(&mut self) -> Job {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        // Recognizable prev_hash so these never get mistaken for pool work
        let mut prev_hash = [0u8; 32];
        prev_hash[0..4].copy_from_slice(&self.block_height.to_be_bytes());
        prev_hash[4..8].copy_from_slice(b"TEST");

        // Coinbase input: null prevout, then a BIP34 height push
        let height = self.block_height.to_le_bytes();
        let mut coinbase1 = vec![0x01, 0x00, 0x00, 0x00, 0x01];
        coinbase1.extend_from_slice(&[0u8; 32]);
        coinbase1.extend_from_slice(&[0xff; 4]);
        coinbase1.extend_from_slice(&[0x0e, 0x03, height[0], height[1], height[2]]);
        coinbase1.extend_from_slice(b"MUJINA");

        let job = Job {
            id: format!("{:x}", self.job_id_counter),
            prev_hash: hex::encode(prev_hash),
            coinbase1: hex::encode(coinbase1),
            coinbase2: "ffffffff0100f2052a010000000000000000".into(),
            merkle_branches: Vec::new(),
            version: "20000000".into(),
            bits: format!("{:08x}", self.bits),
            time: format!("{:08x}", now),
            extranonce1: "00000000".into(),
            extranonce2_size: 4,
            clean_jobs: true,
        };
        self.job_id_counter += 1;

        debug!(
            job_id = %job.id,
            block_height = self.block_height,
            bits = %job.bits,
            "Generated synthetic job"
        );
        job
    }
}

/// Session for `dummy://` pools.
pub struct DummySession {
    pool_id: PoolId,
    events: SessionEventSender,
    interval: Duration,
    generator: Arc<Mutex<JobGenerator>>,
    running: Option<CancellationToken>,
    next_share: ShareId,
}

impl DummySession {
    pub fn new(pool_id: PoolId, events: SessionEventSender) -> Self {
        Self::with_interval(pool_id, events, JOB_INTERVAL)
    }

    pub fn with_interval(pool_id: PoolId, events: SessionEventSender, interval: Duration) -> Self {
        Self {
            pool_id,
            events,
            interval,
            generator: Arc::new(Mutex::new(JobGenerator::new(NETWORK_DIFFICULTY))),
            running: None,
            next_share: 1,
        }
    }
}

async fn job_loop(
    generator: Arc<Mutex<JobGenerator>>,
    events: SessionEventSender,
    running: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);

    if events.send(SessionEvent::Online).is_err()
        || events
            .send(SessionEvent::DifficultyChanged(SHARE_DIFFICULTY))
            .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = generator.lock().next_job();
                if events.send(SessionEvent::NewJob(job)).is_err() {
                    break;
                }
            }
            _ = running.cancelled() => break,
        }
    }
}

impl PoolSession for DummySession {
    fn connect(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let handle = Handle::try_current()
            .map_err(|e| Error::Pool(format!("cannot start dummy session: {e}")))?;

        let running = CancellationToken::new();
        handle.spawn(job_loop(
            self.generator.clone(),
            self.events.clone(),
            running.clone(),
            self.interval,
        ));
        self.running = Some(running);
        info!(pool = %self.pool_id, "Dummy pool session started");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel();
            let _ = self.events.send(SessionEvent::Offline);
        }
    }

    fn submit(&mut self, share: SubmitParams) -> Result<ShareId> {
        let share_id = self.next_share;
        self.next_share += 1;
        debug!(
            pool = %self.pool_id,
            job_id = %share.job_id,
            nonce = format!("{:08x}", share.nonce),
            share_id,
            "Dummy pool accepting share"
        );
        let _ = self.events.send(SessionEvent::ShareAccepted(share_id));
        Ok(share_id)
    }
}

/// Session factory for the schemes this crate ships.
#[derive(Debug, Default, Clone)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn create(
        &self,
        id: &PoolId,
        config: &PoolConfig,
        events: SessionEventSender,
    ) -> Result<Box<dyn PoolSession>> {
        match config.url.split_once("://") {
            Some((DUMMY_SCHEME, _)) => Ok(Box::new(DummySession::new(id.clone(), events))),
            Some((scheme, _)) => Err(Error::Pool(format!(
                "unsupported pool protocol \"{scheme}\" in {}",
                config.url
            ))),
            None => Err(Error::Config(format!("malformed pool URL {}", config.url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::work::{Algorithm, WorkCache};
    use tokio::sync::mpsc;

    #[test]
    fn test_generated_jobs_decode() {
        let mut generator = JobGenerator::new(NETWORK_DIFFICULTY);
        let first = generator.next_job();
        let second = generator.next_job();
        assert_ne!(first.id, second.id);

        let mut cache = WorkCache::new(PoolId::new("d"), Algorithm::Sha256d);
        cache.update(&first, SHARE_DIFFICULTY).unwrap();
        assert_eq!(cache.height(), Some(BLOCK_HEIGHT));
        let coin = cache.coin_difficulty().unwrap();
        assert!((coin - NETWORK_DIFFICULTY).abs() / NETWORK_DIFFICULTY < 1e-3);
    }

    #[test]
    fn test_factory_rejects_unknown_schemes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = DefaultSessionFactory;
        let id = PoolId::new("p");

        assert!(factory
            .create(&id, &testing::pool_config("dummy://local", 0), tx.clone())
            .is_ok());
        assert!(matches!(
            factory.create(&id, &testing::pool_config("stratum+tcp://pool:3333", 0), tx.clone()),
            Err(Error::Pool(_))
        ));
        assert!(matches!(
            factory.create(&id, &testing::pool_config("pool:3333", 0), tx),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            DummySession::with_interval(PoolId::new("d"), tx, Duration::from_secs(5));

        session.connect().unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Online));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::DifficultyChanged(SHARE_DIFFICULTY))
        );
        assert!(matches!(rx.recv().await, Some(SessionEvent::NewJob(job)) if job.id == "0"));
        assert!(matches!(rx.recv().await, Some(SessionEvent::NewJob(job)) if job.id == "1"));

        let share = SubmitParams {
            job_id: "1".into(),
            extranonce2: "00000000".into(),
            ntime: "00000000".into(),
            nonce: 42,
        };
        let id = session.submit(share).unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::ShareAccepted(id)));

        session.disconnect();
        assert_eq!(rx.recv().await, Some(SessionEvent::Offline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_ids_continue_after_reconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            DummySession::with_interval(PoolId::new("d"), tx, Duration::from_secs(5));

        session.connect().unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Online));
        rx.recv().await;
        assert!(matches!(rx.recv().await, Some(SessionEvent::NewJob(job)) if job.id == "0"));

        session.disconnect();
        assert_eq!(rx.recv().await, Some(SessionEvent::Offline));

        session.connect().unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Online));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::DifficultyChanged(SHARE_DIFFICULTY))
        );
        assert!(matches!(rx.recv().await, Some(SessionEvent::NewJob(job)) if job.id == "1"));

        session.disconnect();
    }
}
