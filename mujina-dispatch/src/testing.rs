//! Test doubles shared across modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::pool::{
    Pool, PoolHandle, PoolId, PoolSession, SessionEvent, SessionEventSender, SessionFactory,
    ShareId, SubmitParams,
};
use crate::scheduler::{Device, DeviceHandle, DeviceId};
use crate::work::{Algorithm, Job, WorkItem};

/// Coinbase prefix as a pool would send it: version, one input, null
/// prevout, then the script length and a 3-byte height push.
pub const COINBASE1: &str = concat!(
    "01000000",
    "01",
    "0000000000000000000000000000000000000000000000000000000000000000",
    "ffffffff",
    "20",
    "03",
    "0f730d"
);

pub fn sample_job(id: &str) -> Job {
    Job {
        id: id.into(),
        prev_hash: "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054".into(),
        coinbase1: COINBASE1.into(),
        coinbase2: "ffffffff0100f2052a01000000".into(),
        merkle_branches: vec![
            "6a1a7e4cb7c1b2c5c4b5a5e08a71be4e6f11ea9b24a4d8a6f2c3a1b0c9d8e7f6".into(),
        ],
        version: "20000000".into(),
        bits: "17034219".into(),
        time: "66a8b1c2".into(),
        extranonce1: "f8002c90".into(),
        extranonce2_size: 4,
        clean_jobs: true,
    }
}

pub fn pool_config(url: &str, priority: u32) -> PoolConfig {
    PoolConfig {
        id: None,
        url: url.into(),
        username: "worker".into(),
        password: None,
        priority,
        algorithm: Algorithm::default(),
        disabled: false,
    }
}

/// Everything a mock session was asked to do.
#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    pub connects: usize,
    pub disconnects: usize,
    pub submits: Vec<SubmitParams>,
}

pub struct MockSession {
    log: Arc<Mutex<SessionLog>>,
    fail_submit: bool,
}

impl PoolSession for MockSession {
    fn connect(&mut self) -> Result<()> {
        self.log.lock().connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.lock().disconnects += 1;
    }

    fn submit(&mut self, share: SubmitParams) -> Result<ShareId> {
        if self.fail_submit {
            return Err(crate::error::Error::Pool("submit failed".into()));
        }
        let mut log = self.log.lock();
        log.submits.push(share);
        Ok(log.submits.len() as ShareId)
    }
}

struct MockEntry {
    events: SessionEventSender,
    log: Arc<Mutex<SessionLog>>,
}

/// Factory handing out [`MockSession`]s; tests inject session events through
/// it and inspect what each session was asked to do.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    sessions: Arc<Mutex<HashMap<PoolId, MockEntry>>>,
}

impl MockSessionFactory {
    pub fn log(&self, id: &PoolId) -> SessionLog {
        self.sessions
            .lock()
            .get(id)
            .map(|entry| entry.log.lock().clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, id: &PoolId, event: SessionEvent) {
        if let Some(entry) = self.sessions.lock().get(id) {
            let _ = entry.events.send(event);
        }
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        id: &PoolId,
        _config: &PoolConfig,
        events: SessionEventSender,
    ) -> Result<Box<dyn PoolSession>> {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        self.sessions.lock().insert(
            id.clone(),
            MockEntry {
                events,
                log: log.clone(),
            },
        );
        Ok(Box::new(MockSession {
            log,
            fail_submit: false,
        }))
    }
}

/// A standalone pool with a mock session, offline and without a job.
pub fn pool(id: &str, priority: u32) -> PoolHandle {
    pool_with_log(id, priority).0
}

/// Like [`pool`], also returning the session log.
pub fn pool_with_log(id: &str, priority: u32) -> (PoolHandle, Arc<Mutex<SessionLog>>) {
    let log = Arc::new(Mutex::new(SessionLog::default()));
    let session = MockSession {
        log: log.clone(),
        fail_submit: false,
    };
    let pool = Pool::new(
        PoolId::new(id),
        pool_config(&format!("dummy://{id}"), priority),
        Box::new(session),
    );
    (Arc::new(pool), log)
}

/// A pool whose session refuses every share.
pub fn failing_pool(id: &str) -> PoolHandle {
    let session = MockSession {
        log: Arc::default(),
        fail_submit: true,
    };
    Arc::new(Pool::new(
        PoolId::new(id),
        pool_config(&format!("dummy://{id}"), 0),
        Box::new(session),
    ))
}

/// Bring a pool online with a decoded job.
pub fn give_job(pool: &PoolHandle, job_id: &str) {
    pool.set_online(true);
    pool.set_job(sample_job(job_id));
    pool.refresh_work().unwrap();
}

/// An online pool serving one job.
pub fn online_pool(id: &str, priority: u32) -> PoolHandle {
    let pool = pool(id, priority);
    give_job(&pool, "1");
    pool
}

/// A device that records the work it is sent.
pub struct MockDevice {
    id: DeviceId,
    affinity: Option<String>,
    idle: AtomicBool,
    received: Mutex<Vec<Option<WorkItem>>>,
}

impl MockDevice {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_affinity(id, None)
    }

    pub fn with_affinity(id: &str, affinity: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::new(id),
            affinity: affinity.map(str::to_owned),
            idle: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        self.clone()
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    /// Work items received so far, oldest first.
    pub fn received(&self) -> Vec<Option<WorkItem>> {
        self.received.lock().clone()
    }

    /// Pool the most recent work came from.
    pub fn last_pool(&self) -> Option<PoolId> {
        self.received
            .lock()
            .iter()
            .rev()
            .flatten()
            .next()
            .map(|work| work.pool_id.clone())
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }
}

impl Device for MockDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    fn is_busy(&self) -> bool {
        !self.is_idle()
    }

    fn scheduler_affinity(&self) -> Option<&str> {
        self.affinity.as_deref()
    }

    fn send_work(&self, work: Option<WorkItem>) {
        if work.is_some() {
            self.idle.store(false, Ordering::Relaxed);
        }
        self.received.lock().push(work);
    }
}
