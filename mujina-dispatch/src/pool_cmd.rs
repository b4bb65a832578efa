//! Pool command queue for external control interfaces.
//!
//! Control surfaces (an API, a CLI socket) talk to the running pool manager
//! through these commands rather than holding a reference to it. Each command
//! carries a oneshot channel for the reply.

use tokio::sync::oneshot;

use crate::error::Result;
use crate::pool::{PoolConfig, PoolHandle, PoolId, PoolProvider};

/// Commands that can be sent to the pool manager for execution.
#[derive(Debug)]
pub enum PoolCommand {
    /// Add a pool and connect it unless it is disabled.
    Add {
        config: PoolConfig,
        response_tx: oneshot::Sender<Result<PoolId>>,
    },

    /// Re-enable a disabled pool.
    Enable {
        id: PoolId,
        response_tx: oneshot::Sender<Result<bool>>,
    },

    /// Disconnect a pool but keep its configuration.
    Disable {
        id: PoolId,
        response_tx: oneshot::Sender<Result<bool>>,
    },

    /// Disconnect and forget a pool.
    Remove {
        id: PoolId,
        response_tx: oneshot::Sender<Result<bool>>,
    },

    /// Register a pool provider and poll it. Replies with how many of its
    /// pools were added.
    RegisterProvider {
        provider: Box<dyn PoolProvider>,
        response_tx: oneshot::Sender<usize>,
    },

    /// Snapshot of every pool.
    List {
        response_tx: oneshot::Sender<Vec<PoolSummary>>,
    },
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSummary {
    pub id: PoolId,
    pub url: String,
    pub priority: u32,
    pub online: bool,
    pub disabled: bool,
    pub job_id: Option<String>,
    pub difficulty: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub lost: u64,
}

impl From<&PoolHandle> for PoolSummary {
    fn from(pool: &PoolHandle) -> Self {
        Self {
            id: pool.id().clone(),
            url: pool.url().to_owned(),
            priority: pool.priority(),
            online: pool.is_online(),
            disabled: pool.is_disabled(),
            job_id: pool.job_id(),
            difficulty: pool.difficulty(),
            accepted: pool.stats().accepted(),
            rejected: pool.stats().rejected(),
            lost: pool.stats().lost(),
        }
    }
}
