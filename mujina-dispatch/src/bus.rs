//! Process-wide publish/subscribe event bus.
//!
//! Components subscribe to a set of [`EventKind`]s and receive matching events
//! on their own unbounded channel. Publishing only enqueues, so a publisher
//! never runs subscriber code inline and never blocks; each subscriber drains
//! its channel from its own task.
//!
//! Ordering: subscribers are served in registration order, and every
//! subscriber sees the events it subscribed to in publish order, across all
//! kinds it subscribed to. A difficulty change followed by a new job for the
//! same pool therefore reaches the work decoder in that order.
//!
//! There is no global instance. The daemon creates one bus and clones it into
//! each component; clones share the same subscriber list.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use strum::{Display, EnumDiscriminants};
use tokio::sync::mpsc;

use crate::pool::{PoolHandle, ShareId};
use crate::scheduler::{DeviceHandle, Solution};

/// Receiving end of a bus subscription.
pub type EventReceiver = mpsc::UnboundedReceiver<BusEvent>;

/// A pool's verdict on a submitted share.
#[derive(Clone)]
pub struct ShareOutcome {
    /// Pool that answered
    pub pool: PoolHandle,

    /// Identifier returned by the session when the share was submitted
    pub share_id: ShareId,

    /// Rejection reason, if the pool gave one
    pub reason: Option<String>,
}

/// Events carried by the bus.
#[derive(Clone, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, Display))]
pub enum BusEvent {
    /// Pool session connected and authorized
    PoolOnline(PoolHandle),

    /// Pool session went away
    PoolOffline(PoolHandle),

    /// Pool changed the share difficulty
    PoolDifficultyChanged(PoolHandle),

    /// Pool sent a new job (not yet turned into work)
    PoolNewJob(PoolHandle),

    /// The pool's work cache has been rebuilt for a new job
    JobDecoded(PoolHandle),

    /// Pool accepted a share
    PoolShareAccepted(ShareOutcome),

    /// Pool rejected a share
    PoolShareRejected(ShareOutcome),

    /// A scheduler finished setting up; carries its name
    SchedulerReady(String),

    /// Device came online
    DeviceConnected(DeviceHandle),

    /// Device went offline
    DeviceDisconnected(DeviceHandle),

    /// Device ran out of work
    DeviceIdle(DeviceHandle),

    /// Device reported a solution
    SolutionFound(Solution),
}

impl BusEvent {
    /// The kind used for subscription matching.
    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }
}

impl fmt::Debug for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEvent::PoolOnline(pool)
            | BusEvent::PoolOffline(pool)
            | BusEvent::PoolDifficultyChanged(pool)
            | BusEvent::PoolNewJob(pool)
            | BusEvent::JobDecoded(pool) => write!(f, "{}({})", self.kind(), pool.id()),
            BusEvent::PoolShareAccepted(outcome) | BusEvent::PoolShareRejected(outcome) => {
                write!(
                    f,
                    "{}({}, share {})",
                    self.kind(),
                    outcome.pool.id(),
                    outcome.share_id
                )
            }
            BusEvent::SchedulerReady(name) => write!(f, "{}({})", self.kind(), name),
            BusEvent::DeviceConnected(device)
            | BusEvent::DeviceDisconnected(device)
            | BusEvent::DeviceIdle(device) => write!(f, "{}({})", self.kind(), device.id()),
            BusEvent::SolutionFound(solution) => {
                write!(f, "{}({})", self.kind(), solution.device_id)
            }
        }
    }
}

struct Subscription {
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Cloneable handle to the shared event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given event kinds.
    ///
    /// Events published after this call and matching any of `kinds` are
    /// delivered to the returned receiver. Dropping the receiver ends the
    /// subscription.
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().push(Subscription {
            kinds: kinds.to_vec(),
            tx,
        });
        rx
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn publish(&self, event: BusEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;

        self.subscriptions.lock().retain(|sub| {
            if !sub.kinds.contains(&kind) {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        delivered
    }

    /// Number of live subscribers for an event kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|sub| sub.kinds.contains(&kind) && !sub.tx.is_closed())
            .count()
    }
}
