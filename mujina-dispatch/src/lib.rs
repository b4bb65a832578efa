//! Work generation and device scheduling core for mujina.
//!
//! Pools hand out jobs; devices want ready-to-hash headers. This crate sits in
//! between:
//!
//! - [`pool`] owns pool sessions, gives them unique identities, and relays
//!   their lifecycle events onto the [`bus`].
//! - [`work`] turns a pool's current job into block header candidates and keeps
//!   a self-sizing cache of them per pool.
//! - [`scheduler`] binds devices to pools under a pluggable policy and tracks
//!   submitted shares until the pool answers or they time out.
//! - [`difficulty`] holds the target/difficulty/compact-bits conversions.
//!
//! Components never share mutable state directly; they exchange events over a
//! single [`bus::EventBus`] constructed by the [`daemon`] and handed to each of
//! them.

pub mod bus;
pub mod config;
pub mod daemon;
pub mod difficulty;
pub mod error;
pub mod pool;
pub mod pool_cmd;
pub mod scheduler;
pub mod tracing;
pub mod work;

#[cfg(test)]
mod testing;
