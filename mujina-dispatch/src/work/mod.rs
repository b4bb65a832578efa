//! Turning pool jobs into hashable work.
//!
//! A pool's current [`Job`] is decoded once into a template; the per-pool
//! [`WorkCache`] then stamps out [`WorkItem`]s from it, each with its own
//! extranonce2 and therefore its own merkle root and header. The
//! [`WorkDecoder`] task reacts to pool job and difficulty events and keeps
//! every pool's cache current.

mod algorithm;
mod cache;
mod decoder;
mod job;

pub use algorithm::Algorithm;
pub use cache::{WorkCache, WorkCacheStats, WorkUpdate};
pub use decoder::{WorkDecoder, SUBSCRIPTIONS as DECODER_SUBSCRIPTIONS};
pub use job::Job;

use thiserror::Error;

use crate::pool::PoolId;

/// Failures while decoding a job into work.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("job field {field} is not valid hex: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("job field {field} must be {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported extranonce2 size {0} (at most 8 bytes)")]
    Extranonce2Size(usize),
}

/// One unit of hashable work.
///
/// Immutable once produced. The nonce field of `header` is zero; the device
/// searches it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Pool this work belongs to
    pub pool_id: PoolId,

    /// Pool job the header was built from
    pub job_id: String,

    /// Block height parsed from the coinbase (1 if it could not be found)
    pub height: u32,

    /// 80-byte block header, each 32-bit word byte-swapped
    pub header: [u8; 80],

    /// Extranonce2 value this header was built with
    pub extranonce2: u32,

    /// Extranonce2 width in bytes, as the pool requested
    pub extranonce2_size: usize,

    /// Header timestamp, as sent by the pool
    pub ntime: u32,

    /// Share target, little-endian
    pub target: [u8; 32],

    /// Top 64 bits of the share target
    pub target64: u64,

    /// Algorithm difficulty multiplier
    pub multiplier: u32,
}

impl WorkItem {
    /// Extranonce2 as the hex string a pool expects on submit.
    pub fn extranonce2_hex(&self) -> String {
        format!(
            "{:0width$x}",
            self.extranonce2,
            width = self.extranonce2_size * 2
        )
    }

    /// Header timestamp as hex, for share submission.
    pub fn ntime_hex(&self) -> String {
        format!("{:08x}", self.ntime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn item(extranonce2: u32, extranonce2_size: usize) -> WorkItem {
        WorkItem {
            pool_id: PoolId::new("p"),
            job_id: "1".into(),
            height: 1,
            header: [0; 80],
            extranonce2,
            extranonce2_size,
            ntime: 0x5f5e1000,
            target: [0; 32],
            target64: 0,
            multiplier: 1,
        }
    }

    #[test_case(0, 4, "00000000")]
    #[test_case(0x1234, 4, "00001234")]
    #[test_case(0xdeadbeef, 8, "00000000deadbeef")]
    fn test_extranonce2_hex(value: u32, size: usize, expected: &str) {
        assert_eq!(item(value, size).extranonce2_hex(), expected);
    }

    #[test]
    fn test_ntime_hex() {
        assert_eq!(item(0, 4).ntime_hex(), "5f5e1000");
    }
}
