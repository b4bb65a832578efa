//! Per-algorithm merkle root hashing and difficulty multipliers.

use bitcoin::hashes::{sha256, sha256d, Hash};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Proof-of-work algorithm a pool mines.
///
/// Only affects how the coinbase hash seeds the merkle root and how the share
/// difficulty is scaled; branch folding is always double SHA-256.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Algorithm {
    #[default]
    Sha256d,
    Keccak,
    Keccakc,
    Blakecoin,
    #[serde(alias = "gr0estl")]
    #[strum(serialize = "groestl", serialize = "gr0estl")]
    Groestl,
}

impl Algorithm {
    /// Factor the pool difficulty is divided by before computing targets.
    pub fn multiplier(self) -> u32 {
        match self {
            Algorithm::Keccak => 0x80,
            Algorithm::Keccakc => 0x100,
            _ => 1,
        }
    }

    fn single_sha_root(self) -> bool {
        matches!(
            self,
            Algorithm::Keccak | Algorithm::Blakecoin | Algorithm::Groestl
        )
    }

    /// Hash a serialized coinbase into the first merkle node.
    pub fn coinbase_hash(self, coinbase: &[u8]) -> [u8; 32] {
        if self.single_sha_root() {
            sha256::Hash::hash(coinbase).to_byte_array()
        } else {
            sha256d::Hash::hash(coinbase).to_byte_array()
        }
    }

    /// Compute the merkle root for a coinbase and the pool's branch list.
    pub fn merkle_root(self, coinbase: &[u8], branches: &[[u8; 32]]) -> [u8; 32] {
        let mut node = [0u8; 64];
        branches
            .iter()
            .fold(self.coinbase_hash(coinbase), |root, branch| {
                node[..32].copy_from_slice(&root);
                node[32..].copy_from_slice(branch);
                sha256d::Hash::hash(&node).to_byte_array()
            })
    }
}
