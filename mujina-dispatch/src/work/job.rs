//! Pool job descriptors and their decoded form.

use serde::{Deserialize, Serialize};

use super::WorkError;
use crate::difficulty;

/// A mining job as a pool sends it. All fields except the sizes and flags
/// are hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    #[serde(default)]
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub bits: String,
    pub time: String,
    pub extranonce1: String,
    pub extranonce2_size: usize,
    #[serde(default)]
    pub clean_jobs: bool,
}

/// A job with every field decoded and checked, ready to stamp out headers.
#[derive(Debug, Clone)]
pub(crate) struct JobTemplate {
    pub id: String,
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
    pub branches: Vec<[u8; 32]>,
    pub version: [u8; 4],
    pub bits: [u8; 4],
    pub time: [u8; 4],
    pub height: u32,
    pub coin_difficulty: f64,
}

/// Extranonce2 is always written as at least a full 32-bit counter.
const MIN_EXTRANONCE2_SIZE: usize = 4;
const MAX_EXTRANONCE2_SIZE: usize = 8;

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, WorkError> {
    hex::decode(value).map_err(|source| WorkError::Hex { field, source })
}

fn decode_array<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], WorkError> {
    let bytes = decode(field, value)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| WorkError::Length {
        field,
        expected: N,
        actual,
    })
}

impl TryFrom<&Job> for JobTemplate {
    type Error = WorkError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        if job.extranonce2_size > MAX_EXTRANONCE2_SIZE {
            return Err(WorkError::Extranonce2Size(job.extranonce2_size));
        }

        let bits: [u8; 4] = decode_array("bits", &job.bits)?;
        let coinbase1 = decode("coinbase1", &job.coinbase1)?;

        Ok(Self {
            id: job.id.clone(),
            prev_hash: decode_array("prev_hash", &job.prev_hash)?,
            height: decode_block_height(&coinbase1),
            coinbase1,
            coinbase2: decode("coinbase2", &job.coinbase2)?,
            extranonce1: decode("extranonce1", &job.extranonce1)?,
            extranonce2_size: job.extranonce2_size.max(MIN_EXTRANONCE2_SIZE),
            branches: job
                .merkle_branches
                .iter()
                .map(|branch| decode_array("merkle_branches", branch))
                .collect::<Result<_, _>>()?,
            version: decode_array("version", &job.version)?,
            time: decode_array("time", &job.time)?,
            coin_difficulty: difficulty::bits_to_difficulty(u32::from_be_bytes(bits)),
            bits,
        })
    }
}

impl JobTemplate {
    /// Header timestamp as a number.
    pub fn ntime(&self) -> u32 {
        u32::from_be_bytes(self.time)
    }

    /// Serialize the coinbase transaction for one extranonce2 value.
    pub fn coinbase(&self, extranonce2: u32) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(
            self.coinbase1.len()
                + self.extranonce1.len()
                + self.extranonce2_size
                + self.coinbase2.len(),
        );
        coinbase.extend_from_slice(&self.coinbase1);
        coinbase.extend_from_slice(&self.extranonce1);
        coinbase.resize(coinbase.len() + self.extranonce2_size - 4, 0);
        coinbase.extend_from_slice(&extranonce2.to_be_bytes());
        coinbase.extend_from_slice(&self.coinbase2);
        coinbase
    }

    /// Assemble the 80-byte header for a merkle root, nonce zeroed and every
    /// 32-bit word byte-swapped.
    pub fn header(&self, merkle_root: &[u8; 32]) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.version);
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&self.time);
        header[72..76].copy_from_slice(&self.bits);
        for word in header.chunks_exact_mut(4) {
            word.reverse();
        }
        header
    }
}

/// Best-effort block height from the coinbase script.
///
/// Looks for the end of the coinbase input's previous-output index
/// (`ffffffff`) past the first 32 bytes, skips the script length, and reads the
/// height push. Returns 1 if anything along the way is missing.
pub(crate) fn decode_block_height(coinbase1: &[u8]) -> u32 {
    parse_block_height(coinbase1).unwrap_or(1)
}

fn parse_block_height(buf: &[u8]) -> Option<u32> {
    let mut pi = 32;
    while pi < buf.len() && buf[pi] != 0xff {
        pi += 1;
    }
    while pi < buf.len() && buf[pi] == 0xff {
        pi += 1;
    }
    if pi < 2 || buf.get(pi - 1) != Some(&0xff) || buf.get(pi - 2) != Some(&0xff) {
        return None;
    }

    let len = *buf.get(pi + 1)?;
    pi += 2;
    let low = buf.get(pi..pi + 2)?;
    let mut height = u32::from(u16::from_le_bytes([low[0], low[1]]));
    pi += 2;

    match len {
        4 => {
            let high = buf.get(pi..pi + 2)?;
            height += 0x10000 * u32::from(u16::from_le_bytes([high[0], high[1]]));
        }
        3 => height += 0x10000 * u32::from(*buf.get(pi)?),
        _ => {}
    }

    Some(height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_job, COINBASE1};
    use test_case::test_case;

    #[test]
    fn test_decode_sample_job() {
        let template = JobTemplate::try_from(&sample_job("1")).unwrap();
        assert_eq!(template.height, 881_423);
        assert_eq!(template.ntime(), 0x66a8b1c2);
        assert_eq!(template.branches.len(), 1);
        assert!(template.coin_difficulty > 1.0e13);
    }

    #[test_case(|job: &mut Job| job.prev_hash = "zz".into() ; "bad hex")]
    #[test_case(|job: &mut Job| job.prev_hash = "0011".into() ; "short prev_hash")]
    #[test_case(|job: &mut Job| job.bits = "1703421900".into() ; "long bits")]
    #[test_case(|job: &mut Job| job.merkle_branches.push("abcd".into()) ; "short branch")]
    #[test_case(|job: &mut Job| job.extranonce2_size = 16 ; "huge extranonce2")]
    fn test_decode_rejects(mutate: fn(&mut Job)) {
        let mut job = sample_job("1");
        mutate(&mut job);
        assert!(JobTemplate::try_from(&job).is_err());
    }

    #[test]
    fn test_coinbase_layout() {
        let mut job = sample_job("1");
        job.extranonce2_size = 6;
        let template = JobTemplate::try_from(&job).unwrap();
        let coinbase = template.coinbase(0x0102_0304);

        let cb1 = template.coinbase1.len();
        let en1 = template.extranonce1.len();
        assert_eq!(
            &coinbase[cb1 + en1..cb1 + en1 + 6],
            &[0, 0, 1, 2, 3, 4]
        );
        assert_eq!(coinbase.len(), cb1 + en1 + 6 + template.coinbase2.len());
    }

    #[test_case(0 ; "none")]
    #[test_case(2 ; "two bytes")]
    fn test_small_extranonce2_widens_to_counter(size: usize) {
        let mut job = sample_job("1");
        job.extranonce2_size = size;
        let template = JobTemplate::try_from(&job).unwrap();
        assert_eq!(template.extranonce2_size, 4);

        let coinbase = template.coinbase(0x0a0b_0c0d);
        let start = template.coinbase1.len() + template.extranonce1.len();
        assert_eq!(&coinbase[start..start + 4], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(coinbase.len(), start + 4 + template.coinbase2.len());
    }

    #[test]
    fn test_header_swaps_words() {
        let template = JobTemplate::try_from(&sample_job("1")).unwrap();
        let header = template.header(&[0u8; 32]);
        assert_eq!(&header[0..4], &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(&header[68..72], &[0xc2, 0xb1, 0xa8, 0x66]);
        assert_eq!(&header[76..80], &[0, 0, 0, 0]);
    }

    #[test_case(COINBASE1, 881_423 ; "three byte push")]
    #[test_case(concat!("0100000001", "0000000000000000000000000000000000000000000000000000000000000000", "ffffffff", "20", "04", "0f730d01") , 0x010d730f ; "four byte push")]
    #[test_case("0011", 1 ; "too short")]
    #[test_case(concat!("0100000001", "0000000000000000000000000000000000000000000000000000000000000000", "00000000", "20"), 1 ; "no marker")]
    fn test_block_height(coinbase1: &str, expected: u32) {
        let bytes = hex::decode(coinbase1).unwrap();
        assert_eq!(decode_block_height(&bytes), expected);
    }
}
