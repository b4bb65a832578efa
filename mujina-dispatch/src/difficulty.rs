//! Conversions between pool difficulty, targets and compact bits.
//!
//! Pools speak in floating-point difficulty; devices want a target to compare
//! hashes against; block headers carry the target in compact "bits" form.
//! These functions move between the three representations:
//!
//! - [`difficulty_to_target`]: full 256-bit target, little-endian bytes
//! - [`difficulty_to_target64`]: most significant 64 bits of the target
//! - [`hash_to_difficulty`]: the difficulty a hash (or target) represents
//! - [`bits_to_difficulty`] / [`difficulty_to_bits`]: compact encoding
//!
//! The arithmetic follows the reference client's `SetCompact`, `GetCompact`
//! and `GetDifficulty` in floating point, so results are reproducible to the
//! last bit of an `f64`. Invalid input (zero, negative, NaN, infinity) never
//! panics: targets saturate to the maximum and difficulties collapse to zero.

use bitcoin::pow::Target;

/// Numerator of the 64-bit target: `0xffff << 28`.
const TARGET64_BASE: u64 = 0x0000_0fff_f000_0000;

/// Mantissa of the difficulty-1 target in the reference client's double
/// arithmetic (`0xffff0000`).
const DIFF1_MANTISSA: f64 = 4_294_901_760.0;

const TWO_POW_32: f64 = 4_294_967_296.0;

/// Convert a difficulty to a full 256-bit target.
///
/// The returned bytes are little-endian, i.e. byte 31 is the most significant.
/// `hex::encode` of the result gives the conventional hex rendering used by
/// pools and logs. Non-finite or non-positive difficulty yields the maximum
/// target, all bytes `0xff`.
pub fn difficulty_to_target(difficulty: f64) -> [u8; 32] {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return [0xff; 32];
    }

    let mut diff = difficulty;
    let mut k = 6usize;
    while k > 0 && diff > 1.0 {
        diff /= TWO_POW_32;
        k -= 1;
    }

    // Float-to-int casts saturate, which is what we want for tiny difficulties
    let m = (DIFF1_MANTISSA / diff) as u64;

    let mut target = [0u8; 32];
    let offset = k * 4;
    target[offset..offset + 4].copy_from_slice(&(m as u32).to_le_bytes());
    target[offset + 4..offset + 8].copy_from_slice(&((m >> 32) as u32).to_le_bytes());
    target
}

/// Convert a difficulty to the most significant 64 bits of its target.
///
/// Devices that compare only the top word of a hash use this instead of the
/// full target. Non-finite or non-positive difficulty yields `u64::MAX`.
pub fn difficulty_to_target64(difficulty: f64) -> u64 {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return u64::MAX;
    }

    let mult = 4096.0 * difficulty;
    if mult < 1.0 {
        return TARGET64_BASE;
    }
    TARGET64_BASE / mult as u64
}

/// Compute the difficulty a hash represents.
///
/// The hash is in internal byte order (little-endian integer), the same order
/// [`difficulty_to_target`] produces, so a target can be passed in as well.
/// Returns positive infinity for an all-zero hash.
pub fn hash_to_difficulty(hash: &[u8; 32]) -> f64 {
    if hash.iter().all(|&b| b == 0) {
        return f64::INFINITY;
    }
    Target::from_le_bytes(*hash).difficulty_float()
}

/// Convert compact bits from a block header to a difficulty.
///
/// Returns 0 for zero bits, a zero mantissa, or a result too small or large
/// to represent.
pub fn bits_to_difficulty(bits: u32) -> f64 {
    if bits == 0 {
        return 0.0;
    }

    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return 0.0;
    }

    let mut shift = (bits >> 24) & 0xff;
    let mut diff = 65535.0 / mantissa as f64;
    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }

    if diff.is_finite() {
        diff
    } else {
        0.0
    }
}

/// Convert a difficulty to compact bits.
///
/// Returns 0 for non-finite or non-positive difficulty, or when the result
/// does not fit the compact encoding.
pub fn difficulty_to_bits(difficulty: f64) -> u32 {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return 0;
    }

    let scaled = |shift_bytes: i32| 65535.0 * 256f64.powi(shift_bytes) / difficulty;

    let mut shift_bytes: i32 = 1;
    let mut word = scaled(shift_bytes);
    // Difficulties below one can overflow the 24-bit mantissa at the
    // starting shift; back off until it fits.
    while word >= 16_777_216.0 {
        shift_bytes -= 1;
        if shift_bytes < -0xe2 {
            return 0;
        }
        word = scaled(shift_bytes);
    }
    while word < 65535.0 {
        shift_bytes += 1;
        if shift_bytes > 0x1d {
            return 0;
        }
        word = scaled(shift_bytes);
    }

    let mut word = (word as u32) & 0x00ff_ffff;
    let mut size = 0x1d - shift_bytes;

    // 0x00800000 is the sign bit; shift the mantissa down a byte if it is set
    if word & 0x0080_0000 != 0 {
        word >>= 8;
        size += 1;
    }
    if word & !0x007f_ffff != 0 || !(0..=0xff).contains(&size) {
        return 0;
    }

    ((size as u32) << 24) | word
}

/// Format a difficulty with an SI suffix for logs, e.g. "9.75M".
pub fn format_difficulty(difficulty: f64) -> String {
    let (scaled, suffix) = if difficulty >= 1e15 {
        (difficulty / 1e15, "P")
    } else if difficulty >= 1e12 {
        (difficulty / 1e12, "T")
    } else if difficulty >= 1e9 {
        (difficulty / 1e9, "G")
    } else if difficulty >= 1e6 {
        (difficulty / 1e6, "M")
    } else if difficulty >= 1e3 {
        (difficulty / 1e3, "K")
    } else {
        (difficulty, "")
    };

    if scaled >= 100.0 {
        format!("{:.0}{}", scaled, suffix)
    } else if scaled >= 10.0 {
        format!("{:.1}{}", scaled, suffix)
    } else {
        format!("{:.2}{}", scaled, suffix)
    }
}
