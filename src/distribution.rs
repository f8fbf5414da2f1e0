//! Size distributions for blocks and padding.
//!
//! Real blocks and the padding in front of them are sized from calibrated
//! distributions so that the data blob's structure looks like noise:
//! - Block sizes: log-normal, mean ~35 MB, clamped to [2 MB, 256 MB]
//! - Padding sizes: truncated Pareto (alpha = 1.25), [5 MB, 600 MB], mean ~17.5 MB
//!
//! All randomness comes from the caller's CSPRNG.

use std::f64::consts::PI;

use rand::RngCore;

use crate::config::PaddingValues;

/// Maximum draws before a block size is clamped into range.
///
/// With a correctly configured mu the acceptance rate is above 99%, so this
/// only triggers on misconfiguration or on a large minimum capacity.
pub const MAX_SAMPLING_ATTEMPTS: usize = 1_000;

/// 2^53, the number of distinct f64 values in [0, 1) with full precision
const F64_SCALE: f64 = (1u64 << 53) as f64;

/// Random f64 in [0, 1)
fn random_f64<R: RngCore + ?Sized>(rng: &mut R) -> f64 {
    (rng.next_u64() >> 11) as f64 / F64_SCALE
}

/// Random f64 in (0, 1]
/// Excludes zero to avoid ln(0) in Box-Muller
fn random_f64_nonzero<R: RngCore + ?Sized>(rng: &mut R) -> f64 {
    ((rng.next_u64() >> 11) as f64 + 1.0) / F64_SCALE
}

/// Standard normal sample via the Box-Muller transform
fn standard_normal<R: RngCore + ?Sized>(rng: &mut R) -> f64 {
    let u1 = random_f64_nonzero(rng);
    let u2 = random_f64(rng);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

// ============================================================
// BLOCK SIZE SELECTION
// ============================================================

/// Draw a block size from the log-normal distribution.
#[must_use]
pub fn generate_block_size<R: RngCore + ?Sized>(rng: &mut R, padding: &PaddingValues) -> u32 {
    draw_block_size(rng, padding.block_size_min, padding)
}

/// Draw a block size that can hold at least `min_capacity` bytes.
///
/// Out-of-range draws are rejected and resampled up to
/// `MAX_SAMPLING_ATTEMPTS` times, then the last draw is clamped.
/// If `min_capacity` exceeds `block_size_max`, the block is exactly
/// `min_capacity` bytes.
#[must_use]
pub fn draw_block_size<R: RngCore + ?Sized>(
    rng: &mut R,
    min_capacity: u32,
    padding: &PaddingValues,
) -> u32 {
    if min_capacity > padding.block_size_max {
        return min_capacity;
    }

    let lower = min_capacity.max(padding.block_size_min) as f64;
    let upper = padding.block_size_max as f64;
    let mu = padding.block_size_log_mu();
    let sigma = padding.block_size_log_sigma;

    let mut last = padding.block_size_mean;
    for _ in 0..MAX_SAMPLING_ATTEMPTS {
        let size = (mu + sigma * standard_normal(rng)).exp();
        if size >= lower && size <= upper {
            return size as u32;
        }
        last = size;
    }

    log::trace!("block size sampling exhausted, clamping");
    last.clamp(lower, upper) as u32
}

// ============================================================
// PARETO PADDING
// ============================================================

/// Draw a padding size from the truncated Pareto distribution.
///
/// Inverse CDF of Pareto(x_min, alpha) truncated at x_max:
/// `x = x_min / (1 - u * (1 - (x_min / x_max)^alpha))^(1 / alpha)`
#[must_use]
pub fn generate_padding_size<R: RngCore + ?Sized>(rng: &mut R, padding: &PaddingValues) -> u32 {
    let min = padding.pareto_min as f64;
    let max = padding.pareto_max as f64;
    let alpha = padding.pareto_alpha;

    let tail = (min / max).powf(alpha);
    let u = random_f64(rng);
    let raw = min / (1.0 - u * (1.0 - tail)).powf(1.0 / alpha);
    raw.clamp(min, max) as u32
}

// ============================================================
// TESTS
// ============================================================
