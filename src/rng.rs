//! Pseudo-random bytes for mask keys and handshake nonces
//!
//! SplitMix64 with a process-wide stream counter folded into the seed, so
//! concurrent callers and back-to-back calls within one clock tick still
//! diverge. Masks and nonces only have to be unpredictable to
//! intermediaries; nothing here is security-sensitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Weyl-sequence increment from the SplitMix64 reference
const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

static STREAM: AtomicU64 = AtomicU64::new(0);

fn seed() -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(GOLDEN_GAMMA);
    let stream = STREAM.fetch_add(GOLDEN_GAMMA, Ordering::Relaxed);
    clock ^ stream.rotate_left(17)
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(GOLDEN_GAMMA);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Fill `buf` with pseudo-random bytes
pub(crate) fn fill(buf: &mut [u8]) {
    let mut state = seed();
    for chunk in buf.chunks_mut(8) {
        let word = splitmix64(&mut state).to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}
