use crate::{key::CheckKey, siphash::siphash24};

/// Maximum number of pseudorandom bytes that can be requested in one call.
pub const MAX_OUTPUT_LEN: usize = 8;

/// Computes up to [`MAX_OUTPUT_LEN`] pseudorandom bytes from a seed (at most
/// 4 bytes) and a key, by hashing `iteration(=0) || seed` with SipHash-2-4.
///
/// Mirrors the firmware's `nexus_check_compute_pseudorandom_bytes`: only a
/// single 8-byte block is ever needed by the keycode and origin-message
/// obfuscation schemes, so only `iteration = 0` is implemented.
///
/// # Panics
///
/// Panics if `seed` is longer than 4 bytes or `output_len` exceeds
/// [`MAX_OUTPUT_LEN`] — both are programmer errors (fixed-size internal
/// callers only).
#[must_use]
pub fn prng_bytes(key: &CheckKey, seed: &[u8], output_len: usize) -> Vec<u8> {
    debug_assert!(seed.len() <= 4, "prng seed must be <= 4 bytes");
    debug_assert!(
        output_len <= MAX_OUTPUT_LEN,
        "prng output must be <= {MAX_OUTPUT_LEN} bytes"
    );
    let mut input = Vec::with_capacity(1 + seed.len());
    input.push(0u8); // iteration = 0
    input.extend_from_slice(seed);
    let check = siphash24(key, &input);
    check.as_bytes()[..output_len.min(MAX_OUTPUT_LEN)].to_vec()
}
