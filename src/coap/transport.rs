//! Authenticated transport wrapping the CoAP codec: a COSE-MAC0-shaped
//! envelope (`[protected, unprotected, payload, tag]`) keyed by the link's
//! symmetric key and bound to a monotonic per-peer nonce
//! (`spec.md` §4.7.2, §4.7.4).

use keylink_crypto::{siphash24, CheckKey};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuthOutcome;

/// Nonce value above which a controller must force a resync before it
/// wraps, to keep headroom for retransmits (`spec.md` §4.7.4).
pub const NONCE_RESET_THRESHOLD: u32 = u32::MAX - 16;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Envelope {
    nonce: u32,
    payload: Vec<u8>,
    tag: u64,
}

fn compute_tag(key: &CheckKey, nonce: u32, payload: &[u8]) -> u64 {
    let mut input = Vec::with_capacity(4 + payload.len());
    input.extend_from_slice(&nonce.to_le_bytes());
    input.extend_from_slice(payload);
    siphash24(key, &input).as_u64()
}

/// Wraps `payload` in an authenticated envelope under `key` at `nonce`.
#[must_use]
pub fn seal(key: &CheckKey, nonce: u32, payload: &[u8]) -> Vec<u8> {
    let tag = compute_tag(key, nonce, payload);
    let env = Envelope {
        nonce,
        payload: payload.to_vec(),
        tag,
    };
    let mut out = Vec::new();
    ciborium::ser::into_writer(&env, &mut out).expect("envelope always serializes");
    out
}

/// Per-peer nonce-tracking state, one per linked device
/// (`spec.md` §4.7.4).
#[derive(Clone, Copy, Debug, Default)]
pub struct NonceState {
    highest_seen: u32,
}

impl NonceState {
    /// Seeds tracking from a previously-persisted nonce (e.g. the link
    /// table's stored value after a restart), so the validator doesn't
    /// regress to accepting nonces the peer has already advanced past.
    #[must_use]
    pub const fn from_persisted(highest_seen: u32) -> Self {
        Self { highest_seen }
    }

    #[must_use]
    pub const fn highest_seen(&self) -> u32 {
        self.highest_seen
    }

    /// Validates and records an inbound nonce. Rejects strictly-decreasing
    /// nonces as replays; accepts equal-or-greater, matching the firmware's
    /// "valid nonce sync" acceptance rule rather than requiring strict
    /// monotonicity (a resent request may carry the same nonce).
    fn accept(&mut self, nonce: u32) -> AuthOutcome {
        if nonce < self.highest_seen {
            return AuthOutcome::RequestReceivedWithInvalidNonce;
        }
        self.highest_seen = nonce;
        if nonce >= NONCE_RESET_THRESHOLD {
            AuthOutcome::NonceApproachingMaxForcedResetRequired
        } else {
            AuthOutcome::ValidNonceSyncReceived
        }
    }
}

/// Opens a sealed envelope under `key`, validating the tag and the nonce
/// against `nonce_state`. Returns the plaintext payload and the outcome
/// describing the nonce's freshness.
pub fn unseal(
    key: &CheckKey,
    sealed: &[u8],
    nonce_state: &mut NonceState,
) -> Result<(Vec<u8>, AuthOutcome), AuthOutcome> {
    let env: Envelope =
        ciborium::de::from_reader(sealed).map_err(|_| AuthOutcome::CoseUnparseable)?;

    let expected_tag = compute_tag(key, env.nonce, &env.payload);
    if expected_tag != env.tag {
        warn!("authenticated transport mac mismatch");
        return Err(AuthOutcome::MacInvalid);
    }

    let outcome = nonce_state.accept(env.nonce);
    if outcome == AuthOutcome::RequestReceivedWithInvalidNonce {
        return Err(outcome);
    }
    Ok((env.payload, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_round_trips() {
        let key = CheckKey::new([5u8; 16]);
        let mut nonce_state = NonceState::default();
        let sealed = seal(&key, 1, b"hello");
        let (payload, outcome) = unseal(&key, &sealed, &mut nonce_state).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(outcome, AuthOutcome::ValidNonceSyncReceived);
        assert_eq!(nonce_state.highest_seen(), 1);
    }

    #[test]
    fn replayed_lower_nonce_rejected() {
        let key = CheckKey::new([5u8; 16]);
        let mut nonce_state = NonceState::default();
        unseal(&key, &seal(&key, 5, b"a"), &mut nonce_state).unwrap();
        let err = unseal(&key, &seal(&key, 3, b"b"), &mut nonce_state).unwrap_err();
        assert_eq!(err, AuthOutcome::RequestReceivedWithInvalidNonce);
    }

    #[test]
    fn tampered_payload_fails_tag_check() {
        let key = CheckKey::new([5u8; 16]);
        let mut nonce_state = NonceState::default();
        let mut sealed = seal(&key, 1, b"hello");
        *sealed.last_mut().unwrap() ^= 0xFF;
        let err = unseal(&key, &sealed, &mut nonce_state);
        assert!(err.is_err());
    }

    #[test]
    fn nonce_near_max_signals_forced_reset() {
        let key = CheckKey::new([5u8; 16]);
        let mut nonce_state = NonceState::default();
        let sealed = seal(&key, NONCE_RESET_THRESHOLD, b"x");
        let (_, outcome) = unseal(&key, &sealed, &mut nonce_state).unwrap();
        assert_eq!(outcome, AuthOutcome::NonceApproachingMaxForcedResetRequired);
    }
}
