//! Host-supplied collaborators the library calls out to (`spec.md` §6.1).
//!
//! The platform's random source, wall-clock tick, NV primitives,
//! feedback rendering, network transport, and PAYG credit application are
//! all external collaborators per `spec.md` §1; this module is the trait
//! boundary a product integrates against.

use keylink_crypto::CheckKey;

use crate::events::{ChannelEvent, Feedback, NetworkSendOutcome, PassthroughOutcome, PaygState};
use crate::nv::RawNv;

/// 48-bit device identifier: `(authority, device)` per `spec.md` §3.5.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NxId {
    pub authority: u16,
    pub device: u32,
}

impl NxId {
    #[must_use]
    pub const fn new(authority: u16, device: u32) -> Self {
        Self { authority, device }
    }
}

/// Every callback a host integration must provide. Implementations should
/// treat key-returning methods as returning by value and must not cache
/// the result beyond the call that needs it (`spec.md` §5, "Shared
/// resources").
pub trait Host: RawNv {
    /// Non-cryptographic randomness (CoAP MID, handshake salt).
    fn random_value(&self) -> u32;

    /// Monotone non-decreasing uptime; not required to be wall-clock.
    fn uptime_seconds(&self) -> u32;

    /// Asks the host to call `Core::process` again soon (within ~20ms).
    /// May be called from an interrupt context.
    fn request_processing(&self);

    fn feedback_start(&self, kind: Feedback);

    fn payg_credit_add(&self, seconds: u32) -> bool;
    fn payg_credit_set(&self, seconds: u32) -> bool;
    fn payg_credit_unlock(&self) -> bool;
    fn payg_state_get_current(&self) -> PaygState;

    /// Device secret key used to authenticate keycodes.
    fn secret_key(&self) -> CheckKey;
    /// Symmetric key shared with the backend issuing origin commands.
    fn symmetric_origin_key(&self) -> CheckKey;
    fn get_nexus_id(&self) -> NxId;
    fn get_user_facing_id(&self) -> u32;

    /// Gives a completed "passthrough" keycode frame to the host for
    /// product-specific handling (e.g. NXC extended commands).
    fn passthrough_keycode(&self, complete: &[u8]) -> PassthroughOutcome;

    fn network_send(
        &self,
        bytes: &[u8],
        src: NxId,
        dst: NxId,
        is_multicast: bool,
    ) -> NetworkSendOutcome;

    fn notify_event(&self, evt: ChannelEvent);
}
