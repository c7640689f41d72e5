//! Mode-3 challenge/response link handshake: a controller and an accessory
//! derive a shared link key from a random challenge and an accessory-chosen
//! salt, then prove mutual possession with a salt/inverted-salt MAC
//! exchange, without ever putting the derived key on the wire
//! (`spec.md` §4.8.1).

use keylink_crypto::{siphash24, CheckKey};
use tracing::{debug, warn};

use crate::host::NxId;

pub const SALT_LEN: usize = 8;
/// Seconds a handshake may sit half-complete before it is abandoned
/// (`spec.md` §4.8.1).
pub const HANDSHAKE_TIMEOUT_S: u32 = 30;

fn invert_salt(salt: &[u8; SALT_LEN]) -> [u8; SALT_LEN] {
    let mut out = *salt;
    for b in &mut out {
        *b = !*b;
    }
    out
}

/// Derives the 16-byte link key from the handshake transcript. Two
/// independent SipHash outputs over swapped orderings of
/// `(challenge, salt)` give two key halves from one provisioning secret
/// without a second static key.
#[must_use]
pub fn derive_link_key(provisioning_key: &CheckKey, challenge: u32, salt: &[u8; SALT_LEN]) -> CheckKey {
    let mut forward = Vec::with_capacity(4 + SALT_LEN);
    forward.extend_from_slice(&challenge.to_le_bytes());
    forward.extend_from_slice(salt);

    let mut reversed = Vec::with_capacity(4 + SALT_LEN);
    reversed.extend_from_slice(salt);
    reversed.extend_from_slice(&challenge.to_le_bytes());

    let mut material = [0u8; 16];
    material[..8].copy_from_slice(siphash24(provisioning_key, &forward).as_bytes());
    material[8..].copy_from_slice(siphash24(provisioning_key, &reversed).as_bytes());
    CheckKey::new(material)
}

fn salt_mac(link_key: &CheckKey, salt: &[u8; SALT_LEN]) -> u64 {
    siphash24(link_key, salt).as_u64()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Idle,
    AwaitingSaltResponse,
    AwaitingConfirmAck,
    Established,
    TimedOut,
}

/// The controller side: issues the challenge, verifies the accessory's
/// salt-keyed MAC, and sends back the inverted-salt confirmation.
#[derive(Debug)]
pub struct HandshakeController {
    peer: NxId,
    challenge: u32,
    link_key: Option<CheckKey>,
    state: ControllerState,
    started_at: u32,
}

impl HandshakeController {
    #[must_use]
    pub const fn new(peer: NxId, challenge: u32, now: u32) -> Self {
        Self {
            peer,
            challenge,
            link_key: None,
            state: ControllerState::AwaitingSaltResponse,
            started_at: now,
        }
    }

    #[must_use]
    pub const fn peer(&self) -> NxId {
        self.peer
    }

    #[must_use]
    pub const fn challenge(&self) -> u32 {
        self.challenge
    }

    #[must_use]
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// Processes the accessory's `(salt, mac)` response. On success returns
    /// the inverted-salt confirmation bytes to send back.
    pub fn on_salt_response(
        &mut self,
        provisioning_key: &CheckKey,
        salt: [u8; SALT_LEN],
        mac: u64,
    ) -> Option<[u8; SALT_LEN]> {
        if self.state != ControllerState::AwaitingSaltResponse {
            return None;
        }
        let link_key = derive_link_key(provisioning_key, self.challenge, &salt);
        if salt_mac(&link_key, &salt) != mac {
            warn!(peer = ?self.peer, "handshake salt mac mismatch");
            self.state = ControllerState::TimedOut;
            return None;
        }
        self.link_key = Some(link_key);
        self.state = ControllerState::AwaitingConfirmAck;
        Some(invert_salt(&salt))
    }

    /// Marks the handshake complete once the accessory acknowledges the
    /// confirmation, returning the derived link key.
    pub fn on_confirm_ack(&mut self) -> Option<CheckKey> {
        if self.state != ControllerState::AwaitingConfirmAck {
            return None;
        }
        self.state = ControllerState::Established;
        self.link_key
    }

    pub fn tick(&mut self, now: u32) {
        if !matches!(self.state, ControllerState::Established | ControllerState::TimedOut)
            && now.saturating_sub(self.started_at) > HANDSHAKE_TIMEOUT_S
        {
            debug!(peer = ?self.peer, "handshake timed out (controller)");
            self.state = ControllerState::TimedOut;
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessoryState {
    Idle,
    AwaitingConfirm,
    Established,
    TimedOut,
}

/// The accessory side: answers a challenge with a freshly chosen salt,
/// then verifies the controller's inverted-salt confirmation.
#[derive(Debug)]
pub struct HandshakeAccessory {
    peer: NxId,
    salt: [u8; SALT_LEN],
    link_key: CheckKey,
    state: AccessoryState,
    started_at: u32,
}

impl HandshakeAccessory {
    /// Answers `challenge` from `peer`, deriving the link key immediately
    /// (the accessory, unlike the controller, knows the salt it chose).
    #[must_use]
    pub fn on_challenge(
        provisioning_key: &CheckKey,
        peer: NxId,
        challenge: u32,
        random_salt: [u8; SALT_LEN],
        now: u32,
    ) -> (Self, [u8; SALT_LEN], u64) {
        let link_key = derive_link_key(provisioning_key, challenge, &random_salt);
        let mac = salt_mac(&link_key, &random_salt);
        (
            Self {
                peer,
                salt: random_salt,
                link_key,
                state: AccessoryState::AwaitingConfirm,
                started_at: now,
            },
            random_salt,
            mac,
        )
    }

    #[must_use]
    pub const fn peer(&self) -> NxId {
        self.peer
    }

    #[must_use]
    pub const fn state(&self) -> AccessoryState {
        self.state
    }

    /// Verifies the controller's inverted-salt confirmation. Returns the
    /// established link key on success.
    pub fn on_confirm(&mut self, inverted_salt: [u8; SALT_LEN]) -> Option<CheckKey> {
        if self.state != AccessoryState::AwaitingConfirm {
            return None;
        }
        if inverted_salt != invert_salt(&self.salt) {
            warn!(peer = ?self.peer, "handshake confirm mismatch");
            self.state = AccessoryState::TimedOut;
            return None;
        }
        self.state = AccessoryState::Established;
        Some(self.link_key)
    }

    pub fn tick(&mut self, now: u32) {
        if !matches!(self.state, AccessoryState::Established | AccessoryState::TimedOut)
            && now.saturating_sub(self.started_at) > HANDSHAKE_TIMEOUT_S
        {
            debug!(peer = ?self.peer, "handshake timed out (accessory)");
            self.state = AccessoryState::TimedOut;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_matching_key() {
        let provisioning_key = CheckKey::new([9u8; 16]);
        let peer = NxId::new(1, 42);
        let challenge = 0xDEAD_BEEF;
        let salt = [1, 2, 3, 4, 5, 6, 7, 8];

        let mut controller = HandshakeController::new(peer, challenge, 0);
        let (mut accessory, salt_out, mac) =
            HandshakeAccessory::on_challenge(&provisioning_key, peer, challenge, salt, 0);
        assert_eq!(salt_out, salt);

        let confirm = controller
            .on_salt_response(&provisioning_key, salt_out, mac)
            .expect("salt response accepted");
        let accessory_key = accessory.on_confirm(confirm).expect("confirm accepted");
        let controller_key = controller.on_confirm_ack().expect("controller completes");

        assert_eq!(accessory_key, controller_key);
        assert_eq!(controller.state(), ControllerState::Established);
        assert_eq!(accessory.state(), AccessoryState::Established);
    }

    #[test]
    fn wrong_provisioning_key_fails_salt_mac() {
        let peer = NxId::new(1, 42);
        let challenge = 123;
        let salt = [0u8; SALT_LEN];
        let (_, salt_out, mac) =
            HandshakeAccessory::on_challenge(&CheckKey::new([1u8; 16]), peer, challenge, salt, 0);

        let mut controller = HandshakeController::new(peer, challenge, 0);
        let result = controller.on_salt_response(&CheckKey::new([2u8; 16]), salt_out, mac);
        assert!(result.is_none());
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }

    #[test]
    fn stalled_handshake_times_out() {
        let peer = NxId::new(1, 1);
        let mut controller = HandshakeController::new(peer, 1, 0);
        controller.tick(HANDSHAKE_TIMEOUT_S + 1);
        assert_eq!(controller.state(), ControllerState::TimedOut);
    }
}
