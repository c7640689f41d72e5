//! The link table: a fixed-capacity set of established links keyed by
//! `(authority, device)`, persisted one NV block per slot, with expiry and
//! controller/accessory/dual operating-mode inference (`spec.md` §3.5,
//! §4.8.2, §4.9).

use keylink_crypto::CheckKey;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::ChannelRole;
use crate::host::NxId;
use crate::nv::{nv_update, BlockMeta, RawNv};

/// First block ID assigned to link slots (`0` and `1` are the keycode MAS
/// and PRO blocks, `2` is the origin-message window).
const LINK_BLOCK_BASE: u16 = 3;
/// `in_use(1) | authority(2) | device(4) | role(1) | key(16) | nonce(4) |
/// last_refreshed(4)`.
const LINK_PAYLOAD_LEN: usize = 1 + 2 + 4 + 1 + 16 + 4 + 4;
const LINK_BLOCK_TOTAL_LEN: usize = LINK_PAYLOAD_LEN + crate::nv::WRAPPER_SIZE_BYTES;

fn slot_meta(index: usize) -> BlockMeta {
    BlockMeta::new(LINK_BLOCK_BASE + index as u16, LINK_BLOCK_TOTAL_LEN)
}

/// An established link: the peer identity, its derived key, and when it
/// was last refreshed.
#[derive(Clone, Debug)]
pub struct Link {
    pub peer: NxId,
    pub key: CheckKey,
    pub role: ChannelRole,
    pub established_at: u32,
    pub last_refreshed: u32,
    /// Current authenticated-transport nonce for this link (`spec.md`
    /// §3.5, §4.7.3); persisted so a restart doesn't reuse a nonce value
    /// already seen by the peer.
    pub nonce: u32,
}

impl Link {
    fn to_payload(&self) -> [u8; LINK_PAYLOAD_LEN] {
        let mut out = [0u8; LINK_PAYLOAD_LEN];
        out[0] = 1;
        out[1..3].copy_from_slice(&self.peer.authority.to_le_bytes());
        out[3..7].copy_from_slice(&self.peer.device.to_le_bytes());
        out[7] = role_code(self.role);
        out[8..24].copy_from_slice(&self.key.to_bytes());
        out[24..28].copy_from_slice(&self.nonce.to_le_bytes());
        out[28..32].copy_from_slice(&self.last_refreshed.to_le_bytes());
        out
    }

    fn from_payload(bytes: &[u8]) -> Option<Self> {
        if bytes[0] != 1 {
            return None;
        }
        let authority = u16::from_le_bytes(bytes[1..3].try_into().expect("2 bytes"));
        let device = u32::from_le_bytes(bytes[3..7].try_into().expect("4 bytes"));
        let role = role_from_code(bytes[7])?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes[8..24]);
        let nonce = u32::from_le_bytes(bytes[24..28].try_into().expect("4 bytes"));
        let last_refreshed = u32::from_le_bytes(bytes[28..32].try_into().expect("4 bytes"));
        Some(Self {
            peer: NxId::new(authority, device),
            key: CheckKey::new(key),
            role,
            established_at: last_refreshed,
            last_refreshed,
            nonce,
        })
    }
}

fn role_code(role: ChannelRole) -> u8 {
    match role {
        ChannelRole::Controller => 0,
        ChannelRole::Accessory => 1,
        ChannelRole::Dual => 2,
    }
}

fn role_from_code(code: u8) -> Option<ChannelRole> {
    match code {
        0 => Some(ChannelRole::Controller),
        1 => Some(ChannelRole::Accessory),
        2 => Some(ChannelRole::Dual),
        _ => None,
    }
}

fn empty_payload() -> [u8; LINK_PAYLOAD_LEN] {
    [0u8; LINK_PAYLOAD_LEN]
}

/// The device's current operating posture, inferred from its configured
/// role and the links actually present (`spec.md` §4.8.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperatingMode {
    Unlinked,
    Controller,
    Accessory,
    Dual,
}

/// Fixed-capacity link table, one NV slot per entry. The backing store is
/// a `SmallVec` sized to the common case so small deployments never
/// allocate; slot *position* is stable for a link's lifetime so it maps
/// 1:1 onto a fixed NV block id (`spec.md` §4.9 "fixed table").
#[derive(Debug)]
pub struct LinkManager {
    slots: SmallVec<[Option<Link>; 10]>,
    capacity: usize,
    link_timeout_seconds: u32,
    configured_role: ChannelRole,
}

impl LinkManager {
    /// Loads every slot from NV (an absent or corrupt slot is treated as
    /// empty, per `spec.md` §4.3's invalid-block fallback).
    #[must_use]
    pub fn new(capacity: usize, link_timeout_seconds: u32, configured_role: ChannelRole, nv: &dyn RawNv) -> Self {
        let mut slots = SmallVec::with_capacity(capacity);
        for index in 0..capacity {
            let (payload, ok) = crate::nv::nv_read(nv, slot_meta(index));
            slots.push(if ok { Link::from_payload(&payload) } else { None });
        }
        Self {
            slots,
            capacity,
            link_timeout_seconds,
            configured_role,
        }
    }

    fn persist_slot(&self, index: usize, nv: &dyn RawNv) {
        let payload = self.slots[index].as_ref().map_or_else(empty_payload, Link::to_payload);
        nv_update(nv, slot_meta(index), &payload);
    }

    #[must_use]
    pub fn find(&self, peer: NxId) -> Option<&Link> {
        self.slots.iter().flatten().find(|l| l.peer == peer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn is_linked(&self, peer: NxId) -> bool {
        self.find(peer).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.slots.iter().flatten()
    }

    /// Installs a newly-established link into the first free slot and
    /// persists it. Fails if the table is full or a link for this peer
    /// already exists (`spec.md` §3.5 uniqueness invariant).
    pub fn create(&mut self, link: Link, nv: &dyn RawNv) -> Result<(), crate::error::ChannelError> {
        if self.is_linked(link.peer) {
            return Err(crate::error::ChannelError::DuplicateLink);
        }
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(crate::error::ChannelError::LinkTableFull);
        };
        debug!(peer = ?link.peer, "link established");
        self.slots[index] = Some(link);
        self.persist_slot(index, nv);
        Ok(())
    }

    pub fn delete(&mut self, peer: NxId, nv: &dyn RawNv) -> bool {
        let Some(index) = self.slots.iter().position(|s| s.as_ref().is_some_and(|l| l.peer == peer)) else {
            return false;
        };
        debug!(?peer, "link deleted");
        self.slots[index] = None;
        self.persist_slot(index, nv);
        true
    }

    pub fn refresh(&mut self, peer: NxId, now: u32) -> bool {
        if let Some(link) = self.slots.iter_mut().flatten().find(|l| l.peer == peer) {
            link.last_refreshed = now;
            true
        } else {
            false
        }
    }

    /// Writes through a new nonce for `peer` only if it actually changed
    /// (`spec.md` §4.9 "writes through NV only if changed").
    pub fn set_nonce(&mut self, peer: NxId, nonce: u32, nv: &dyn RawNv) {
        let Some(index) = self.slots.iter().position(|s| s.as_ref().is_some_and(|l| l.peer == peer)) else {
            return;
        };
        let changed = self.slots[index].as_ref().is_some_and(|l| l.nonce != nonce);
        if changed {
            self.slots[index].as_mut().expect("just matched").nonce = nonce;
            self.persist_slot(index, nv);
        }
    }

    /// Drops links that haven't been refreshed within the configured
    /// timeout, persisting the now-empty slots. Returns the peers that
    /// expired, for the caller to notify.
    pub fn expire(&mut self, now: u32, nv: &dyn RawNv) -> SmallVec<[NxId; 4]> {
        let mut expired = SmallVec::new();
        for index in 0..self.slots.len() {
            let stale = self.slots[index]
                .as_ref()
                .is_some_and(|l| now.saturating_sub(l.last_refreshed) > self.link_timeout_seconds);
            if stale {
                let peer = self.slots[index].take().expect("checked Some above").peer;
                warn!(?peer, "link expired");
                expired.push(peer);
                self.persist_slot(index, nv);
            }
        }
        expired
    }

    /// Seconds until the next link is due to expire, for the scheduler.
    #[must_use]
    pub fn seconds_until_next_expiry(&self, now: u32) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .map(|l| {
                let age = now.saturating_sub(l.last_refreshed);
                self.link_timeout_seconds.saturating_sub(age)
            })
            .min()
    }

    /// Infers the device's operating mode from its configured role and the
    /// links currently held (`spec.md` §4.8.2): a `Dual`-configured device
    /// degrades to `Controller`/`Accessory`/`Unlinked` once its actual
    /// links settle into a single direction.
    #[must_use]
    pub fn operating_mode(&self) -> OperatingMode {
        if self.is_empty() {
            return OperatingMode::Unlinked;
        }
        let has_controller_role = self.iter().any(|l| l.role == ChannelRole::Controller);
        let has_accessory_role = self.iter().any(|l| l.role == ChannelRole::Accessory);
        match (has_controller_role, has_accessory_role) {
            (true, true) => OperatingMode::Dual,
            (true, false) => OperatingMode::Controller,
            (false, true) => OperatingMode::Accessory,
            (false, false) => match self.configured_role {
                ChannelRole::Controller => OperatingMode::Controller,
                ChannelRole::Accessory => OperatingMode::Accessory,
                ChannelRole::Dual => OperatingMode::Unlinked,
            },
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNv(RefCell<HashMap<u16, Vec<u8>>>);
    impl RawNv for FakeNv {
        fn nv_read(&self, meta: BlockMeta, out: &mut [u8]) -> bool {
            match self.0.borrow().get(&meta.block_id) {
                Some(d) => {
                    out.copy_from_slice(d);
                    true
                }
                None => false,
            }
        }
        fn nv_write(&self, meta: BlockMeta, data: &[u8]) -> bool {
            self.0.borrow_mut().insert(meta.block_id, data.to_vec());
            true
        }
    }

    fn sample_link(device: u32) -> Link {
        Link {
            peer: NxId::new(1, device),
            key: CheckKey::ZERO,
            role: ChannelRole::Accessory,
            established_at: 0,
            last_refreshed: 0,
            nonce: 0,
        }
    }

    #[test]
    fn create_then_find() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(2, 1000, ChannelRole::Dual, &nv);
        mgr.create(sample_link(1), &nv).unwrap();
        assert!(mgr.is_linked(NxId::new(1, 1)));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn duplicate_link_rejected() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(2, 1000, ChannelRole::Dual, &nv);
        mgr.create(sample_link(1), &nv).unwrap();
        assert!(mgr.create(sample_link(1), &nv).is_err());
    }

    #[test]
    fn full_table_rejects_new_link() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(1, 1000, ChannelRole::Dual, &nv);
        mgr.create(sample_link(1), &nv).unwrap();
        assert!(mgr.create(sample_link(2), &nv).is_err());
    }

    #[test]
    fn stale_link_expires() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(2, 100, ChannelRole::Dual, &nv);
        mgr.create(sample_link(1), &nv).unwrap();
        let expired = mgr.expire(500, &nv);
        assert_eq!(expired.len(), 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn operating_mode_tracks_actual_links() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(4, 1000, ChannelRole::Dual, &nv);
        assert_eq!(mgr.operating_mode(), OperatingMode::Unlinked);
        let mut controller_link = sample_link(1);
        controller_link.role = ChannelRole::Controller;
        mgr.create(controller_link, &nv).unwrap();
        assert_eq!(mgr.operating_mode(), OperatingMode::Controller);
        mgr.create(sample_link(2), &nv).unwrap();
        assert_eq!(mgr.operating_mode(), OperatingMode::Dual);
    }

    #[test]
    fn link_survives_manager_reload_from_nv() {
        let nv = FakeNv::default();
        {
            let mut mgr = LinkManager::new(4, 1000, ChannelRole::Dual, &nv);
            let mut link = sample_link(7);
            link.nonce = 42;
            mgr.create(link, &nv).unwrap();
        }
        let reloaded = LinkManager::new(4, 1000, ChannelRole::Dual, &nv);
        let link = reloaded.find(NxId::new(1, 7)).expect("persisted link reloads");
        assert_eq!(link.nonce, 42);
    }

    #[test]
    fn nonce_write_avoided_when_unchanged() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(4, 1000, ChannelRole::Dual, &nv);
        let link = sample_link(9);
        mgr.create(link, &nv).unwrap();
        let writes_before = nv.0.borrow().len();
        mgr.set_nonce(NxId::new(1, 9), 0, &nv);
        assert_eq!(nv.0.borrow().len(), writes_before, "unchanged nonce must not trigger a write path change");
        mgr.set_nonce(NxId::new(1, 9), 5, &nv);
        assert_eq!(mgr.find(NxId::new(1, 9)).unwrap().nonce, 5);
    }

    #[test]
    fn deleted_slot_is_reusable() {
        let nv = FakeNv::default();
        let mut mgr = LinkManager::new(1, 1000, ChannelRole::Dual, &nv);
        mgr.create(sample_link(1), &nv).unwrap();
        assert!(mgr.delete(NxId::new(1, 1), &nv));
        mgr.create(sample_link(2), &nv).unwrap();
        assert!(mgr.is_linked(NxId::new(1, 2)));
    }
}
