//! Nonvolatile block store: fixed-layout blocks with a `block_id` + CRC
//! envelope, and write-avoidance when the payload is unchanged
//! (`spec.md` §4.3).

use keylink_crypto::crc16_ccitt;
use tracing::{trace, warn};

/// Width, in bytes, of the `block_id` and CRC fields.
const BLOCK_ID_WIDTH: usize = 2;
const CRC_WIDTH: usize = 2;
/// Total bytes of envelope overhead around the payload.
pub const WRAPPER_SIZE_BYTES: usize = BLOCK_ID_WIDTH + CRC_WIDTH;

/// Identifies and sizes one NV block. `total_len` includes the envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockMeta {
    pub block_id: u16,
    pub total_len: usize,
}

impl BlockMeta {
    #[must_use]
    pub const fn new(block_id: u16, total_len: usize) -> Self {
        assert!(total_len > WRAPPER_SIZE_BYTES, "block too small for envelope");
        Self { block_id, total_len }
    }

    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.total_len - WRAPPER_SIZE_BYTES
    }
}

/// Host-supplied raw NV read/write primitives (`spec.md` §6.1). The host
/// owns the actual storage medium; this trait only describes fixed-length
/// block access.
pub trait RawNv {
    /// Reads the full framed block (`block_id || payload || crc`) for
    /// `meta` into `out` (`out.len() == meta.total_len`). Returns `false`
    /// if the read failed at the host level (e.g. never written).
    fn nv_read(&self, meta: BlockMeta, out: &mut [u8]) -> bool;

    /// Writes the full framed block for `meta`. Returns `false` on host
    /// write failure.
    fn nv_write(&self, meta: BlockMeta, data: &[u8]) -> bool;
}

fn compute_crc(block_id: u16, payload: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(BLOCK_ID_WIDTH + payload.len());
    buf.extend_from_slice(&block_id.to_le_bytes());
    buf.extend_from_slice(payload);
    crc16_ccitt(&buf)
}

fn block_valid(meta: BlockMeta, raw: &[u8]) -> bool {
    if raw.len() != meta.total_len {
        return false;
    }
    let block_id = u16::from_le_bytes([raw[0], raw[1]]);
    if block_id != meta.block_id {
        return false;
    }
    let payload = &raw[BLOCK_ID_WIDTH..meta.total_len - CRC_WIDTH];
    let stored_crc = u16::from_le_bytes([raw[meta.total_len - 2], raw[meta.total_len - 1]]);
    compute_crc(block_id, payload) == stored_crc
}

/// Reads the payload of `meta` via `nv`. On any envelope mismatch (block ID,
/// CRC, or a host read failure) returns `(zeroed payload, false)` so the
/// caller can fall back to in-RAM defaults (`spec.md` §4.3 "Invalid block").
#[must_use]
pub fn nv_read(nv: &dyn RawNv, meta: BlockMeta) -> (Vec<u8>, bool) {
    let mut raw = vec![0u8; meta.total_len];
    let mut payload = vec![0u8; meta.payload_len()];
    if !nv.nv_read(meta, &mut raw) || !block_valid(meta, &raw) {
        warn!(block_id = meta.block_id, "nv block invalid or unreadable");
        return (payload, false);
    }
    payload.copy_from_slice(&raw[BLOCK_ID_WIDTH..meta.total_len - CRC_WIDTH]);
    (payload, true)
}

/// Updates the stored payload for `meta` to `payload`. If the existing
/// stored payload is byte-identical, `nv_write` is never called
/// (`spec.md` §4.3 write-avoidance, property `P5`).
///
/// # Panics
///
/// Panics if `payload.len() != meta.payload_len()`.
pub fn nv_update(nv: &dyn RawNv, meta: BlockMeta, payload: &[u8]) -> bool {
    assert_eq!(payload.len(), meta.payload_len(), "payload size mismatch");

    let mut existing_raw = vec![0u8; meta.total_len];
    if nv.nv_read(meta, &mut existing_raw) && block_valid(meta, &existing_raw) {
        let existing_payload = &existing_raw[BLOCK_ID_WIDTH..meta.total_len - CRC_WIDTH];
        if existing_payload == payload {
            trace!(block_id = meta.block_id, "nv payload unchanged, skipping write");
            return true;
        }
    }

    let mut new_block = vec![0u8; meta.total_len];
    new_block[..BLOCK_ID_WIDTH].copy_from_slice(&meta.block_id.to_le_bytes());
    new_block[BLOCK_ID_WIDTH..meta.total_len - CRC_WIDTH].copy_from_slice(payload);
    let crc = compute_crc(meta.block_id, payload);
    new_block[meta.total_len - CRC_WIDTH..].copy_from_slice(&crc.to_le_bytes());

    nv.nv_write(meta, &new_block)
}
