//! Shared PRO-protocol engine: the persisted replay window, factory-test
//! lifetime counters, and the custom-restricted-flag latch that both the
//! Full and Small wire encodings sit on top of (`spec.md` §4.5).

pub mod full;
pub mod small;

use keylink_crypto::{prng_bytes, siphash24, CheckKey};
use tracing::{debug, warn};

use crate::config::QcLimits;
use crate::error::ApplyOutcome;
use crate::events::{ChannelEvent, CustomFlag, Feedback};
use crate::host::Host;
use crate::nv::{nv_read, nv_update, BlockMeta, RawNv};
use crate::util::Window;

pub const NV_BLOCK: BlockMeta = BlockMeta::new(1, 20);

const WINDOW_BELOW: u32 = 23;
const WINDOW_ABOVE: u32 = 40;

/// Which state a `WIPE_STATE` message clears (`spec.md` §4.5.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WipeTarget {
    Credit,
    CreditAndMask,
    MaskOnly,
    /// Accepted and acknowledged like any other wipe target, but has no
    /// observable effect on this platform — see `SPEC_FULL.md` §3.1.
    UartReadlock,
}

impl WipeTarget {
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Credit),
            1 => Some(Self::CreditAndMask),
            2 => Some(Self::MaskOnly),
            3 => Some(Self::UartReadlock),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ProStored {
    window_mask: [u8; 8],
    center_index: u32,
    qc_short_count: u8,
    qc_long_count: u8,
    custom_flag_restricted: bool,
}

impl ProStored {
    fn to_payload(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.window_mask);
        out[8..12].copy_from_slice(&self.center_index.to_le_bytes());
        out[12] = self.qc_short_count;
        out[13] = self.qc_long_count;
        out[14] = u8::from(self.custom_flag_restricted);
        out
    }

    fn from_payload(bytes: &[u8]) -> Self {
        let mut window_mask = [0u8; 8];
        window_mask.copy_from_slice(&bytes[0..8]);
        Self {
            window_mask,
            center_index: u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")),
            qc_short_count: bytes[12],
            qc_long_count: bytes[13],
            custom_flag_restricted: bytes[14] != 0,
        }
    }
}

/// The persisted state shared by both wire encodings: one replay window
/// over the compressed message ID, plus factory-test lifetime caps and the
/// custom-restricted-flag latch (`spec.md` §4.5.3, §6.5).
#[derive(Debug)]
pub struct ProEngine {
    window: Window,
    qc_short_count: u8,
    qc_long_count: u8,
    custom_flag_restricted: bool,
    qc_limits: QcLimits,
}

impl ProEngine {
    #[must_use]
    pub fn new(qc_limits: QcLimits, nv: &dyn RawNv) -> Self {
        let (payload, ok) = nv_read(nv, NV_BLOCK);
        if ok {
            let stored = ProStored::from_payload(&payload);
            Self {
                window: Window::from_bytes(
                    &stored.window_mask,
                    stored.center_index,
                    WINDOW_BELOW,
                    WINDOW_ABOVE,
                ),
                qc_short_count: stored.qc_short_count,
                qc_long_count: stored.qc_long_count,
                custom_flag_restricted: stored.custom_flag_restricted,
                qc_limits,
            }
        } else {
            Self {
                window: Window::init(WINDOW_BELOW, WINDOW_BELOW, WINDOW_ABOVE),
                qc_short_count: 0,
                qc_long_count: 0,
                custom_flag_restricted: false,
                qc_limits,
            }
        }
    }

    fn persist(&self, nv: &dyn RawNv) {
        let mut window_mask = [0u8; 8];
        self.window.write_mask_bytes(&mut window_mask);
        nv_update(
            nv,
            NV_BLOCK,
            &ProStored {
                window_mask,
                center_index: self.window.center_index(),
                qc_short_count: self.qc_short_count,
                qc_long_count: self.qc_long_count,
                custom_flag_restricted: self.custom_flag_restricted,
            }
            .to_payload(),
        );
    }

    #[must_use]
    pub const fn get_custom_flag(&self, flag: CustomFlag) -> bool {
        match flag {
            CustomFlag::Restricted => self.custom_flag_restricted,
        }
    }

    /// No-op if `value` already matches the stored flag; otherwise persists
    /// it and notifies the host (`spec.md` §6.1 `CustomFlagChanged`).
    pub fn set_custom_flag(&mut self, flag: CustomFlag, value: bool, host: &dyn Host, nv: &dyn RawNv) {
        if self.get_custom_flag(flag) == value {
            return;
        }
        self.custom_flag_restricted = value;
        self.persist(nv);
        host.notify_event(ChannelEvent::CustomFlagChanged(flag, value));
    }

    /// Lowest and highest compressed message IDs accepted without a window
    /// shift, used by both encodings' ID-inference search.
    #[must_use]
    pub fn window_bounds(&self) -> (u32, u32) {
        (self.window.floor(), self.window.ceiling())
    }

    #[must_use]
    pub fn already_seen(&self, full_id: u32) -> bool {
        self.window.flag_already_set(full_id)
    }

    fn accept_id(&mut self, full_id: u32, nv: &dyn RawNv) {
        self.window.set_id_flag(full_id);
        self.persist(nv);
    }

    fn can_accept_qc(&self, is_long: bool) -> bool {
        if is_long {
            self.qc_long_count < self.qc_limits.long_lifetime_max
        } else {
            self.qc_short_count < self.qc_limits.short_lifetime_max
        }
    }

    fn record_qc(&mut self, is_long: bool, nv: &dyn RawNv) {
        if is_long {
            self.qc_long_count = self.qc_long_count.saturating_add(1);
        } else {
            self.qc_short_count = self.qc_short_count.saturating_add(1);
        }
        self.persist(nv);
    }

    fn apply_wipe(&mut self, target: WipeTarget, host: &dyn Host, nv: &dyn RawNv) -> bool {
        match target {
            WipeTarget::Credit => host.payg_credit_set(0),
            WipeTarget::CreditAndMask => {
                let ok = host.payg_credit_set(0);
                self.window = Window::init(WINDOW_BELOW, WINDOW_BELOW, WINDOW_ABOVE);
                self.persist(nv);
                ok
            }
            WipeTarget::MaskOnly => {
                self.window = Window::init(WINDOW_BELOW, WINDOW_BELOW, WINDOW_ABOVE);
                self.persist(nv);
                true
            }
            WipeTarget::UartReadlock => {
                debug!("wipe target UART_READLOCK acknowledged, no platform effect");
                true
            }
        }
    }

    /// Dispatches a completed MAS frame to the Full or Small decoder and
    /// applies the resulting command.
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        config: &crate::config::Config,
        host: &dyn Host,
        nv: &dyn RawNv,
    ) -> (Feedback, ApplyOutcome) {
        use crate::config::KeycodeProtocol;
        match config.keycode_protocol {
            KeycodeProtocol::Full => full::handle(self, frame, host, nv),
            KeycodeProtocol::Small => {
                let mut alphabet = [0u8; 4];
                alphabet.copy_from_slice(&config.mas.alphabet[..4]);
                small::handle(self, frame, &alphabet, host, nv)
            }
        }
    }
}

/// Computes the lowest `digit_count` decimal digits of `siphash24(key, input)`.
#[must_use]
pub(super) fn check_digits(key: &CheckKey, input: &[u8], digit_count: u32) -> u32 {
    let modulus = 10u32.checked_pow(digit_count).expect("digit_count <= 9");
    (siphash24(key, input).as_u32()) % modulus
}

/// Computes the lowest `bit_count` bits of `siphash24(key, input)`, for wire
/// formats (Small) that pack the check value as raw bits rather than decimal
/// digits.
#[must_use]
pub(super) fn check_bits(key: &CheckKey, input: &[u8], bit_count: u32) -> u32 {
    debug_assert!(bit_count <= 32, "bit_count must fit a u32");
    let mask = if bit_count >= 32 { u32::MAX } else { (1u32 << bit_count) - 1 };
    siphash24(key, input).as_u32() & mask
}

/// Additively obfuscates/de-obfuscates `digits` in place (mod 10 per digit)
/// using a PRNG stream keyed off the frame's check value. Symmetric: calling
/// twice with the same `sign` un-does itself is false — callers must pass
/// `forward = true` to obfuscate and `forward = false` to reverse.
pub(super) fn scramble_digits(key: &CheckKey, check_seed: u32, digits: &mut [u8], forward: bool) {
    let stream = prng_bytes(key, &check_seed.to_le_bytes(), digits.len().min(8));
    for (d, p) in digits.iter_mut().zip(stream.iter()) {
        let shift = p % 10;
        *d = if forward {
            (*d + shift) % 10
        } else {
            (*d + 10 - shift) % 10
        };
    }
}

pub(super) fn log_rejected(reason: &str) {
    warn!(reason, "pro keycode message rejected");
}
