//! Keycode Message Assembly: start/end framing, entry timeout, and the
//! rate-limit token bucket (`spec.md` §4.4).

use tracing::{debug, trace};

use crate::config::MasConfig;
use crate::events::Feedback;
use crate::nv::{nv_read, nv_update, BlockMeta, RawNv};

pub const MAX_MESSAGE_LEN: usize = 30;

pub const NV_BLOCK: BlockMeta = BlockMeta::new(0, 12);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameState {
    Idle,
    AwaitingStart,
    Receiving,
    Finalizing,
}

/// Persisted rate-limit bucket level, in seconds.
#[derive(Clone, Copy, Debug, Default)]
struct MasStored {
    bucket_seconds: u32,
}

impl MasStored {
    fn to_payload(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.bucket_seconds.to_le_bytes());
        out
    }

    fn from_payload(bytes: &[u8]) -> Self {
        Self {
            bucket_seconds: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
        }
    }
}

/// The message-assembly state machine plus rate-limit bucket
/// (`spec.md` §4.4).
#[derive(Debug)]
pub struct Mas {
    config: MasConfig,
    state: FrameState,
    buffer: Vec<u8>,
    last_push_uptime: u32,
    bucket_seconds: u32,
}

impl Mas {
    #[must_use]
    pub fn new(config: MasConfig, nv: &dyn RawNv) -> Self {
        let (payload, ok) = nv_read(nv, NV_BLOCK);
        let stored = if ok {
            MasStored::from_payload(&payload)
        } else {
            MasStored {
                bucket_seconds: u32::from(config.rate_limit_initial) * u32::from(config.refill_sec_per_attempt),
            }
        };
        Self {
            config,
            state: FrameState::Idle,
            buffer: Vec::with_capacity(MAX_MESSAGE_LEN),
            last_push_uptime: 0,
            bucket_seconds: stored.bucket_seconds,
        }
    }

    fn bucket_capacity(&self) -> u32 {
        u32::from(self.config.rate_limit_bucket_max) * u32::from(self.config.refill_sec_per_attempt)
    }

    fn refill_sec(&self) -> u32 {
        u32::from(self.config.refill_sec_per_attempt)
    }

    /// `true` if the bucket cannot cover one more attempt.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.config.rate_limit_bucket_max != 0 && self.bucket_seconds < self.refill_sec()
    }

    /// Number of full attempts remaining before rate limiting engages.
    #[must_use]
    pub fn attempts_remaining(&self) -> u32 {
        if self.config.rate_limit_bucket_max == 0 {
            return u32::MAX;
        }
        (self.bucket_seconds / self.refill_sec()).min(u32::from(self.config.rate_limit_initial))
    }

    fn deduct_one_attempt(&mut self) {
        if self.config.rate_limit_bucket_max == 0 {
            return;
        }
        self.bucket_seconds = self.bucket_seconds.saturating_sub(self.refill_sec());
    }

    fn persist(&self, nv: &dyn RawNv) {
        nv_update(
            nv,
            NV_BLOCK,
            &MasStored {
                bucket_seconds: self.bucket_seconds,
            }
            .to_payload(),
        );
    }

    /// Feeds one symbol into the assembler. Returns feedback plus a
    /// completed frame if this symbol finished one.
    ///
    /// `handle_single_key` itself (the interrupt-safe entrypoint) only
    /// enqueues the raw byte; this method is the synchronous processing
    /// step run from `Core::process` / `Core::handle_complete_keycode`.
    pub fn push_symbol(&mut self, symbol: u8, uptime_s: u32) -> (Feedback, Option<Vec<u8>>) {
        self.last_push_uptime = uptime_s;

        if self.is_rate_limited() && self.state != FrameState::Idle {
            trace!("mas: rate limited, rejecting symbol");
            return (Feedback::KeyRejected, None);
        }

        match self.state {
            FrameState::Idle | FrameState::AwaitingStart => {
                if symbol == self.config.start_char {
                    self.buffer.clear();
                    self.state = FrameState::Receiving;
                    (Feedback::KeyAccepted, None)
                } else {
                    (Feedback::KeyRejected, None)
                }
            }
            FrameState::Receiving => self.push_while_receiving(symbol),
            FrameState::Finalizing => (Feedback::KeyRejected, None),
        }
    }

    fn push_while_receiving(&mut self, symbol: u8) -> (Feedback, Option<Vec<u8>>) {
        if symbol == self.config.start_char {
            self.buffer.clear();
            return (Feedback::KeyAccepted, None);
        }
        if self.config.end_char == Some(symbol) {
            let frame = std::mem::take(&mut self.buffer);
            self.state = FrameState::Idle;
            return (Feedback::KeyAccepted, Some(frame));
        }
        if !self.config.alphabet.contains(&symbol) {
            return (Feedback::KeyRejected, None);
        }
        self.buffer.push(symbol);
        if self.config.end_char.is_none() && self.buffer.len() >= self.config.stop_length as usize
        {
            let frame = std::mem::take(&mut self.buffer);
            self.state = FrameState::Idle;
            return (Feedback::KeyAccepted, Some(frame));
        }
        (Feedback::KeyAccepted, None)
    }

    /// Records that a frame completed processing; deducts the rate-limit
    /// bucket and persists it.
    pub fn finish_frame(&mut self, nv: &dyn RawNv) {
        self.deduct_one_attempt();
        self.persist(nv);
    }

    /// Driven by the scheduler: refills the bucket and applies the entry
    /// timeout.
    pub fn process(&mut self, seconds_elapsed: u32, uptime_s: u32, nv: &dyn RawNv) {
        if self.config.rate_limit_bucket_max != 0 {
            let capacity = self.bucket_capacity();
            let credit = seconds_elapsed.min(capacity.saturating_sub(self.bucket_seconds));
            if credit > 0 {
                self.bucket_seconds += credit;
                self.persist(nv);
            }
        }
        if self.state != FrameState::Idle
            && uptime_s.saturating_sub(self.last_push_uptime) > u32::from(self.config.entry_timeout_s)
        {
            debug!("mas: entry timeout, resetting to idle");
            self.state = FrameState::Idle;
            self.buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeNv(RefCell<Option<Vec<u8>>>);
    impl RawNv for FakeNv {
        fn nv_read(&self, _meta: BlockMeta, out: &mut [u8]) -> bool {
            match &*self.0.borrow() {
                Some(d) => {
                    out.copy_from_slice(d);
                    true
                }
                None => false,
            }
        }
        fn nv_write(&self, _meta: BlockMeta, data: &[u8]) -> bool {
            *self.0.borrow_mut() = Some(data.to_vec());
            true
        }
    }

    fn full_config() -> MasConfig {
        let mut c = MasConfig::full_protocol();
        c.rate_limit_bucket_max = 10;
        c.rate_limit_initial = 10;
        c.refill_sec_per_attempt = 3600;
        c
    }

    #[test]
    fn frame_completes_on_end_char() {
        let nv = FakeNv::default();
        let mut mas = Mas::new(full_config(), &nv);
        assert_eq!(mas.push_symbol(b'*', 0).0, Feedback::KeyAccepted);
        for d in b"1234567890123" {
            assert_eq!(mas.push_symbol(*d, 0).0, Feedback::KeyAccepted);
        }
        let (fb, frame) = mas.push_symbol(b'#', 0);
        assert_eq!(fb, Feedback::KeyAccepted);
        assert_eq!(frame.unwrap().len(), 13);
    }

    #[test]
    fn unknown_symbol_before_start_rejected() {
        let nv = FakeNv::default();
        let mut mas = Mas::new(full_config(), &nv);
        assert_eq!(mas.push_symbol(b'9', 0).0, Feedback::KeyRejected);
    }

    #[test]
    fn entry_timeout_resets_to_idle() {
        let nv = FakeNv::default();
        let mut mas = Mas::new(full_config(), &nv);
        mas.push_symbol(b'*', 0);
        mas.push_symbol(b'1', 0);
        mas.process(100, 100, &nv); // exceeds 60s entry_timeout_s
        // After timeout, a digit (not the start char) is rejected again.
        assert_eq!(mas.push_symbol(b'1', 100).0, Feedback::KeyRejected);
    }

    #[test]
    fn rate_limit_bound_after_k_frames() {
        let nv = FakeNv::default();
        let mut mas = Mas::new(full_config(), &nv);
        for _ in 0..10 {
            mas.finish_frame(&nv);
        }
        assert_eq!(mas.attempts_remaining(), 0);
        assert!(mas.is_rate_limited());
    }

    #[test]
    fn refill_credits_bucket_on_process() {
        let nv = FakeNv::default();
        let mut mas = Mas::new(full_config(), &nv);
        for _ in 0..10 {
            mas.finish_frame(&nv);
        }
        assert!(mas.is_rate_limited());
        mas.process(3600, 0, &nv);
        assert!(!mas.is_rate_limited());
        assert_eq!(mas.attempts_remaining(), 1);
    }
}
