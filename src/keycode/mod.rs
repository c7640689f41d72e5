//! The keycode subsystem: message assembly (`mas`) feeding the shared PRO
//! replay-protected command engine (`pro`) (`spec.md` §4.4, §4.5).

pub mod mas;
pub mod pro;

use crate::config::Config;
use crate::error::ApplyOutcome;
use crate::events::{CustomFlag, Feedback};
use crate::host::Host;
use crate::nv::RawNv;

use mas::Mas;
use pro::ProEngine;

/// Owns both keycode sub-machines and routes a completed frame from one to
/// the other.
#[derive(Debug)]
pub struct KeycodeEngine {
    mas: Mas,
    pro: ProEngine,
}

impl KeycodeEngine {
    #[must_use]
    pub fn new(config: &Config, nv: &dyn RawNv) -> Self {
        Self {
            mas: Mas::new(config.mas.clone(), nv),
            pro: ProEngine::new(config.qc_limits, nv),
        }
    }

    /// Feeds one key press. Interrupt-safe in the firmware sense: it only
    /// touches in-memory assembler state and never blocks.
    pub fn handle_single_key(
        &mut self,
        symbol: u8,
        uptime_s: u32,
        config: &Config,
        host: &dyn Host,
        nv: &dyn RawNv,
    ) -> ApplyOutcome {
        let (feedback, frame) = self.mas.push_symbol(symbol, uptime_s);
        host.feedback_start(feedback);
        let Some(frame) = frame else {
            return ApplyOutcome::None;
        };
        self.mas.finish_frame(nv);
        let (apply_feedback, outcome) = self.pro.handle_frame(&frame, config, host, nv);
        if apply_feedback != Feedback::None {
            host.feedback_start(apply_feedback);
        }
        outcome
    }

    /// Hands a complete, out-of-band-assembled frame straight to the PRO
    /// engine (e.g. a keycode delivered over a non-keypad channel).
    pub fn handle_complete_keycode(
        &mut self,
        frame: &[u8],
        config: &Config,
        host: &dyn Host,
        nv: &dyn RawNv,
    ) -> ApplyOutcome {
        let (feedback, outcome) = self.pro.handle_frame(frame, config, host, nv);
        if feedback != Feedback::None {
            host.feedback_start(feedback);
        }
        outcome
    }

    #[must_use]
    pub const fn get_custom_flag(&self, flag: CustomFlag) -> bool {
        self.pro.get_custom_flag(flag)
    }

    pub fn set_custom_flag(&mut self, flag: CustomFlag, value: bool, host: &dyn Host, nv: &dyn RawNv) {
        self.pro.set_custom_flag(flag, value, host, nv);
    }

    /// Number of full keycode attempts left before rate limiting engages
    /// (`spec.md` P10).
    #[must_use]
    pub fn attempts_remaining(&self) -> u32 {
        self.mas.attempts_remaining()
    }

    /// Driven by the scheduler; refills the rate-limit bucket and expires a
    /// stalled in-progress frame. Returns seconds until this subsystem next
    /// needs attention.
    pub fn process(&mut self, seconds_elapsed: u32, uptime_s: u32, nv: &dyn RawNv) -> u32 {
        self.mas.process(seconds_elapsed, uptime_s, nv);
        if self.mas.is_rate_limited() {
            1
        } else {
            60
        }
    }
}
