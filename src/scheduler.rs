//! Cooperative single-threaded scheduling: each subsystem reports how many
//! seconds until it next needs attention, and the core reports the minimum
//! back to the host so it knows when to call `process` again
//! (`spec.md` §4.10).

use crate::channel::ChannelCore;
use crate::config::Config;
use crate::host::Host;
use crate::keycode::KeycodeEngine;
use crate::nv::RawNv;

/// Runs one scheduling pass over every subsystem and returns the number of
/// seconds the host may sleep before calling `process` again.
pub fn run(
    keycode: &mut KeycodeEngine,
    channel: Option<&mut ChannelCore>,
    config: &Config,
    host: &dyn Host,
    nv: &dyn RawNv,
    seconds_elapsed: u32,
) -> u32 {
    let uptime = host.uptime_seconds();
    let mut next_wake = keycode.process(seconds_elapsed, uptime, nv);

    if let Some(channel) = channel {
        let channel_wake = channel.process(host, nv);
        next_wake = next_wake.min(channel_wake);
    }

    next_wake.min(config.idle_ceiling_s).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{ChannelEvent, Feedback, NetworkSendOutcome, PassthroughOutcome, PaygState};
    use crate::host::NxId;
    use keylink_crypto::CheckKey;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeNv(RefCell<std::collections::HashMap<u16, Vec<u8>>>);
    impl RawNv for FakeNv {
        fn nv_read(&self, meta: crate::nv::BlockMeta, out: &mut [u8]) -> bool {
            match self.0.borrow().get(&meta.block_id) {
                Some(d) => {
                    out.copy_from_slice(d);
                    true
                }
                None => false,
            }
        }
        fn nv_write(&self, meta: crate::nv::BlockMeta, data: &[u8]) -> bool {
            self.0.borrow_mut().insert(meta.block_id, data.to_vec());
            true
        }
    }

    struct FakeHost(FakeNv);
    impl RawNv for FakeHost {
        fn nv_read(&self, meta: crate::nv::BlockMeta, out: &mut [u8]) -> bool {
            self.0.nv_read(meta, out)
        }
        fn nv_write(&self, meta: crate::nv::BlockMeta, data: &[u8]) -> bool {
            self.0.nv_write(meta, data)
        }
    }
    impl Host for FakeHost {
        fn random_value(&self) -> u32 {
            0
        }
        fn uptime_seconds(&self) -> u32 {
            0
        }
        fn request_processing(&self) {}
        fn feedback_start(&self, _kind: Feedback) {}
        fn payg_credit_add(&self, _seconds: u32) -> bool {
            true
        }
        fn payg_credit_set(&self, _seconds: u32) -> bool {
            true
        }
        fn payg_credit_unlock(&self) -> bool {
            true
        }
        fn payg_state_get_current(&self) -> PaygState {
            PaygState::Enabled
        }
        fn secret_key(&self) -> CheckKey {
            CheckKey::ZERO
        }
        fn symmetric_origin_key(&self) -> CheckKey {
            CheckKey::ZERO
        }
        fn get_nexus_id(&self) -> NxId {
            NxId::new(0, 0)
        }
        fn get_user_facing_id(&self) -> u32 {
            0
        }
        fn passthrough_keycode(&self, _complete: &[u8]) -> PassthroughOutcome {
            PassthroughOutcome::None
        }
        fn network_send(&self, _bytes: &[u8], _src: NxId, _dst: NxId, _is_multicast: bool) -> NetworkSendOutcome {
            NetworkSendOutcome::None
        }
        fn notify_event(&self, _evt: ChannelEvent) {}
    }

    #[test]
    fn wake_is_bounded_by_idle_ceiling() {
        let host = FakeHost(FakeNv::default());
        let config = Config::default();
        let mut keycode = KeycodeEngine::new(&config, &host);
        let wake = run(&mut keycode, None, &config, &host, &host, 0);
        assert!(wake <= config.idle_ceiling_s);
        assert!(wake >= 1);
    }
}
