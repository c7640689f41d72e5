//! The Small keycode encoding: a 14-symbol, 4-symbol-alphabet frame packed
//! as 28 bits, split by its leading bit into an activation or a passthrough
//! message, closed by a 12-bit SipHash MAC (`spec.md` §4.5.2).

use super::{check_bits, log_rejected, ProEngine, WipeTarget};
use crate::error::ApplyOutcome;
use crate::events::Feedback;
use crate::host::Host;
use crate::nv::RawNv;
use crate::util::BitStream;

const FRAME_SYMBOLS: usize = 14;
const FRAME_BITS: u16 = 28;
const MAC_BITS: u16 = 12;
const ID_BITS: u32 = 6;
const BODY_BITS: u16 = 7;
const PASSTHROUGH_BITS: u16 = 15;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SmallType {
    Add,
    Set,
    Wipe,
    Demo,
}

fn small_type(code: u8) -> Option<SmallType> {
    match code {
        0 => Some(SmallType::Add),
        1 => Some(SmallType::Set),
        2 => Some(SmallType::Wipe),
        3 => Some(SmallType::Demo),
        _ => None,
    }
}

fn symbols_to_bits(frame: &[u8], alphabet: &[u8; 4]) -> Option<[u8; 4]> {
    if frame.len() != FRAME_SYMBOLS {
        return None;
    }
    let mut packed = [0u8; 4];
    let mut bits = BitStream::new(&mut packed, FRAME_BITS, 0);
    for &symbol in frame {
        let value = alphabet.iter().position(|&c| c == symbol)? as u8;
        bits.push_u8(value, 2);
    }
    Some(packed)
}

fn infer_message_id(engine: &ProEngine, compressed_id: u32) -> Option<u32> {
    let modulus = 1u32 << ID_BITS;
    let (floor, ceiling) = engine.window_bounds();
    (floor..=ceiling).find(|&candidate| candidate % modulus == compressed_id)
}

pub(super) fn handle(
    engine: &mut ProEngine,
    frame: &[u8],
    alphabet: &[u8; 4],
    host: &dyn Host,
    nv: &dyn RawNv,
) -> (Feedback, ApplyOutcome) {
    let Some(mut packed) = symbols_to_bits(frame, alphabet) else {
        log_rejected("small frame has non-alphabet symbol");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };

    let prefix_bits = FRAME_BITS - MAC_BITS;
    let mac_bytes = [packed[0], packed[1], packed[2], packed[3]];
    let key = host.secret_key();
    let prefix_bit_len = usize::from(prefix_bits);
    let prefix_byte_len = prefix_bit_len.div_ceil(8);
    let expected_mac = {
        let mut reader = BitStream::new(&mut packed, FRAME_BITS, FRAME_BITS);
        reader.set_position_bits(prefix_bits);
        reader.pull_u16_be(MAC_BITS)
    };
    let mac_input = &mac_bytes[..prefix_byte_len];
    let computed_mac = check_bits(&key, mac_input, u32::from(MAC_BITS)) as u16;
    if computed_mac != expected_mac {
        log_rejected("small frame mac mismatch");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    }

    let mut reader = BitStream::new(&mut packed, FRAME_BITS, FRAME_BITS);
    let is_passthrough = reader.pull_u8(1) != 0;

    if is_passthrough {
        let body = reader.pull_u16_be(PASSTHROUGH_BITS);
        let outcome = host.passthrough_keycode(&body.to_le_bytes());
        use crate::events::PassthroughOutcome;
        return match outcome {
            PassthroughOutcome::None => (Feedback::MessageApplied, ApplyOutcome::None),
            PassthroughOutcome::RateLimited | PassthroughOutcome::Malformed => {
                (Feedback::MessageInvalid, ApplyOutcome::Invalid)
            }
            PassthroughOutcome::Unhandled => (Feedback::MessageInvalid, ApplyOutcome::None),
        };
    }

    let type_code = reader.pull_u8(2);
    let Some(kind) = small_type(type_code) else {
        log_rejected("unknown small activation type");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };
    let compressed_id = u32::from(reader.pull_u8(ID_BITS as u8));
    let body = u32::from(reader.pull_u16_be(BODY_BITS));

    let Some(full_id) = infer_message_id(engine, compressed_id) else {
        log_rejected("small activation id outside window");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };
    if engine.already_seen(full_id) {
        return (Feedback::MessageValid, ApplyOutcome::ValidDuplicate);
    }

    let applied = match kind {
        SmallType::Add => host.payg_credit_add(body * 3600),
        SmallType::Set => host.payg_credit_set(body * 3600),
        SmallType::Wipe => match WipeTarget::from_code(body) {
            Some(target) => engine.apply_wipe(target, host, nv),
            None => false,
        },
        SmallType::Demo => host.payg_credit_add(body * 60),
    };

    // Marked seen regardless of whether the credit call took effect, so an
    // `ADD` arriving after `Unlocked` can't later be replayed as credit
    // (`spec.md` §4.5.5).
    engine.accept_id(full_id, nv);
    if !applied {
        return (Feedback::MessageValid, ApplyOutcome::ValidDuplicate);
    }
    (Feedback::MessageApplied, ApplyOutcome::ValidApplied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QcLimits;
    use crate::events::{ChannelEvent, NetworkSendOutcome, PaygState};
    use crate::host::NxId;
    use keylink_crypto::CheckKey;
    use std::cell::RefCell;

    const ALPHABET: [u8; 4] = [b'1', b'2', b'3', b'4'];

    #[derive(Default)]
    struct FakeNv(RefCell<Option<Vec<u8>>>);
    impl RawNv for FakeNv {
        fn nv_read(&self, _meta: crate::nv::BlockMeta, out: &mut [u8]) -> bool {
            match &*self.0.borrow() {
                Some(d) => {
                    out.copy_from_slice(d);
                    true
                }
                None => false,
            }
        }
        fn nv_write(&self, _meta: crate::nv::BlockMeta, data: &[u8]) -> bool {
            *self.0.borrow_mut() = Some(data.to_vec());
            true
        }
    }

    struct FakeHost {
        nv: FakeNv,
        credit_seconds: RefCell<u32>,
    }

    impl RawNv for FakeHost {
        fn nv_read(&self, meta: crate::nv::BlockMeta, out: &mut [u8]) -> bool {
            self.nv.nv_read(meta, out)
        }
        fn nv_write(&self, meta: crate::nv::BlockMeta, data: &[u8]) -> bool {
            self.nv.nv_write(meta, data)
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
        fn payg_credit_add(&self, seconds: u32) -> bool {
            *self.credit_seconds.borrow_mut() += seconds;
            true
        }
        fn payg_credit_set(&self, seconds: u32) -> bool {
            *self.credit_seconds.borrow_mut() = seconds;
            true
        }
        fn payg_credit_unlock(&self) -> bool {
            true
        }
        fn payg_state_get_current(&self) -> PaygState {
            PaygState::Enabled
        }
        fn secret_key(&self) -> CheckKey {
            CheckKey::new([3u8; 16])
        }
        fn symmetric_origin_key(&self) -> CheckKey {
            CheckKey::new([4u8; 16])
        }
        fn get_nexus_id(&self) -> NxId {
            NxId::new(1, 1)
        }
        fn get_user_facing_id(&self) -> u32 {
            42
        }
        fn passthrough_keycode(&self, _complete: &[u8]) -> crate::events::PassthroughOutcome {
            crate::events::PassthroughOutcome::None
        }
        fn network_send(
            &self,
            _bytes: &[u8],
            _src: NxId,
            _dst: NxId,
            _is_multicast: bool,
        ) -> NetworkSendOutcome {
            NetworkSendOutcome::None
        }
        fn notify_event(&self, _evt: ChannelEvent) {}
    }

    fn bits_to_symbols(packed: &[u8; 4]) -> Vec<u8> {
        let mut buf = *packed;
        let mut reader = BitStream::new(&mut buf, FRAME_BITS, FRAME_BITS);
        (0..FRAME_SYMBOLS)
            .map(|_| ALPHABET[reader.pull_u8(2) as usize])
            .collect()
    }

    fn build_frame(key: &CheckKey, type_code: u8, full_id: u32, body: u32) -> Vec<u8> {
        let mut packed = [0u8; 4];
        {
            let mut w = BitStream::new(&mut packed, FRAME_BITS, 0);
            w.push_u8(0, 1);
            w.push_u8(type_code, 2);
            w.push_u8((full_id % (1 << ID_BITS)) as u8, ID_BITS as u8);
            w.push_u8(body as u8, BODY_BITS as u8);
        }
        let prefix_bits = FRAME_BITS - MAC_BITS;
        let prefix_byte_len = (prefix_bits as usize).div_ceil(8);
        let mac = check_bits(key, &packed[..prefix_byte_len], u32::from(MAC_BITS)) as u16;
        {
            let mut w = BitStream::new(&mut packed, FRAME_BITS, prefix_bits);
            w.push_u8((mac >> 4) as u8, 8);
            w.push_u8((mac & 0xF) as u8, 4);
        }
        bits_to_symbols(&packed)
    }

    #[test]
    fn valid_add_credit_applies() {
        let host = FakeHost {
            nv: FakeNv::default(),
            credit_seconds: RefCell::new(0),
        };
        let mut engine = ProEngine::new(QcLimits::default(), &host.nv);
        let full_id = engine.window_bounds().0;
        let frame = build_frame(&host.secret_key(), 0, full_id, 5);
        let (fb, outcome) = handle(&mut engine, &frame, &ALPHABET, &host, &host.nv);
        assert_eq!(fb, Feedback::MessageApplied);
        assert_eq!(outcome, ApplyOutcome::ValidApplied);
        assert_eq!(*host.credit_seconds.borrow(), 5 * 3600);
    }

    #[test]
    fn bad_mac_rejected() {
        let host = FakeHost {
            nv: FakeNv::default(),
            credit_seconds: RefCell::new(0),
        };
        let mut engine = ProEngine::new(QcLimits::default(), &host.nv);
        let mut frame = build_frame(&host.secret_key(), 0, engine.window_bounds().0, 5);
        frame[13] = if frame[13] == ALPHABET[0] { ALPHABET[1] } else { ALPHABET[0] };
        let (fb, outcome) = handle(&mut engine, &frame, &ALPHABET, &host, &host.nv);
        assert_eq!(fb, Feedback::MessageInvalid);
        assert_eq!(outcome, ApplyOutcome::Invalid);
    }
}
