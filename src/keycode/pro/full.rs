//! The Full keycode encoding: `*`-started, `#`-terminated decimal strings,
//! a scrambled body, and a 6-digit SipHash check (`spec.md` §4.5.1).

use tracing::debug;

use super::{check_digits, log_rejected, scramble_digits, ProEngine, WipeTarget};
use crate::error::ApplyOutcome;
use crate::events::{Feedback, PaygState};
use crate::host::Host;
use crate::nv::RawNv;
use crate::util::Digits;

const CHECK_DIGITS: u32 = 6;
const ACTIVATION_ID_DIGITS: usize = 2;
const ACTIVATION_BODY_DIGITS: usize = 5;
/// Sentinel body value for `ADD_CREDIT`/`SET_CREDIT` meaning "unlock".
const UNLOCK_SENTINEL: u32 = 99_999;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ActivationType {
    Add,
    Set,
    Wipe,
    Demo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FactoryType {
    AllowTest,
    QcTest,
    DeviceIdDisplay,
    NomacDeviceIdConfirmation,
    PassthroughCommand,
}

fn activation_type(code: u32) -> Option<ActivationType> {
    match code {
        0 => Some(ActivationType::Add),
        1 => Some(ActivationType::Set),
        2 => Some(ActivationType::Wipe),
        3 => Some(ActivationType::Demo),
        _ => None,
    }
}

fn factory_type(code: u32) -> Option<FactoryType> {
    match code {
        4 => Some(FactoryType::AllowTest),
        5 => Some(FactoryType::QcTest),
        6 => Some(FactoryType::DeviceIdDisplay),
        7 => Some(FactoryType::NomacDeviceIdConfirmation),
        8 => Some(FactoryType::PassthroughCommand),
        _ => None,
    }
}

/// Infers the full (uncompressed) message ID nearest the window whose
/// low-order `ACTIVATION_ID_DIGITS` decimal digits equal `compressed_id`,
/// the same linear-search-over-the-window strategy the origin-message
/// engine uses for its compressed IDs (`spec.md` §4.5.3, §4.6.3).
fn infer_message_id(engine: &ProEngine, compressed_id: u32) -> Option<u32> {
    let modulus = 10u32.pow(ACTIVATION_ID_DIGITS as u32);
    let (floor, ceiling) = engine.window_bounds();
    (floor..=ceiling).find(|&candidate| candidate % modulus == compressed_id)
}

fn verify_check(key: &keylink_crypto::CheckKey, prefix: &[u8], expected: u32) -> bool {
    check_digits(key, prefix, CHECK_DIGITS) == expected
}

pub(super) fn handle(
    engine: &mut ProEngine,
    frame: &[u8],
    host: &dyn Host,
    nv: &dyn RawNv,
) -> (Feedback, ApplyOutcome) {
    if frame.len() == 14 {
        handle_activation(engine, frame, host, nv)
    } else if (7..=13).contains(&frame.len()) {
        handle_factory(engine, frame, host, nv)
    } else {
        log_rejected("full frame length out of range");
        (Feedback::MessageInvalid, ApplyOutcome::Invalid)
    }
}

fn handle_activation(
    engine: &mut ProEngine,
    frame: &[u8],
    host: &dyn Host,
    nv: &dyn RawNv,
) -> (Feedback, ApplyOutcome) {
    let mut digits = Digits::new(frame);
    let type_code = digits.pull_u32(1);
    let Some(kind) = activation_type(type_code) else {
        log_rejected("unknown full activation type");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };
    let compressed_id = digits.pull_u32(ACTIVATION_ID_DIGITS);
    let body_start = digits.position();
    let mut body: Vec<u8> = frame[body_start..body_start + ACTIVATION_BODY_DIGITS]
        .iter()
        .map(|&c| c - b'0')
        .collect();
    digits.set_position(body_start + ACTIVATION_BODY_DIGITS);
    let check = digits.pull_u32(CHECK_DIGITS as usize);

    let key = host.secret_key();
    // Body scrambling is keyed by the fixed public mixing key, not the
    // device secret: the check digit already carries device authentication,
    // and the scramble itself only needs a stream derived from data already
    // on the wire (`spec.md` §4.5.1, `key=FIXED_00`).
    scramble_digits(&keylink_crypto::CheckKey::ZERO, check, &mut body, false);
    let body_value = body.iter().fold(0u32, |acc, &d| acc * 10 + u32::from(d));

    // The check covers the plain (pre-obfuscation) body: the issuer computes
    // it before scrambling, and scrambling itself is keyed off the check
    // value, so verification must undo the scramble first.
    let mut plain_prefix = frame[..body_start].to_vec();
    plain_prefix.extend(body.iter().map(|&d| b'0' + d));
    if !verify_check(&key, &plain_prefix, check) {
        log_rejected("full activation check mismatch");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    }

    let Some(full_id) = infer_message_id(engine, compressed_id) else {
        log_rejected("full activation id outside window");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };
    if engine.already_seen(full_id) {
        debug!(full_id, "full activation replay");
        return (Feedback::MessageValid, ApplyOutcome::ValidDuplicate);
    }

    let applied = match kind {
        ActivationType::Add => {
            if body_value == UNLOCK_SENTINEL {
                host.payg_credit_unlock()
            } else {
                host.payg_credit_add(body_value * 3600)
            }
        }
        ActivationType::Set => {
            if body_value == UNLOCK_SENTINEL {
                host.payg_credit_unlock()
            } else {
                host.payg_credit_set(body_value * 3600)
            }
        }
        ActivationType::Wipe => match WipeTarget::from_code(body_value) {
            Some(target) => engine.apply_wipe(target, host, nv),
            None => false,
        },
        ActivationType::Demo => host.payg_credit_add(body_value * 60),
    };

    // The id is marked seen whether or not the credit call itself took
    // effect (e.g. `ADD` arriving after the unit is already `Unlocked`):
    // `spec.md` §4.5.5 requires it can't later be replayed as credit.
    engine.accept_id(full_id, nv);
    if !applied {
        return (Feedback::MessageValid, ApplyOutcome::ValidDuplicate);
    }
    (Feedback::MessageApplied, ApplyOutcome::ValidApplied)
}

fn handle_factory(
    engine: &mut ProEngine,
    frame: &[u8],
    host: &dyn Host,
    nv: &dyn RawNv,
) -> (Feedback, ApplyOutcome) {
    let mut digits = Digits::new(frame);
    let type_code = digits.pull_u32(1);
    let Some(kind) = factory_type(type_code) else {
        log_rejected("unknown full factory type");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    };

    if kind == FactoryType::NomacDeviceIdConfirmation {
        let body_digits = frame.len() - 1;
        let body = digits.pull_u32(body_digits);
        return if body == host.get_user_facing_id() {
            (Feedback::MessageApplied, ApplyOutcome::ValidApplied)
        } else {
            log_rejected("nomac device id confirmation mismatch");
            (Feedback::MessageInvalid, ApplyOutcome::Invalid)
        };
    }

    if kind == FactoryType::PassthroughCommand {
        let outcome = host.passthrough_keycode(frame);
        use crate::events::PassthroughOutcome;
        return match outcome {
            PassthroughOutcome::None => (Feedback::MessageApplied, ApplyOutcome::None),
            PassthroughOutcome::RateLimited | PassthroughOutcome::Malformed => {
                (Feedback::MessageInvalid, ApplyOutcome::Invalid)
            }
            PassthroughOutcome::Unhandled => (Feedback::MessageInvalid, ApplyOutcome::None),
        };
    }

    if frame.len() < 7 {
        log_rejected("full factory frame too short for check field");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    }
    let body_digits = frame.len() - 1 - CHECK_DIGITS as usize;
    let body = digits.pull_u32(body_digits);
    let prefix = &frame[..1 + body_digits];
    let check = digits.pull_u32(CHECK_DIGITS as usize);

    let key = host.secret_key();
    if !verify_check(&key, prefix, check) {
        log_rejected("full factory check mismatch");
        return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
    }

    match kind {
        FactoryType::AllowTest => {
            host.payg_credit_add(300);
            (Feedback::MessageApplied, ApplyOutcome::ValidApplied)
        }
        FactoryType::QcTest => {
            let is_long = body > 10;
            if !engine.can_accept_qc(is_long) {
                log_rejected("qc lifetime cap reached");
                return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
            }
            engine.record_qc(is_long, nv);
            host.payg_credit_add(body * 60);
            (Feedback::MessageApplied, ApplyOutcome::ValidApplied)
        }
        FactoryType::DeviceIdDisplay => {
            if host.payg_state_get_current() == PaygState::Unlocked {
                log_rejected("device id display refused, unit already unlocked");
                return (Feedback::MessageInvalid, ApplyOutcome::Invalid);
            }
            (Feedback::None, ApplyOutcome::DisplayDeviceId)
        }
        FactoryType::NomacDeviceIdConfirmation | FactoryType::PassthroughCommand => unreachable!(),
    }
}
