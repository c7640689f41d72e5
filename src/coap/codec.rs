//! Wire encode/decode for the CoAP subset in [`super::message`]
//! (`spec.md` §4.7.1): 4-byte header, 0-8 byte token, delta-encoded
//! options, and an optional `0xFF`-marked payload.

use crate::error::CoapError;

use super::message::{CoapCode, CoapMessage, CoapType, Option_};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LEN: usize = 8;

#[must_use]
pub fn encode(msg: &CoapMessage) -> Vec<u8> {
    assert!(msg.token.len() <= MAX_TOKEN_LEN, "token too long");
    let mut out = Vec::with_capacity(4 + msg.token.len() + msg.payload.len() + 8);

    let byte0 = (VERSION << 6) | (msg.msg_type.to_bits() << 4) | (msg.token.len() as u8);
    out.push(byte0);
    out.push(msg.code.0);
    out.extend_from_slice(&msg.message_id.to_be_bytes());
    out.extend_from_slice(&msg.token);

    let mut sorted_options = msg.options.clone();
    sorted_options.sort_by_key(|o| o.number);

    let mut prev_number = 0u16;
    for opt in &sorted_options {
        let delta = opt.number - prev_number;
        prev_number = opt.number;
        encode_option(&mut out, delta, &opt.value);
    }

    if !msg.payload.is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(&msg.payload);
    }
    out
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = nibble_and_extension(delta);
    let (len_nibble, len_ext) = nibble_and_extension(value.len() as u16);
    out.push((delta_nibble << 4) | len_nibble);
    out.extend(delta_ext);
    out.extend(len_ext);
    out.extend_from_slice(value);
}

/// Returns the 4-bit option nibble and its extended-length bytes, per the
/// RFC 7252 13/14/15 escaping scheme (15 is reserved and never produced
/// here since every field this firmware emits fits in 14-bit extension).
fn nibble_and_extension(value: u16) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        let v = value - 269;
        (14, v.to_be_bytes().to_vec())
    }
}

pub fn decode(bytes: &[u8]) -> Result<CoapMessage, CoapError> {
    if bytes.len() < 4 {
        return Err(CoapError::Malformed);
    }
    let byte0 = bytes[0];
    if byte0 >> 6 != VERSION {
        return Err(CoapError::Malformed);
    }
    let msg_type = CoapType::from_bits((byte0 >> 4) & 0x3).ok_or(CoapError::Malformed)?;
    let token_len = usize::from(byte0 & 0xf);
    if token_len > MAX_TOKEN_LEN {
        return Err(CoapError::Malformed);
    }
    let code = CoapCode(bytes[1]);
    let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut pos = 4;
    if bytes.len() < pos + token_len {
        return Err(CoapError::Malformed);
    }
    let token = bytes[pos..pos + token_len].to_vec();
    pos += token_len;

    let mut options = Vec::new();
    let mut prev_number = 0u16;
    while pos < bytes.len() && bytes[pos] != PAYLOAD_MARKER {
        let header = bytes[pos];
        pos += 1;
        let delta_nibble = header >> 4;
        let len_nibble = header & 0xf;
        if delta_nibble == 15 || len_nibble == 15 {
            return Err(CoapError::Malformed);
        }
        let delta = read_extension(bytes, &mut pos, delta_nibble)?;
        let length = read_extension(bytes, &mut pos, len_nibble)? as usize;
        if bytes.len() < pos + length {
            return Err(CoapError::Malformed);
        }
        let number = prev_number
            .checked_add(delta)
            .ok_or(CoapError::Malformed)?;
        prev_number = number;
        options.push(Option_ {
            number,
            value: bytes[pos..pos + length].to_vec(),
        });
        pos += length;
    }

    let payload = if pos < bytes.len() && bytes[pos] == PAYLOAD_MARKER {
        pos += 1;
        if pos >= bytes.len() {
            return Err(CoapError::Malformed);
        }
        bytes[pos..].to_vec()
    } else {
        Vec::new()
    };

    Ok(CoapMessage {
        msg_type,
        code,
        message_id,
        token,
        options,
        payload,
    })
}

fn read_extension(bytes: &[u8], pos: &mut usize, nibble: u8) -> Result<u16, CoapError> {
    match nibble {
        13 => {
            if bytes.len() < *pos + 1 {
                return Err(CoapError::Malformed);
            }
            let v = u16::from(bytes[*pos]) + 13;
            *pos += 1;
            Ok(v)
        }
        14 => {
            if bytes.len() < *pos + 2 {
                return Err(CoapError::Malformed);
            }
            let v = u16::from_be_bytes([bytes[*pos], bytes[*pos + 1]]) + 269;
            *pos += 2;
            Ok(v)
        }
        n => Ok(u16::from(n)),
    }
}
