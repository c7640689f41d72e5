//! CoAP wire codec and the authenticated transport layered on top of it
//! (`spec.md` §4.7).

pub mod codec;
pub mod message;
pub mod transport;

pub use codec::{decode, encode};
pub use message::{CoapCode, CoapMessage, CoapOption, CoapType};
pub use transport::{seal, unseal, NonceState, NONCE_RESET_THRESHOLD};
