//! Device-linking: the challenge/response handshake and the resulting
//! link table (`spec.md` §4.8).

pub mod handshake;
pub mod manager;

pub use handshake::{derive_link_key, AccessoryState, ControllerState, HandshakeAccessory, HandshakeController};
pub use manager::{Link, LinkManager, OperatingMode};
