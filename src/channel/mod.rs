//! The channel subsystem: link handshakes, the link table, the
//! origin-message engine, and CoAP resource routing (`spec.md` §4.8, §4.9).

pub mod core;
pub mod registry;

pub use core::ChannelCore;
pub use registry::{Resource, ResourceRegistry};
