//! Packing/unpacking primitives and replay-window mathematics
//! (`spec.md` §4.2).

pub mod bitset;
pub mod bitstream;
pub mod digits;
pub mod window;

pub use bitset::BitSet;
pub use bitstream::BitStream;
pub use digits::Digits;
pub use window::Window;
