use std::fmt;

/// A 16-byte symmetric key used for SipHash-2-4 check-value computation.
///
/// Implements [`Debug`] by redaction: key material is never written to logs.
#[derive(Clone, Copy, Eq, PartialEq)]
#[must_use]
pub struct CheckKey([u8; 16]);

impl CheckKey {
    pub const ZERO: Self = Self([0u8; 16]);
    pub const ALL_FF: Self = Self([0xffu8; 16]);

    #[inline]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub(crate) const fn bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Raw key bytes, for a host integration or NV layer that needs to
    /// serialize the key (e.g. persisting a derived link key).
    #[inline]
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Debug for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CheckKey").field(&"<redacted>").finish()
    }
}

impl From<[u8; 16]> for CheckKey {
    #[inline]
    fn from(bytes: [u8; 16]) -> Self {
        Self::new(bytes)
    }
}

/// Result of a SipHash-2-4 computation: exactly 8 bytes, little-endian.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
#[must_use]
pub struct CheckValue([u8; 8]);

impl CheckValue {
    #[inline]
    pub(crate) const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw little-endian bytes of the check value.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Numeric value of the check, decoded little-endian.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    /// Lowest 32 bits of the check value.
    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.as_u64() as u32
    }
}
