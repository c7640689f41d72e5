//! Outcome and error types (`spec.md` §4.5.4, §4.7.4, §7).

use strum::Display;
use thiserror::Error;

/// Result of parsing+authenticating+applying a keycode frame
/// (`spec.md` §4.5.4).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ApplyOutcome {
    Invalid,
    ValidDuplicate,
    ValidApplied,
    DisplayDeviceId,
    /// Passthrough already rendered its own feedback; caller emits none.
    None,
}

/// Result of applying an origin-message command (`spec.md` §4.6).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum OriginApplyOutcome {
    Applied,
    /// Covers malformed input, MAC mismatch, and already-applied replays —
    /// `spec.md` §7 surfaces all three uniformly as `ACTION_REJECTED`.
    ActionRejected,
}

/// Authenticated-transport outcome (`spec.md` §4.7.4).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum AuthOutcome {
    None,
    MacInvalid,
    CoseUnparseable,
    PayloadSizeInvalid,
    SenderDeviceNotLinked,
    ResourceRequiresSecuredRequest,
    RequestReceivedWithInvalidNonce,
    ValidNonceSyncReceived,
    NonceApproachingMaxForcedResetRequired,
}

/// CoAP codec failures (`spec.md` §4.7.1, §7).
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum CoapError {
    #[error("malformed CoAP message")]
    Malformed,
    #[error("unknown critical option")]
    UnknownCriticalOption,
    #[error("payload exceeds configured block size")]
    PayloadTooLarge,
}

/// Top-level error surfaced by the public channel entrypoints
/// (`nx_channel_error` in the original firmware).
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum ChannelError {
    #[error("channel support is disabled")]
    Disabled,
    #[error(transparent)]
    Coap(#[from] CoapError),
    #[error("authentication failed: {0}")]
    Auth(AuthOutcome),
    #[error("no resource matched the request")]
    NoMatchingResource,
    #[error("method not allowed on this resource")]
    MethodNotAllowed,
    #[error("link table is full")]
    LinkTableFull,
    #[error("duplicate link for this (authority, device) pair")]
    DuplicateLink,
}
