//! Feedback kinds and asynchronous events surfaced to the host
//! (`spec.md` §6.1).

use strum::Display;

/// Immediate, synchronous feedback hint for a single keypress or completed
/// frame. Rendered by the host (LED/beeper); never blocks the library.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Feedback {
    KeyAccepted,
    KeyRejected,
    MessageValid,
    MessageInvalid,
    MessageApplied,
    None,
}

/// PAYG credit state as reported by the host (`spec.md` §6.1).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PaygState {
    Disabled,
    Enabled,
    Unlocked,
}

/// Outcome a host collaborator returns for an inbound "complete" passthrough
/// keycode it chose to handle itself (`spec.md` §6.1 `passthrough_keycode`).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PassthroughOutcome {
    None,
    RateLimited,
    Malformed,
    Unhandled,
}

/// Outcome of a host `network_send` attempt (`spec.md` §6.1).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NetworkSendOutcome {
    None,
    Unspecified,
    ActionRejected,
}

/// Identifies a persisted custom flag for `get_custom_flag`/`set_custom_flag`
/// (`spec.md` §3, §6.2). Only one flag is defined in this specification's
/// scope today; the indirection exists so the host-facing signature doesn't
/// need to change if a product adds another.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum CustomFlag {
    Restricted,
}

/// Asynchronous events the library notifies the host about
/// (`spec.md` §6.1 `notify_event`).
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ChannelEvent {
    LinkHandshakeStarted,
    LinkHandshakeTimedOut,
    LinkEstablishedAsController,
    LinkEstablishedAsAccessory,
    LinkDeleted,
    CustomFlagChanged(CustomFlag, bool),
}
