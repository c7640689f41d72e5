//! PAYG entitlement and device-linking firmware core.
//!
//! Decodes keycodes and origin-message commands into pay-as-you-go credit
//! changes, and links accessories into a local command channel over CoAP.
//! The host integration supplies randomness, persistence, and the actual
//! credit/network primitives through the [`host::Host`] trait; this crate
//! owns only the protocol state machines.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod coap;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod keycode;
pub mod link;
pub mod nv;
pub mod om;
pub mod scheduler;
pub mod util;

use config::Config;
use error::ApplyOutcome;
use events::CustomFlag;
use host::{Host, NxId};
use keycode::KeycodeEngine;

/// The library's single entrypoint: owns every subsystem and is the object
/// a product's main loop drives (`spec.md` §5, §6).
#[derive(Debug)]
pub struct Core {
    config: Config,
    keycode: KeycodeEngine,
    channel: Option<channel::ChannelCore>,
}

impl Core {
    /// Initializes every subsystem from persisted NV state, or fresh
    /// defaults when none exists yet.
    #[must_use]
    pub fn init(config: Config, host: &dyn Host) -> Self {
        let channel = config.channel_enabled.then(|| channel::ChannelCore::new(&config, host));
        Self {
            keycode: KeycodeEngine::new(&config, host),
            channel,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Feeds one key press from the device's keypad (`spec.md` §6.2).
    /// Interrupt-safe: never blocks, never touches NV beyond what a
    /// completed frame requires.
    pub fn handle_single_key(
        &mut self,
        symbol: u8,
        host: &dyn Host,
    ) -> ApplyOutcome {
        self.keycode
            .handle_single_key(symbol, host.uptime_seconds(), &self.config, host, host)
    }

    /// Hands a complete, already-assembled keycode frame straight to the
    /// PRO engine (`spec.md` §6.2), e.g. one delivered over a provisioning
    /// tool rather than the physical keypad.
    pub fn handle_complete_keycode(&mut self, frame: &[u8], host: &dyn Host) -> ApplyOutcome {
        self.keycode.handle_complete_keycode(frame, &self.config, host, host)
    }

    /// Applies an origin-message command received out of band (e.g.
    /// extracted from a keycode passthrough payload) (`spec.md` §6.3).
    pub fn handle_origin_command(&mut self, frame: &[u8], host: &dyn Host) -> error::OriginApplyOutcome {
        if let Some(channel) = &mut self.channel {
            channel.handle_origin_command(frame, host, host)
        } else {
            error::OriginApplyOutcome::ActionRejected
        }
    }

    /// Routes one inbound network datagram to the channel subsystem
    /// (`spec.md` §6.3). A no-op returning [`error::ChannelError::Disabled`]
    /// if the channel is not configured.
    pub fn network_receive(&mut self, bytes: &[u8], src: NxId, host: &dyn Host) -> Result<(), error::ChannelError> {
        match &mut self.channel {
            Some(channel) => channel.network_receive(bytes, src, host, host),
            None => Err(error::ChannelError::Disabled),
        }
    }

    /// Registers a product-specific CoAP resource with the channel
    /// subsystem. No-op if the channel is not configured.
    pub fn register_resource(&mut self, resource: Box<dyn channel::Resource>) {
        if let Some(channel) = &mut self.channel {
            channel.registry.register(resource);
        }
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.channel.as_ref().map_or(0, channel::ChannelCore::link_count)
    }

    /// Reads a persisted custom flag (`spec.md` §6.2 `get_custom_flag`).
    #[must_use]
    pub const fn get_custom_flag(&self, flag: CustomFlag) -> bool {
        self.keycode.get_custom_flag(flag)
    }

    /// Sets a persisted custom flag, notifying the host via
    /// `ChannelEvent::CustomFlagChanged` if the value actually changes
    /// (`spec.md` §6.2 `set_custom_flag`).
    pub fn set_custom_flag(&mut self, flag: CustomFlag, value: bool, host: &dyn Host) {
        self.keycode.set_custom_flag(flag, value, host, host);
    }

    #[must_use]
    pub fn keycode_attempts_remaining(&self) -> u32 {
        self.keycode.attempts_remaining()
    }

    /// Driven by the host's main loop; returns the number of seconds the
    /// host may sleep before calling `process` again (`spec.md` §6.4).
    pub fn process(&mut self, seconds_elapsed: u32, host: &dyn Host) -> u32 {
        scheduler::run(
            &mut self.keycode,
            self.channel.as_mut(),
            &self.config,
            host,
            host,
            seconds_elapsed,
        )
    }
}
