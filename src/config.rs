//! Compile/init-time configuration (`spec.md` §6.5).

/// Which wire encoding the keycode engine accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeycodeProtocol {
    Full,
    Small,
}

/// Role this device plays in the channel link fabric.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelRole {
    Controller,
    Accessory,
    Dual,
}

/// Message-assembly framing configuration.
#[derive(Clone, Debug)]
pub struct MasConfig {
    pub start_char: u8,
    pub end_char: Option<u8>,
    pub alphabet: Vec<u8>,
    pub stop_length: u8,
    pub entry_timeout_s: u8,
    pub rate_limit_bucket_max: u8,
    pub rate_limit_initial: u8,
    pub refill_sec_per_attempt: u16,
}

impl MasConfig {
    #[must_use]
    pub fn full_protocol() -> Self {
        Self {
            start_char: b'*',
            end_char: Some(b'#'),
            alphabet: b"0123456789".to_vec(),
            stop_length: 0, // unused: framing ends on `end_char`
            entry_timeout_s: 60,
            rate_limit_bucket_max: 10,
            rate_limit_initial: 10,
            refill_sec_per_attempt: 3600,
        }
    }

    #[must_use]
    pub fn small_protocol(alphabet: [u8; 4]) -> Self {
        Self {
            start_char: alphabet[0].max(b'1'),
            end_char: None,
            alphabet: alphabet.to_vec(),
            stop_length: 14,
            entry_timeout_s: 60,
            rate_limit_bucket_max: 10,
            rate_limit_initial: 10,
            refill_sec_per_attempt: 3600,
        }
    }
}

/// Factory-test lifetime caps (`spec.md` §6.5).
#[derive(Clone, Copy, Debug)]
pub struct QcLimits {
    pub short_lifetime_max: u8,
    pub long_lifetime_max: u8,
}

impl Default for QcLimits {
    fn default() -> Self {
        Self {
            short_lifetime_max: 15,
            long_lifetime_max: 15,
        }
    }
}

/// Top-level configuration aggregate, constructed once at `Core::init`.
#[derive(Clone, Debug)]
pub struct Config {
    pub keycode_protocol: KeycodeProtocol,
    pub mas: MasConfig,
    pub qc_limits: QcLimits,
    pub channel_enabled: bool,
    pub channel_role: ChannelRole,
    pub max_simultaneous_links: u8,
    pub link_timeout_seconds: u32,
    pub idle_ceiling_s: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keycode_protocol: KeycodeProtocol::Full,
            mas: MasConfig::full_protocol(),
            qc_limits: QcLimits::default(),
            channel_enabled: false,
            channel_role: ChannelRole::Accessory,
            max_simultaneous_links: 10,
            link_timeout_seconds: 7_776_000,
            idle_ceiling_s: 240,
        }
    }
}
