//! Application configuration.
//!
//! Configuration is read from the process environment at startup:
//! - `HOLDBACK_URL`: base URL of the hosted backend
//! - `HOLDBACK_KEY`: access key, sent as `apikey` and bearer token
//! - `HOLDBACK_PIN`: PIN required before the dashboard opens
//! - `HOLDBACK_DEBOUNCE_MS`: quiet window for field edits (default: 500)
//! - `HOLDBACK_POLL_MS`: change-poll interval of the HTTP backend (default: 2000)

use std::env;
use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{HoldbackError, Result};

pub const URL_VAR: &str = "HOLDBACK_URL";
pub const KEY_VAR: &str = "HOLDBACK_KEY";
pub const PIN_VAR: &str = "HOLDBACK_PIN";
pub const DEBOUNCE_VAR: &str = "HOLDBACK_DEBOUNCE_MS";
pub const POLL_VAR: &str = "HOLDBACK_POLL_MS";

const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_POLL_MS: u64 = 2000;

/// Runtime configuration
#[derive(Clone)]
pub struct Config {
    /// Backend base URL (e.g. `https://abc.example.co`)
    pub url: Option<String>,
    /// Backend access key
    pub key: Option<SecretString>,
    /// Dashboard PIN
    pub pin: Option<String>,
    /// Quiet window before a field edit is written
    pub debounce: Duration,
    /// Interval between change polls
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            pin: None,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("pin", &self.pin.as_ref().map(|_| "[REDACTED]"))
            .field("debounce", &self.debounce)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut config = Config {
            url: get(URL_VAR).map(|u| u.trim_end_matches('/').to_string()),
            key: get(KEY_VAR).map(SecretString::from),
            pin: get(PIN_VAR),
            ..Config::default()
        };

        if let Some(ms) = get(DEBOUNCE_VAR) {
            config.debounce = Duration::from_millis(parse_millis(DEBOUNCE_VAR, &ms)?);
        }
        if let Some(ms) = get(POLL_VAR) {
            let ms = parse_millis(POLL_VAR, &ms)?;
            if ms == 0 {
                return Err(HoldbackError::Config(format!(
                    "{POLL_VAR} must be greater than zero"
                )));
            }
            config.poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Backend URL, or a configuration error naming the missing variable
    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| HoldbackError::Config(format!("{URL_VAR} is not set")))
    }

    /// Backend key, or a configuration error naming the missing variable
    pub fn require_key(&self) -> Result<&SecretString> {
        self.key
            .as_ref()
            .ok_or_else(|| HoldbackError::Config(format!("{KEY_VAR} is not set")))
    }

    /// Check an entered PIN against the configured one.
    ///
    /// With no PIN configured the gate is closed.
    pub fn verify_pin(&self, entered: &str) -> Result<()> {
        match &self.pin {
            Some(pin) if pin == entered.trim() => Ok(()),
            _ => Err(HoldbackError::PinRejected),
        }
    }

    /// Whether a key is configured, without exposing it
    pub fn has_key(&self) -> bool {
        self.key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        HoldbackError::Config(format!(
            "{name} must be a number of milliseconds, got '{value}'"
        ))
    })
}
