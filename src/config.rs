//! Configuration loading and persistence.
//!
//! Covers every externally tunable knob: `broker_url`,
//! `spare_connection_limit`, `reconnect_backoff_ms`, `ping_interval_ms`,
//! `pong_timeout_ms`, `max_frame_queue`, `close_reason_max_bytes`,
//! `ephemeral_curve`, `nonce_parity_initiator`, and the OCE success-window
//! default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// Which side of a channel uses odd local nonces.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NonceParityInitiator {
    /// The initiator (client role in CS-C/CS-S) uses odd local nonces.
    Odd,
    /// The initiator uses even local nonces.
    Even,
}

impl Default for NonceParityInitiator {
    fn default() -> Self {
        Self::Odd
    }
}

impl NonceParityInitiator {
    /// The nonce parity the initiator side (CS-C) of a key exchange should
    /// use, per this setting.
    #[must_use]
    pub fn initiator_parity(self) -> crate::crypto::channel::NonceParity {
        match self {
            Self::Odd => crate::crypto::channel::NonceParity::Odd,
            Self::Even => crate::crypto::channel::NonceParity::Even,
        }
    }
}

/// The only supported ephemeral curve, kept as an explicit config key so it
/// can be validated rather than assumed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralCurve {
    /// Curve25519-XSalsa20-Poly1305 ("NaCl box" semantics).
    Box,
}

impl Default for EphemeralCurve {
    fn default() -> Self {
        Self::Box
    }
}

/// Runtime configuration for the relay core.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// URL of the relay broker (`ws://` or `wss://`).
    pub broker_url: String,
    /// Number of spare connections a listener tries to keep parked.
    pub spare_connection_limit: usize,
    /// Backoff between reconnect attempts, in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Broker ping cadence, in milliseconds.
    pub ping_interval_ms: u64,
    /// Pong timeout; if `None`, derived as `3 * ping_interval_ms`.
    pub pong_timeout_ms: Option<u64>,
    /// Bounded capacity of a Framed Duplex Channel's receive queue.
    pub max_frame_queue: usize,
    /// Maximum UTF-8 byte length of a close reason sent on the wire.
    pub close_reason_max_bytes: usize,
    /// Ephemeral key exchange curve.
    pub ephemeral_curve: EphemeralCurve,
    /// Which role uses odd local nonces.
    pub nonce_parity_initiator: NonceParityInitiator,
    /// Deadline for `OutgoingConnectionEstablisher::connect_once_with_deadline`.
    pub oce_success_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8765".to_string(),
            spare_connection_limit: 3,
            reconnect_backoff_ms: 5_000,
            ping_interval_ms: 5_000,
            pong_timeout_ms: None,
            max_frame_queue: 256,
            close_reason_max_bytes: 123,
            ephemeral_curve: EphemeralCurve::Box,
            nonce_parity_initiator: NonceParityInitiator::Odd,
            oce_success_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Resolve `pong_timeout_ms`, applying the `3 * ping_interval_ms` heuristic
    /// when the operator has not overridden it explicitly.
    #[must_use]
    pub fn pong_timeout_ms(&self) -> u64 {
        self.pong_timeout_ms
            .unwrap_or(self.ping_interval_ms.saturating_mul(3))
    }

    /// Returns the configuration directory, creating it if necessary.
    ///
    /// Honors `RELAY_CONFIG_DIR` for tests and containerized deployments;
    /// otherwise uses the platform-standard config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("RELAY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join("relay-core")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from `{config_dir}/config.json`, falling back to
    /// defaults if absent, then apply environment-variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&content).context("parsing config file")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RELAY_BROKER_URL") {
            self.broker_url = url;
        }
        if let Ok(v) = std::env::var("RELAY_SPARE_CONNECTION_LIMIT") {
            if let Ok(v) = v.parse() {
                self.spare_connection_limit = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_RECONNECT_BACKOFF_MS") {
            if let Ok(v) = v.parse() {
                self.reconnect_backoff_ms = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_PING_INTERVAL_MS") {
            if let Ok(v) = v.parse() {
                self.ping_interval_ms = v;
            }
        }
        if let Ok(v) = std::env::var("RELAY_PONG_TIMEOUT_MS") {
            if let Ok(v) = v.parse() {
                self.pong_timeout_ms = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAY_MAX_FRAME_QUEUE") {
            if let Ok(v) = v.parse() {
                self.max_frame_queue = v;
            }
        }
    }

    /// Persist the configuration to disk with restrictive permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.reconnect_backoff_ms, 5_000);
        assert_eq!(config.ping_interval_ms, 5_000);
        assert_eq!(config.close_reason_max_bytes, 123);
        assert_eq!(config.oce_success_timeout_ms, 5_000);
        assert_eq!(config.nonce_parity_initiator, NonceParityInitiator::Odd);
    }

    #[test]
    fn pong_timeout_derives_from_ping_interval_by_default() {
        let config = Config::default();
        assert_eq!(config.pong_timeout_ms(), 15_000);
    }

    #[test]
    fn pong_timeout_override_is_respected() {
        let mut config = Config::default();
        config.pong_timeout_ms = Some(1_234);
        assert_eq!(config.pong_timeout_ms(), 1_234);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.broker_url, config.broker_url);
        assert_eq!(loaded.ephemeral_curve, config.ephemeral_curve);
    }
}
