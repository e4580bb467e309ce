//! Client configuration.
//!
//! Tunables are loaded from environment variables; everything has a default so
//! an empty environment yields a working client.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5001";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_OFFER_DELAY_MS: u64 = 1000;
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_SESSION_DURATION_SECS: u64 = 3600;
pub const DEFAULT_SESSION_WARNING_SECS: u64 = 900;

/// Where the reported round-trip latency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencySource {
    /// Derived from packet loss and jitter.
    #[default]
    Estimated,
    /// Transport round-trip measurements, falling back to the estimate.
    Measured,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Session warning ({warning}s) must be shorter than the session ({duration}s)")]
    WarningAfterEnd { warning: u64, duration: u64 },

    #[error("At least one ICE server is required")]
    NoIceServers,
}

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Pause before the initiator sends its offer.
    pub offer_delay: Duration,
    pub metrics_interval: Duration,
    pub session_duration: Duration,
    /// Remaining time at which the one-time warning fires.
    pub session_warning: Duration,
    pub latency_source: LatencySource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            offer_delay: Duration::from_millis(DEFAULT_OFFER_DELAY_MS),
            metrics_interval: Duration::from_millis(DEFAULT_METRICS_INTERVAL_MS),
            session_duration: Duration::from_secs(DEFAULT_SESSION_DURATION_SECS),
            session_warning: Duration::from_secs(DEFAULT_SESSION_WARNING_SECS),
            latency_source: LatencySource::Estimated,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_url = vars
            .get("MESH_SIGNALING_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());

        let ice_servers: Vec<String> = match vars.get("MESH_ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![DEFAULT_ICE_SERVER.to_string()],
        };
        if ice_servers.is_empty() {
            return Err(ConfigError::NoIceServers);
        }

        let offer_delay_ms = parse_u64(vars, "MESH_OFFER_DELAY_MS", DEFAULT_OFFER_DELAY_MS)?;
        let metrics_interval_ms =
            parse_u64(vars, "MESH_METRICS_INTERVAL_MS", DEFAULT_METRICS_INTERVAL_MS)?;
        if metrics_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MESH_METRICS_INTERVAL_MS",
                value: "0".to_string(),
            });
        }

        let duration = parse_u64(vars, "MESH_SESSION_DURATION_SECS", DEFAULT_SESSION_DURATION_SECS)?;
        let warning = parse_u64(vars, "MESH_SESSION_WARNING_SECS", DEFAULT_SESSION_WARNING_SECS)?;
        if warning >= duration {
            return Err(ConfigError::WarningAfterEnd { warning, duration });
        }

        let latency_source = match vars.get("MESH_LATENCY_SOURCE").map(|s| s.to_ascii_lowercase()) {
            None => LatencySource::Estimated,
            Some(s) if s == "estimated" => LatencySource::Estimated,
            Some(s) if s == "measured" => LatencySource::Measured,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "MESH_LATENCY_SOURCE",
                    value: other,
                })
            }
        };

        Ok(Self {
            signaling_url,
            ice_servers,
            offer_delay: Duration::from_millis(offer_delay_ms),
            metrics_interval: Duration::from_millis(metrics_interval_ms),
            session_duration: Duration::from_secs(duration),
            session_warning: Duration::from_secs(warning),
            latency_source,
        })
    }
}

fn parse_u64(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw.clone(),
        }),
    }
}

/// Who the local participant is and where it is going.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    /// Join with the microphone muted.
    pub no_audio: bool,
    /// Join with the camera off.
    pub video_off: bool,
}

impl SessionConfig {
    /// Build an identity, generating the room id when none is given.
    pub fn new(room_id: Option<String>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(crate::room::generate_room_id),
            participant_id: crate::room::generate_participant_id(),
            display_name: display_name.into(),
            no_audio: false,
            video_off: false,
        }
    }
}
