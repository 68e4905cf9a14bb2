use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::identity::Identity;
use crate::engine::connection::{ConnectionOptions, ReconnectPolicy};
use crate::engine::session::SessionOptions;

/// Top-level client configuration, loaded from outpost.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub identity: IdentitySection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Real-time WebSocket endpoint.
    pub ws_url: String,
    /// REST backend used for outpost metadata.
    pub api_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".into(),
            api_url: "http://localhost:8080/api".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub reaction_cooldown_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub probe_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            reaction_cooldown_secs: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
            probe_timeout_ms: 3_000,
            open_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct IdentitySection {
    /// Wallet address to act as. Unset means signed out.
    pub address: Option<String>,
    pub uuid: Option<Uuid>,
}

impl ClientConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            Self::parse(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OUTPOST_WS_URL") {
            self.server.ws_url = v;
        }
        if let Ok(v) = std::env::var("OUTPOST_API_URL") {
            self.server.api_url = v;
        }
        if let Ok(v) = std::env::var("OUTPOST_ADDRESS") {
            let v = v.trim().to_string();
            self.identity.address = (!v.is_empty()).then_some(v);
        }
        if let Ok(v) = std::env::var("OUTPOST_UUID")
            && let Ok(uuid) = v.parse()
        {
            self.identity.uuid = Some(uuid);
        }

        let session = &mut self.session;
        override_number("REACTION_COOLDOWN_SECS", &mut session.reaction_cooldown_secs);
        override_number("RECONNECT_BASE_DELAY_MS", &mut session.reconnect_base_delay_ms);
        override_number("RECONNECT_MAX_DELAY_MS", &mut session.reconnect_max_delay_ms);
        override_number("RECONNECT_MAX_ATTEMPTS", &mut session.reconnect_max_attempts);
        override_number("PROBE_TIMEOUT_MS", &mut session.probe_timeout_ms);
        override_number("OPEN_TIMEOUT_MS", &mut session.open_timeout_ms);
        override_number("JOIN_TIMEOUT_MS", &mut session.join_timeout_ms);
    }

    /// Options for the session controller.
    pub fn session_options(&self) -> SessionOptions {
        let s = &self.session;
        SessionOptions {
            ws_url: self.server.ws_url.clone(),
            reaction_cooldown: Duration::from_secs(s.reaction_cooldown_secs),
            join_timeout: Duration::from_millis(s.join_timeout_ms),
            connection: ConnectionOptions {
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(s.reconnect_base_delay_ms),
                    max_delay: Duration::from_millis(s.reconnect_max_delay_ms),
                    max_attempts: s.reconnect_max_attempts,
                },
                open_timeout: Duration::from_millis(s.open_timeout_ms),
                probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            },
        }
    }

    /// The configured actor, if an address is set. A missing uuid gets a fresh one.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.address.as_ref().map(|address| Identity {
            address: address.clone(),
            uuid: self.identity.uuid.unwrap_or_else(Uuid::new_v4),
        })
    }
}

fn override_number<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key)
        && let Ok(n) = v.parse()
    {
        *target = n;
    }
}
