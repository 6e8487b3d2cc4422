use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;

// =============================================================================
// Core Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
}

impl HomeAssistantConfig {
    pub fn new(url: String, token: String) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn websocket_url(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        let new_scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )));
            }
        };
        url.set_scheme(new_scheme)
            .map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
        url.set_path("/api/websocket");
        Ok(url.to_string())
    }
}

// =============================================================================
// Gateway Settings
// =============================================================================

/// Knobs for entity resolution and elicitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Elicitation round-trips allowed before a resolution fails terminally.
    pub max_rounds: u32,
    /// Raw-score lead the top candidate needs over the runner-up.
    pub gap_points: f64,
    /// Confidence ratio used when the caller supplies none.
    pub default_confidence: f64,
    pub default_limit: usize,
    pub max_limit: usize,
    pub cache_capacity: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            gap_points: 10.0,
            default_confidence: 0.75,
            default_limit: 5,
            max_limit: 10,
            cache_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub auth_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub template_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 10,
            command_timeout_secs: 30,
            template_timeout_secs: 10,
        }
    }
}

impl TransportSettings {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn template_timeout(&self) -> Duration {
        Duration::from_secs(self.template_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub resolver: ResolverSettings,
    pub transport: TransportSettings,
}

impl GatewaySettings {
    /// Load settings from an optional YAML file; no path means defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml(&raw)?;
        tracing::info!(path = %path.display(), "loaded gateway settings");
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_yaml::from_str(raw)?;
        if settings.resolver.max_limit == 0 || settings.resolver.cache_capacity == 0 {
            anyhow::bail!("resolver.max_limit and resolver.cache_capacity must be positive");
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_scheme() {
        let config = HomeAssistantConfig::new("https://ha.local:8123/".into(), "t".into());
        assert_eq!(
            config.websocket_url().unwrap(),
            "wss://ha.local:8123/api/websocket"
        );

        let config = HomeAssistantConfig::new("http://localhost:8123".into(), "t".into());
        assert_eq!(
            config.websocket_url().unwrap(),
            "ws://localhost:8123/api/websocket"
        );
    }

    #[test]
    fn websocket_url_rejects_unknown_scheme() {
        let config = HomeAssistantConfig::new("ftp://ha.local".into(), "t".into());
        assert!(matches!(
            config.websocket_url(),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = GatewaySettings::from_yaml("resolver:\n  max_rounds: 3\n").unwrap();
        assert_eq!(settings.resolver.max_rounds, 3);
        assert_eq!(settings.resolver.cache_capacity, 64);
        assert_eq!(settings.transport.command_timeout_secs, 30);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(GatewaySettings::from_yaml("resolver:\n  cache_capacity: 0\n").is_err());
    }
}
