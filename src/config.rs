//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `TAGRELAY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `TAGRELAY_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `TAGRELAY_TRACKING__MATOMO_URL=https://stats.example.com` sets the `tracking.matomo_url` field.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port` - HTTP server binding configuration
//! - **Tracking**: `tracking.*` - default collector settings applied to every sales channel
//! - **Channels**: `channels.<sales-channel-id>.*` - per-channel overrides of the tracking table
//! - **Features**: `enable_metrics` - Prometheus metrics endpoint at `/internal/metrics`
//! - **Sessions**: `session.ttl` - idle lifetime of the server-side visitor session
//!
//! ```yaml
//! tracking:
//!   enabled: true
//!   matomo_url: https://stats.example.com
//!   site_id: "3"
//!   api_token: abc123
//!   excluded_referrers: "payment.example.org, sso.example.org"
//!   event_tracking: true
//!   ecommerce_tracking: true
//! channels:
//!   b2b-channel:
//!     enabled: false
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TAGRELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Timeout for the outbound collector call
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,
    /// Server-side session configuration
    pub session: SessionConfig,
    /// Default tracking settings, applied to every sales channel without an override
    pub tracking: TrackingSettings,
    /// Per-sales-channel overrides of the tracking settings
    pub channels: HashMap<String, TrackingSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3820,
            enable_metrics: false,
            dispatch_timeout: Duration::from_secs(5),
            session: SessionConfig::default(),
            tracking: TrackingSettings::default(),
            channels: HashMap::new(),
        }
    }
}

/// Server-side session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Idle lifetime of a visitor session. Cross-request tracking state
    /// (client id, screen resolution, browsing context) is dropped after this.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Matomo collector settings for one sales channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingSettings {
    /// Master switch. When false, requests on this channel are never tracked.
    pub enabled: bool,
    /// Base URL of the Matomo instance; the tracking endpoint is `<matomo_url>/matomo.php`
    pub matomo_url: Option<Url>,
    /// Matomo site id. The payload falls back to "1" when unset.
    #[serde(deserialize_with = "string_or_number")]
    pub site_id: Option<String>,
    /// Matomo API token, sent as `token_auth` (required for `cip` IP overrides)
    pub api_token: Option<String>,
    /// Comma-separated referrer domains that are suppressed from `urlref`
    pub excluded_referrers: Option<String>,
    /// Include Matomo event fields (`e_c`/`e_a`/`e_n`) in payloads
    pub event_tracking: bool,
    /// Include Matomo ecommerce fields (`ec_*`, `idgoal`, `revenue`, ...) in payloads
    pub ecommerce_tracking: bool,
}

/// Site ids are strings on the wire, but YAML and the figment env provider
/// hand unquoted values over as numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
    }))
}

impl TrackingSettings {
    /// Excluded referrer domains: comma-separated, trimmed, empty entries dropped.
    pub fn excluded_referrer_domains(&self) -> impl Iterator<Item = &str> {
        self.excluded_referrers
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }

    /// Full collector endpoint URL, if a base URL is configured.
    pub fn collector_endpoint(&self) -> Option<String> {
        self.matomo_url
            .as_ref()
            .map(|url| format!("{}/matomo.php", url.as_str().trim_end_matches('/')))
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("TAGRELAY_").split("__"))
    }

    /// Tracking settings for a sales channel: the channel override when one is
    /// configured, otherwise the global `tracking` table.
    pub fn for_channel(&self, sales_channel_id: &str) -> &TrackingSettings {
        self.channels.get(sales_channel_id).unwrap_or(&self.tracking)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.tracking.enabled && self.tracking.matomo_url.is_none() {
            return Err(Error::Internal {
                operation: "Config validation: tracking is enabled but matomo_url is not configured. \
                     Please set TAGRELAY_TRACKING__MATOMO_URL or add tracking.matomo_url to the config file."
                    .to_string(),
            });
        }

        for (channel, settings) in &self.channels {
            if settings.enabled && settings.matomo_url.is_none() {
                return Err(Error::Internal {
                    operation: format!(
                        "Config validation: tracking is enabled for channel '{channel}' but its matomo_url is not configured"
                    ),
                });
            }
        }

        if self.session.ttl.as_secs() < 60 {
            return Err(Error::Internal {
                operation: "Config validation: session.ttl is too short (minimum 1 minute)".to_string(),
            });
        }

        if self.dispatch_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: dispatch_timeout cannot be 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
