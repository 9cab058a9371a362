//! Server configuration
//!
//! Built once by the startup wrapper (or embedding code) and immutable
//! afterwards. The wrapper sources values from `NAME=value` command-line
//! arguments and uppercased environment variables, argument winning.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MAX_PAYLOAD;

/// Mailbox server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind port
    pub port: u16,
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum inbound WebSocket frame size; forwarded messages above this
    /// size are spilled to the sideband store
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// TLS material; enables TLS on both the WebSocket and HTTP endpoints
    #[serde(default)]
    pub ssl: Option<TlsOptions>,
    /// Pre-shared token required as query parameter `t` on every endpoint
    #[serde(default)]
    pub token: Option<String>,
    /// Enables the development-only `GET /{group}/send` endpoint
    #[serde(default)]
    pub dev_mode: bool,
}

/// TLS certificate material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// PEM private key
    pub key_path: Option<PathBuf>,
    /// PKCS#12 archive (recognized but unsupported; convert to PEM)
    pub pfx_path: Option<PathBuf>,
    /// PKCS#12 passphrase
    pub passphrase: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl ServerConfig {
    /// Create a configuration with defaults for everything but the port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: default_host(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            ssl: None,
            token: None,
            dev_mode: false,
        }
    }

    /// Build a configuration from the startup wrapper's settings map.
    ///
    /// Recognized names: `HOST`, `PORT` (required), `SSL` (`"1"` enables
    /// TLS), `KEY_PATH`, `CERT_PATH`, `PFX_PATH`, `PASSPHRASE`, `TOKEN`,
    /// `MAX_PAYLOAD`, `DEV` (`"1"` enables the development send endpoint).
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self, String> {
        let port = settings
            .get("PORT")
            .ok_or_else(|| "PORT is required".to_string())?
            .parse::<u16>()
            .map_err(|e| format!("invalid PORT: {}", e))?;

        let mut config = Self::new(port);

        if let Some(host) = settings.get("HOST") {
            config.host = host.clone();
        }
        if let Some(max_payload) = settings.get("MAX_PAYLOAD") {
            config.max_payload = max_payload
                .parse::<usize>()
                .map_err(|e| format!("invalid MAX_PAYLOAD: {}", e))?;
        }
        if let Some(token) = settings.get("TOKEN") {
            config.token = Some(token.clone());
        }
        if settings.get("DEV").map(String::as_str) == Some("1") {
            config.dev_mode = true;
        }
        if settings.get("SSL").map(String::as_str) == Some("1") {
            config.ssl = Some(TlsOptions {
                cert_path: settings.get("CERT_PATH").map(PathBuf::from),
                key_path: settings.get("KEY_PATH").map(PathBuf::from),
                pfx_path: settings.get("PFX_PATH").map(PathBuf::from),
                passphrase: settings.get("PASSPHRASE").cloned(),
            });
        }

        Ok(config)
    }
}
