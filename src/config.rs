//! Engine configuration.
//!
//! The configuration file is JSON (spec.md §6), not TOML: `proxy-server`,
//! `tracer-server`, `tracers`, `installation-path`, `auto-launch`, plus the
//! root CA and cert-cache paths.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `host:port` the proxy listens on.
    #[serde(rename = "proxy-server", default = "default_proxy_server")]
    pub proxy_server: SocketAddr,

    /// `host:port` reported to the (out-of-scope) UI. Parsed and carried
    /// but not acted on by the core.
    #[serde(rename = "tracer-server", default = "default_tracer_server")]
    pub tracer_server: SocketAddr,

    /// `tracerString -> tracerPayload` labels loaded into the
    /// `TracerRegistry` at startup.
    #[serde(default)]
    pub tracers: HashMap<String, String>,

    /// Browser-extension install path. Out of scope for the core; parsed
    /// only so a real `tracy`-style config file loads without error.
    #[serde(rename = "installation-path", default)]
    pub installation_path: String,

    /// `"default"` | `"off"` | a command line. Out of scope for the core.
    #[serde(rename = "auto-launch", default = "default_auto_launch")]
    pub auto_launch: String,

    #[serde(default)]
    pub tls: TlsPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsPaths {
    #[serde(default = "default_ca_cert_path")]
    pub root_ca_cert: PathBuf,

    #[serde(default = "default_ca_key_path")]
    pub root_ca_key: PathBuf,

    #[serde(default = "default_cert_cache_path")]
    pub cert_cache: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxy_server: default_proxy_server(),
            tracer_server: default_tracer_server(),
            tracers: HashMap::new(),
            installation_path: String::new(),
            auto_launch: default_auto_launch(),
            tls: TlsPaths::default(),
        }
    }
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            root_ca_cert: default_ca_cert_path(),
            root_ca_key: default_ca_key_path(),
            cert_cache: default_cert_cache_path(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. A missing required key with no
    /// default, or unparsable JSON, is `ConfigFatal`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigFatal(format!(
                "failed to read config file {:?}: {e}",
                path.as_ref()
            ))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| ProxyError::ConfigFatal(format!("failed to parse config JSON: {e}")))
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TRACEWIRE_PROXY_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.proxy_server = parsed;
            }
        }

        if let Ok(dir) = std::env::var("TRACEWIRE_CERT_DIR") {
            let dir = PathBuf::from(dir);
            config.tls.root_ca_cert = dir.join("ca.pem");
            config.tls.root_ca_key = dir.join("ca.key");
            config.tls.cert_cache = dir.join("cert-cache.json");
        }

        config
    }

    /// Save configuration to a JSON file (round trips with `from_file`).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProxyError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::ConfigFatal(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ProxyError::ConfigFatal(format!("failed to write config file: {e}")))
    }
}

fn default_proxy_server() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_tracer_server() -> SocketAddr {
    "127.0.0.1:8081".parse().unwrap()
}

fn default_auto_launch() -> String {
    "off".to_string()
}

fn default_state_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".tracewire")
}

fn default_ca_cert_path() -> PathBuf {
    default_state_dir().join("ca.pem")
}

fn default_ca_key_path() -> PathBuf {
    default_state_dir().join("ca.key")
}

fn default_cert_cache_path() -> PathBuf {
    default_state_dir().join("cert-cache.json")
}
