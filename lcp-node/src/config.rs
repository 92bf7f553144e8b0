//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use lcp_core::LCP_PORT;

/// Daemon configuration. File: ~/.config/lcp/config.toml or
/// /etc/lcp/config.toml. Env overrides: LCP_USER_ID,
/// LCP_BROADCAST_INTERVAL, LCP_PORT, LCP_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity announced on the LAN (at most 20 bytes). The CLI
    /// positional argument wins over file and environment.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Seconds between discovery probes (default 1.0).
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: f64,
    /// Shared UDP/TCP port (default 9990).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where peers.json, history.json and downloads/ live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_broadcast_interval() -> f64 {
    1.0
}
fn default_port() -> u16 {
    LCP_PORT
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("lcp-data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: None,
            broadcast_interval: default_broadcast_interval(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("LCP_USER_ID") {
        if !s.is_empty() {
            c.user_id = Some(s);
        }
    }
    if let Ok(s) = std::env::var("LCP_BROADCAST_INTERVAL") {
        if let Ok(v) = s.parse::<f64>() {
            if v > 0.0 {
                c.broadcast_interval = v;
            }
        }
    }
    if let Ok(s) = std::env::var("LCP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("LCP_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lcp/config.toml"));
    }
    out.push(PathBuf::from("/etc/lcp/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
