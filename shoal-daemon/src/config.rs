//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/shoal/config.toml or
/// /etc/shoal/config.toml. Env overrides: SHOAL_HOST, SHOAL_PORT,
/// SHOAL_SHARE_DIR, SHOAL_PEERS, SHOAL_BLOCK_SIZE,
/// SHOAL_MAX_INCOMING_CONNECTIONS, SHOAL_SCAN_INTERVAL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host advertised to peers in handshake messages (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to listen on and advertise (default 8111).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Share directory to synchronize (default ./share).
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Max bytes per transfer chunk (default 8192).
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Inbound session cap before refusing handshakes with peer hints
    /// (default 10).
    #[serde(default = "default_max_incoming_connections")]
    pub max_incoming_connections: usize,
    /// Initial peers to connect to, as host:port.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Seconds between share-directory scans (default 5).
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8111
}
fn default_share_dir() -> PathBuf {
    PathBuf::from("share")
}
fn default_block_size() -> u64 {
    8192
}
fn default_max_incoming_connections() -> usize {
    10
}
fn default_scan_interval_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            share_dir: default_share_dir(),
            block_size: default_block_size(),
            max_incoming_connections: default_max_incoming_connections(),
            peers: Vec::new(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env
/// vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SHOAL_HOST") {
        if !s.is_empty() {
            c.host = s;
        }
    }
    if let Ok(s) = std::env::var("SHOAL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("SHOAL_SHARE_DIR") {
        if !s.is_empty() {
            c.share_dir = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("SHOAL_BLOCK_SIZE") {
        if let Ok(n) = s.parse::<u64>() {
            c.block_size = n;
        }
    }
    if let Ok(s) = std::env::var("SHOAL_MAX_INCOMING_CONNECTIONS") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_incoming_connections = n;
        }
    }
    if let Ok(s) = std::env::var("SHOAL_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Ok(s) = std::env::var("SHOAL_SCAN_INTERVAL_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.scan_interval_secs = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shoal/config.toml"));
    }
    out.push(PathBuf::from("/etc/shoal/config.toml"));
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
