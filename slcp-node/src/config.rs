//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ./slcp.toml or ~/.config/slcp/config.toml.
/// Env overrides: SLCP_HANDLE, SLCP_PORT, SLCP_WHOISPORT, SLCP_IMAGEPATH,
/// SLCP_INACTIVE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Own chat handle.
    #[serde(default = "default_handle")]
    pub handle: String,
    /// UDP data port for unicast messages (default 5001).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Well-known discovery/broadcast UDP port (default 4000).
    #[serde(default = "default_whoisport")]
    pub whoisport: u16,
    /// Directory for received images.
    #[serde(default = "default_imagepath")]
    pub imagepath: PathBuf,
    /// Reply text sent while inactive.
    #[serde(default = "default_autoreply")]
    pub autoreply: String,
    /// When set, inbound messages are answered with the autoreply text.
    #[serde(default)]
    pub inactive: bool,
    /// Remove peers not heard from within this many seconds; 0 disables.
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
}

fn default_handle() -> String {
    "anonymous".to_string()
}
fn default_port() -> u16 {
    5001
}
fn default_whoisport() -> u16 {
    4000
}
fn default_imagepath() -> PathBuf {
    PathBuf::from("./received")
}
fn default_autoreply() -> String {
    "I am not here.".to_string()
}
fn default_peer_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handle: default_handle(),
            port: default_port(),
            whoisport: default_whoisport(),
            imagepath: default_imagepath(),
            autoreply: default_autoreply(),
            inactive: false,
            peer_timeout_secs: default_peer_timeout_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SLCP_HANDLE") {
        if !s.is_empty() {
            c.handle = s;
        }
    }
    if let Ok(s) = std::env::var("SLCP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("SLCP_WHOISPORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.whoisport = p;
        }
    }
    if let Ok(s) = std::env::var("SLCP_IMAGEPATH") {
        if !s.is_empty() {
            c.imagepath = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("SLCP_INACTIVE") {
        if let Ok(b) = s.parse::<bool>() {
            c.inactive = b;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("slcp.toml")];
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/slcp/config.toml"));
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 5001);
        assert_eq!(c.whoisport, 4000);
        assert!(!c.inactive);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str("handle = \"alice\"\nport = 6001\n").unwrap();
        assert_eq!(c.handle, "alice");
        assert_eq!(c.port, 6001);
        assert_eq!(c.whoisport, 4000);
        assert_eq!(c.autoreply, "I am not here.");
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("nonsense = 1\n").is_err());
    }
}
