//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/grove/config.toml or
/// /etc/grove/config.toml. Env overrides: GROVE_NAME, GROVE_UDP_PORT,
/// GROVE_DATA_DIR, GROVE_KEY_DIR, GROVE_DIRECTORY_URL, GROVE_DIRECTORY_UDP,
/// GROVE_DIRECTORY_NAME, GROVE_ENCRYPT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our name in the directory.
    #[serde(default = "default_name")]
    pub name: String,
    /// UDP listen port (default 7513).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Directory subtree published as our Merkle root.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where the long-term key lives.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    /// Directory REST base URL.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// Directory UDP endpoint, host:port.
    #[serde(default = "default_directory_udp")]
    pub directory_udp: String,
    /// Name under which the directory answers Hello.
    #[serde(default = "default_directory_name")]
    pub directory_name: String,
    /// Advertise and use the encryption extension.
    #[serde(default)]
    pub encrypt: bool,
}

fn default_name() -> String {
    "grove".to_owned()
}
fn default_udp_port() -> u16 {
    7513
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}
fn default_directory_url() -> String {
    "https://directory.grove-net.org:8443".to_owned()
}
fn default_directory_udp() -> String {
    "directory.grove-net.org:8443".to_owned()
}
fn default_directory_name() -> String {
    "directory.grove-net.org".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            udp_port: default_udp_port(),
            data_dir: default_data_dir(),
            key_dir: default_key_dir(),
            directory_url: default_directory_url(),
            directory_udp: default_directory_udp(),
            directory_name: default_directory_name(),
            encrypt: false,
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("GROVE_NAME") {
        c.name = s;
    }
    if let Ok(s) = std::env::var("GROVE_UDP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.udp_port = p;
        }
    }
    if let Ok(s) = std::env::var("GROVE_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("GROVE_KEY_DIR") {
        c.key_dir = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("GROVE_DIRECTORY_URL") {
        c.directory_url = s;
    }
    if let Ok(s) = std::env::var("GROVE_DIRECTORY_UDP") {
        c.directory_udp = s;
    }
    if let Ok(s) = std::env::var("GROVE_DIRECTORY_NAME") {
        c.directory_name = s;
    }
    if let Ok(s) = std::env::var("GROVE_ENCRYPT") {
        c.encrypt = matches!(s.as_str(), "1" | "true" | "yes");
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/grove/config.toml"));
    }
    out.push(PathBuf::from("/etc/grove/config.toml"));
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
