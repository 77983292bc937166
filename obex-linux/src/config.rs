//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use obex_core::protocol::MIN_MTU;
use obex_core::{CredentialProvider, StaticCredentials, DEFAULT_MTU};

use crate::server::{ServerOptions, DEFAULT_MAX_OBJECT_SIZE};

/// Daemon configuration. File: ~/.config/obexd/config.toml or /etc/obexd/config.toml.
/// Env overrides: OBEXD_PORT, OBEXD_ROOT, OBEXD_MTU, OBEXD_PASSWORD, OBEXD_TIMEOUT_SECS,
/// OBEXD_MAX_OBJECT_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for `serve` (default 0.0.0.0).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// OBEX over TCP port (default 650).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Folder served and written to by `serve`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Max packet size offered at CONNECT (default 0x2000).
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Challenge clients before serving them.
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    /// Per-read timeout; unset waits forever.
    #[serde(default)]
    pub io_timeout_secs: Option<u64>,
    /// Let clients create folders with SETPATH.
    #[serde(default = "default_allow_create")]
    pub allow_create: bool,
    /// Largest object accepted by PUT or served by GET, in bytes (default 64 MiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    650
}
fn default_root_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/obexd"),
        None => PathBuf::from("/var/lib/obexd"),
    }
}
fn default_mtu() -> u16 {
    DEFAULT_MTU
}
fn default_allow_create() -> bool {
    true
}
fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            root_dir: default_root_dir(),
            mtu: default_mtu(),
            require_auth: false,
            user: None,
            password: None,
            realm: None,
            io_timeout_secs: None,
            allow_create: default_allow_create(),
            max_object_size: default_max_object_size(),
        }
    }
}

impl Config {
    /// Configured password (and user) as a credential provider.
    pub fn credentials(&self) -> Option<Arc<dyn CredentialProvider>> {
        let password = self.password.clone()?;
        Some(Arc::new(StaticCredentials::new(self.user.clone(), password)))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    pub fn server_options(&self) -> ServerOptions {
        if self.require_auth && self.password.is_none() {
            tracing::warn!("require_auth set without a password; every client will be refused");
        }
        ServerOptions {
            mtu: self.mtu,
            credentials: self.credentials(),
            require_auth: self.require_auth,
            realm: self.realm.clone(),
            timeout: self.timeout(),
            max_object_size: self.max_object_size,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("OBEXD_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(root) = var("OBEXD_ROOT") {
        c.root_dir = PathBuf::from(root);
    }
    if let Some(mtu) = var("OBEXD_MTU").and_then(|s| s.parse::<u16>().ok()) {
        c.mtu = mtu;
    }
    if let Some(password) = var("OBEXD_PASSWORD") {
        c.password = Some(password);
    }
    if let Some(secs) = var("OBEXD_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
        c.io_timeout_secs = Some(secs);
    }
    if let Some(limit) = var("OBEXD_MAX_OBJECT_SIZE").and_then(|s| s.parse::<u64>().ok()) {
        c.max_object_size = limit;
    }
    if c.mtu < MIN_MTU {
        tracing::warn!(mtu = c.mtu, "mtu below {}, raised", MIN_MTU);
        c.mtu = MIN_MTU;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/obexd/config.toml"));
    }
    out.push(PathBuf::from("/etc/obexd/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}
