use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::backend::BackendOptions;
use crate::protocol::command::MAX_SLOT_NUM;
use crate::route::RouterOptions;
use crate::session::SessionOptions;

/// Proxy configuration, loaded from TOML.
///
/// Every knob has a production default; a config file only has to name
/// the listen address and whatever it wants to override.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,

    /// Password clients must present through `AUTH`; unset disables the
    /// challenge.
    #[serde(default)]
    pub product_auth: Option<String>,
    /// Password sent to every backend after dialing.
    #[serde(default)]
    pub backend_auth: Option<String>,

    /// Keepalive cadence in milliseconds; 0 disables the PING poll.
    #[serde(default = "default_backend_ping_period")]
    pub backend_ping_period: u64,
    #[serde(default = "default_bufsize")]
    pub backend_recv_bufsize: usize,
    #[serde(default = "default_bufsize")]
    pub backend_send_bufsize: usize,
    #[serde(default = "default_bufsize")]
    pub session_recv_bufsize: usize,
    #[serde(default = "default_bufsize")]
    pub session_send_bufsize: usize,
    /// Sessions holding more undecodable bytes than this are dropped.
    #[serde(default = "default_session_max_bufsize")]
    pub session_max_bufsize: usize,
    /// Commands a session may have in flight before the decoder stops
    /// reading its socket.
    #[serde(default = "default_session_max_pipeline")]
    pub session_max_pipeline: usize,
    /// TCP keepalive period for client sockets, milliseconds; 0 disables.
    #[serde(default = "default_session_keepalive_period")]
    pub session_keepalive_period: u64,

    /// Fixed keyspace width. Changing it invalidates hash compatibility,
    /// so anything but 1024 is refused.
    #[serde(default = "default_slot_num")]
    pub slot_num: usize,
    /// Answer PING locally instead of consulting a backend.
    #[serde(default = "default_ping_local")]
    pub ping_local: bool,
    /// Timeout handed to the per-key migration command, milliseconds.
    #[serde(default = "default_migrate_timeout")]
    pub migrate_timeout: u64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            bail!("listen_addr cannot be empty");
        }
        parse_port(&self.listen_addr)
            .with_context(|| format!("listen_addr {} is not a valid address", self.listen_addr))?;
        if self.slot_num != MAX_SLOT_NUM {
            bail!(
                "slot_num {} is not supported, the keyspace is fixed at {} slots",
                self.slot_num,
                MAX_SLOT_NUM
            );
        }
        if self.session_max_pipeline == 0 {
            bail!("session_max_pipeline must be at least 1");
        }
        Ok(())
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            auth: self.backend_auth.clone(),
            recv_bufsize: self.backend_recv_bufsize,
            send_bufsize: self.backend_send_bufsize,
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            backend: self.backend_options(),
            migrate_timeout_ms: self.migrate_timeout,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            product_auth: self.product_auth.clone(),
            recv_bufsize: self.session_recv_bufsize,
            send_bufsize: self.session_send_bufsize,
            max_bufsize: self.session_max_bufsize,
            max_pipeline: self.session_max_pipeline,
            keepalive_period_ms: self.session_keepalive_period,
            ping_local: self.ping_local,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6379".to_string(),
            product_auth: None,
            backend_auth: None,
            backend_ping_period: default_backend_ping_period(),
            backend_recv_bufsize: default_bufsize(),
            backend_send_bufsize: default_bufsize(),
            session_recv_bufsize: default_bufsize(),
            session_send_bufsize: default_bufsize(),
            session_max_bufsize: default_session_max_bufsize(),
            session_max_pipeline: default_session_max_pipeline(),
            session_keepalive_period: default_session_keepalive_period(),
            slot_num: default_slot_num(),
            ping_local: default_ping_local(),
            migrate_timeout: default_migrate_timeout(),
        }
    }
}

fn default_backend_ping_period() -> u64 {
    5_000
}

fn default_bufsize() -> usize {
    64 * 1024
}

fn default_session_max_bufsize() -> usize {
    100 * 1024 * 1024
}

fn default_session_max_pipeline() -> usize {
    1024
}

fn default_session_keepalive_period() -> u64 {
    75_000
}

fn default_slot_num() -> usize {
    MAX_SLOT_NUM
}

fn default_ping_local() -> bool {
    true
}

fn default_migrate_timeout() -> u64 {
    100
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }
    if let Some((_, port_str)) = addr.rsplit_once(':') {
        let port = port_str
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {}", port_str))?;
        return Ok(port);
    }
    bail!("unable to extract port from address {}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str(r#"listen_addr = "0.0.0.0:19000""#).unwrap();
        cfg.ensure_valid().unwrap();
        assert_eq!(cfg.slot_num, MAX_SLOT_NUM);
        assert_eq!(cfg.backend_ping_period, 5_000);
        assert!(cfg.ping_local);
        assert_eq!(cfg.migrate_timeout, 100);
    }

    #[test]
    fn rejects_foreign_slot_count() {
        let cfg: Config = toml::from_str(
            r#"
listen_addr = "0.0.0.0:19000"
slot_num = 16384
"#,
        )
        .unwrap();
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let cfg: Config = toml::from_str(r#"listen_addr = "nonsense""#).unwrap();
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn auth_knobs_flow_into_backend_options() {
        let cfg: Config = toml::from_str(
            r#"
listen_addr = "127.0.0.1:19000"
backend_auth = "sekrit"
backend_recv_bufsize = 32768
"#,
        )
        .unwrap();
        let options = cfg.backend_options();
        assert_eq!(options.auth.as_deref(), Some("sekrit"));
        assert_eq!(options.recv_bufsize, 32768);
    }
}
