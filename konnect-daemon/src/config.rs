//! Daemon command line configuration.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use konnect_protocol::{MAX_PORT, MIN_PORT};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdminBind {
    /// Loopback TCP on `--admin-port`.
    Tcp,
    /// UNIX socket at `--admin-socket`.
    Socket,
}

#[derive(Debug, Parser)]
#[command(name = "konnectd", version, about = "Headless KDE Connect server")]
pub struct Config {
    /// Device name announced to peers
    #[arg(long, default_value_t = default_name())]
    pub name: String,

    /// Show debug messages
    #[arg(long)]
    pub debug: bool,

    /// Protocol discovery port
    #[arg(long, value_name = "PORT", default_value_t = MIN_PORT)]
    pub discovery_port: u16,

    /// Protocol service port
    #[arg(long, value_name = "PORT", default_value_t = MAX_PORT)]
    pub service_port: u16,

    /// Transfer port (top of the descending allocation range)
    #[arg(long, value_name = "PORT", default_value_t = MAX_PORT - 1)]
    pub transfer_port: u16,

    /// Simultaneously open transfer ports
    #[arg(long, value_name = "NUM", default_value_t = 3)]
    pub max_transfer_ports: usize,

    /// Admin API port
    #[arg(long, value_name = "PORT", default_value_t = 8080)]
    pub admin_port: u16,

    /// Admin API unix socket
    #[arg(long, value_name = "SOCK")]
    pub admin_socket: Option<PathBuf>,

    /// Admin API bind type
    #[arg(long, value_enum, value_name = "BIND", default_value_t = AdminBind::Tcp)]
    pub admin_bind: AdminBind,

    /// Config directory
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Listen for new devices
    #[arg(long)]
    pub receiver: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PORT..=MAX_PORT).contains(&self.service_port) {
            bail!(
                "service port must be within {}-{}, got {}",
                MIN_PORT,
                MAX_PORT,
                self.service_port
            );
        }
        Ok(())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("konnect")
        })
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.admin_socket.clone().unwrap_or_else(|| {
            std::env::var_os("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join("konnectd.sock")
        })
    }
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "konnect".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["konnectd"]);
        assert_eq!(config.discovery_port, 1716);
        assert_eq!(config.service_port, 1764);
        assert_eq!(config.transfer_port, 1763);
        assert_eq!(config.admin_bind, AdminBind::Tcp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_port_out_of_range() {
        let config = Config::parse_from(["konnectd", "--service-port", "1800"]);
        assert!(config.validate().is_err());
    }
}
