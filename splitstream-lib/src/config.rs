//! Daemon configuration file.
//!
//! A small versioned TOML document standing in for the configuration
//! pushes of a full client daemon. The file is re-read on SIGHUP.

use serde::Deserialize;
use thiserror::Error;

use std::path::Path;

use tokio::fs;

use crate::params::{CgroupPaths, FirewallParams, NetworkScan, TunnelParams};

pub const DEFAULT_PATH: &str = "/etc/splitstream/config.toml";
pub const ENV_VAR: &str = "SPLITSTREAM_CONFIG_PATH";

const SUPPORTED_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(i64),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exclude_apps: Vec<String>,
    pub vpn_only_apps: Vec<String>,
    pub network: NetworkScan,
    pub tunnel: TunnelParams,
    pub cgroups: CgroupPaths,
}

impl Config {
    pub fn firewall_params(&self) -> FirewallParams {
        FirewallParams {
            net_scan: self.network.clone(),
            exclude_apps: self.exclude_apps.clone(),
            vpn_only_apps: self.vpn_only_apps.clone(),
        }
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;
    if version != SUPPORTED_VERSION {
        return Err(Error::VersionMismatch(version));
    }

    for key in wrong_keys(&table).iter() {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }

    Ok(toml::from_str(&content)?)
}

fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong_keys = Vec::new();
    for (key, value) in table.iter() {
        // plain keys
        if key == "version" || key == "exclude_apps" || key == "vpn_only_apps" {
            continue;
        }
        // network nested struct
        if key == "network" {
            if let Some(network) = value.as_table() {
                for (k, _v) in network.iter() {
                    if k == "interface_name" || k == "ip_address" || k == "gateway_ip" {
                        continue;
                    }
                    wrong_keys.push(format!("network.{k}"));
                }
            }
            continue;
        }
        // tunnel nested struct
        if key == "tunnel" {
            if let Some(tunnel) = value.as_table() {
                for (k, _v) in tunnel.iter() {
                    if k == "device_name" || k == "local_address" || k == "remote_address" {
                        continue;
                    }
                    wrong_keys.push(format!("tunnel.{k}"));
                }
            }
            continue;
        }
        // cgroups nested struct
        if key == "cgroups" {
            if let Some(cgroups) = value.as_table() {
                for (k, _v) in cgroups.iter() {
                    if k == "exclusions" || k == "vpn_only" || k == "parent" {
                        continue;
                    }
                    wrong_keys.push(format!("cgroups.{k}"));
                }
            }
            continue;
        }
        wrong_keys.push(key.to_string());
    }
    wrong_keys
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    async fn read_str(content: &str) -> Result<Config, Error> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        read(file.path()).await
    }

    #[tokio::test]
    async fn reads_full_config() -> anyhow::Result<()> {
        let config = read_str(
            r#"
            version = 1

            exclude_apps = ["/usr/bin/foo"]
            vpn_only_apps = ["/usr/bin/bar"]

            [network]
            interface_name = "eth0"
            ip_address = "192.168.1.7"
            gateway_ip = "192.168.1.1"

            [tunnel]
            device_name = "tun0"
            local_address = "10.9.0.2"
            remote_address = "10.9.0.1"
            "#,
        )
        .await?;

        assert_eq!(config.exclude_apps, vec!["/usr/bin/foo"]);
        assert!(config.network.is_valid());
        assert_eq!(config.tunnel.device_name, "tun0");
        // unspecified cgroup section falls back to the packaged layout
        assert_eq!(config.cgroups, CgroupPaths::default());

        let params = config.firewall_params();
        assert_eq!(params.vpn_only_apps, vec!["/usr/bin/bar"]);
        Ok(())
    }

    #[tokio::test]
    async fn partial_network_section_is_accepted_but_invalid() -> anyhow::Result<()> {
        let config = read_str(
            r#"
            version = 1

            [network]
            interface_name = "eth0"
            "#,
        )
        .await?;

        assert!(!config.network.is_valid());
        Ok(())
    }

    #[test]
    fn flags_unknown_keys_at_every_level() {
        let table = r#"
            version = 1
            exclude_apps = []
            dns_leak_protection = true

            [network]
            interface_name = "eth0"
            mtu = 1500

            [tunnel]
            device_name = "tun0"
            keepalive = 25

            [cgroups]
            parent = "/sys/fs/cgroup/net_cls"
            controller = "net_cls"
            "#
        .parse::<toml::Table>()
        .unwrap();

        let mut keys = wrong_keys(&table);
        keys.sort();
        assert_eq!(
            keys,
            vec!["cgroups.controller", "dns_leak_protection", "network.mtu", "tunnel.keepalive"]
        );
    }

    #[test]
    fn known_keys_are_not_flagged() {
        let table = r#"
            version = 1
            exclude_apps = ["/usr/bin/foo"]
            vpn_only_apps = []

            [network]
            interface_name = "eth0"
            ip_address = "192.168.1.7"
            gateway_ip = "192.168.1.1"

            [tunnel]
            device_name = "tun0"
            local_address = "10.9.0.2"
            remote_address = "10.9.0.1"
            "#
        .parse::<toml::Table>()
        .unwrap();

        assert!(wrong_keys(&table).is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        assert!(matches!(read_str("version = 7").await, Err(Error::VersionMismatch(7))));
        assert!(matches!(read_str("").await, Err(Error::VersionNotFound)));
    }

    #[tokio::test]
    async fn missing_file_is_its_own_error() {
        assert!(matches!(read(Path::new("/nonexistent/config.toml")).await, Err(Error::NoFile)));
    }
}
