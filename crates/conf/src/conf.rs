//! This module implements final (i.e. parsed and validated) host
//! configuration objects and their building from persistent configuration.

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use anyhow::{ensure, Context, Error, Result};

use crate::persisted;

pub const DEFAULT_HOST_NAME: &str = "UNNAMED";
pub const DEFAULT_HOST_PORT: u16 = 26000;
pub const MAX_HOST_NAME_LEN: usize = 15;
pub const MAX_CLIENTS_LIMIT: u8 = 16;

#[derive(Clone, Debug, Default)]
pub struct Configuration {
    network: NetworkConf,
}

impl Configuration {
    pub fn network(&self) -> &NetworkConf {
        &self.network
    }
}

impl TryFrom<persisted::Configuration> for Configuration {
    type Error = Error;

    fn try_from(conf: persisted::Configuration) -> Result<Self> {
        let network = match conf.network {
            Some(network) => {
                NetworkConf::try_from(network).context("Invalid network configuration")?
            }
            None => NetworkConf::default(),
        };
        Ok(Self { network })
    }
}

#[derive(Clone, Debug)]
pub struct NetworkConf {
    host_name: String,
    host_port: u16,
    bind: IpAddr,
    max_clients: u8,
    dedicated: bool,
    listen: bool,
    message_timeout: Duration,
}

impl NetworkConf {
    /// Name under which the host is announced to other hosts.
    pub fn host_name(&self) -> &str {
        self.host_name.as_str()
    }

    /// Port on which remote connections are accepted.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// IP address all sockets are bound to.
    pub fn bind(&self) -> IpAddr {
        self.bind
    }

    pub fn max_clients(&self) -> u8 {
        self.max_clients
    }

    /// Dedicated hosts run no local client.
    pub fn dedicated(&self) -> bool {
        self.dedicated
    }

    /// Whether remote connections are accepted right after start.
    pub fn listen(&self) -> bool {
        self.listen
    }

    /// Connections silent for longer than this are closed.
    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }
}

impl NetworkConf {
    pub fn set_host_port(&mut self, host_port: u16) -> Result<()> {
        check_host_port(host_port)?;
        self.host_port = host_port;
        Ok(())
    }

    pub fn set_max_clients(&mut self, max_clients: u8) -> Result<()> {
        check_max_clients(max_clients)?;
        self.max_clients = max_clients;
        Ok(())
    }

    pub fn set_dedicated(&mut self, dedicated: bool) {
        self.dedicated = dedicated;
    }

    pub fn set_listen(&mut self, listen: bool) {
        self.listen = listen;
    }
}

fn check_host_port(host_port: u16) -> Result<()> {
    ensure!(host_port > 0, "`host_port` must not be 0.");
    Ok(())
}

fn check_max_clients(max_clients: u8) -> Result<()> {
    ensure!(
        (1..=MAX_CLIENTS_LIMIT).contains(&max_clients),
        "`max_clients` must be between 1 and {MAX_CLIENTS_LIMIT}."
    );
    Ok(())
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_owned(),
            host_port: DEFAULT_HOST_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_clients: 4,
            dedicated: false,
            listen: false,
            message_timeout: Duration::from_secs(300),
        }
    }
}

impl TryFrom<persisted::Network> for NetworkConf {
    type Error = Error;

    fn try_from(network: persisted::Network) -> Result<Self> {
        let defaults = Self::default();

        let host_name = network.host_name.unwrap_or(defaults.host_name);
        ensure!(!host_name.is_empty(), "`host_name` must not be empty.");
        ensure!(
            host_name.chars().count() <= MAX_HOST_NAME_LEN,
            "`host_name` must be at most {MAX_HOST_NAME_LEN} characters long."
        );

        let host_port = network.host_port.unwrap_or(defaults.host_port);
        check_host_port(host_port)?;

        let max_clients = network.max_clients.unwrap_or(defaults.max_clients);
        check_max_clients(max_clients)?;

        let message_timeout = match network.message_timeout {
            Some(secs) => {
                ensure!(
                    secs.is_finite() && secs > 0.,
                    "`message_timeout` must be a positive number of seconds."
                );
                Duration::from_secs_f64(secs)
            }
            None => defaults.message_timeout,
        };

        Ok(Self {
            host_name,
            host_port,
            bind: network.bind.unwrap_or(defaults.bind),
            max_clients,
            dedicated: network.dedicated.unwrap_or(defaults.dedicated),
            listen: network.listen.unwrap_or(defaults.listen),
            message_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Configuration> {
        let persisted: persisted::Configuration = serde_yaml::from_str(text)?;
        Configuration::try_from(persisted)
    }

    #[test]
    fn test_defaults() {
        let conf = parse("{}").unwrap();
        assert_eq!(conf.network().host_name(), DEFAULT_HOST_NAME);
        assert_eq!(conf.network().host_port(), DEFAULT_HOST_PORT);
        assert_eq!(conf.network().max_clients(), 4);
        assert!(!conf.network().dedicated());

        let conf = parse("network:\n  dedicated: true\n").unwrap();
        assert!(conf.network().dedicated());
        assert_eq!(conf.network().message_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid() {
        for text in [
            "network:\n  max_clients: 0\n",
            "network:\n  max_clients: 17\n",
            "network:\n  host_port: 0\n",
            "network:\n  host_name: \"\"\n",
            "network:\n  host_name: a-very-long-host-name\n",
            "network:\n  message_timeout: -1\n",
        ] {
            assert!(parse(text).is_err(), "{text}");
        }
    }

    #[test]
    fn test_overrides() {
        let mut network = NetworkConf::default();
        assert!(network.set_host_port(0).is_err());
        assert!(network.set_max_clients(17).is_err());
        network.set_host_port(27500).unwrap();
        network.set_max_clients(16).unwrap();
        assert_eq!(network.host_port(), 27500);
        assert_eq!(network.max_clients(), 16);
    }
}
