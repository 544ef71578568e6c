//! This module contains configuration object which can be (de)serialized from
//! a configuration file. It does not contain final configuration object which
//! must be build and validated from the objects here.

use std::net::IpAddr;

use serde::Deserialize;

#[derive(Deserialize, Default)]
pub(super) struct Configuration {
    pub(super) network: Option<Network>,
}

#[derive(Deserialize, Default)]
pub(super) struct Network {
    pub(super) host_name: Option<String>,
    pub(super) host_port: Option<u16>,
    pub(super) bind: Option<IpAddr>,
    pub(super) max_clients: Option<u8>,
    pub(super) dedicated: Option<bool>,
    pub(super) listen: Option<bool>,
    /// In seconds.
    pub(super) message_timeout: Option<f64>,
}
