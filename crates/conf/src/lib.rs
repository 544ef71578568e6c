//! This crate implements functionality around host configuration:
//!
//! * Loading of the configuration from a YAML file.
//!
//! * Parsing, validation and configuration provisioning.

mod conf;
mod io;
mod persisted;

pub use conf::*;
pub use io::{default_conf_path, load_conf};
