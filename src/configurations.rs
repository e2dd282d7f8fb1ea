//! A module that contains functions required to read, parse and return the configuration settings
//! mapping each role to its multicast group address and cardinality.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use config::{Config, File};

/// One role's entry: how many processes are expected to run that role, and the multicast
/// endpoint they all join.
pub type RoleConfig = HashMap<String, (usize, SocketAddrV4)>;

/// A configuration file error. Startup configuration errors are the one case this crate
/// surfaces to the operator (Section 7), so this is a real error type rather than a panic.
#[derive(Debug)]
pub enum ConfigError {
    Read(String),
    MissingField { role: String, field: &'static str },
    InvalidField { role: String, field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(msg) => write!(f, "could not read configuration: {}", msg),
            ConfigError::MissingField { role, field } => {
                write!(f, "role '{}' is missing field '{}'", role, field)
            }
            ConfigError::InvalidField { role, field, reason } => {
                write!(f, "role '{}' field '{}' is invalid: {}", role, field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn get_config(file_name: &str) -> Result<RoleConfig, ConfigError> {
    let raw = read_config(file_name)?;
    parse_config(&raw)
}

fn read_config(file_name: &str) -> Result<HashMap<String, HashMap<String, String>>, ConfigError> {
    let mut c = Config::default();
    c.merge(File::with_name(file_name))
        .map_err(|e| ConfigError::Read(e.to_string()))?;
    c.try_into::<HashMap<String, HashMap<String, String>>>()
        .map_err(|e| ConfigError::Read(e.to_string()))
}

fn field<'a>(
    role: &str,
    value: &'a HashMap<String, String>,
    field: &'static str,
) -> Result<&'a str, ConfigError> {
    value
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingField { role: role.to_owned(), field })
}

fn parse_config(c: &HashMap<String, HashMap<String, String>>) -> Result<RoleConfig, ConfigError> {
    c.iter()
        .map(|(role, value)| {
            let size: usize = field(role, value, "size")?
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidField {
                    role: role.clone(),
                    field: "size",
                    reason: e.to_string(),
                })?;

            let host = Ipv4Addr::from_str(field(role, value, "host")?).map_err(|e| {
                ConfigError::InvalidField { role: role.clone(), field: "host", reason: e.to_string() }
            })?;

            let port: u16 = field(role, value, "port")?
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidField {
                    role: role.clone(),
                    field: "port",
                    reason: e.to_string(),
                })?;

            Ok((role.clone(), (size, SocketAddrV4::new(host, port))))
        })
        .collect()
}
