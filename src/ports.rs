//! Host-to-container port mappings
//!
//! Mappings are validated strictly when a container is configured, but
//! forwarding itself is best-effort: it never blocks a container from
//! starting or stopping.

use crate::errors::ConfigError;
use regex::Regex;
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    /// Parse a `host:container` pair of TCP port numbers
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^(?P<host>\d{1,5}):(?P<container>\d{1,5})$").unwrap();
        }
        let invalid = || ConfigError::InvalidPortSpec(s.to_owned());
        let captures = RE.captures(s).ok_or_else(invalid)?;
        let port = |name: &str| {
            captures
                .name(name)
                .and_then(|m| m.as_str().parse::<u16>().ok())
                .filter(|port| *port != 0)
                .ok_or_else(invalid)
        };
        Ok(PortMapping {
            host: port("host")?,
            container: port("container")?,
        })
    }
}

impl FromStr for PortMapping {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortMapping::parse(s)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Parse every mapping, failing on the first invalid one
pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> Result<Vec<PortMapping>, ConfigError> {
    specs.iter().map(|s| PortMapping::parse(s.as_ref())).collect()
}

/// Start forwarding for a container's ports
///
/// Forwarding isn't wired to a packet filter; the intended rules are logged.
pub fn setup(container: &str, mappings: &[PortMapping]) {
    for mapping in mappings {
        log::info!(
            "container {}: forwarding host port {} to container port {}",
            container,
            mapping.host,
            mapping.container
        );
    }
}

/// Stop forwarding for a container's ports
///
/// Specs that no longer parse are skipped with a warning.
pub fn cleanup<S: AsRef<str>>(container: &str, specs: &[S]) {
    for spec in specs {
        match PortMapping::parse(spec.as_ref()) {
            Ok(mapping) => log::info!(
                "container {}: removing forward from host port {} to container port {}",
                container,
                mapping.host,
                mapping.container
            ),
            Err(err) => log::warn!("container {}: {}", container, err),
        }
    }
}
