//! Port and volume mappings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// A published port: host port to container port, TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port.
    pub host_port: u16,

    /// Container port.
    pub container_port: u16,
}

impl PortMapping {
    /// Creates a port mapping. Both ports must be non-zero.
    pub fn new(host_port: u16, container_port: u16) -> Result<Self> {
        if host_port == 0 || container_port == 0 {
            return Err(OrchestratorError::validation(format!(
                "port mapping {}:{} must use ports between 1 and 65535",
                host_port, container_port
            )));
        }
        Ok(Self {
            host_port,
            container_port,
        })
    }

    /// Returns the Docker port key, e.g. `80/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

impl FromStr for PortMapping {
    type Err = OrchestratorError;

    /// Parses `HOST:CONTAINER`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            OrchestratorError::validation(format!(
                "invalid port mapping '{}', expected HOST:CONTAINER",
                s
            ))
        };

        let (host, container) = s.trim().split_once(':').ok_or_else(invalid)?;
        let host: u16 = host.trim().parse().map_err(|_| invalid())?;
        let container: u16 = container.trim().parse().map_err(|_| invalid())?;
        Self::new(host, container)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// Volume mount from a host path or named volume into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Source path on the host or volume name.
    pub source: String,

    /// Target path in the container.
    pub target: String,

    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl VolumeMount {
    /// Creates a read-write mount.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let target = target.into();
        if source.is_empty() || target.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "volume '{}:{}' needs both a source and a target",
                source, target
            )));
        }
        if !target.starts_with('/') {
            return Err(OrchestratorError::validation(format!(
                "volume target '{}' must be an absolute container path",
                target
            )));
        }
        Ok(Self {
            source,
            target,
            read_only: false,
        })
    }

    /// Sets the mount to read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns the Docker bind string, e.g. `./data:/data:ro`.
    pub fn as_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

impl FromStr for VolumeMount {
    type Err = OrchestratorError;

    /// Parses `SOURCE:TARGET[:ro|rw]`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [source, target] => Self::new(*source, *target),
            [source, target, "ro"] => Ok(Self::new(*source, *target)?.read_only()),
            [source, target, "rw"] => Self::new(*source, *target),
            _ => Err(OrchestratorError::validation(format!(
                "invalid volume '{}', expected SOURCE:TARGET[:ro|rw]",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_parse() {
        let port: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(port.host_port, 8080);
        assert_eq!(port.container_port, 80);
        assert_eq!(port.container_key(), "80/tcp");
        assert_eq!(port.to_string(), "8080:80");
    }

    #[test]
    fn test_port_mapping_rejects_malformed() {
        assert!("8080".parse::<PortMapping>().is_err());
        assert!("0:80".parse::<PortMapping>().is_err());
        assert!("80:70000".parse::<PortMapping>().is_err());
        assert!("http:80".parse::<PortMapping>().unwrap_err().is_validation());
    }

    #[test]
    fn test_volume_parse() {
        let volume: VolumeMount = "./data:/var/lib/data:ro".parse().unwrap();
        assert_eq!(volume.source, "./data");
        assert!(volume.read_only);
        assert_eq!(volume.as_bind(), "./data:/var/lib/data:ro");

        let volume: VolumeMount = "pgdata:/var/lib/postgresql/data".parse().unwrap();
        assert!(!volume.read_only);
    }

    #[test]
    fn test_volume_rejects_malformed() {
        assert!("/data".parse::<VolumeMount>().is_err());
        assert!("./data:relative".parse::<VolumeMount>().is_err());
        assert!("./data:/data:rx".parse::<VolumeMount>().is_err());
    }
}
