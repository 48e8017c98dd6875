//! Image build configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Target CPU architecture of the built image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// x86-64.
    #[default]
    Amd64,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit ARMv7.
    Armv7,
}

impl Arch {
    /// Returns the platform string passed to the builder.
    pub fn platform(&self) -> &'static str {
        match self {
            Self::Amd64 => "linux/amd64",
            Self::Arm64 => "linux/arm64",
            Self::Armv7 => "linux/arm/v7",
        }
    }
}

impl FromStr for Arch {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Self::Amd64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "armv7" | "arm" => Ok(Self::Armv7),
            other => Err(OrchestratorError::validation(format!(
                "unsupported architecture '{}', expected amd64, arm64 or armv7",
                other
            ))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Armv7 => "armv7",
        })
    }
}

/// Address of a remote container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum RemoteEndpoint {
    /// Reached through an SSH tunnel to the remote daemon socket.
    Ssh {
        /// Login user; ssh's default when absent.
        user: Option<String>,
        /// Remote host.
        host: String,
        /// SSH port; ssh's default when absent.
        port: Option<u16>,
    },
    /// Plain HTTP daemon endpoint, `host:port`.
    Tcp {
        /// `host:port`.
        address: String,
    },
    /// Unix socket path.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

impl FromStr for RemoteEndpoint {
    type Err = OrchestratorError;

    /// Parses `ssh://[user@]host[:port]`, `tcp://host:port`,
    /// `http://host:port` or `unix:///path`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| {
            OrchestratorError::validation(format!("invalid remote endpoint '{}': {}", s, why))
        };

        let (scheme, rest) = s
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        match scheme {
            "ssh" => {
                let (user, host_port) = match rest.split_once('@') {
                    Some((user, hp)) if !user.is_empty() => (Some(user.to_string()), hp),
                    Some(_) => return Err(invalid("empty user")),
                    None => (None, rest),
                };
                let host_port = host_port.trim_end_matches('/');
                let (host, port) = match host_port.rsplit_once(':') {
                    Some((host, port)) => {
                        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                        (host, Some(port))
                    }
                    None => (host_port, None),
                };
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                // Both end up on the ssh command line.
                if host.starts_with('-') || user.as_deref().is_some_and(|u| u.starts_with('-')) {
                    return Err(invalid("user and host must not start with '-'"));
                }
                Ok(Self::Ssh {
                    user,
                    host: host.to_string(),
                    port,
                })
            }
            "tcp" | "http" => {
                let address = rest.trim_end_matches('/');
                match address.rsplit_once(':') {
                    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                        Ok(Self::Tcp {
                            address: address.to_string(),
                        })
                    }
                    _ => Err(invalid("expected host:port")),
                }
            }
            "unix" => {
                if !rest.starts_with('/') {
                    return Err(invalid("socket path must be absolute"));
                }
                Ok(Self::Unix {
                    path: PathBuf::from(rest),
                })
            }
            other => Err(invalid(format!("unsupported scheme '{}'", other).as_str())),
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh { user, host, port } => {
                f.write_str("ssh://")?;
                if let Some(user) = user {
                    write!(f, "{}@", user)?;
                }
                f.write_str(host)?;
                if let Some(port) = port {
                    write!(f, ":{}", port)?;
                }
                Ok(())
            }
            Self::Tcp { address } => write!(f, "tcp://{}", address),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Where images are built and containers run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// The local daemon.
    #[default]
    Local,
    /// A remote daemon.
    Remote {
        /// How to reach it.
        endpoint: RemoteEndpoint,
    },
}

impl BuildMode {
    /// Returns true for remote mode.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Build configuration for the primary service image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderSpec {
    /// Target architecture.
    pub arch: Arch,

    /// Local or remote execution.
    pub mode: BuildMode,

    /// Build context directory.
    pub context: PathBuf,

    /// Dockerfile path relative to the context.
    pub dockerfile: PathBuf,

    /// Build arguments.
    pub build_args: BTreeMap<String, String>,
}

impl Default for BuilderSpec {
    fn default() -> Self {
        Self {
            arch: Arch::default(),
            mode: BuildMode::Local,
            context: PathBuf::from("."),
            dockerfile: PathBuf::from("Dockerfile"),
            build_args: BTreeMap::new(),
        }
    }
}

impl BuilderSpec {
    /// Creates a local build configuration with defaults.
    pub fn local() -> Self {
        Self::default()
    }

    /// Creates a remote build configuration from an endpoint string.
    pub fn remote(endpoint: &str) -> Result<Self> {
        Ok(Self {
            mode: BuildMode::Remote {
                endpoint: endpoint.parse()?,
            },
            ..Self::default()
        })
    }

    /// Sets the architecture.
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// Sets the build context directory.
    pub fn with_context(mut self, context: impl Into<PathBuf>) -> Self {
        self.context = context.into();
        self
    }

    /// Sets the dockerfile path.
    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = dockerfile.into();
        self
    }

    /// Adds a build argument.
    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    /// Returns the remote endpoint in remote mode.
    pub fn endpoint(&self) -> Option<&RemoteEndpoint> {
        match &self.mode {
            BuildMode::Remote { endpoint } => Some(endpoint),
            BuildMode::Local => None,
        }
    }

    /// Returns the platform string for the configured architecture.
    pub fn platform(&self) -> &'static str {
        self.arch.platform()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_platform() {
        assert_eq!(Arch::Amd64.platform(), "linux/amd64");
        assert_eq!(Arch::Armv7.platform(), "linux/arm/v7");
        assert_eq!("ARM64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert!("mips".parse::<Arch>().is_err());
    }

    #[test]
    fn test_ssh_endpoint_parse() {
        let endpoint: RemoteEndpoint = "ssh://deploy@build.example.com:2222".parse().unwrap();
        assert_eq!(
            endpoint,
            RemoteEndpoint::Ssh {
                user: Some("deploy".into()),
                host: "build.example.com".into(),
                port: Some(2222),
            }
        );
        assert_eq!(endpoint.to_string(), "ssh://deploy@build.example.com:2222");

        let endpoint: RemoteEndpoint = "ssh://builder".parse().unwrap();
        assert!(matches!(endpoint, RemoteEndpoint::Ssh { user: None, port: None, .. }));
    }

    #[test]
    fn test_other_endpoints_parse() {
        assert_eq!(
            "tcp://10.0.0.5:2375".parse::<RemoteEndpoint>().unwrap(),
            RemoteEndpoint::Tcp {
                address: "10.0.0.5:2375".into()
            }
        );
        assert!(matches!(
            "unix:///run/docker.sock".parse::<RemoteEndpoint>().unwrap(),
            RemoteEndpoint::Unix { .. }
        ));
    }

    #[test]
    fn test_bad_endpoints() {
        assert!("build.example.com".parse::<RemoteEndpoint>().is_err());
        assert!("ftp://host".parse::<RemoteEndpoint>().is_err());
        assert!("ssh://@host".parse::<RemoteEndpoint>().is_err());
        assert!("tcp://host".parse::<RemoteEndpoint>().is_err());
        assert!("unix://relative.sock".parse::<RemoteEndpoint>().is_err());
    }

    #[test]
    fn test_ssh_endpoint_rejects_option_lookalikes() {
        assert!("ssh://-oProxyCommand=touch%20/tmp/x"
            .parse::<RemoteEndpoint>()
            .is_err());
        assert!("ssh://-oProxyCommand=x@host".parse::<RemoteEndpoint>().is_err());
        assert!("ssh://deploy@host-1".parse::<RemoteEndpoint>().is_ok());
    }

    #[test]
    fn test_builder_spec_modes() {
        let local = BuilderSpec::local();
        assert!(local.endpoint().is_none());
        assert_eq!(local.dockerfile, PathBuf::from("Dockerfile"));

        let remote = BuilderSpec::remote("ssh://deploy@host")
            .unwrap()
            .with_arch(Arch::Arm64)
            .with_build_arg("VERSION", "1.0");
        assert!(remote.mode.is_remote());
        assert!(remote.endpoint().is_some());
        assert_eq!(remote.platform(), "linux/arm64");

        assert!(BuilderSpec::remote("").is_err());
    }
}
