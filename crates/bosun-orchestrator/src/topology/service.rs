//! Primary service and accessory descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::topology::network::{PortMapping, VolumeMount};

/// Container description shared by the primary service and accessories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Published ports.
    pub ports: Vec<PortMapping>,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,

    /// Network to attach the container to.
    pub network: Option<String>,
}

impl ServiceSpec {
    /// Creates a new builder for a service with the given name.
    pub fn builder(name: impl Into<String>) -> ServiceSpecBuilder {
        ServiceSpecBuilder::new(name)
    }
}

/// Builder for [`ServiceSpec`].
#[derive(Debug, Clone)]
pub struct ServiceSpecBuilder {
    name: String,
    image: Option<String>,
    ports: Vec<PortMapping>,
    environment: BTreeMap<String, String>,
    volumes: Vec<VolumeMount>,
    network: Option<String>,
}

impl ServiceSpecBuilder {
    /// Creates a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            network: None,
        }
    }

    /// Overrides the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the image reference.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds a port mapping.
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Adds a volume mount.
    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// Sets the network name.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Builds the service specification.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is not a valid container name,
    /// the image is missing or blank, the network name is blank, or two
    /// mappings publish the same host port.
    pub fn build(self) -> Result<ServiceSpec> {
        validate_container_name(&self.name)?;

        let image = self
            .image
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| OrchestratorError::validation(format!("{}: image is required", self.name)))?;
        if image.chars().any(char::is_whitespace) {
            return Err(OrchestratorError::validation(format!(
                "{}: image reference '{}' contains whitespace",
                self.name, image
            )));
        }

        if let Some(network) = &self.network {
            if network.trim().is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "{}: network name is empty",
                    self.name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.host_port) {
                return Err(OrchestratorError::validation(format!(
                    "{}: host port {} is published twice",
                    self.name, port.host_port
                )));
            }
        }

        Ok(ServiceSpec {
            name: self.name,
            image,
            ports: self.ports,
            environment: self.environment,
            volumes: self.volumes,
            network: self.network,
        })
    }
}

/// Docker accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn validate_container_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::validation(format!(
            "invalid container name '{}'",
            name
        )))
    }
}

/// Container restart policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Always restart.
    #[default]
    Always,

    /// Restart unless explicitly stopped.
    UnlessStopped,

    /// Restart on failure.
    OnFailure,

    /// Never restart.
    No,
}

impl RestartPolicy {
    /// Returns the Docker restart policy string.
    pub fn as_docker_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
            Self::No => "no",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_docker_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "always" => Ok(Self::Always),
            "unless-stopped" => Ok(Self::UnlessStopped),
            "on-failure" => Ok(Self::OnFailure),
            "no" => Ok(Self::No),
            other => Err(OrchestratorError::validation(format!(
                "unknown restart policy '{}', expected always, unless-stopped, on-failure or no",
                other
            ))),
        }
    }
}

/// An accessory container and its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorySpec {
    /// Identifier, unique among accessories.
    pub id: String,

    /// The container description.
    pub service: ServiceSpec,

    /// Accessories that must be running first, without duplicates.
    pub depends_on: Vec<String>,

    /// Restart policy.
    pub restart_policy: RestartPolicy,
}

impl AccessorySpec {
    /// Creates a new builder. The container name defaults to the identifier.
    pub fn builder(id: impl Into<String>) -> AccessorySpecBuilder {
        AccessorySpecBuilder::new(id)
    }

    /// Returns the container name.
    pub fn container_name(&self) -> &str {
        &self.service.name
    }
}

/// Builder for [`AccessorySpec`].
#[derive(Debug, Clone)]
pub struct AccessorySpecBuilder {
    id: String,
    service: ServiceSpecBuilder,
    depends_on: Vec<String>,
    restart_policy: RestartPolicy,
}

impl AccessorySpecBuilder {
    /// Creates a new builder.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            service: ServiceSpecBuilder::new(id.clone()),
            id,
            depends_on: Vec::new(),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Sets the container name.
    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.service = self.service.name(name);
        self
    }

    /// Sets the image reference.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.service = self.service.image(image);
        self
    }

    /// Adds a port mapping.
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.service = self.service.port(mapping);
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.service = self.service.env(key, value);
        self
    }

    /// Adds a volume mount.
    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.service = self.service.volume(mount);
        self
    }

    /// Sets the network name.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.service = self.service.network(network);
        self
    }

    /// Adds a dependency on another accessory.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    /// Sets the restart policy.
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Builds the accessory specification.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the identifier is empty, the accessory
    /// depends on itself, or the container description is invalid.
    pub fn build(self) -> Result<AccessorySpec> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::validation("accessory identifier is empty"));
        }
        if self.depends_on.iter().any(|d| d == &self.id) {
            return Err(OrchestratorError::validation(format!(
                "accessory {} depends on itself",
                self.id
            )));
        }

        Ok(AccessorySpec {
            service: self.service.build()?,
            id: self.id,
            depends_on: self.depends_on,
            restart_policy: self.restart_policy,
        })
    }
}
