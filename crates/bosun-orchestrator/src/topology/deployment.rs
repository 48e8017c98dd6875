//! A complete deployment: the primary service, its builder and accessories.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::graph::{self, ExecutionOrder};
use crate::topology::builder::BuilderSpec;
use crate::topology::service::{AccessorySpec, ServiceSpec};

/// Which part of a deployment a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The primary service.
    App,
    /// An accessory.
    Accessory,
}

impl Role {
    /// Returns the role label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Accessory => "accessory",
        }
    }
}

/// One deployment, fully resolved.
///
/// Accessories keep their declaration order, which the dependency resolver
/// uses to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    service: ServiceSpec,
    builder: BuilderSpec,
    accessories: Vec<AccessorySpec>,
}

impl Deployment {
    /// Creates a deployment.
    ///
    /// # Errors
    ///
    /// Returns a validation error if two accessories share an identifier, an
    /// accessory identifier equals the service name, or two containers would
    /// get the same name. Dependency references are checked by
    /// [`Deployment::validate`].
    pub fn new(
        service: ServiceSpec,
        builder: BuilderSpec,
        accessories: Vec<AccessorySpec>,
    ) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut names = HashSet::from([service.name.as_str()]);

        for accessory in &accessories {
            if !ids.insert(accessory.id.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "accessory {} is declared twice",
                    accessory.id
                )));
            }
            if accessory.id == service.name {
                return Err(OrchestratorError::validation(format!(
                    "accessory {} has the same name as the service",
                    accessory.id
                )));
            }
            if !names.insert(accessory.container_name()) {
                return Err(OrchestratorError::validation(format!(
                    "accessory {} reuses container name {}",
                    accessory.id,
                    accessory.container_name()
                )));
            }
        }

        Ok(Self {
            service,
            builder,
            accessories,
        })
    }

    /// Resolves the accessory graph, failing on unknown dependencies or cycles.
    pub fn validate(&self) -> Result<ExecutionOrder> {
        graph::resolve(&self.accessories)
    }

    /// Returns the primary service.
    pub fn service(&self) -> &ServiceSpec {
        &self.service
    }

    /// Returns the build configuration.
    pub fn builder(&self) -> &BuilderSpec {
        &self.builder
    }

    /// Returns the accessories in declaration order.
    pub fn accessories(&self) -> &[AccessorySpec] {
        &self.accessories
    }

    /// Looks up an accessory by identifier.
    pub fn accessory(&self, id: &str) -> Option<&AccessorySpec> {
        self.accessories.iter().find(|a| a.id == id)
    }

    /// Looks up an accessory by identifier or container name.
    pub fn find_accessory(&self, name: &str) -> Option<&AccessorySpec> {
        self.accessory(name)
            .or_else(|| self.accessories.iter().find(|a| a.container_name() == name))
    }

    /// Returns the accessory or fails with an unknown accessory error.
    pub fn require_accessory(&self, id: &str) -> Result<&AccessorySpec> {
        self.accessory(id)
            .ok_or_else(|| OrchestratorError::unknown_accessory(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceSpec {
        ServiceSpec::builder("web").image("web:latest").build().unwrap()
    }

    fn accessory(id: &str) -> AccessorySpec {
        AccessorySpec::builder(id).image("redis:7").build().unwrap()
    }

    #[test]
    fn test_deployment_lookup() {
        let cache = AccessorySpec::builder("cache")
            .container_name("web-cache")
            .image("redis:7")
            .build()
            .unwrap();
        let deployment =
            Deployment::new(service(), BuilderSpec::local(), vec![accessory("db"), cache]).unwrap();

        assert_eq!(deployment.accessories().len(), 2);
        assert!(deployment.accessory("cache").is_some());
        assert_eq!(deployment.find_accessory("web-cache").unwrap().id, "cache");
        assert!(deployment.require_accessory("queue").is_err());
    }

    #[test]
    fn test_deployment_rejects_duplicates() {
        let result = Deployment::new(
            service(),
            BuilderSpec::local(),
            vec![accessory("db"), accessory("db")],
        );
        assert!(result.unwrap_err().is_validation());

        let clash = AccessorySpec::builder("db")
            .container_name("web")
            .image("postgres:16")
            .build()
            .unwrap();
        assert!(Deployment::new(service(), BuilderSpec::local(), vec![clash]).is_err());

        assert!(Deployment::new(service(), BuilderSpec::local(), vec![accessory("web")]).is_err());
    }

    #[test]
    fn test_deployment_validate_checks_references() {
        let api = AccessorySpec::builder("api")
            .image("api:1")
            .depends_on("ghost")
            .build()
            .unwrap();
        let deployment = Deployment::new(service(), BuilderSpec::local(), vec![api]).unwrap();

        let err = deployment.validate().unwrap_err();
        assert_eq!(err, OrchestratorError::unknown_dependency("ghost", "api"));
    }
}
