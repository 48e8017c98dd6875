//! What the runtime needs to create a container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::topology::{
    AccessorySpec, PortMapping, RestartPolicy, Role, ServiceSpec, VolumeMount,
};

/// Label marking containers managed by bosun.
pub const LABEL_MANAGED: &str = "bosun.managed";
/// Label carrying the primary service name.
pub const LABEL_SERVICE: &str = "bosun.service";
/// Label carrying the container role (`app` or `accessory`).
pub const LABEL_ROLE: &str = "bosun.role";

/// Image reference split into repository, tag and digest.
///
/// A `:` only starts a tag when it comes after the last `/`, so registry
/// ports such as `localhost:5000/app` are not mistaken for tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    reference: String,
}

impl ImageReference {
    /// Wraps a reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use bosun_orchestrator::container::ImageReference;
    ///
    /// let image = ImageReference::new("localhost:5000/web");
    /// assert_eq!(image.tag(), None);
    /// assert_eq!(image.with_default_tag().reference(), "localhost:5000/web:latest");
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    /// Returns the full reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn without_digest(&self) -> &str {
        self.reference
            .split_once('@')
            .map_or(self.reference.as_str(), |(name, _)| name)
    }

    fn tag_separator(&self) -> Option<usize> {
        let name = self.without_digest();
        let colon = name.rfind(':')?;
        match name.rfind('/') {
            Some(slash) if slash > colon => None,
            _ => Some(colon),
        }
    }

    /// Returns the repository without tag or digest.
    pub fn repository(&self) -> &str {
        let name = self.without_digest();
        match self.tag_separator() {
            Some(at) => &name[..at],
            None => name,
        }
    }

    /// Returns the tag if present.
    pub fn tag(&self) -> Option<&str> {
        let name = self.without_digest();
        self.tag_separator().map(|at| &name[at + 1..])
    }

    /// Returns the digest if present.
    pub fn digest(&self) -> Option<&str> {
        self.reference.split_once('@').map(|(_, digest)| digest)
    }

    /// Returns the reference with `:latest` appended when it has neither a tag
    /// nor a digest.
    pub fn with_default_tag(&self) -> Self {
        if self.tag().is_some() || self.digest().is_some() {
            self.clone()
        } else {
            Self::new(format!("{}:latest", self.reference))
        }
    }
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
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

    /// Network to attach to.
    pub network: Option<String>,

    /// Restart policy.
    pub restart_policy: RestartPolicy,

    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Creates a spec for the primary service running `image`.
    pub fn for_app(service: &ServiceSpec, image: impl Into<String>) -> Self {
        let mut spec = Self::from_service(service, RestartPolicy::No);
        spec.image = image.into();
        spec.with_role(&service.name, Role::App)
    }

    /// Creates a spec for an accessory of `service_name`.
    ///
    /// An untagged image gets `:latest`; the daemon would otherwise pull every
    /// tag of the repository.
    pub fn for_accessory(accessory: &AccessorySpec, service_name: &str) -> Self {
        let mut spec = Self::from_service(&accessory.service, accessory.restart_policy);
        spec.image = ImageReference::new(spec.image)
            .with_default_tag()
            .reference()
            .to_string();
        spec.with_role(service_name, Role::Accessory)
    }

    fn from_service(service: &ServiceSpec, restart_policy: RestartPolicy) -> Self {
        Self {
            name: service.name.clone(),
            image: service.image.clone(),
            ports: service.ports.clone(),
            environment: service.environment.clone(),
            volumes: service.volumes.clone(),
            network: service.network.clone(),
            restart_policy,
            labels: BTreeMap::new(),
        }
    }

    fn with_role(mut self, service_name: &str, role: Role) -> Self {
        self.labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        self.labels
            .insert(LABEL_SERVICE.to_string(), service_name.to_string());
        self.labels
            .insert(LABEL_ROLE.to_string(), role.as_str().to_string());
        self
    }

    /// Adds labels, keeping the bosun labels authoritative.
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        for (key, value) in labels {
            self.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Returns the environment as `KEY=VALUE` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference_parts() {
        let image = ImageReference::new("ghcr.io/acme/web:1.4@sha256:abc");
        assert_eq!(image.repository(), "ghcr.io/acme/web");
        assert_eq!(image.tag(), Some("1.4"));
        assert_eq!(image.digest(), Some("sha256:abc"));

        let image = ImageReference::new("localhost:5000/web");
        assert_eq!(image.repository(), "localhost:5000/web");
        assert_eq!(image.tag(), None);
    }

    #[test]
    fn test_default_tag() {
        assert_eq!(
            ImageReference::new("web").with_default_tag().reference(),
            "web:latest"
        );
        assert_eq!(
            ImageReference::new("web:2").with_default_tag().reference(),
            "web:2"
        );
    }

    #[test]
    fn test_accessory_image_gets_default_tag() {
        let cache = AccessorySpec::builder("cache").image("redis").build().unwrap();
        assert_eq!(ContainerSpec::for_accessory(&cache, "shop").image, "redis:latest");

        let db = AccessorySpec::builder("db")
            .image("localhost:5000/postgres:16")
            .build()
            .unwrap();
        assert_eq!(
            ContainerSpec::for_accessory(&db, "shop").image,
            "localhost:5000/postgres:16"
        );
    }

    #[test]
    fn test_container_spec_labels() {
        let service = ServiceSpec::builder("web")
            .image("web:1")
            .env("PORT", "80")
            .build()
            .unwrap();
        let extra = BTreeMap::from([
            ("team".to_string(), "platform".to_string()),
            (LABEL_ROLE.to_string(), "spoofed".to_string()),
        ]);
        let spec = ContainerSpec::for_app(&service, "web:2").with_labels(&extra);

        assert_eq!(spec.image, "web:2");
        assert_eq!(spec.restart_policy, RestartPolicy::No);
        assert_eq!(spec.labels[LABEL_ROLE], "app");
        assert_eq!(spec.labels["team"], "platform");
        assert_eq!(spec.env_pairs(), vec!["PORT=80"]);
    }

    #[test]
    fn test_accessory_spec_keeps_restart_policy() {
        let accessory = AccessorySpec::builder("db")
            .container_name("web-db")
            .image("postgres:16")
            .restart_policy(RestartPolicy::UnlessStopped)
            .build()
            .unwrap();
        let spec = ContainerSpec::for_accessory(&accessory, "web");

        assert_eq!(spec.name, "web-db");
        assert_eq!(spec.restart_policy, RestartPolicy::UnlessStopped);
        assert_eq!(spec.labels[LABEL_SERVICE], "web");
    }
}
