//! Configuration model.
//!
//! Typed, validated descriptions of one deployment: the primary
//! [`ServiceSpec`], its [`BuilderSpec`], and the [`AccessorySpec`]s it
//! depends on. Every type checks its invariants when it is constructed, so
//! the rest of the crate never sees a half-valid configuration.

mod builder;
mod deployment;
mod network;
mod service;

pub use builder::{Arch, BuildMode, BuilderSpec, RemoteEndpoint};
pub use deployment::{Deployment, Role};
pub use network::{PortMapping, VolumeMount};
pub use service::{
    AccessorySpec, AccessorySpecBuilder, RestartPolicy, ServiceSpec, ServiceSpecBuilder,
};
