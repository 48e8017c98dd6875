//! Image builds for the primary service.
//!
//! The coordinator turns a [`BuilderSpec`] into a [`BuildRequest`] on the
//! local machine (context, dockerfile, platform, build args, tag) and hands
//! it to whichever runtime is bound. It never cross-compiles; the platform
//! string is passed through to the runtime's builder.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::backend::{BuildRequest, BuiltImage, SharedRuntime};
use crate::container::ImageReference;
use crate::error::{OrchestratorError, Result};
use crate::plan::Action;
use crate::topology::BuilderSpec;

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Resolves and runs image builds against a runtime.
#[derive(Clone)]
pub struct BuildCoordinator {
    runtime: SharedRuntime,
    pull: bool,
    no_cache: bool,
}

impl BuildCoordinator {
    /// Creates a coordinator for the given runtime.
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            pull: false,
            no_cache: false,
        }
    }

    /// Always pull newer base images.
    pub fn with_pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    /// Disable the build cache.
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Resolves a build request without touching the runtime.
    ///
    /// `dockerfile` overrides the builder's dockerfile. A path naming a
    /// directory means the `Dockerfile` inside it.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the context is not a directory, the
    /// dockerfile does not exist or lies outside the context, or the tag is
    /// empty.
    pub fn resolve(
        &self,
        builder: &BuilderSpec,
        dockerfile: Option<&Path>,
        image_tag: &str,
    ) -> Result<BuildRequest> {
        if image_tag.trim().is_empty() {
            return Err(OrchestratorError::validation("image tag is empty"));
        }

        let context = &builder.context;
        if !context.is_dir() {
            return Err(OrchestratorError::validation(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }

        let dockerfile = resolve_dockerfile(context, dockerfile.unwrap_or(&builder.dockerfile))?;
        let tag = ImageReference::new(image_tag.trim()).with_default_tag();

        Ok(BuildRequest {
            context: context.clone(),
            dockerfile,
            tag: tag.reference().to_string(),
            platform: builder.platform().to_string(),
            build_args: builder.build_args.clone(),
            pull: self.pull,
            no_cache: self.no_cache,
        })
    }

    /// Builds the image and returns the tag to create containers from.
    ///
    /// # Errors
    ///
    /// - Validation errors from [`resolve`](Self::resolve), before any
    ///   runtime call
    /// - [`OrchestratorError::Transport`] if a remote runtime is unreachable
    /// - [`OrchestratorError::Build`] if the runtime reports a failed build
    pub async fn build(
        &self,
        builder: &BuilderSpec,
        dockerfile: Option<&Path>,
        image_tag: &str,
    ) -> Result<BuiltImage> {
        let request = self.resolve(builder, dockerfile, image_tag)?;

        if let Some(endpoint) = builder.endpoint() {
            if !self.runtime.is_ready().await {
                return Err(OrchestratorError::transport(
                    endpoint.to_string(),
                    Action::Build,
                    "remote runtime is not reachable",
                ));
            }
        }

        info!(
            tag = %request.tag,
            arch = %builder.arch,
            dockerfile = %request.dockerfile.display(),
            runtime = %self.runtime.name(),
            "Starting image build"
        );

        self.runtime.build(&request).await
    }
}

/// Returns the dockerfile path relative to the context.
fn resolve_dockerfile(context: &Path, dockerfile: &Path) -> Result<PathBuf> {
    let relative = if dockerfile.is_absolute() {
        let context = context.canonicalize().map_err(|e| {
            OrchestratorError::validation(format!(
                "cannot resolve build context {}: {}",
                context.display(),
                e
            ))
        })?;
        dockerfile
            .strip_prefix(&context)
            .map(Path::to_path_buf)
            .map_err(|_| {
                OrchestratorError::validation(format!(
                    "dockerfile {} is outside the build context {}",
                    dockerfile.display(),
                    context.display()
                ))
            })?
    } else {
        dockerfile.to_path_buf()
    };

    let relative = if context.join(&relative).is_dir() {
        relative.join(DEFAULT_DOCKERFILE)
    } else {
        relative
    };

    if !context.join(&relative).is_file() {
        return Err(OrchestratorError::validation(format!(
            "dockerfile {} not found in {}",
            relative.display(),
            context.display()
        )));
    }

    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::InMemoryRuntime;
    use crate::topology::Arch;

    fn context() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir(dir.path().join("docker")).unwrap();
        std::fs::write(dir.path().join("docker/Dockerfile"), "FROM scratch\n").unwrap();
        dir
    }

    fn coordinator(runtime: &InMemoryRuntime) -> BuildCoordinator {
        BuildCoordinator::new(Arc::new(runtime.clone()))
    }

    #[test]
    fn test_resolve_request() {
        let dir = context();
        let builder = BuilderSpec::local()
            .with_context(dir.path())
            .with_arch(Arch::Armv7)
            .with_build_arg("VERSION", "1.2");
        let request = coordinator(&InMemoryRuntime::new())
            .resolve(&builder, None, "registry.local:5000/web")
            .unwrap();

        assert_eq!(request.tag, "registry.local:5000/web:latest");
        assert_eq!(request.platform, "linux/arm/v7");
        assert_eq!(request.dockerfile, PathBuf::from("Dockerfile"));
        assert_eq!(request.build_args["VERSION"], "1.2");
    }

    #[test]
    fn test_resolve_dockerfile_directory() {
        let dir = context();
        let builder = BuilderSpec::local().with_context(dir.path());
        let request = coordinator(&InMemoryRuntime::new())
            .resolve(&builder, Some(Path::new("docker")), "web:1")
            .unwrap();

        assert_eq!(request.dockerfile, PathBuf::from("docker/Dockerfile"));
        assert_eq!(request.tag, "web:1");
    }

    #[test]
    fn test_resolve_rejects_outside_dockerfile() {
        let dir = context();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("Dockerfile");
        std::fs::write(&outside, "FROM scratch\n").unwrap();

        let builder = BuilderSpec::local().with_context(dir.path());
        let err = coordinator(&InMemoryRuntime::new())
            .resolve(&builder, Some(&outside), "web")
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_missing_dockerfile_fails_before_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = InMemoryRuntime::new();
        let builder = BuilderSpec::local().with_context(dir.path());

        let err = coordinator(&runtime)
            .build(&builder, None, "web")
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(runtime.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_build_returns_resolved_tag() {
        let dir = context();
        let runtime = InMemoryRuntime::new();
        let builder = BuilderSpec::local().with_context(dir.path());

        let image = coordinator(&runtime)
            .build(&builder, None, "web")
            .await
            .unwrap();

        assert_eq!(image.tag, "web:latest");
        assert_eq!(runtime.built_images().await, vec!["web:latest"]);
    }

    #[tokio::test]
    async fn test_build_failure_is_build_error() {
        let dir = context();
        let runtime = InMemoryRuntime::new();
        runtime.fail_builds("RUN cargo build exited with 101").await;
        let builder = BuilderSpec::local().with_context(dir.path());

        let err = coordinator(&runtime)
            .build(&builder, None, "web")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Build { .. }));
    }

    #[tokio::test]
    async fn test_remote_build_without_transport() {
        let dir = context();
        let runtime = InMemoryRuntime::new();
        runtime.disconnect().await;
        let builder = BuilderSpec::remote("ssh://deploy@build.example.com")
            .unwrap()
            .with_context(dir.path());

        let err = coordinator(&runtime)
            .build(&builder, None, "web")
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert!(runtime.calls().await.is_empty());
    }
}
