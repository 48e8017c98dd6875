//! Deployment file loading.
//!
//! `deploy.yaml` is parsed into a YAML tree, `${VAR}` and `${VAR:-default}`
//! references in string values are replaced from the environment, and the
//! result is deserialized into [`DeployFile`]. Conversion into a
//! [`Deployment`] runs every model check, so a file that loads is a file the
//! orchestrator can act on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bosun_orchestrator::topology::{
    AccessorySpec, Arch, BuilderSpec, Deployment, PortMapping, RestartPolicy, ServiceSpec,
    ServiceSpecBuilder, VolumeMount,
};
use bosun_orchestrator::OrchestratorConfig;
use regex::{Captures, Regex};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::{AccessoryCommand, AppCommand, CliArgs, Commands};

/// Default deployment file name.
pub const DEFAULT_CONFIG_PATH: &str = "deploy.yaml";

const ENV_REFERENCE: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";

/// The deployment file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployFile {
    /// Primary service name, also its container name.
    pub service: String,

    /// Image reference for the primary service.
    pub image: String,

    /// Published ports of the primary service.
    #[serde(default, deserialize_with = "string_or_list")]
    pub app_ports: Vec<String>,

    /// Network for the primary service.
    #[serde(default)]
    pub network: Option<String>,

    /// Environment of the primary service.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Volume mounts of the primary service.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Image build configuration.
    #[serde(default)]
    pub builder: BuilderConfig,

    /// Accessories in declaration order.
    #[serde(default, deserialize_with = "ordered_accessories")]
    pub accessories: Vec<(String, AccessoryConfig)>,

    /// Orchestrator settings.
    #[serde(default)]
    pub settings: Settings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Image build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Target architecture (amd64, arm64, armv7).
    pub arch: String,

    /// Build on the local daemon.
    pub local: bool,

    /// Remote endpoint, required when `local` is false.
    pub remote: Option<String>,

    /// Build context, relative to the deployment file.
    pub context: PathBuf,

    /// Dockerfile, relative to the context.
    pub dockerfile: PathBuf,

    /// Build arguments.
    pub args: BTreeMap<String, String>,

    /// Always pull newer base images.
    pub pull: bool,

    /// Build without the layer cache.
    pub no_cache: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            arch: "amd64".to_string(),
            local: true,
            remote: None,
            context: PathBuf::from("."),
            dockerfile: PathBuf::from("Dockerfile"),
            args: BTreeMap::new(),
            pull: false,
            no_cache: false,
        }
    }
}

/// One accessory definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessoryConfig {
    /// Image reference.
    pub image: String,

    /// Container name, `<service>-<id>` when omitted.
    #[serde(default)]
    pub service: Option<String>,

    /// Published ports.
    #[serde(default, deserialize_with = "string_or_list")]
    pub ports: Vec<String>,

    /// Network name.
    #[serde(default)]
    pub network: Option<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Container options.
    #[serde(default)]
    pub options: ContainerOptions,

    /// Accessories that must run first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Container options of an accessory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerOptions {
    /// Restart policy.
    pub restart: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            restart: "always".to_string(),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Grace period before a stopping container is killed.
    pub stop_timeout_secs: u64,

    /// Labels added to every container.
    pub labels: BTreeMap<String, String>,

    /// Remove anonymous volumes together with containers.
    pub remove_volumes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            labels: BTreeMap::new(),
            remove_volumes: false,
        }
    }
}

impl Settings {
    /// Returns the stop timeout as a Duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Merges the logging flags.
    pub fn merge_cli_args(&mut self, args: &CliArgs) {
        if let Some(ref level) = args.log_level {
            self.level = level.clone();
        }
        if args.verbose {
            self.level = "debug".to_string();
        }
        if let Some(ref format) = args.log_format {
            self.format = format.clone();
        }
    }

    /// Validates level and format.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            bail!("Invalid log level: {}", self.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            bail!("Invalid log format: {}", self.format);
        }

        Ok(())
    }
}

impl DeployFile {
    /// Loads a deployment file, substituting from the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content, |name| std::env::var(name).ok())
    }

    /// Parses a deployment file, resolving variables with `lookup`.
    pub fn parse<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: Value = serde_yaml::from_str(content).context("Invalid YAML")?;
        if value.is_null() {
            bail!("Deployment file is empty");
        }

        let pattern = Regex::new(ENV_REFERENCE)?;
        substitute(&mut value, &pattern, &lookup, &mut Vec::new())?;

        serde_yaml::from_value(value).context("Invalid deployment file")
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &CliArgs) {
        self.logging.merge_cli_args(args);

        // Override stop timeout if specified
        if let Some(secs) = args.stop_timeout {
            self.settings.stop_timeout_secs = secs;
        }

        if let Commands::Deploy { pull, no_cache, .. } = args.command {
            self.builder.pull |= pull;
            self.builder.no_cache |= no_cache;
        }

        let volumes = matches!(
            args.command,
            Commands::Accessory(AccessoryCommand::Down { volumes: true, .. })
                | Commands::App(AppCommand::Remove { volumes: true })
        );
        if volumes {
            self.settings.remove_volumes = true;
        }
    }

    /// Validates values that the deployment model does not check.
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;

        if self.settings.stop_timeout_secs == 0 {
            bail!("settings.stop_timeout_secs must be at least 1");
        }

        if !self.builder.local && self.builder.remote.as_deref().map_or(true, str::is_empty) {
            bail!("builder.remote is required when builder.local is false");
        }

        for (id, accessory) in &self.accessories {
            if accessory.image.trim().is_empty() {
                bail!("accessories.{}.image is required", id);
            }
        }

        Ok(())
    }

    /// Returns the orchestrator configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::builder()
            .stop_timeout(self.settings.stop_timeout())
            .labels(self.settings.labels.clone())
            .remove_volumes(self.settings.remove_volumes)
            .pull(self.builder.pull)
            .no_cache(self.builder.no_cache)
            .build()
    }

    /// Converts the file into a validated deployment.
    ///
    /// Relative paths (build context, bind mount sources starting with `.`)
    /// are resolved against `base_dir`, the directory of the file. A relative
    /// `base_dir` is taken from the current directory, since the daemon only
    /// accepts absolute bind sources.
    pub fn to_deployment(&self, base_dir: &Path) -> Result<Deployment> {
        let base_dir = &absolute_dir(base_dir)?;
        let service = service_spec(
            ServiceSpec::builder(&self.service).image(&self.image),
            &self.app_ports,
            &self.env,
            &self.volumes,
            self.network.as_deref(),
            base_dir,
        )
        .and_then(|builder| Ok(builder.build()?))
        .context("Invalid service")?;

        let builder = self.builder_spec(base_dir).context("Invalid builder")?;

        let accessories = self
            .accessories
            .iter()
            .map(|(id, accessory)| {
                self.accessory_spec(id, accessory, base_dir)
                    .with_context(|| format!("Invalid accessory {}", id))
            })
            .collect::<Result<Vec<_>>>()?;

        let deployment = Deployment::new(service, builder, accessories)?;
        deployment.validate()?;
        Ok(deployment)
    }

    fn builder_spec(&self, base_dir: &Path) -> Result<BuilderSpec> {
        let config = &self.builder;
        let arch: Arch = config.arch.parse()?;

        let spec = if config.local {
            BuilderSpec::local()
        } else {
            let remote = config
                .remote
                .as_deref()
                .context("builder.remote is required when builder.local is false")?;
            BuilderSpec::remote(remote)?
        };

        let spec = config
            .args
            .iter()
            .fold(spec, |spec, (key, value)| spec.with_build_arg(key, value));

        Ok(spec
            .with_arch(arch)
            .with_context(base_dir.join(&config.context))
            .with_dockerfile(&config.dockerfile))
    }

    fn accessory_spec(
        &self,
        id: &str,
        config: &AccessoryConfig,
        base_dir: &Path,
    ) -> Result<AccessorySpec> {
        let name = config
            .service
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.service, id));
        let restart: RestartPolicy = config.options.restart.parse()?;

        let mut builder = AccessorySpec::builder(id)
            .container_name(name)
            .image(&config.image)
            .restart_policy(restart);

        for port in &config.ports {
            builder = builder.port(parse_port(port)?);
        }
        for (key, value) in &config.env {
            builder = builder.env(key, value);
        }
        for volume in &config.volumes {
            builder = builder.volume(parse_volume(volume, base_dir)?);
        }
        if let Some(network) = &config.network {
            builder = builder.network(network);
        }
        for dependency in &config.depends_on {
            builder = builder.depends_on(dependency);
        }

        Ok(builder.build()?)
    }
}

fn service_spec(
    mut builder: ServiceSpecBuilder,
    ports: &[String],
    env: &BTreeMap<String, String>,
    volumes: &[String],
    network: Option<&str>,
    base_dir: &Path,
) -> Result<ServiceSpecBuilder> {
    for port in ports {
        builder = builder.port(parse_port(port)?);
    }
    for (key, value) in env {
        builder = builder.env(key, value);
    }
    for volume in volumes {
        builder = builder.volume(parse_volume(volume, base_dir)?);
    }
    if let Some(network) = network {
        builder = builder.network(network);
    }
    Ok(builder)
}

fn parse_port(value: &str) -> Result<PortMapping> {
    value
        .parse()
        .with_context(|| format!("Invalid port mapping '{}'", value))
}

fn parse_volume(value: &str, base_dir: &Path) -> Result<VolumeMount> {
    let mut mount: VolumeMount = value
        .parse()
        .with_context(|| format!("Invalid volume '{}'", value))?;
    if mount.source.starts_with('.') {
        mount.source = join_relative(base_dir, Path::new(&mount.source))
            .display()
            .to_string();
    }
    Ok(mount)
}

fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    Ok(join_relative(&cwd, dir))
}

/// Joins `path` onto `base`, dropping `.` components.
fn join_relative(base: &Path, path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .fold(base.to_path_buf(), |joined, c| joined.join(c))
}

/// Replaces environment references in every string of the tree.
///
/// `path` tracks the keys leading to the current value for error messages.
fn substitute<F>(value: &mut Value, pattern: &Regex, lookup: &F, path: &mut Vec<String>) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(text) => {
            *text = interpolate(text, pattern, lookup)
                .with_context(|| format!("at {}", display_path(path)))?;
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                path.push(i.to_string());
                substitute(item, pattern, lookup, path)?;
                path.pop();
            }
        }
        Value::Mapping(mapping) => {
            for (key, item) in mapping.iter_mut() {
                path.push(key.as_str().unwrap_or("?").to_string());
                substitute(item, pattern, lookup, path)?;
                path.pop();
            }
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, pattern, lookup, path)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

/// Expands `${VAR}` and `${VAR:-default}`.
///
/// The default applies when the variable is unset or empty. An unset
/// variable without a default is an error.
fn interpolate<F>(text: &str, pattern: &Regex, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let expanded = pattern.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str());
        match (lookup(name), default) {
            (Some(value), Some(default)) if value.is_empty() => default.to_string(),
            (Some(value), _) => value,
            (None, Some(default)) => default.to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => bail!("environment variable {} is not set and has no default", name),
        None => Ok(expanded.into_owned()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Accepts `"80:80"`, `"80:80, 443:443"` or a list of mappings.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(OneOrMany::Many(values)) => values,
    })
}

/// Keeps accessories in the order they are written.
fn ordered_accessories<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<(String, AccessoryConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, AccessoryConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of accessory names to definitions")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut accessories = Vec::new();
            while let Some((id, accessory)) = map.next_entry::<String, AccessoryConfig>()? {
                accessories.push((id, accessory));
            }
            Ok(accessories)
        }
    }

    deserializer.deserialize_any(OrderedVisitor)
}
