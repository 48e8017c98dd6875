//! Bosun - declarative deployments for a service and its accessories.
//!
//! Bosun reads a `deploy.yaml` describing one primary service, the image
//! build for it and a set of accessory containers (databases, caches,
//! workers) with dependencies between them, and drives a local or remote
//! Docker daemon towards that state.
//!
//! # Usage
//!
//! ```bash
//! # Write a starting deploy.yaml
//! bosun init
//!
//! # Check the file and print the resolved accessory order
//! bosun validate
//!
//! # Build the image, bring accessories up and replace the app container
//! bosun deploy
//!
//! # Manage accessories
//! bosun accessory up db cache
//! bosun accessory down --volumes
//! bosun accessory reboot db
//! bosun accessory restart --all
//! bosun accessory logs db --follow
//!
//! # Manage the primary service
//! bosun app restart
//! bosun app logs --tail 50
//! ```
//!
//! Every command that changes containers prints the steps it ran. A failed
//! step stops the command, lists what was not attempted and exits non-zero.

mod config;
mod render;
mod template;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bosun_orchestrator::{backend, DeployOptions, LogOptions, Orchestrator, PlanResult};
use clap::{Args, Parser, Subcommand};
use config::{DeployFile, LoggingConfig, DEFAULT_CONFIG_PATH};
use futures::StreamExt;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments for bosun.
#[derive(Parser, Debug)]
#[command(
    name = "bosun",
    about = "Declarative deployments for a service and its accessory containers",
    version
)]
pub struct CliArgs {
    /// Path to the deployment file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "BOSUN_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json).
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Seconds a container gets to stop before it is killed.
    #[arg(long, value_name = "SECS", global = true)]
    stop_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a documented deployment file.
    Init {
        /// Where to write the file.
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Check the deployment file and print the accessory order.
    Validate,

    /// Build the image, bring accessories up and replace the app container.
    Deploy {
        /// Recreate accessories even if they are running.
        #[arg(long)]
        force: bool,

        /// Deploy the image already tagged locally.
        #[arg(long)]
        skip_build: bool,

        /// Leave accessories alone.
        #[arg(long)]
        skip_accessories: bool,

        /// Always pull newer base images when building.
        #[arg(long)]
        pull: bool,

        /// Build without the layer cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Manage accessory containers.
    #[command(subcommand)]
    Accessory(AccessoryCommand),

    /// Manage the primary service container.
    #[command(subcommand)]
    App(AppCommand),
}

/// Accessory commands.
#[derive(Subcommand, Debug)]
pub enum AccessoryCommand {
    /// Start accessories and their dependencies (all when none are named).
    Up {
        /// Accessory ids.
        names: Vec<String>,
    },

    /// Stop and remove accessories and their dependents (all when none are named).
    Down {
        /// Accessory ids.
        names: Vec<String>,

        /// Also remove anonymous volumes.
        #[arg(long)]
        volumes: bool,
    },

    /// Stop and start accessories whose dependencies are running.
    Restart {
        /// Accessory ids.
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Restart every accessory.
        #[arg(long, conflicts_with = "names")]
        all: bool,
    },

    /// Remove and recreate accessories whose dependencies are running.
    Reboot {
        /// Accessory ids.
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Reboot every accessory.
        #[arg(long, conflicts_with = "names")]
        all: bool,
    },

    /// Show the logs of one accessory.
    Logs {
        /// Accessory id or container name.
        name: String,

        #[command(flatten)]
        options: LogArgs,
    },

    /// List the primary service and accessories with their state.
    Ls,
}

/// Primary service commands.
#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Start the app container.
    Start,

    /// Stop the app container.
    Stop,

    /// Stop and start the app container.
    Restart,

    /// Stop and remove the app container.
    Remove {
        /// Also remove anonymous volumes.
        #[arg(long)]
        volumes: bool,
    },

    /// Show the logs of the app container.
    Logs {
        #[command(flatten)]
        options: LogArgs,
    },
}

/// Log reading flags.
#[derive(Args, Debug, Clone, Copy)]
pub struct LogArgs {
    /// Keep streaming new lines.
    #[arg(short, long)]
    follow: bool,

    /// Number of trailing lines to show.
    #[arg(short = 'n', long, value_name = "LINES")]
    tail: Option<usize>,

    /// Prefix lines with timestamps.
    #[arg(short, long)]
    timestamps: bool,
}

impl From<LogArgs> for LogOptions {
    fn from(args: LogArgs) -> Self {
        let options = LogOptions::default()
            .follow(args.follow)
            .timestamps(args.timestamps);
        match args.tail {
            Some(lines) => options.tail(Some(lines)),
            None => options,
        }
    }
}

/// Initialize tracing/logging.
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    // Logs go to stderr so stdout only carries command output.
    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}

/// Prints a plan result and turns a halted plan into an error.
fn report(result: PlanResult, json: bool) -> Result<()> {
    if json {
        println!("{}", render::json(&result)?);
    } else {
        print!("{}", render::plan(&result));
    }

    match result.error() {
        Some(err) => {
            error!(command = %result.command, error = %err, "Command failed");
            Err(anyhow::Error::new(err.clone()).context(format!("{} failed", result.command)))
        }
        None => Ok(()),
    }
}

/// Prints log lines until the stream ends or a shutdown signal arrives.
async fn stream_logs(orchestrator: &Orchestrator, name: &str, options: LogOptions) -> Result<()> {
    let mut lines = orchestrator
        .logs(name, options)
        .await
        .with_context(|| format!("Failed to read logs of {}", name))?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => println!("{}", line?),
                None => break,
            },
            result = &mut shutdown => {
                result?;
                debug!(name, "Stopped following logs");
                break;
            }
        }
    }

    Ok(())
}

/// `None` selects every accessory.
fn selection(names: &[String], all: bool) -> Option<&[String]> {
    (!all).then_some(names)
}

fn base_dir(config: &Path) -> PathBuf {
    match config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    if let Commands::Init { ref output, force } = args.command {
        let mut logging = LoggingConfig::default();
        logging.merge_cli_args(&args);
        logging.validate()?;
        init_tracing(&logging)?;

        template::write(output, force)?;
        println!("Wrote {}", output.display());
        return Ok(());
    }

    // Load configuration
    let mut file = DeployFile::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    // Merge CLI arguments
    file.merge_cli_args(&args);

    // Validate configuration
    file.validate().context("Invalid configuration")?;

    init_tracing(&file.logging)?;

    let deployment = file
        .to_deployment(&base_dir(&args.config))
        .context("Invalid deployment")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %deployment.service().name,
        accessories = deployment.accessories().len(),
        "Loaded deployment"
    );

    if let Commands::Validate = args.command {
        let order = deployment.validate()?;
        if args.json {
            let value = serde_json::json!({
                "deployment": &deployment,
                "order": order.forward(),
            });
            println!("{}", render::json(&value)?);
        } else {
            print!("{}", render::summary(&deployment, &order));
        }
        return Ok(());
    }

    let runtime = backend::connect(deployment.builder())
        .await
        .context("Failed to connect to the container runtime")?;
    let orchestrator = Orchestrator::new(deployment, runtime, file.orchestrator_config());

    let result = match args.command {
        Commands::Init { .. } | Commands::Validate => return Ok(()),
        Commands::Deploy {
            force,
            skip_build,
            skip_accessories,
            ..
        } => {
            orchestrator
                .deploy(DeployOptions {
                    force,
                    skip_build,
                    skip_accessories,
                })
                .await?
        }
        Commands::Accessory(command) => match command {
            AccessoryCommand::Up { names } => {
                orchestrator.accessory_up(Some(names.as_slice())).await?
            }
            AccessoryCommand::Down { names, .. } => {
                orchestrator.accessory_down(Some(names.as_slice())).await?
            }
            AccessoryCommand::Restart { names, all } => {
                orchestrator.accessory_restarts(selection(&names, all)).await?
            }
            AccessoryCommand::Reboot { names, all } => {
                orchestrator.accessory_reboots(selection(&names, all)).await?
            }
            AccessoryCommand::Logs { name, options } => {
                return stream_logs(&orchestrator, &name, options.into()).await;
            }
            AccessoryCommand::Ls => {
                let reports = orchestrator.status().await?;
                if args.json {
                    println!("{}", render::json(&reports)?);
                } else {
                    print!("{}", render::status(&reports));
                }
                return Ok(());
            }
        },
        Commands::App(command) => match command {
            AppCommand::Start => orchestrator.app_start().await?,
            AppCommand::Stop => orchestrator.app_stop().await?,
            AppCommand::Restart => orchestrator.app_restart().await?,
            AppCommand::Remove { .. } => orchestrator.app_remove().await?,
            AppCommand::Logs { options } => {
                let name = orchestrator.deployment().service().name.clone();
                return stream_logs(&orchestrator, &name, options.into()).await;
            }
        },
    };

    report(result, args.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_orchestrator::plan::{Action, Command};
    use bosun_orchestrator::OrchestratorError;

    #[test]
    fn test_cli_args_parsing() {
        let args = CliArgs::parse_from(["bosun", "validate"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.log_level.is_none());
        assert!(!args.json);
        assert!(matches!(args.command, Commands::Validate));
    }

    #[test]
    fn test_cli_args_with_options() {
        let args = CliArgs::parse_from([
            "bosun",
            "deploy",
            "--config",
            "ops/deploy.yaml",
            "--log-level",
            "warn",
            "--json",
            "--skip-build",
        ]);

        assert_eq!(args.config, PathBuf::from("ops/deploy.yaml"));
        assert_eq!(args.log_level, Some("warn".to_string()));
        assert!(args.json);
        assert!(matches!(
            args.command,
            Commands::Deploy {
                force: false,
                skip_build: true,
                skip_accessories: false,
                ..
            }
        ));
    }

    #[test]
    fn test_accessory_commands() {
        let args = CliArgs::parse_from(["bosun", "accessory", "up", "db", "cache"]);
        match args.command {
            Commands::Accessory(AccessoryCommand::Up { names }) => {
                assert_eq!(names, vec!["db".to_string(), "cache".to_string()])
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let args = CliArgs::parse_from(["bosun", "accessory", "down"]);
        assert!(matches!(
            args.command,
            Commands::Accessory(AccessoryCommand::Down { ref names, volumes: false }) if names.is_empty()
        ));

        assert!(CliArgs::try_parse_from(["bosun", "accessory", "reboot"]).is_err());
        assert!(CliArgs::try_parse_from(["bosun", "accessory", "reboot", "db", "--all"]).is_err());

        let args = CliArgs::parse_from(["bosun", "accessory", "reboot", "--all"]);
        match args.command {
            Commands::Accessory(AccessoryCommand::Reboot { names, all }) => {
                assert!(all);
                assert_eq!(selection(&names, all), None);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let args = CliArgs::parse_from(["bosun", "accessory", "restart", "db", "cache"]);
        match args.command {
            Commands::Accessory(AccessoryCommand::Restart { names, all }) => {
                assert_eq!(
                    selection(&names, all),
                    Some(["db".to_string(), "cache".to_string()].as_slice())
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_args() {
        let args = CliArgs::parse_from(["bosun", "app", "logs", "-f", "-n", "20"]);
        let Commands::App(AppCommand::Logs { options }) = args.command else {
            panic!("expected app logs");
        };

        let options = LogOptions::from(options);
        assert!(options.follow);
        assert_eq!(options.tail, Some(20));
        assert!(!options.timestamps);

        let args = CliArgs::parse_from(["bosun", "accessory", "logs", "db"]);
        let Commands::Accessory(AccessoryCommand::Logs { options, .. }) = args.command else {
            panic!("expected accessory logs");
        };
        assert_eq!(LogOptions::from(options), LogOptions::default());
    }

    #[test]
    fn test_report_fails_on_halted_plan() {
        let mut result = PlanResult::new(Command::AppStart);
        result.halt(
            "web",
            Action::Start,
            OrchestratorError::NotFound {
                target: "web".to_string(),
                action: Action::Start,
            },
            Vec::new(),
        );
        let err = report(result, true).unwrap_err();
        assert!(err.to_string().contains("app start failed"));

        let mut result = PlanResult::new(Command::AppStart);
        result.skipped("web", Action::Start, "already running");
        assert!(report(result, true).is_ok());
    }

    #[test]
    fn test_base_dir() {
        assert_eq!(base_dir(Path::new("deploy.yaml")), PathBuf::from("."));
        assert_eq!(base_dir(Path::new("ops/deploy.yaml")), PathBuf::from("ops"));
    }
}
