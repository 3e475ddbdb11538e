// ABOUTME: Main application orchestration for the trailhead CLI
// ABOUTME: Coordinates between CLI arguments, configuration, and command execution

use anyhow::{anyhow, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use super::commands;
use super::{Args, Commands, Config};

pub struct App {
    config: Config,
}

impl App {
    /// Create a new application instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Install the tracing subscriber on stderr. `RUST_LOG` overrides the
    /// configured level.
    pub fn init_logging(&self, verbose: bool, no_color: bool) -> Result<()> {
        let level = match verbose {
            true => "debug",
            false => self.config.logging.level.as_str(),
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(!no_color)
            .with_target(false);

        let installed = match self.config.logging.format.as_str() {
            "compact" => builder.compact().try_init(),
            "pretty" => builder.pretty().try_init(),
            _ => builder.try_init(),
        };
        installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

        debug!("Logging initialized at {} ({})", level, self.config.logging.format);
        Ok(())
    }

    /// Run the application with parsed arguments
    pub async fn run(&mut self, args: Args) -> Result<()> {
        self.init_logging(args.verbose, args.no_color)?;

        info!("Starting trailhead v{}", env!("CARGO_PKG_VERSION"));
        debug!("Configuration loaded from: {:?}", args.config);

        match args.command {
            Commands::Run {
                workflow,
                vars,
                snapshot,
                complete_operations,
            } => {
                let inputs = Args::parse_variables(&vars)?;
                commands::run_workflow(workflow, inputs, snapshot, complete_operations, &self.config)
                    .await
            }

            Commands::Resume {
                state,
                workflow,
                bookmark,
                value,
                cancel,
                snapshot,
                complete_operations,
            } => {
                commands::resume_workflow(
                    state,
                    workflow,
                    bookmark,
                    value,
                    cancel,
                    snapshot,
                    complete_operations,
                    &self.config,
                )
                .await
            }

            Commands::Validate { workflow, strict } => {
                commands::validate_workflow(workflow, strict).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_app_creation() {
        let app = App::new(Config::default());
        assert_eq!(app.config.logging.level, "info");
    }

    #[tokio::test]
    async fn test_app_config_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("trailhead.yaml");

        let config_content = r#"
idle_timeout: 2s
logging:
  level: debug
  format: compact
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        let app = App::new(config);
        assert_eq!(app.config.idle_timeout, Duration::from_secs(2));
        assert_eq!(app.config.logging.level, "debug");
        assert_eq!(app.config.logging.format, "compact");
    }
}
