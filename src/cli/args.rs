// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the main CLI structure and the run, resume and validate subcommands

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use std::path::PathBuf;

use crate::definition::Value;

#[derive(Parser)]
#[command(name = "trailhead")]
#[command(about = "Run, persist and resume hierarchical YAML workflows")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow and run it until it completes or goes idle
    Run {
        #[arg(help = "Path to workflow YAML file")]
        workflow: PathBuf,

        #[arg(
            short = 'V',
            long = "var",
            help = "Workflow input (key=value, value parsed as JSON when possible)"
        )]
        vars: Vec<String>,

        #[arg(long, help = "Write the persisted state here if the workflow goes idle")]
        snapshot: Option<PathBuf>,

        #[arg(long, help = "Answer every external call with its own request")]
        complete_operations: bool,
    },

    /// Restore a persisted workflow, deliver a stimulus and keep running
    Resume {
        #[arg(help = "Path to a snapshot written by run or resume")]
        state: PathBuf,

        #[arg(short, long, help = "Path to the workflow YAML the snapshot was taken from")]
        workflow: PathBuf,

        #[arg(short, long, help = "Bookmark to resume")]
        bookmark: Option<String>,

        #[arg(long, requires = "bookmark", help = "Resumption value (JSON, or a plain string)")]
        value: Option<String>,

        #[arg(long, help = "Request cancellation of the workflow")]
        cancel: bool,

        #[arg(long, help = "Write the persisted state here if the workflow goes idle again")]
        snapshot: Option<PathBuf>,

        #[arg(long, help = "Answer every external call with its own request")]
        complete_operations: bool,
    },

    /// Validate a workflow file without executing
    Validate {
        #[arg(help = "Path to workflow YAML file")]
        workflow: PathBuf,

        #[arg(long, help = "Treat unknown symbols and shared bookmarks as errors")]
        strict: bool,
    },
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse inputs from key=value format
    pub fn parse_variables(vars: &[String]) -> anyhow::Result<IndexMap<String, Value>> {
        let mut variables = IndexMap::new();

        for var in vars {
            if let Some((key, value)) = var.split_once('=') {
                variables.insert(key.to_string(), parse_value(value));
            } else {
                return Err(anyhow::anyhow!(
                    "Invalid variable format '{}'. Expected 'key=value'",
                    var
                ));
            }
        }

        Ok(variables)
    }
}

/// JSON when it parses, otherwise the raw text as a string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variables() {
        let vars = vec![
            "region=eu-west".to_string(),
            "amount=250".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ];

        let parsed = Args::parse_variables(&vars).unwrap();

        assert_eq!(parsed.get("region"), Some(&json!("eu-west")));
        assert_eq!(parsed.get("amount"), Some(&json!(250)));
        assert_eq!(parsed.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_parse_variables_invalid() {
        let vars = vec!["invalid_format".to_string()];
        let result = Args::parse_variables(&vars);
        assert!(result.is_err());
    }

    #[test]
    fn test_resume_arguments() {
        let args = Args::try_parse_from([
            "trailhead",
            "resume",
            "state.json",
            "--workflow",
            "flow.yaml",
            "--bookmark",
            "approve",
            "--value",
            "true",
        ])
        .unwrap();
        match args.command {
            Commands::Resume {
                bookmark, value, ..
            } => {
                assert_eq!(bookmark.as_deref(), Some("approve"));
                assert_eq!(value.as_deref(), Some("true"));
            }
            _ => panic!("expected resume"),
        }
    }
}
