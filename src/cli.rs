//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use procpool::logging::LogFormat;
use procpool::worker::WorkerArgs;
use std::path::PathBuf;

/// Run functions in a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all log output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log format: pretty, compact, json.
    #[arg(long, global = true, env = "PROCPOOL_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true, env = "PROCPOOL_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a builtin function once per input value.
    Run(RunArgs),

    /// List the builtin functions.
    Functions,

    /// Worker process mode, started by the pool.
    #[command(hide = true)]
    InternalWorker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Function to run (see `procpool functions`).
    pub function: String,

    /// Inputs, one task each. Parsed as JSON, otherwise taken as strings.
    pub inputs: Vec<String>,

    /// Number of worker processes (default: available parallelism).
    #[arg(short, long, env = "PROCPOOL_WORKERS")]
    pub workers: Option<usize>,

    /// Recycle each worker after this many tasks (0 = never).
    #[arg(long, env = "PROCPOOL_TASK_LIMIT", default_value_t = 0)]
    pub task_limit: usize,

    /// Per-task timeout in seconds (0 = none).
    #[arg(short, long, default_value_t = 0.0)]
    pub timeout: f64,

    /// Initializer function run once in every worker.
    #[arg(long)]
    pub initializer: Option<String>,

    /// JSON array of initializer arguments.
    #[arg(long, default_value = "[]")]
    pub initargs: String,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ResultFormat::Plain)]
    pub format: ResultFormat,
}

/// Output format for task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResultFormat {
    /// One result per line
    Plain,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "procpool", "-vv", "run", "double", "1", "2", "--workers", "2", "--timeout", "0.5",
            "--format", "json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.function, "double");
                assert_eq!(args.inputs, vec!["1", "2"]);
                assert_eq!(args.workers, Some(2));
                assert_eq!(args.timeout, 0.5);
                assert_eq!(args.format, ResultFormat::Json);
            }
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_internal_worker() {
        let cli = Cli::try_parse_from([
            "procpool",
            "internal-worker",
            "--task-limit",
            "3",
            "--initializer",
            "init_marker",
            "--initargs",
            "[1]",
        ])
        .unwrap();
        match cli.command {
            Commands::InternalWorker(args) => {
                assert_eq!(args.task_limit, 3);
                assert_eq!(args.initializer.as_deref(), Some("init_marker"));
                assert_eq!(args.initargs, "[1]");
            }
            other => panic!("Expected internal-worker, got {:?}", other),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["procpool", "-q", "-v", "functions"]).is_err());
    }

    #[test]
    fn test_bad_log_format_rejected() {
        assert!(Cli::try_parse_from(["procpool", "--log-format", "xml", "functions"]).is_err());
    }
}
