//! procpool - run functions in a pool of worker processes

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use procpool::logging::{self, LogConfig};
use procpool::pool::{Pool, PoolConfig};
use procpool::{PoolError, Task, TaskOptions, builtins};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands, ResultFormat, RunArgs};

fn main() {
    let cli = Cli::parse();

    // Worker mode: stdout belongs to the pool
    if let Commands::InternalWorker(args) = &cli.command {
        logging::init(LogConfig::for_worker().with_env_overrides());
        procpool::worker::run_worker_main(builtins::registry(), args.clone());
    }

    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Functions => cmd_functions(),
        Commands::InternalWorker(_) => Ok(()),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut config = LogConfig::new().with_level(level);
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    // An explicit -v/-q beats the environment's level
    if cli.verbose > 0 || cli.quiet {
        config = config.with_filter(level.to_string().to_lowercase());
    }
    logging::init(config.with_env_overrides());
}

/// Inputs are JSON when they parse as JSON, plain strings otherwise.
fn parse_input(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let registry = builtins::registry();
    if !registry.contains(&args.function) {
        bail!(
            "Unknown function '{}'. Run `procpool functions` to list them.",
            args.function
        );
    }

    let mut config = PoolConfig::default().with_task_limit(args.task_limit);
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(initializer) = &args.initializer {
        let initargs: Vec<Value> =
            serde_json::from_str(&args.initargs).context("--initargs must be a JSON array")?;
        config = config.with_initializer(initializer.clone(), initargs);
    }

    let mut options = TaskOptions::new();
    if args.timeout > 0.0 {
        let timeout = Duration::try_from_secs_f64(args.timeout)
            .with_context(|| format!("Invalid timeout: {}", args.timeout))?;
        options = options.with_timeout(timeout);
    }

    let pool = Arc::new(Pool::new(config));
    pool.start().context("Failed to start worker pool")?;

    {
        let pool = Arc::clone(&pool);
        ctrlc::set_handler(move || {
            eprintln!("\nReceived Ctrl+C, stopping workers...");
            pool.kill();
            std::process::exit(130);
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    let inputs: Vec<Value> = args.inputs.iter().map(|s| parse_input(s)).collect();
    let tasks = inputs
        .iter()
        .map(|input| pool.schedule_with(&args.function, [input], options.clone()))
        .collect::<procpool::Result<Vec<Arc<Task>>>>()?;

    let mut failures = 0;
    for (input, task) in inputs.iter().zip(&tasks) {
        let result = task.get(None);
        if result.is_err() {
            failures += 1;
        }
        print_result(args.format, input, task, result);
    }

    pool.close(None)?;

    if failures > 0 {
        bail!("{} of {} tasks failed", failures, tasks.len());
    }
    Ok(())
}

fn print_result(
    format: ResultFormat,
    input: &Value,
    task: &Task,
    result: procpool::Result<Value>,
) {
    match format {
        ResultFormat::Plain => match result {
            Ok(Value::String(s)) => println!("{}", s),
            Ok(value) => println!("{}", value),
            Err(e) => eprintln!(
                "{}: {}",
                "failed".if_supports_color(Stderr, |text| text.red()),
                e
            ),
        },
        ResultFormat::Json => {
            let line = match result {
                Ok(value) => json!({
                    "number": task.number(),
                    "input": input,
                    "ok": true,
                    "value": value,
                    "pid": task.pid(),
                }),
                Err(e) => json!({
                    "number": task.number(),
                    "input": input,
                    "ok": false,
                    "error": e.to_string(),
                    "kind": error_kind(&e),
                }),
            };
            println!("{}", line);
        }
    }
}

fn error_kind(error: &PoolError) -> &'static str {
    match error {
        PoolError::TaskTimeout { .. } => "timeout",
        PoolError::TaskCancelled(_) => "cancelled",
        PoolError::WorkerLost(_) => "worker_lost",
        PoolError::TaskFailed { .. } => "failed",
        _ => "pool",
    }
}

fn cmd_functions() -> Result<()> {
    for name in builtins::registry().names() {
        println!("{}", name);
    }
    Ok(())
}
