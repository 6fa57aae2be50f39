//! Crucible CLI
//!
//! A command-line front end for running untrusted code through crucible.
//! Results are printed to stdout as JSON; logs go to stderr. `crucible serve`
//! exposes the same pipeline over HTTP.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crucible::{
    Backend, Config, EXAMPLE_CONFIG, ResourceLimits, Scheduler, SchedulerError, Submission,
    SubmissionHandle, SubmissionRequest,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "Run untrusted code in isolated execution units")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Isolation backend, overriding the configuration
    #[arg(short, long, global = true, value_parser = ["docker", "isolate", "process"])]
    backend: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: crucible.toml)
        #[arg(short, long, default_value = "crucible.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run one source file and print its result
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., cpp, python, java)
        #[arg(short, long)]
        language: String,

        /// File piped to the program's stdin (default: empty)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Time limit in seconds
        #[arg(short, long)]
        time_limit: Option<f64>,

        /// Memory limit in KB
        #[arg(short, long)]
        memory_limit: Option<u64>,
    },

    /// Run every submission in a JSON Lines file through the worker pool
    Batch {
        /// One `{language, source, stdin?, limits?}` object per line
        #[arg(value_name = "FILE")]
        requests: PathBuf,
    },

    /// Serve the HTTP submission API until interrupted
    Serve {
        /// Listen address, overriding `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Build images ahead of time
    Prepare {
        /// Language IDs (default: all)
        languages: Vec<String>,
    },

    /// List available languages
    Languages,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { output, force } = cli.command {
        return init_config(&output, force).await;
    }

    let config = load_config(cli.config.as_deref(), cli.backend.as_deref())?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Run {
            source,
            language,
            input,
            time_limit,
            memory_limit,
        } => {
            run_one(
                config,
                &source,
                language,
                input.as_deref(),
                time_limit,
                memory_limit,
            )
            .await
        }
        Commands::Batch { requests } => run_batch(config, &requests).await,
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::Prepare { languages } => prepare(config, languages).await,
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, backend: Option<&str>) -> Result<Config> {
    let mut config = if let Some(path) = path {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::from_env().context("failed to load default configuration")?
    };

    if let Some(backend) = backend {
        config.backend = match backend {
            "isolate" => Backend::Isolate,
            "process" => Backend::Process,
            _ => Backend::Docker,
        };
        config
            .validate()
            .with_context(|| format!("configuration is not valid for the {backend} backend"))?;
    }
    if config.backend == Backend::Process {
        warn!("process backend selected: submitted code runs unconfined on this host");
    }
    Ok(config)
}

async fn run_one(
    config: Config,
    source: &Path,
    language: String,
    input: Option<&Path>,
    time_limit: Option<f64>,
    memory_limit: Option<u64>,
) -> Result<()> {
    let source = tokio::fs::read(source)
        .await
        .context("failed to read source file")?;
    let mut submission = Submission::new(language, source);

    if let Some(input) = input {
        let stdin = tokio::fs::read(input)
            .await
            .context("failed to read input file")?;
        submission = submission.with_stdin(stdin);
    }

    // Only explicitly given limits, so language defaults still apply
    if time_limit.is_some() || memory_limit.is_some() {
        let mut limits = ResourceLimits::unset();
        limits.time_limit = time_limit;
        limits.memory_limit = memory_limit;
        submission = submission.with_limits(limits);
    }

    let scheduler = Scheduler::from_config(config).context("failed to start scheduler")?;
    let result = scheduler
        .run(submission)
        .await
        .context("submission failed")?;
    scheduler.shutdown().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&result.to_payload()).context("failed to encode result")?
    );

    info!(
        outcome = %result.outcome,
        duration = ?result.duration,
        exit_code = ?result.exit_code,
        "execution result"
    );

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_batch(config: Config, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context("failed to read batch file")?;
    let scheduler = Scheduler::from_config(config).context("failed to start scheduler")?;

    // Results are printed in input order, so pending handles form a FIFO.
    let mut pending: VecDeque<Result<SubmissionHandle, String>> = VecDeque::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let request: SubmissionRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                pending.push_back(Err(format!("line {}: {e}", number + 1)));
                continue;
            }
        };
        let submission = Submission::from(request);

        loop {
            match scheduler.submit(submission.clone()) {
                Ok(handle) => {
                    pending.push_back(Ok(handle));
                    break;
                }
                // Backpressure: wait for the oldest submission, then retry.
                Err(SchedulerError::QueueFull(_)) if !pending.is_empty() => {
                    if let Some(entry) = pending.pop_front() {
                        print_entry(entry).await?;
                    }
                }
                Err(e) => {
                    pending.push_back(Err(e.to_string()));
                    break;
                }
            }
        }
    }

    while let Some(entry) = pending.pop_front() {
        print_entry(entry).await?;
    }
    scheduler.shutdown().await;
    Ok(())
}

async fn print_entry(entry: Result<SubmissionHandle, String>) -> Result<()> {
    let line = match entry {
        Ok(handle) => {
            let id = handle.id();
            match handle.await {
                Ok(result) => serde_json::to_value(result.to_payload())?,
                Err(e) => serde_json::json!({ "id": id, "error": e.to_string() }),
            }
        }
        Err(message) => serde_json::json!({ "error": message }),
    };
    println!("{line}");
    Ok(())
}

async fn serve(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
        config.validate().context("invalid --bind address")?;
    }

    let scheduler = Arc::new(Scheduler::from_config(config).context("failed to start scheduler")?);
    crucible_server::serve(scheduler.clone(), shutdown_signal())
        .await
        .context("submission API failed")?;
    scheduler.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "cannot listen for Ctrl-C");
            }
        }
        () = terminate => {}
    }
    info!("shutdown requested, draining submissions");
}

async fn prepare(config: Config, languages: Vec<String>) -> Result<()> {
    let mut keys = if languages.is_empty() {
        config.languages.keys().cloned().collect()
    } else {
        languages
    };
    keys.sort();

    let scheduler = Scheduler::from_config(config).context("failed to start scheduler")?;
    let results = scheduler
        .images()
        .prepare(keys.iter().map(String::as_str))
        .await;

    let mut failed = 0;
    for (key, result) in results {
        match result {
            Ok(image) => println!(
                "  {key:<15} {} ({})",
                image.reference,
                image.short_fingerprint()
            ),
            Err(e) => {
                failed += 1;
                println!("  {key:<15} FAILED: {e}");
            }
        }
    }
    scheduler.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} image(s) failed to build");
    }
    Ok(())
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!(
            "  {:<15} {} ({}, {})",
            id, lang.name, lang_type, lang.source_name
        );
    }
}

fn show_config(config: &Config) {
    println!("Backend: {}", config.backend.as_str());
    println!(
        "Workers: {} (queue capacity {})",
        config.workers, config.queue_capacity
    );
    println!("Capture limit: {} bytes", config.capture_limit);
    println!("Image build timeout: {:?}", config.image_build_timeout());
    println!("Workspace root: {}", config.workspace_root.display());
    println!("API address: {}", config.server.bind);
    println!();
    println!("Default resource limits:");
    print_limits(&config.default_limits);
    println!();
    println!("Override ceiling:");
    print_limits(&config.max_limits);
    println!();
    match config.backend {
        Backend::Docker => println!("Docker binary: {}", config.docker_binary().display()),
        Backend::Isolate => println!("Isolate binary: {}", config.isolate_binary().display()),
        Backend::Process => {}
    }
    println!("Languages configured: {}", config.languages.len());
}

fn print_limits(limits: &ResourceLimits) {
    println!("  Time limit: {:?}", limits.time_limit);
    println!("  Wall time limit: {:?}", limits.wall_time_limit);
    println!("  Memory limit: {:?} KB", limits.memory_limit);
    println!("  Stack limit: {:?} KB", limits.stack_limit);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Max output: {:?} KB", limits.max_output);
    println!("  CPUs: {:?}", limits.cpus);
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
