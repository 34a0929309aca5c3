use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use repx_core::{Experiment, FieldMatch, JobField, OutputResolver};
use repx_runner::{DebugRunner, RunnerOptions};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repx", version, about = "Local debug runner for repx experiment labs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Debug-execute a job and its transitive dependency closure.
    Run {
        #[arg(long)]
        lab: PathBuf,
        /// Id of the target job.
        #[arg(long)]
        job: String,
        /// Cache root for job outputs; auto-detected when omitted.
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Execution runtime: 'native' or a name declared by the job's run.
        #[arg(long)]
        runtime: Option<String>,
        /// Extraction root for sandbox-style runtimes.
        #[arg(long)]
        sandbox_root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Resolve effective parameters for every job in a lab.
    TraceParams {
        lab: PathBuf,
        /// Write the JSON document here instead of standard output.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the jobs of a lab, optionally filtered.
    Jobs {
        lab: PathBuf,
        /// Keep only jobs with this exact stage type.
        #[arg(long)]
        stage_type: Option<String>,
        /// Keep only jobs whose name starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            lab,
            job,
            cache,
            runtime,
            sandbox_root,
            json,
        } => {
            let cache_root = match cache {
                Some(dir) => absolute(&dir)?,
                None => find_writable_cache_dir()?,
            };
            fs::create_dir_all(&cache_root)?;
            let exp = Experiment::load_with_resolver(
                &lab,
                OutputResolver::LocalCache {
                    cache_root: cache_root.clone(),
                },
            )?;
            let runner = DebugRunner::new(
                &exp,
                cache_root.clone(),
                RunnerOptions {
                    runtime,
                    sandbox_root,
                },
            );
            let report = runner.ensure_run(&job)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "target": report.target,
                    "executed": report.executed,
                    "cached": report.cached,
                    "cache_root": cache_root.display().to_string(),
                    "out_dir": report.out_dir.display().to_string()
                })));
            }
            println!("target: {}", report.target);
            println!("executed: {}", join_or_none(&report.executed));
            println!("cached: {}", join_or_none(&report.cached));
            println!("out_dir: {}", report.out_dir.display());
        }
        Commands::TraceParams { lab, output } => {
            let exp = Experiment::load(&lab)?;
            let all = exp.resolve_all()?;
            let payload = serde_json::to_value(&all)?;
            match output {
                Some(path) => {
                    repx_core::atomic_write_json_pretty(&path, &payload)?;
                    eprintln!("wrote effective parameters to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&payload)?),
            }
        }
        Commands::Jobs {
            lab,
            stage_type,
            prefix,
            json,
        } => {
            let exp = Experiment::load(&lab)?;
            let mut jobs = exp.jobs();
            if let Some(stage) = stage_type {
                jobs = jobs.filter_field(JobField::StageType, &FieldMatch::Exact(stage));
            }
            if let Some(prefix) = prefix {
                jobs = jobs.filter_field(JobField::Name, &FieldMatch::StartsWith(prefix));
            }
            if json {
                let entries: Vec<Value> = jobs
                    .iter()
                    .map(|view| {
                        json!({
                            "id": view.id(),
                            "name": view.name(),
                            "stage_type": view.stage_type()
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "jobs",
                    "count": entries.len(),
                    "jobs": entries
                })));
            }
            for view in jobs.iter() {
                println!("{}: {} ({})", view.id(), view.name(), view.stage_type());
            }
        }
    }
    Ok(None)
}

/// Walks up from the current directory to the first place a `.repx-cache`
/// directory can be created. Policy only; the core never discovers caches.
fn find_writable_cache_dir() -> Result<PathBuf> {
    let start = std::env::current_dir()?;
    for dir in start.ancestors() {
        let candidate = dir.join(".repx-cache");
        if fs::create_dir_all(&candidate).is_ok() {
            debug!("auto-detected job cache directory: {}", candidate.display());
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "could not find a writable directory for the job cache; pass --cache"
    ))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn join_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Jobs { json, .. } => *json,
        Commands::TraceParams { .. } => false,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}
