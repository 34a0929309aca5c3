use repx_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, Experiment, JobView, ModelError,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Runtime name selecting the plain-process back-end.
pub const NATIVE_RUNTIME: &str = "native";

const OCI_RUNTIME: &str = "oci";
const BWRAP_RUNTIME: &str = "bwrap";

const STATUS_DIR: &str = "repx";
const SUCCESS_MARKER: &str = "SUCCESS";
const LOGIC_MANIFEST: &str = "logic-manifest.json";
const RUNTIME_MANIFEST: &str = "runtime-manifest.json";

/// Stage type that is ensured and marked without ever being invoked.
const BARRIER_STAGE: &str = "barrier";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("job '{job}' requested runtime '{requested}' but its run declares {supported:?}")]
    UnsupportedRuntime {
        job: String,
        requested: String,
        supported: Vec<String>,
    },
    #[error("job '{job}' declares runtimes {declared:?}; pass --runtime to pick one (or 'native')")]
    AmbiguousRuntime { job: String, declared: Vec<String> },
    #[error("job '{job}' requires contract key '{key}' which has no known provider")]
    UnsatisfiableContract { job: String, key: String },
    #[error("no executable found for job '{job}' at {probed}: {reason}")]
    ExecutableNotFound {
        job: String,
        probed: PathBuf,
        reason: String,
    },
    #[error(
        "job '{job}' failed with exit code {code}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    )]
    JobExecutionFailed {
        job: String,
        code: String,
        stdout: String,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Requested runtime name; None means "native unless the run declares
    /// alternatives", in which case the choice must be made explicitly.
    pub runtime: Option<String>,
    /// Extraction root for sandbox-style runtimes; defaults to
    /// `<cache_root>/<job_id>/sandbox`.
    pub sandbox_root: Option<PathBuf>,
}

/// Summary of one `ensure_run` invocation, job ids in execution order.
#[derive(Debug)]
pub struct EnsureReport {
    pub target: String,
    pub executed: Vec<String>,
    pub cached: Vec<String>,
    pub out_dir: PathBuf,
}

/// On-disk layout of one job under the cache root.
struct JobPaths {
    out: PathBuf,
    status_dir: PathBuf,
    logic_manifest: PathBuf,
    runtime_manifest: PathBuf,
    success_marker: PathBuf,
}

impl JobPaths {
    fn new(cache_root: &Path, job_id: &str) -> Self {
        let job_dir = cache_root.join(job_id);
        let status_dir = job_dir.join(STATUS_DIR);
        Self {
            out: job_dir.join("out"),
            logic_manifest: status_dir.join(LOGIC_MANIFEST),
            runtime_manifest: status_dir.join(RUNTIME_MANIFEST),
            success_marker: status_dir.join(SUCCESS_MARKER),
            status_dir,
        }
    }

    fn prepare(&self) -> Result<(), RunError> {
        ensure_dir(&self.out)?;
        ensure_dir(&self.status_dir)?;
        Ok(())
    }
}

struct RuntimeSelection {
    name: String,
    artifact: Option<PathBuf>,
    sandbox_root: Option<PathBuf>,
}

impl RuntimeSelection {
    fn native() -> Self {
        Self {
            name: NATIVE_RUNTIME.to_string(),
            artifact: None,
            sandbox_root: None,
        }
    }

    fn containerized(&self) -> bool {
        self.name != NATIVE_RUNTIME
    }
}

/// Re-executes a job and its transitive dependency closure against a local
/// on-disk cache, sequentially, resuming past jobs that already carry a
/// success marker.
pub struct DebugRunner<'a> {
    exp: &'a Experiment,
    cache_root: PathBuf,
    options: RunnerOptions,
}

impl<'a> DebugRunner<'a> {
    pub fn new(exp: &'a Experiment, cache_root: impl Into<PathBuf>, options: RunnerOptions) -> Self {
        Self {
            exp,
            cache_root: cache_root.into(),
            options,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn ensure_run(&self, target: &str) -> Result<EnsureReport, RunError> {
        let mut report = EnsureReport {
            target: target.to_string(),
            executed: Vec::new(),
            cached: Vec::new(),
            out_dir: self.cache_root.join(target).join("out"),
        };
        let mut visiting: BTreeSet<String> = BTreeSet::new();
        self.ensure_job(target, &mut visiting, &mut report)?;
        Ok(report)
    }

    fn ensure_job(
        &self,
        job_id: &str,
        visiting: &mut BTreeSet<String>,
        report: &mut EnsureReport,
    ) -> Result<(), RunError> {
        let job = self.exp.job(job_id)?;
        let paths = JobPaths::new(&self.cache_root, job_id);
        if paths.success_marker.exists() {
            info!("cached job: {}", job_id);
            report.cached.push(job_id.to_string());
            return Ok(());
        }

        // Markers cannot be trusted to break cycles: a cyclic graph with an
        // empty cache would recurse forever without this guard.
        if !visiting.insert(job_id.to_string()) {
            return Err(RunError::Model(ModelError::CircularDependency(
                job_id.to_string(),
            )));
        }
        for dep in job.dependencies()? {
            self.ensure_job(dep.id(), visiting, report)?;
        }
        visiting.remove(job_id);

        self.execute_job(&job, &paths)?;
        report.executed.push(job_id.to_string());
        Ok(())
    }

    fn execute_job(&self, job: &JobView<'_>, paths: &JobPaths) -> Result<(), RunError> {
        if job.stage_type() == BARRIER_STAGE {
            info!("skipping job: {} (type: {})", job.id(), job.stage_type());
            paths.prepare()?;
            atomic_write_bytes(&paths.success_marker, b"")?;
            return Ok(());
        }

        info!("executing job: {}", job.id());
        let selection = self.select_runtime(job.id())?;
        paths.prepare()?;

        let logic = self.build_logic_manifest(job)?;
        atomic_write_json_pretty(&paths.logic_manifest, &Value::Object(logic))
            ?;

        let runtime = self.build_runtime_manifest(job, paths, &selection)?;
        atomic_write_json_pretty(&paths.runtime_manifest, &Value::Object(runtime))
            ?;

        let executable = self.locate_executable(job)?;
        debug!(
            "command: {} {} {}",
            executable.display(),
            paths.logic_manifest.display(),
            paths.runtime_manifest.display()
        );
        let output = Command::new(&executable)
            .arg(&paths.logic_manifest)
            .arg(&paths.runtime_manifest)
            .output()?;

        if !output.status.success() {
            return Err(RunError::JobExecutionFailed {
                job: job.id().to_string(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        atomic_write_bytes(&paths.success_marker, b"")?;
        info!("finished job: {}", job.id());
        Ok(())
    }

    /// Picks the execution runtime for a job against its run's declared
    /// `runtimes`. Never silently defaults when a non-native choice exists.
    fn select_runtime(&self, job_id: &str) -> Result<RuntimeSelection, RunError> {
        let empty = BTreeMap::new();
        let declared = self
            .exp
            .run_for_job(job_id)
            .map(|(_, run)| &run.runtimes)
            .unwrap_or(&empty);

        match self.options.runtime.as_deref() {
            Some(NATIVE_RUNTIME) => Ok(RuntimeSelection::native()),
            Some(requested) => {
                let spec = declared.get(requested).ok_or_else(|| {
                    RunError::UnsupportedRuntime {
                        job: job_id.to_string(),
                        requested: requested.to_string(),
                        supported: declared.keys().cloned().collect(),
                    }
                })?;
                let artifact = spec.artifact.clone().ok_or_else(|| {
                    RunError::Model(ModelError::InvalidMetadata(format!(
                        "runtime '{}' for job '{}' declares no artifact",
                        requested, job_id
                    )))
                })?;
                let sandbox_root = (requested == BWRAP_RUNTIME).then(|| {
                    self.options
                        .sandbox_root
                        .clone()
                        .unwrap_or_else(|| self.cache_root.join(job_id).join("sandbox"))
                });
                Ok(RuntimeSelection {
                    name: requested.to_string(),
                    artifact: Some(artifact),
                    sandbox_root,
                })
            }
            None => {
                let alternatives: Vec<String> = declared
                    .keys()
                    .filter(|name| name.as_str() != NATIVE_RUNTIME)
                    .cloned()
                    .collect();
                if alternatives.is_empty() {
                    Ok(RuntimeSelection::native())
                } else {
                    Err(RunError::AmbiguousRuntime {
                        job: job_id.to_string(),
                        declared: alternatives,
                    })
                }
            }
        }
    }

    /// Input key -> absolute path of the dependency's output, every
    /// dependency resolved against this runner's local cache.
    fn build_logic_manifest(
        &self,
        job: &JobView<'_>,
    ) -> Result<serde_json::Map<String, Value>, RunError> {
        let mut manifest = serde_json::Map::new();
        for mapping in job.input_mappings() {
            let (Some(dep_id), Some(source_output), Some(target_input)) = (
                mapping.source_job_id(),
                mapping.source_output.as_deref(),
                mapping.target_input.as_deref(),
            ) else {
                continue;
            };
            let dep = self.exp.job(dep_id)?;
            let template =
                dep.outputs()
                    .get(source_output)
                    .ok_or_else(|| ModelError::MissingOutput {
                        job: dep_id.to_string(),
                        key: source_output.to_string(),
                    })?;
            let dep_out = self.cache_root.join(dep_id).join("out");
            let resolved =
                template.replace(repx_core::OUT_PLACEHOLDER, &dep_out.to_string_lossy());
            manifest.insert(target_input.to_string(), Value::String(resolved));
        }
        Ok(manifest)
    }

    /// The contract-filtered subset of the well-known value store. A contract
    /// key with no provider fails before anything is spawned.
    fn build_runtime_manifest(
        &self,
        job: &JobView<'_>,
        paths: &JobPaths,
        selection: &RuntimeSelection,
    ) -> Result<serde_json::Map<String, Value>, RunError> {
        let mut manifest = serde_json::Map::new();
        for key in job.entrypoint_contract() {
            let value = match key.as_str() {
                "outDir" => path_value(&paths.out),
                "logicManifest" => path_value(&paths.logic_manifest),
                "statusDir" => path_value(&paths.status_dir),
                "workerBin" => Value::String(job.worker_bin().unwrap_or_default().to_string()),
                "labRoot" => path_value(self.exp.lab_root()),
                "containerized" => Value::Bool(selection.containerized()),
                "ociImage" => runtime_artifact_value(selection, OCI_RUNTIME),
                "sandboxArchive" => runtime_artifact_value(selection, BWRAP_RUNTIME),
                "sandboxRoot" => selection
                    .sandbox_root
                    .as_deref()
                    .map(path_value)
                    .unwrap_or_else(|| Value::String(String::new())),
                _ => {
                    return Err(RunError::UnsatisfiableContract {
                        job: job.id().to_string(),
                        key: key.clone(),
                    })
                }
            };
            manifest.insert(key.clone(), value);
        }
        Ok(manifest)
    }

    /// Probes `<lab>/<package>/bin/` for the job executable; exactly one
    /// candidate is expected.
    fn locate_executable(&self, job: &JobView<'_>) -> Result<PathBuf, RunError> {
        let Some(package) = job.package() else {
            return Err(RunError::ExecutableNotFound {
                job: job.id().to_string(),
                probed: self.exp.lab_root().to_path_buf(),
                reason: "job declares no package directory".to_string(),
            });
        };
        let bin_dir = self.exp.lab_root().join(package).join("bin");
        let not_found = |reason: String| RunError::ExecutableNotFound {
            job: job.id().to_string(),
            probed: bin_dir.clone(),
            reason,
        };
        let entries = fs::read_dir(&bin_dir)
            .map_err(|e| not_found(format!("cannot read bin directory: {}", e)))?;
        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in entries {
            candidates.push(entry?.path());
        }
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(not_found("bin directory is empty".to_string())),
            n => Err(not_found(format!("expected one candidate, found {}", n))),
        }
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().to_string())
}

fn runtime_artifact_value(selection: &RuntimeSelection, runtime: &str) -> Value {
    if selection.name == runtime {
        selection
            .artifact
            .as_deref()
            .map(path_value)
            .unwrap_or_else(|| Value::String(String::new()))
    } else {
        Value::String(String::new())
    }
}
