use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Sentinel `job_id` meaning "no external dependency"; skipped everywhere.
pub const SELF_SENTINEL: &str = "self";

/// Placeholder token in output templates standing for the job's output directory.
pub const OUT_PLACEHOLDER: &str = "$out";

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("job '{0}' not found in metadata")]
    UnknownJob(String),
    #[error("circular dependency detected at: {0}")]
    CircularDependency(String),
    #[error("job '{job}' declares no output '{key}'")]
    MissingOutput { job: String, key: String },
    #[error("manifest resolver has no entry for job '{0}'")]
    MissingManifestEntry(String),
    #[error("no run contains job '{0}'")]
    RunNotFound(String),
    #[error("no metadata.json found under {0}")]
    MetadataNotFound(PathBuf),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub fn ensure_dir(path: &Path) -> Result<(), ModelError> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<(), ModelError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn default_stage_type() -> String {
    "simple".to_string()
}

/// One declared data dependency of a job. Wire keys follow the metadata
/// document; all fields except `job_id` are optional and an incomplete
/// mapping is skipped during manifest generation.
#[derive(Debug, Clone, Deserialize)]
pub struct InputMapping {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub source_output: Option<String>,
    #[serde(default)]
    pub target_input: Option<String>,
    #[serde(default)]
    pub source_run: Option<String>,
    #[serde(default)]
    pub dependency_type: Option<String>,
}

impl InputMapping {
    /// The real dependency job id, or None for an absent or sentinel source.
    pub fn source_job_id(&self) -> Option<&str> {
        match self.job_id.as_deref() {
            Some(SELF_SENTINEL) | None => None,
            Some(id) => Some(id),
        }
    }
}

/// A job as declared in the metadata document. Required fields are typed;
/// everything else the document declares lands in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_stage_type")]
    pub stage_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub worker_bin: Option<String>,
    #[serde(default)]
    pub entrypoint_contract: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    pub runs: BTreeMap<String, RunRecord>,
}

/// Maps a job's `$out` placeholder to a concrete output directory. The
/// variant is chosen once at `Experiment` construction.
#[derive(Debug, Clone)]
pub enum OutputResolver {
    /// `$out` becomes `<cache_root>/<job_id>/out`.
    LocalCache { cache_root: PathBuf },
    /// `$out` becomes a pre-resolved absolute path supplied by the caller.
    Manifest { paths: BTreeMap<String, PathBuf> },
}

impl OutputResolver {
    pub fn out_dir(&self, job_id: &str) -> Result<PathBuf, ModelError> {
        match self {
            OutputResolver::LocalCache { cache_root } => {
                Ok(cache_root.join(job_id).join("out"))
            }
            OutputResolver::Manifest { paths } => paths
                .get(job_id)
                .cloned()
                .ok_or_else(|| ModelError::MissingManifestEntry(job_id.to_string())),
        }
    }

    pub fn resolve(&self, job_id: &str, template: &str) -> Result<PathBuf, ModelError> {
        let out_dir = self.out_dir(job_id)?;
        let resolved = template.replace(OUT_PLACEHOLDER, &out_dir.to_string_lossy());
        Ok(PathBuf::from(resolved))
    }
}

enum Frame {
    Enter(String),
    Exit(String),
}

/// Memoized effective-parameter computation. The memo is populated lazily
/// and never evicted for the lifetime of the loaded graph.
#[derive(Debug, Default)]
pub struct ParamResolver {
    memo: RefCell<BTreeMap<String, BTreeMap<String, Value>>>,
    evaluations: Cell<u64>,
}

impl ParamResolver {
    /// How many jobs have been evaluated (memo hits do not count).
    pub fn evaluations(&self) -> u64 {
        self.evaluations.get()
    }

    pub fn effective_params(
        &self,
        jobs: &BTreeMap<String, JobRecord>,
        job_id: &str,
    ) -> Result<BTreeMap<String, Value>, ModelError> {
        let mut memo = self.memo.borrow_mut();
        if let Some(hit) = memo.get(job_id) {
            return Ok(hit.clone());
        }

        // Iterative two-phase depth-first walk; stack usage stays bounded
        // regardless of dependency chain length.
        let mut visiting: BTreeSet<String> = BTreeSet::new();
        let mut stack = vec![Frame::Enter(job_id.to_string())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if memo.contains_key(&id) {
                        continue;
                    }
                    if visiting.contains(&id) {
                        return Err(ModelError::CircularDependency(id));
                    }
                    let job = jobs
                        .get(&id)
                        .ok_or_else(|| ModelError::UnknownJob(id.clone()))?;
                    visiting.insert(id.clone());
                    // Exit runs after every dependency has been memoized.
                    stack.push(Frame::Exit(id));
                    for mapping in job.input_mappings.iter().rev() {
                        if let Some(dep) = mapping.source_job_id() {
                            stack.push(Frame::Enter(dep.to_string()));
                        }
                    }
                }
                Frame::Exit(id) => {
                    let job = jobs
                        .get(&id)
                        .ok_or_else(|| ModelError::UnknownJob(id.clone()))?;
                    let mut acc: BTreeMap<String, Value> = BTreeMap::new();
                    for mapping in &job.input_mappings {
                        if let Some(dep) = mapping.source_job_id() {
                            let dep_params = memo
                                .get(dep)
                                .ok_or_else(|| ModelError::UnknownJob(dep.to_string()))?;
                            for (key, value) in dep_params {
                                acc.insert(key.clone(), value.clone());
                            }
                        }
                    }
                    // Own params always win over anything inherited.
                    for (key, value) in &job.params {
                        acc.insert(key.clone(), value.clone());
                    }
                    visiting.remove(&id);
                    self.evaluations.set(self.evaluations.get() + 1);
                    memo.insert(id, acc);
                }
            }
        }

        memo.get(job_id)
            .cloned()
            .ok_or_else(|| ModelError::UnknownJob(job_id.to_string()))
    }
}

/// Read-only facade over one job: declared fields plus derived state.
#[derive(Clone, Copy)]
pub struct JobView<'a> {
    exp: &'a Experiment,
    id: &'a str,
    record: &'a JobRecord,
}

impl<'a> JobView<'a> {
    pub fn id(&self) -> &'a str {
        self.id
    }

    /// Display name, falling back to the job id.
    pub fn name(&self) -> &'a str {
        self.record.name.as_deref().unwrap_or(self.id)
    }

    pub fn stage_type(&self) -> &'a str {
        &self.record.stage_type
    }

    pub fn params(&self) -> &'a BTreeMap<String, Value> {
        &self.record.params
    }

    pub fn input_mappings(&self) -> &'a [InputMapping] {
        &self.record.input_mappings
    }

    pub fn outputs(&self) -> &'a BTreeMap<String, String> {
        &self.record.outputs
    }

    pub fn package(&self) -> Option<&'a str> {
        self.record.package.as_deref()
    }

    pub fn worker_bin(&self) -> Option<&'a str> {
        self.record.worker_bin.as_deref()
    }

    pub fn entrypoint_contract(&self) -> &'a [String] {
        self.record
            .entrypoint_contract
            .as_deref()
            .unwrap_or_default()
    }

    pub fn extra(&self) -> &'a BTreeMap<String, Value> {
        &self.record.extra
    }

    pub fn effective_params(&self) -> Result<BTreeMap<String, Value>, ModelError> {
        self.exp.effective_params(self.id)
    }

    /// Distinct real dependencies, in first-occurrence declaration order.
    pub fn dependencies(&self) -> Result<Vec<JobView<'a>>, ModelError> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut deps = Vec::new();
        for mapping in &self.record.input_mappings {
            if let Some(dep) = mapping.source_job_id() {
                if seen.insert(dep) {
                    deps.push(self.exp.job(dep)?);
                }
            }
        }
        Ok(deps)
    }

    /// Resolves one of this job's declared output keys to an absolute path,
    /// using the resolver chosen at experiment construction.
    pub fn output_path(&self, key: &str) -> Result<PathBuf, ModelError> {
        self.exp.resolve_output_path(self.id, key)
    }
}

impl std::fmt::Debug for JobView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobView").field("id", &self.id).finish()
    }
}

/// Named string fields a collection can be filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobField {
    Id,
    Name,
    StageType,
}

#[derive(Debug, Clone)]
pub enum FieldMatch {
    Exact(String),
    StartsWith(String),
}

impl FieldMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            FieldMatch::Exact(want) => value == want,
            FieldMatch::StartsWith(prefix) => value.starts_with(prefix.as_str()),
        }
    }
}

/// Ordered, filterable, read-only sequence of job views. Order follows the
/// store's job enumeration order; filters return new collections.
#[derive(Clone)]
pub struct JobCollection<'a> {
    views: Vec<JobView<'a>>,
}

impl<'a> JobCollection<'a> {
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&JobView<'a>> {
        self.views.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, JobView<'a>> {
        self.views.iter()
    }

    pub fn filter<P>(&self, mut predicate: P) -> JobCollection<'a>
    where
        P: FnMut(&JobView<'a>) -> bool,
    {
        JobCollection {
            views: self
                .views
                .iter()
                .copied()
                .filter(|view| predicate(view))
                .collect(),
        }
    }

    pub fn filter_field(&self, field: JobField, matcher: &FieldMatch) -> JobCollection<'a> {
        self.filter(|view| {
            let value = match field {
                JobField::Id => view.id(),
                JobField::Name => view.name(),
                JobField::StageType => view.stage_type(),
            };
            matcher.matches(value)
        })
    }

    pub fn slice(&self, range: Range<usize>) -> JobCollection<'a> {
        JobCollection {
            views: self.views[range].to_vec(),
        }
    }
}

impl<'a> std::ops::Index<usize> for JobCollection<'a> {
    type Output = JobView<'a>;

    fn index(&self, index: usize) -> &JobView<'a> {
        &self.views[index]
    }
}

impl<'a> IntoIterator for &'a JobCollection<'a> {
    type Item = &'a JobView<'a>;
    type IntoIter = std::slice::Iter<'a, JobView<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.views.iter()
    }
}

/// An immutable experiment snapshot: the parsed metadata document, the
/// job-to-run index, the output resolver, and the parameter memo.
#[derive(Debug)]
pub struct Experiment {
    lab_root: PathBuf,
    metadata_path: PathBuf,
    metadata: Metadata,
    job_to_run: BTreeMap<String, String>,
    resolver: OutputResolver,
    params: ParamResolver,
}

impl Experiment {
    /// Loads a lab with the default local-cache resolver rooted at
    /// `<lab>/.repx-cache`.
    pub fn load(lab_path: &Path) -> Result<Self, ModelError> {
        let lab_root = canonical_or_owned(lab_path);
        let resolver = OutputResolver::LocalCache {
            cache_root: lab_root.join(".repx-cache"),
        };
        Self::load_with_resolver(lab_path, resolver)
    }

    pub fn load_with_resolver(
        lab_path: &Path,
        resolver: OutputResolver,
    ) -> Result<Self, ModelError> {
        let lab_root = canonical_or_owned(lab_path);
        let metadata_path = discover_metadata(&lab_root)?;
        debug!("using metadata at {}", metadata_path.display());
        let metadata: Metadata = serde_json::from_slice(&fs::read(&metadata_path)?)?;

        let mut job_to_run: BTreeMap<String, String> = BTreeMap::new();
        for (run_name, run) in &metadata.runs {
            for job_id in &run.jobs {
                if let Some(previous) = job_to_run.insert(job_id.clone(), run_name.clone()) {
                    return Err(ModelError::InvalidMetadata(format!(
                        "job '{}' belongs to both run '{}' and run '{}'",
                        job_id, previous, run_name
                    )));
                }
            }
        }

        Ok(Self {
            lab_root,
            metadata_path,
            metadata,
            job_to_run,
            resolver,
            params: ParamResolver::default(),
        })
    }

    pub fn lab_root(&self) -> &Path {
        &self.lab_root
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn resolver(&self) -> &OutputResolver {
        &self.resolver
    }

    pub fn job(&self, job_id: &str) -> Result<JobView<'_>, ModelError> {
        let (id, record) = self
            .metadata
            .jobs
            .get_key_value(job_id)
            .ok_or_else(|| ModelError::UnknownJob(job_id.to_string()))?;
        Ok(JobView {
            exp: self,
            id: id.as_str(),
            record,
        })
    }

    pub fn jobs(&self) -> JobCollection<'_> {
        JobCollection {
            views: self
                .metadata
                .jobs
                .iter()
                .map(|(id, record)| JobView {
                    exp: self,
                    id: id.as_str(),
                    record,
                })
                .collect(),
        }
    }

    pub fn runs(&self) -> &BTreeMap<String, RunRecord> {
        &self.metadata.runs
    }

    pub fn run_for_job(&self, job_id: &str) -> Result<(&str, &RunRecord), ModelError> {
        let run_name = self
            .job_to_run
            .get(job_id)
            .ok_or_else(|| ModelError::RunNotFound(job_id.to_string()))?;
        let run = self
            .metadata
            .runs
            .get(run_name)
            .ok_or_else(|| ModelError::RunNotFound(job_id.to_string()))?;
        Ok((run_name, run))
    }

    pub fn effective_params(&self, job_id: &str) -> Result<BTreeMap<String, Value>, ModelError> {
        self.params.effective_params(&self.metadata.jobs, job_id)
    }

    /// Effective params for every job in the graph, keyed by job id.
    pub fn resolve_all(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, Value>>, ModelError> {
        let mut all = BTreeMap::new();
        for job_id in self.metadata.jobs.keys() {
            all.insert(job_id.clone(), self.effective_params(job_id)?);
        }
        Ok(all)
    }

    pub fn param_evaluations(&self) -> u64 {
        self.params.evaluations()
    }

    pub fn resolve_output_path(&self, job_id: &str, key: &str) -> Result<PathBuf, ModelError> {
        let view = self.job(job_id)?;
        let template = view
            .outputs()
            .get(key)
            .ok_or_else(|| ModelError::MissingOutput {
                job: job_id.to_string(),
                key: key.to_string(),
            })?;
        self.resolver.resolve(job_id, template)
    }
}

fn canonical_or_owned(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn discover_metadata(lab_root: &Path) -> Result<PathBuf, ModelError> {
    let direct = lab_root.join(METADATA_FILE);
    if direct.is_file() {
        return Ok(direct);
    }
    let revision_dir = lab_root.join("revision");
    if revision_dir.is_dir() {
        let walker = walkdir::WalkDir::new(&revision_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok());
        for entry in walker {
            if entry.file_type().is_file()
                && entry.file_name().to_str() == Some(METADATA_FILE)
            {
                return Ok(entry.path().to_path_buf());
            }
        }
    }
    Err(ModelError::MetadataNotFound(lab_root.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_lab(metadata: &Value) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "repx_core_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp lab dir");
        atomic_write_json_pretty(&root.join(METADATA_FILE), metadata).expect("write metadata");
        root
    }

    fn chain_metadata(len: usize) -> Value {
        let mut jobs = serde_json::Map::new();
        for i in 0..len {
            let mut job = serde_json::Map::new();
            let mut params = serde_json::Map::new();
            params.insert(format!("p{}", i), json!(i));
            job.insert("params".to_string(), Value::Object(params));
            if i > 0 {
                job.insert(
                    "input_mappings".to_string(),
                    json!([{ "job_id": format!("job-{:05}", i - 1) }]),
                );
            }
            jobs.insert(format!("job-{:05}", i), Value::Object(job));
        }
        json!({ "jobs": jobs, "runs": {} })
    }

    #[test]
    fn job_without_dependencies_keeps_own_params() {
        let lab = temp_lab(&json!({
            "jobs": {
                "solo": { "params": { "alpha": 1, "beta": "x" } }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let params = exp.effective_params("solo").expect("params");
        assert_eq!(params.get("alpha"), Some(&json!(1)));
        assert_eq!(params.get("beta"), Some(&json!("x")));
        assert_eq!(params.len(), 2);
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn own_params_override_inherited_and_siblings_merge_in_order() {
        let lab = temp_lab(&json!({
            "jobs": {
                "first": { "params": { "shared": "from-first", "only_first": 1 } },
                "second": { "params": { "shared": "from-second", "only_second": 2 } },
                "child": {
                    "params": { "own": "mine", "only_first": "overridden" },
                    "input_mappings": [
                        { "job_id": "first" },
                        { "job_id": "second" }
                    ]
                }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let params = exp.effective_params("child").expect("params");
        // later sibling wins on collision, own params win over both
        assert_eq!(params.get("shared"), Some(&json!("from-second")));
        assert_eq!(params.get("only_first"), Some(&json!("overridden")));
        assert_eq!(params.get("only_second"), Some(&json!(2)));
        assert_eq!(params.get("own"), Some(&json!("mine")));
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn self_sentinel_is_skipped_during_resolution() {
        let lab = temp_lab(&json!({
            "jobs": {
                "looper": {
                    "params": { "k": true },
                    "input_mappings": [{ "job_id": "self" }]
                }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let params = exp.effective_params("looper").expect("params");
        assert_eq!(params.get("k"), Some(&json!(true)));
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn two_job_cycle_fails_for_both_jobs() {
        let lab = temp_lab(&json!({
            "jobs": {
                "a": { "input_mappings": [{ "job_id": "b" }] },
                "b": { "input_mappings": [{ "job_id": "a" }] }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        for job in ["a", "b"] {
            let err = exp.effective_params(job).expect_err("cycle must fail");
            assert!(
                matches!(err, ModelError::CircularDependency(_)),
                "unexpected error for {}: {}",
                job,
                err
            );
        }
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn long_cycle_does_not_overflow_the_stack() {
        let mut metadata = chain_metadata(2000);
        // close the chain into one big cycle
        metadata["jobs"]["job-00000"]["input_mappings"] =
            json!([{ "job_id": "job-01999" }]);
        let lab = temp_lab(&metadata);
        let exp = Experiment::load(&lab).expect("load");
        let err = exp
            .effective_params("job-01999")
            .expect_err("cycle must fail");
        assert!(matches!(err, ModelError::CircularDependency(_)));
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn deep_chain_resolves_iteratively() {
        let lab = temp_lab(&chain_metadata(2000));
        let exp = Experiment::load(&lab).expect("load");
        let params = exp.effective_params("job-01999").expect("deep chain");
        assert_eq!(params.get("p0"), Some(&json!(0)));
        assert_eq!(params.get("p1999"), Some(&json!(1999)));
        assert_eq!(params.len(), 2000);
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn memoization_short_circuits_repeat_queries() {
        let lab = temp_lab(&json!({
            "jobs": {
                "base": { "params": { "depth": 0 } },
                "mid": { "params": { "depth": 1 }, "input_mappings": [{ "job_id": "base" }] },
                "top": { "params": { "depth": 2 }, "input_mappings": [{ "job_id": "mid" }] }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let first = exp.effective_params("top").expect("first pass");
        assert_eq!(exp.param_evaluations(), 3);
        let second = exp.effective_params("top").expect("second pass");
        assert_eq!(first, second);
        assert_eq!(exp.param_evaluations(), 3, "memo hit must not re-traverse");
        // diamond over the same memo: no extra evaluation for shared deps
        exp.effective_params("mid").expect("mid");
        assert_eq!(exp.param_evaluations(), 3);
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let lab = temp_lab(&json!({
            "jobs": {
                "dangling": { "input_mappings": [{ "job_id": "ghost" }] }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let err = exp.effective_params("dangling").expect_err("must fail");
        match err {
            ModelError::UnknownJob(id) => assert_eq!(id, "ghost"),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn local_cache_resolver_substitutes_out_dir() {
        let resolver = OutputResolver::LocalCache {
            cache_root: PathBuf::from("/tmp/repx-r"),
        };
        let path = resolver.resolve("J", "$out/numbers.txt").expect("resolve");
        assert_eq!(path, PathBuf::from("/tmp/repx-r/J/out/numbers.txt"));
    }

    #[test]
    fn manifest_resolver_uses_caller_paths_and_reports_missing_entries() {
        let mut paths = BTreeMap::new();
        paths.insert(
            "J".to_string(),
            PathBuf::from("/nix/store/some-hash-result"),
        );
        let resolver = OutputResolver::Manifest { paths };
        let path = resolver.resolve("J", "$out/numbers.txt").expect("resolve");
        assert_eq!(path, PathBuf::from("/nix/store/some-hash-result/numbers.txt"));

        let err = resolver
            .resolve("absent", "$out/numbers.txt")
            .expect_err("missing entry");
        match err {
            ModelError::MissingManifestEntry(id) => assert_eq!(id, "absent"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn output_path_lookup_is_exact_match() {
        let lab = temp_lab(&json!({
            "jobs": {
                "sum": { "outputs": { "data.total_sum": "$out/total_sum.txt" } }
            },
            "runs": {}
        }));
        let cache = PathBuf::from("/tmp/repx-cache");
        let exp = Experiment::load_with_resolver(
            &lab,
            OutputResolver::LocalCache {
                cache_root: cache.clone(),
            },
        )
        .expect("load");
        let path = exp
            .resolve_output_path("sum", "data.total_sum")
            .expect("nested key");
        assert_eq!(path, cache.join("sum").join("out").join("total_sum.txt"));

        let err = exp
            .resolve_output_path("sum", "data")
            .expect_err("prefix must not match");
        match err {
            ModelError::MissingOutput { job, key } => {
                assert_eq!(job, "sum");
                assert_eq!(key, "data");
            }
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn metadata_is_discovered_under_revision() {
        let root = std::env::temp_dir().join(format!(
            "repx_core_revision_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let nested = root.join("revision").join("r1").join("snapshot");
        ensure_dir(&nested).expect("nested dir");
        atomic_write_json_pretty(
            &nested.join(METADATA_FILE),
            &json!({ "jobs": { "only": {} }, "runs": {} }),
        )
        .expect("write metadata");

        let exp = Experiment::load(&root).expect("load via revision scan");
        assert!(exp.metadata_path().ends_with("snapshot/metadata.json"));
        assert_eq!(exp.jobs().len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let root = std::env::temp_dir().join(format!(
            "repx_core_missing_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("dir");
        let err = Experiment::load(&root).expect_err("must fail");
        assert!(matches!(err, ModelError::MetadataNotFound(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_run_membership_is_rejected() {
        let lab = temp_lab(&json!({
            "jobs": { "shared": {} },
            "runs": {
                "run-a": { "jobs": ["shared"] },
                "run-b": { "jobs": ["shared"] }
            }
        }));
        let err = Experiment::load(&lab).expect_err("must fail");
        match err {
            ModelError::InvalidMetadata(msg) => assert!(msg.contains("shared"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn run_lookup_reports_membership() {
        let lab = temp_lab(&json!({
            "jobs": { "member": {}, "stray": {} },
            "runs": { "sim": { "jobs": ["member"], "runtimes": {} } }
        }));
        let exp = Experiment::load(&lab).expect("load");
        let (name, run) = exp.run_for_job("member").expect("member run");
        assert_eq!(name, "sim");
        assert_eq!(run.jobs, vec!["member".to_string()]);
        let err = exp.run_for_job("stray").expect_err("stray has no run");
        assert!(matches!(err, ModelError::RunNotFound(_)));
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn collection_filters_compose_and_preserve_order() {
        let lab = temp_lab(&json!({
            "jobs": {
                "j1": { "name": "stage-A-producer", "stage_type": "simple" },
                "j2": { "name": "stage-B-producer", "stage_type": "scatter-gather" },
                "j3": { "name": "stage-C-consumer", "stage_type": "simple" },
                "j4": { "name": "stage-C-consumer-retry", "stage_type": "simple" }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let jobs = exp.jobs();
        assert_eq!(jobs.len(), 4);

        let simple = jobs.filter_field(
            JobField::StageType,
            &FieldMatch::Exact("simple".to_string()),
        );
        assert_eq!(simple.len(), 3);

        let consumers = simple.filter_field(
            JobField::Name,
            &FieldMatch::StartsWith("stage-C-consumer".to_string()),
        );
        assert_eq!(consumers.len(), 2);
        assert_eq!(consumers[0].id(), "j3");
        assert_eq!(consumers[1].id(), "j4");

        let via_predicate = jobs.filter(|view| view.name().ends_with("producer"));
        assert_eq!(via_predicate.len(), 2);
        assert_eq!(via_predicate[0].id(), "j1");
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn collection_supports_slicing_and_indexing() {
        let lab = temp_lab(&json!({
            "jobs": { "a": {}, "b": {}, "c": {}, "d": {} },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let jobs = exp.jobs();
        assert_eq!(jobs[2].id(), "c");
        assert_eq!(jobs.get(9).map(|v| v.id()), None);
        let middle = jobs.slice(1..3);
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].id(), "b");
        assert_eq!(middle[1].id(), "c");
        let _ = fs::remove_dir_all(lab);
    }

    #[test]
    fn view_exposes_declared_fields_and_dependency_order() {
        let lab = temp_lab(&json!({
            "jobs": {
                "p1": {}, "p2": {},
                "c": {
                    "stage_type": "worker",
                    "worker_bin": "shard-worker",
                    "entrypoint_contract": ["outDir", "logicManifest"],
                    "custom_field": { "nested": 7 },
                    "input_mappings": [
                        { "job_id": "p2", "source_output": "x", "target_input": "x_in" },
                        { "job_id": "self" },
                        { "job_id": "p1" },
                        { "job_id": "p2" }
                    ]
                }
            },
            "runs": {}
        }));
        let exp = Experiment::load(&lab).expect("load");
        let view = exp.job("c").expect("view");
        assert_eq!(view.name(), "c", "name falls back to the id");
        assert_eq!(view.stage_type(), "worker");
        assert_eq!(view.worker_bin(), Some("shard-worker"));
        assert_eq!(view.entrypoint_contract(), ["outDir", "logicManifest"]);
        assert_eq!(view.extra().get("custom_field"), Some(&json!({ "nested": 7 })));

        let deps = view.dependencies().expect("deps");
        let ids: Vec<&str> = deps.iter().map(|d| d.id()).collect();
        assert_eq!(ids, ["p2", "p1"], "distinct, first-occurrence order");
        let _ = fs::remove_dir_all(lab);
    }
}
