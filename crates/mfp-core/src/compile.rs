//! Compile orchestration.
//!
//! Drives the parser and code generator over every configured source:
//! fetch bytes, hash, skip unchanged sources, parse, generate, lint, and
//! write `functions.py` + `manifest.json` + `__init__.py` atomically (temp
//! file in the target directory, then rename). One bad source fails that
//! source only; the report carries the outcome per server.
//!
//! The compiler is synchronous end to end. Serving picks the results up by
//! reloading the registry.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;

use crate::config::MfpConfig;
use crate::events::{EventKind, EventLog, MfpEvent};
use crate::lint;
use crate::report::Reporter;
use mfp_types::{
    LIBRARY_FILE, MANIFEST_FILE, MANIFEST_VERSION, Manifest, MfpError, PACKAGE_INIT_FILE,
    SwaggerSource,
};

/// Compile-run switches, mapped from CLI flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Parse only; perform no writes.
    pub dry_run: bool,
    /// Run the docstring enhancement pass before hashing and writing.
    pub enhance_docs: bool,
}

/// Outcome for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Generated { endpoints: usize },
    /// Unchanged swagger hash; nothing written.
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub server: String,
    pub status: SourceStatus,
}

/// Per-run summary over all sources.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub sources: Vec<SourceReport>,
}

impl CompileReport {
    pub fn generated(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Generated { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Failed { .. }))
    }

    /// True when no source failed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&SourceStatus) -> bool) -> usize {
        self.sources.iter().filter(|s| pred(&s.status)).count()
    }
}

/// Stateless docstring rewriting applied under `--llm-enhance`. The manifest
/// `library_hash` is always computed on the post-enhancement content.
pub trait DocEnhancer {
    fn enhance(&self, server_name: &str, library: String) -> String;
}

/// Built-in enhancer: a deterministic docstring tidy (summary lines get
/// terminal punctuation), so enhanced compiles stay reproducible.
#[derive(Debug, Default)]
pub struct ReflowEnhancer;

impl DocEnhancer for ReflowEnhancer {
    fn enhance(&self, _server_name: &str, library: String) -> String {
        let mut out = Vec::new();
        for line in library.lines() {
            let mut line = line.to_string();
            // Opening docstring line with an inline summary that lacks
            // terminal punctuation.
            if let Some(summary) = line.trim_start().strip_prefix("\"\"\"") {
                if !summary.is_empty()
                    && !summary.ends_with('"')
                    && !summary.trim_end().ends_with(['.', ':', '!', '?'])
                {
                    line.push('.');
                }
            }
            out.push(line);
        }
        let mut joined = out.join("\n");
        if library.ends_with('\n') {
            joined.push('\n');
        }
        joined
    }
}

/// Compile every configured source. Per-source failures land in the report;
/// only environment-level problems (unreadable output dir, broken config)
/// surface as `Err`.
pub fn run_compile(
    config: &MfpConfig,
    options: CompileOptions,
    reporter: &mut dyn Reporter,
) -> Result<CompileReport, MfpError> {
    let events = EventLog::new(&config.state_dir);
    let _ = events.append(&MfpEvent::now(EventKind::CompileStarted {
        source_count: config.servers.len(),
    }));

    if !options.dry_run {
        fs::create_dir_all(&config.compiled_dir).map_err(|e| {
            MfpError::Config(format!(
                "cannot create output dir {}: {e}",
                config.compiled_dir.display()
            ))
        })?;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent(concat!("mfp/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| MfpError::Internal(format!("failed to build http client: {e}")))?;

    let lint_on = lint::lint_available(&config.lint_bin);
    if !lint_on && !config.lint_bin.is_empty() {
        reporter.warn(&format!(
            "linter {:?} not found on PATH; generated files will not be linted",
            config.lint_bin
        ));
    }

    let mut report = CompileReport::default();
    for source in &config.servers {
        let status = compile_source(config, options, &client, lint_on, source, reporter);
        match &status {
            SourceStatus::Generated { endpoints } => {
                reporter.info(&format!(
                    "{}: generated {endpoints} function(s){}",
                    source.name,
                    if options.dry_run { " (dry run, not written)" } else { "" }
                ));
                let _ = events.append(&MfpEvent::now(EventKind::SourceCompiled {
                    server: source.name.clone(),
                    endpoint_count: *endpoints,
                }));
            }
            SourceStatus::Skipped => {
                reporter.info(&format!("{}: unchanged, skipping", source.name));
                let _ = events.append(&MfpEvent::now(EventKind::SourceSkipped {
                    server: source.name.clone(),
                    reason: "swagger hash unchanged".to_string(),
                }));
            }
            SourceStatus::Failed { reason } => {
                reporter.error(&format!("{}: {reason}", source.name));
                let _ = events.append(&MfpEvent::now(EventKind::SourceFailed {
                    server: source.name.clone(),
                    reason: reason.clone(),
                }));
            }
        }
        report.sources.push(SourceReport { server: source.name.clone(), status });
    }

    Ok(report)
}

fn compile_source(
    config: &MfpConfig,
    options: CompileOptions,
    client: &reqwest::blocking::Client,
    lint_on: bool,
    source: &SwaggerSource,
    reporter: &mut dyn Reporter,
) -> SourceStatus {
    let bytes = match fetch_document(client, source) {
        Ok(bytes) => bytes,
        Err(reason) => return SourceStatus::Failed { reason },
    };
    let swagger_hash = mfp_hash::sha256_hex(&bytes);

    let server_dir = config.compiled_dir.join(&source.name);
    if !options.dry_run && existing_hash(&server_dir) == Some(swagger_hash.clone()) {
        return SourceStatus::Skipped;
    }

    let outcome = match mfp_swagger::parse_document(source, &bytes) {
        Ok(outcome) => outcome,
        Err(e) => return SourceStatus::Failed { reason: e.to_string() },
    };
    for warning in &outcome.warnings {
        reporter.warn(warning);
    }
    let spec = outcome.spec;

    if options.dry_run {
        return SourceStatus::Generated { endpoints: spec.endpoints.len() };
    }

    let mut library = mfp_codegen::generate_library(&spec);
    if options.enhance_docs {
        library = ReflowEnhancer.enhance(&spec.name, library);
    }

    if lint_on {
        if let Err(e) = lint::lint_source(&config.lint_bin, LIBRARY_FILE, &library) {
            return SourceStatus::Failed {
                reason: MfpError::Compile { message: e.to_string() }.to_string(),
            };
        }
    }

    let manifest = Manifest {
        manifest_version: MANIFEST_VERSION,
        server_name: spec.name.clone(),
        summary: spec.summary.clone(),
        base_url: spec.base_url.clone(),
        generated_at: Utc::now(),
        swagger_hash,
        library_hash: mfp_hash::sha256_hex(library.as_bytes()),
        endpoint_count: spec.endpoints.len(),
        functions: mfp_codegen::function_infos(&spec),
    };

    match write_outputs(&server_dir, &spec.name, &library, &manifest) {
        Ok(()) => SourceStatus::Generated { endpoints: spec.endpoints.len() },
        Err(e) => SourceStatus::Failed { reason: format!("write failed: {e:#}") },
    }
}

/// Swagger hash of the previously compiled output, if any.
fn existing_hash(server_dir: &Path) -> Option<String> {
    if !server_dir.join(LIBRARY_FILE).is_file() {
        return None;
    }
    let content = fs::read_to_string(server_dir.join(MANIFEST_FILE)).ok()?;
    let manifest: Manifest = serde_json::from_str(&content).ok()?;
    (manifest.manifest_version == MANIFEST_VERSION).then_some(manifest.swagger_hash)
}

fn fetch_document(
    client: &reqwest::blocking::Client,
    source: &SwaggerSource,
) -> Result<Vec<u8>, String> {
    if let Some(path) = &source.path {
        return fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()));
    }
    let Some(url) = &source.swagger_url else {
        return Err("no swagger_url or path configured".to_string());
    };
    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("fetch of {url} failed: {e}"))?;
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| format!("reading body of {url} failed: {e}"))
}

fn write_outputs(
    server_dir: &Path,
    server_name: &str,
    library: &str,
    manifest: &Manifest,
) -> anyhow::Result<()> {
    fs::create_dir_all(server_dir)
        .with_context(|| format!("failed to create {}", server_dir.display()))?;

    let manifest_json =
        serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;

    write_atomic(&server_dir.join(LIBRARY_FILE), library.as_bytes())?;
    write_atomic(&server_dir.join(MANIFEST_FILE), manifest_json.as_bytes())?;
    write_atomic(
        &server_dir.join(PACKAGE_INIT_FILE),
        mfp_codegen::package_init(server_name).as_bytes(),
    )?;
    Ok(())
}

/// Write to a temp path inside the target directory, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}
