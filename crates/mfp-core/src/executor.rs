//! The execution state machine behind `execute_code`.
//!
//! One call walks `INIT -> SIZE_CHECKED -> AST_OK -> LINT_OK -> CONTAINER_UP
//! -> CODE_SENT -> OUTPUT_READ -> PARSED -> CACHED -> DONE`; any step can
//! fan out to a failed [`ExecutionResult`] instead. Nothing is retried here;
//! the caller decides whether to resubmit.
//!
//! Every failure becomes a populated result with an operator-safe message.
//! The submitted code is never echoed back, and the vault-built credential
//! map goes only into the container environment.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::MfpConfig;
use crate::events::{EventKind, EventLog, MfpEvent};
use crate::lint;
use mfp_cache::SnippetCache;
use mfp_guard::AstGuard;
use mfp_policy::Policy;
use mfp_registry::Registry;
use mfp_sandbox::{SandboxConfig, SandboxOutput};
use mfp_types::{ErrorType, ExecutionResult, MfpError};
use mfp_vault::Vault;

/// States of one execution, in walk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionPhase {
    Init,
    SizeChecked,
    AstOk,
    LintOk,
    ContainerUp,
    CodeSent,
    OutputRead,
    Parsed,
    Cached,
    Done,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::SizeChecked => "size_checked",
            Self::AstOk => "ast_ok",
            Self::LintOk => "lint_ok",
            Self::ContainerUp => "container_up",
            Self::CodeSent => "code_sent",
            Self::OutputRead => "output_read",
            Self::Parsed => "parsed",
            Self::Cached => "cached",
            Self::Done => "done",
        }
    }
}

/// Executes snippets against the registry, cache, and sandbox. Cheap to
/// share: concurrent executions each own a container and meet only at the
/// cache and registry.
pub struct Executor {
    policy: Policy,
    vault: Vault,
    registry: Arc<Registry>,
    cache: Option<Arc<SnippetCache>>,
    events: EventLog,
    docker_bin: String,
    docker_image: String,
    docker_network: String,
    compiled_dir: PathBuf,
    lint_bin: String,
    timeout: Duration,
    cache_ttl_seconds: u64,
}

impl Executor {
    pub fn new(
        config: &MfpConfig,
        registry: Arc<Registry>,
        cache: Option<Arc<SnippetCache>>,
    ) -> Self {
        Self {
            policy: config.policy(),
            vault: config.vault(),
            registry,
            cache,
            events: EventLog::new(&config.state_dir),
            docker_bin: config.docker_bin.clone(),
            docker_image: config.docker_image.clone(),
            docker_network: config.docker_network.clone(),
            compiled_dir: config.compiled_dir.clone(),
            lint_bin: config.lint_bin.clone(),
            timeout: config.execution_timeout,
            cache_ttl_seconds: config.cache_ttl_seconds,
        }
    }

    /// Run one snippet. Never raises; every outcome is an
    /// [`ExecutionResult`].
    pub async fn execute(&self, code: &str, description: &str) -> ExecutionResult {
        let started = Instant::now();
        let mut phase = ExecutionPhase::Init;

        let mut result = match self.run(code, description, &mut phase).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(e.error_type(), e.to_string()),
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        let _ = self.events.append(&MfpEvent::now(EventKind::ExecutionFinished {
            phase: phase.as_str().to_string(),
            success: result.success,
            error_type: result.error_type.map(|t| t.to_string()),
            cache_id: result.cache_id.clone(),
            duration_ms: result.duration_ms,
        }));
        result
    }

    async fn run(
        &self,
        code: &str,
        description: &str,
        phase: &mut ExecutionPhase,
    ) -> Result<ExecutionResult, MfpError> {
        // SIZE: cheapest gate first, before any parsing.
        self.policy.check_code_size(code)?;
        *phase = ExecutionPhase::SizeChecked;

        // AST: static guard against the registry's known servers.
        let guard = AstGuard::new(self.registry.server_names());
        guard.check(code)?;
        self.policy.check_code_urls(code)?;
        *phase = ExecutionPhase::AstOk;

        // LINT: snippet plus the prelude it will actually run with.
        let payload = format!("{}\n{}\n", mfp_sandbox::prelude(), code);
        if lint::lint_available(&self.lint_bin) {
            lint::lint_source(&self.lint_bin, "snippet.py", &payload)?;
        }
        *phase = ExecutionPhase::LintOk;

        // ASSEMBLE: env vars for every server the snippet imports.
        let servers_used = detect_servers_used(code);
        let mut env = Vec::new();
        for server in &servers_used {
            env.extend(self.vault.build_server_env(server)?);
        }

        let sandbox = SandboxConfig {
            docker_bin: self.docker_bin.clone(),
            image: self.docker_image.clone(),
            network: self.docker_network.clone(),
            compiled_dir: self.compiled_dir.clone(),
            env,
            timeout: self.timeout,
        };

        *phase = ExecutionPhase::ContainerUp;
        *phase = ExecutionPhase::CodeSent;
        let output = mfp_sandbox::run_snippet(&sandbox, &payload)
            .await
            .map_err(|e| MfpError::Runtime(format!("sandbox failed: {e:#}")))?;
        *phase = ExecutionPhase::OutputRead;

        if output.timed_out {
            let seconds = self.timeout.as_secs();
            let mut result = ExecutionResult::failure(
                ErrorType::Timeout,
                MfpError::Timeout { seconds }.to_string(),
            );
            // Partial output is still useful to the caller.
            result.stdout = output.stdout;
            result.stderr = output.stderr;
            return Ok(result);
        }

        let mut result = self.parse_output(&output);
        *phase = ExecutionPhase::Parsed;

        if result.success {
            if let Some(cache) = &self.cache {
                let summary = result
                    .data
                    .as_ref()
                    .map(summarize_value)
                    .unwrap_or_default();
                // A cache fault must not fail a successful execution.
                if let Ok(id) =
                    cache.put(code, description, &servers_used, &summary, self.cache_ttl_seconds)
                {
                    result.cache_id = Some(id);
                    *phase = ExecutionPhase::Cached;
                }
            }
        }

        *phase = ExecutionPhase::Done;
        Ok(result)
    }

    fn parse_output(&self, output: &SandboxOutput) -> ExecutionResult {
        match parse_sandbox_stdout(&output.stdout) {
            Some((success, value)) => {
                let data = value.get("data").cloned();
                let error = value
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string);
                ExecutionResult {
                    success,
                    data: if success { data } else { None },
                    error: if success {
                        None
                    } else {
                        Some(error.unwrap_or_else(|| "snippet reported failure".to_string()))
                    },
                    error_type: (!success).then_some(ErrorType::Runtime),
                    stdout: output.stdout.clone(),
                    stderr: output.stderr.clone(),
                    duration_ms: 0,
                    cache_id: None,
                }
            }
            None => {
                let success = output.exit_code == 0;
                ExecutionResult {
                    success,
                    data: success
                        .then(|| serde_json::Value::String(output.stdout.trim_end().to_string())),
                    error: (!success).then(|| {
                        format!("sandbox process exited with status {}", output.exit_code)
                    }),
                    error_type: (!success).then_some(ErrorType::Runtime),
                    stdout: output.stdout.clone(),
                    stderr: output.stderr.clone(),
                    duration_ms: 0,
                    cache_id: None,
                }
            }
        }
    }
}

/// Server names referenced by `from {server}.functions import ...` or
/// `import {server}.functions` lines. Aliased and dynamic imports are
/// intentionally missed; unknown servers simply get no env injection and
/// fail inside the sandbox.
pub fn detect_servers_used(code: &str) -> Vec<String> {
    static IMPORT_RE: OnceLock<Regex> = OnceLock::new();
    let re = IMPORT_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:from|import)\s+([A-Za-z_][A-Za-z0-9_]*)\.functions\b")
            .expect("import pattern is valid")
    });

    let mut servers = Vec::new();
    for captures in re.captures_iter(code) {
        let name = captures[1].to_string();
        if !servers.contains(&name) {
            servers.push(name);
        }
    }
    servers
}

/// The last JSON object in stdout carrying a boolean `success` field.
pub fn parse_sandbox_stdout(stdout: &str) -> Option<(bool, serde_json::Value)> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(success) = value.get("success").and_then(|s| s.as_bool()) {
                return Some((success, value));
            }
        }
    }
    None
}

fn summarize_value(value: &serde_json::Value) -> String {
    let mut summary = value.to_string();
    if summary.len() > 200 {
        summary.truncate(200);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, run_compile};
    use crate::report::NullReporter;
    use mfp_types::SwaggerSource;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn detect_servers_from_import_lines() {
        let code = "\
from weather.functions import get_forecast
import petstore.functions
from weather.functions import post_report
x = 'from fake.functions import nothing'
";
        assert_eq!(detect_servers_used(code), vec!["weather", "petstore"]);
    }

    #[test]
    fn detect_ignores_dynamic_imports() {
        assert!(detect_servers_used("mod = importlib.import_module('weather.functions')").is_empty());
    }

    #[test]
    fn parse_stdout_takes_last_json_object() {
        let stdout = "\
progress line
{\"success\": true, \"data\": 1}
noise
{\"success\": false, \"error\": \"late failure\"}
";
        let (success, value) = parse_sandbox_stdout(stdout).expect("parsed");
        assert!(!success);
        assert_eq!(value["error"], "late failure");
    }

    #[test]
    fn parse_stdout_misses_without_success_field() {
        assert!(parse_sandbox_stdout("{\"data\": 1}\nplain text\n").is_none());
    }

    // End-to-end scenarios against a recording docker stub.

    const WEATHER_DOC: &str = r##"{
        "openapi": "3.0.0",
        "info": {"title": "Weather API"},
        "paths": {
            "/forecast": {
                "get": {"operationId": "get_forecast", "responses": {"200": {"description": "ok"}}}
            }
        }
    }"##;

    #[cfg(unix)]
    struct Harness {
        _td: tempfile::TempDir,
        config: MfpConfig,
        docker_log: PathBuf,
        cache: Arc<SnippetCache>,
        registry: Arc<Registry>,
    }

    #[cfg(unix)]
    fn write_docker_stub(dir: &Path, log: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        fs::write(
            &path,
            format!("#!/usr/bin/env sh\necho \"$@\" >> {}\n{body}", log.display()),
        )
        .expect("write stub");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    fn harness(stub_body: &str) -> Harness {
        let td = tempdir().expect("tempdir");
        let doc_path = td.path().join("weather.json");
        fs::write(&doc_path, WEATHER_DOC).expect("write doc");
        let docker_log = td.path().join("docker.log");
        let stub = write_docker_stub(td.path(), &docker_log, stub_body);

        let config = MfpConfig {
            compiled_dir: td.path().join("compiled"),
            state_dir: td.path().join(".mfp"),
            docker_bin: stub.display().to_string(),
            lint_bin: String::new(),
            execution_timeout: Duration::from_millis(500),
            servers: vec![SwaggerSource {
                name: "weather".to_string(),
                swagger_url: None,
                path: Some(doc_path),
                base_url: "https://api.example.com".to_string(),
                auth_header: Some("Bearer SECRET-TOKEN".to_string()),
                is_read_only: true,
            }],
            ..MfpConfig::default()
        };

        let report =
            run_compile(&config, CompileOptions::default(), &mut NullReporter).expect("compile");
        assert!(report.is_success());

        let registry = Arc::new(Registry::load(&config.compiled_dir).expect("registry"));
        let cache = Arc::new(SnippetCache::open_in_memory(100).expect("cache"));
        Harness { _td: td, config, docker_log, cache, registry }
    }

    #[cfg(unix)]
    fn executor(h: &Harness) -> Executor {
        Executor::new(&h.config, Arc::clone(&h.registry), Some(Arc::clone(&h.cache)))
    }

    const OK_STUB: &str = r#"if [ "$1" = "run" ]; then
  cat > /dev/null
  echo '{"success": true, "data": {"temp": 3.5}}'
fi
exit 0
"#;

    const HANG_STUB: &str = r#"if [ "$1" = "run" ]; then
  cat > /dev/null
  exec sleep 5
fi
exit 0
"#;

    #[cfg(unix)]
    #[test]
    fn blocked_import_fails_before_any_container() {
        let h = harness(OK_STUB);
        let result = tokio::runtime::Runtime::new().unwrap().block_on(
            executor(&h).execute("import os\nos.listdir('/')", "probe"),
        );

        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::Security));
        // No docker invocation, no cache write.
        assert!(!h.docker_log.exists());
        assert!(h.cache.is_empty().expect("cache"));
    }

    #[cfg(unix)]
    #[test]
    fn oversized_code_is_rejected_at_the_boundary() {
        let h = harness(OK_STUB);
        let exec = executor(&h);
        let rt = tokio::runtime::Runtime::new().unwrap();

        let padding = "# ".to_string() + &"x".repeat(h.config.max_code_size_bytes - 8) + "\nz = 1";
        assert!(padding.len() <= h.config.max_code_size_bytes);
        let ok = rt.block_on(exec.execute(&padding, "exactly at limit"));
        assert!(ok.success, "error: {:?}", ok.error);

        let over = "#".repeat(h.config.max_code_size_bytes + 1);
        let rejected = rt.block_on(exec.execute(&over, "one byte over"));
        assert!(!rejected.success);
        assert_eq!(rejected.error_type, Some(ErrorType::Security));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_yields_timeout_and_removes_container() {
        let h = harness(HANG_STUB);
        let started = Instant::now();
        let result = tokio::runtime::Runtime::new().unwrap().block_on(
            executor(&h).execute("import time\ntime.sleep(60)", "sleeper"),
        );

        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::Timeout));
        assert!(started.elapsed() < Duration::from_secs(3));

        let log = fs::read_to_string(&h.docker_log).expect("log");
        assert!(log.lines().any(|l| l.starts_with("kill")));
        assert!(log.lines().any(|l| l.starts_with("rm -f")));
        // Failed executions never reach the cache.
        assert!(h.cache.is_empty().expect("cache"));
    }

    #[cfg(unix)]
    #[test]
    fn success_caches_and_reuse_shares_the_entry() {
        let h = harness(OK_STUB);
        let exec = executor(&h);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let code = "from weather.functions import get_forecast\nimport json\nprint(json.dumps({'x': 1}))";

        let first = rt.block_on(exec.execute(code, "forecast check"));
        assert!(first.success, "error: {:?}", first.error);
        assert_eq!(first.data, Some(serde_json::json!({"temp": 3.5})));
        let id = first.cache_id.clone().expect("cache id");

        // Whitespace variant of the same snippet shares the entry.
        let second = rt.block_on(exec.execute(&format!("{code}\n\n"), "forecast check again"));
        assert_eq!(second.cache_id.as_deref(), Some(id.as_str()));

        let entry = h.cache.get(&id).expect("get").expect("entry");
        assert_eq!(entry.servers_used, vec!["weather".to_string()]);
        // Two puts on the same id plus this get.
        assert_eq!(entry.use_count, 3);
    }

    #[cfg(unix)]
    #[test]
    fn credentials_never_leak_into_results_or_events() {
        let h = harness(OK_STUB);
        let result = tokio::runtime::Runtime::new().unwrap().block_on(executor(&h).execute(
            "from weather.functions import get_forecast\nprint(get_forecast())",
            "forecast",
        ));
        assert!(result.success);

        let serialized = serde_json::to_string(&result).expect("serialize");
        assert!(!serialized.contains("SECRET-TOKEN"));

        let events = fs::read_to_string(h.config.state_dir.join("events.jsonl")).expect("events");
        assert!(!events.contains("SECRET-TOKEN"));

        // The credential did reach the container environment.
        let log = fs::read_to_string(&h.docker_log).expect("log");
        assert!(log.contains("MFP_WEATHER_AUTH=Bearer SECRET-TOKEN"));
    }

    #[cfg(unix)]
    #[test]
    fn non_json_stdout_falls_back_to_exit_code() {
        let h = harness(
            r#"if [ "$1" = "run" ]; then
  cat > /dev/null
  echo 'plain output'
fi
exit 0
"#,
        );
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(executor(&h).execute("print('plain output')", "plain"));
        assert!(result.success);
        assert_eq!(result.data, Some(serde_json::json!("plain output")));
    }

    #[cfg(unix)]
    #[test]
    fn cache_disabled_still_executes() {
        let h = harness(OK_STUB);
        let exec = Executor::new(&h.config, Arc::clone(&h.registry), None);
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(exec.execute("x = 1", "no cache"));
        assert!(result.success);
        assert!(result.cache_id.is_none());
    }
}
