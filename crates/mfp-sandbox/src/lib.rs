//! Container execution for MFP snippets.
//!
//! The sandbox drives the `docker` CLI as a subprocess: one container per
//! execution, created with mandatory hardening flags, fed the code over
//! stdin, waited on under a wall-clock timeout, and removed on every exit
//! path through a scoped guard. The Docker daemon itself is an external
//! collaborator; this crate only owns container ids it created.
//!
//! The binary is configurable so tests can substitute a recording stub for
//! real Docker.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Where the compiled libraries are bind-mounted (read-only) inside the
/// container.
pub const COMPILED_MOUNT: &str = "/opt/mfp/compiled";

/// Default container image.
pub const DEFAULT_IMAGE: &str = "python:3.12-slim";

/// Everything needed to run one snippet.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker binary; tests point this at a stub.
    pub docker_bin: String,
    pub image: String,
    /// Docker network name; `none` keeps the container offline.
    pub network: String,
    /// Host directory of compiled libraries, mounted read-only.
    pub compiled_dir: PathBuf,
    /// Environment injected into the container (vault-built credentials).
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Raw outcome of one container run.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Prelude prepended to every snippet: makes `from {server}.functions
/// import ...` resolve against the bind-mounted compiled directory.
pub fn prelude() -> String {
    format!("import sys\n\nsys.path.insert(0, \"{COMPILED_MOUNT}\")\n")
}

/// Removes the container on drop, covering success, failure, and
/// cancellation alike.
struct ContainerGuard {
    docker_bin: String,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let _ = std::process::Command::new(&self.docker_bin)
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

fn container_name() -> String {
    format!("mfp-run-{:016x}", rand::random::<u64>())
}

/// Run one payload (prelude + snippet) in a fresh container.
///
/// On timeout the container is killed, partial output is returned when
/// available, and `timed_out` is set; the caller maps that to its own error
/// taxonomy. The container is removed before this function returns.
pub async fn run_snippet(config: &SandboxConfig, payload: &str) -> Result<SandboxOutput> {
    let started = Instant::now();
    let name = container_name();
    let _guard = ContainerGuard {
        docker_bin: config.docker_bin.clone(),
        name: name.clone(),
    };

    let mut cmd = tokio::process::Command::new(&config.docker_bin);
    cmd.arg("run")
        .args(["--name", &name])
        .arg("-i")
        // Mandatory resource and privilege constraints.
        .args(["--memory", "256m"])
        .args(["--memory-swap", "256m"])
        .args(["--cpus", "0.5"])
        .args(["--security-opt", "no-new-privileges"])
        .arg("--read-only")
        .args(["--tmpfs", "/tmp:rw,size=64m"])
        .args(["--user", "1000:1000"])
        .args(["--network", &config.network]);

    // The compiled-library bind is the only mount.
    cmd.args([
        "-v",
        &format!("{}:{COMPILED_MOUNT}:ro", config.compiled_dir.display()),
    ]);
    for (key, value) in &config.env {
        cmd.args(["-e", &format!("{key}={value}")]);
    }
    cmd.arg(&config.image).args(["python3", "-u", "-"]);

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {} run", config.docker_bin))?;

    // Drain both pipes concurrently before writing stdin, so a chatty
    // container cannot deadlock the write.
    let mut stdout_pipe = child.stdout.take().context("container stdout missing")?;
    let mut stderr_pipe = child.stderr.take().context("container stderr missing")?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let mut stdin = child.stdin.take().context("container stdin missing")?;
    stdin
        .write_all(payload.as_bytes())
        .await
        .context("failed to send code to container")?;
    stdin.shutdown().await.context("failed to close container stdin")?;
    drop(stdin);

    let (exit_code, timed_out) = match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("failed to wait for container")?;
            (status.code().unwrap_or(-1), false)
        }
        Err(_) => {
            // Wall clock exhausted: kill the container, then the client.
            let _ = tokio::process::Command::new(&config.docker_bin)
                .args(["kill", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            let _ = child.kill().await;
            let _ = child.wait().await;
            (-1, true)
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

    Ok(SandboxOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_points_at_compiled_mount() {
        let p = prelude();
        assert!(p.contains("sys.path.insert"));
        assert!(p.contains(COMPILED_MOUNT));
    }

    #[test]
    fn container_names_are_unique() {
        let a = container_name();
        let b = container_name();
        assert!(a.starts_with("mfp-run-"));
        assert_ne!(a, b);
    }
}
