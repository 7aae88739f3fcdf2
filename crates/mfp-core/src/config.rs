//! Runtime configuration.
//!
//! [`MfpConfig`] is a plain value built once (environment plus the TOML
//! sources file) and passed down by reference; nothing in the engine reads
//! configuration globals, and only the vault touches credential variables.
//!
//! Every `MFP_*` knob has a default, so a bare environment yields a working
//! config. Malformed values are a [`MfpError::Config`], which the CLI maps
//! to exit code 2.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::report::LogLevel;
use mfp_policy::{DEFAULT_MAX_CODE_SIZE_BYTES, Policy};
use mfp_types::{MfpError, SwaggerSource};

/// Default sources file, next to the working directory.
pub const DEFAULT_SOURCES_FILE: &str = "mfp.toml";
/// Default compiled-output directory.
pub const DEFAULT_COMPILED_DIR: &str = "compiled";
/// Default state directory (cache db, event log).
pub const DEFAULT_STATE_DIR: &str = ".mfp";
/// Default execution wall-clock budget, in seconds.
pub const DEFAULT_EXECUTION_TIMEOUT_SECONDS: u64 = 30;

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct MfpConfig {
    pub log_level: LogLevel,
    pub sources_file: PathBuf,
    pub compiled_dir: PathBuf,
    pub state_dir: PathBuf,
    pub docker_bin: String,
    pub docker_image: String,
    pub docker_network: String,
    /// Linter binary; empty disables the lint pass.
    pub lint_bin: String,
    pub execution_timeout: Duration,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub cache_db_path: PathBuf,
    pub max_code_size_bytes: usize,
    pub allowed_domains: Vec<String>,
    /// Parsed sources file.
    pub servers: Vec<SwaggerSource>,
}

impl Default for MfpConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
        Self {
            log_level: LogLevel::default(),
            sources_file: PathBuf::from(DEFAULT_SOURCES_FILE),
            compiled_dir: PathBuf::from(DEFAULT_COMPILED_DIR),
            cache_db_path: state_dir.join("cache.db"),
            state_dir,
            docker_bin: "docker".to_string(),
            docker_image: mfp_sandbox::DEFAULT_IMAGE.to_string(),
            docker_network: "none".to_string(),
            lint_bin: "ruff".to_string(),
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECONDS),
            cache_enabled: true,
            cache_ttl_seconds: mfp_cache::DEFAULT_TTL_SECONDS,
            cache_max_entries: mfp_cache::DEFAULT_MAX_ENTRIES,
            max_code_size_bytes: DEFAULT_MAX_CODE_SIZE_BYTES,
            allowed_domains: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl MfpConfig {
    /// Build the config from `MFP_*` environment variables and load the
    /// sources file if it exists.
    pub fn from_env() -> Result<Self, MfpError> {
        let mut config = Self::default();

        if let Some(level) = env_string("MFP_LOG_LEVEL") {
            config.log_level = level.parse().map_err(MfpError::Config)?;
        }
        if let Some(path) = env_string("MFP_SOURCES_FILE") {
            config.sources_file = PathBuf::from(path);
        }
        if let Some(dir) = env_string("MFP_COMPILED_OUTPUT_DIR") {
            config.compiled_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("MFP_STATE_DIR") {
            config.state_dir = PathBuf::from(&dir);
            config.cache_db_path = PathBuf::from(dir).join("cache.db");
        }
        if let Some(path) = env_string("MFP_CACHE_DB_PATH") {
            config.cache_db_path = PathBuf::from(path);
        }
        if let Some(bin) = env_string("MFP_DOCKER_BIN") {
            config.docker_bin = bin;
        }
        if let Some(image) = env_string("MFP_DOCKER_IMAGE") {
            config.docker_image = image;
        }
        if let Some(network) = env_string("MFP_DOCKER_NETWORK") {
            config.docker_network = network;
        }
        if let Some(bin) = env_var_allow_empty("MFP_LINT_BIN") {
            config.lint_bin = bin;
        }
        if let Some(secs) = env_parse::<u64>("MFP_EXECUTION_TIMEOUT_SECONDS")? {
            config.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_bool("MFP_CACHE_ENABLED")? {
            config.cache_enabled = enabled;
        }
        if let Some(ttl) = env_parse::<u64>("MFP_CACHE_TTL_SECONDS")? {
            config.cache_ttl_seconds = ttl;
        }
        if let Some(max) = env_parse::<usize>("MFP_CACHE_MAX_ENTRIES")? {
            config.cache_max_entries = max;
        }
        if let Some(max) = env_parse::<usize>("MFP_MAX_CODE_SIZE_BYTES")? {
            config.max_code_size_bytes = max;
        }
        if let Some(domains) = env_string("MFP_ALLOWED_DOMAINS") {
            config.allowed_domains = domains
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }

        config.servers = load_sources(&config.sources_file)?;
        Ok(config)
    }

    /// Policy instance derived from this config.
    pub fn policy(&self) -> Policy {
        Policy::new(self.max_code_size_bytes, self.allowed_domains.clone())
    }

    /// Vault primed with the sources-file fallbacks.
    pub fn vault(&self) -> mfp_vault::Vault {
        let mut vault = mfp_vault::Vault::new();
        for source in &self.servers {
            vault.register(
                &source.name,
                mfp_vault::ServerCredentials {
                    base_url: source.base_url.clone(),
                    auth_header: source.auth_header.clone(),
                },
            );
        }
        vault
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    servers: Vec<SwaggerSource>,
}

/// Load and validate the sources file. A missing file at the default
/// location is an empty server list, not an error.
pub fn load_sources(path: &Path) -> Result<Vec<SwaggerSource>, MfpError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        MfpError::Config(format!("failed to read sources file {}: {e}", path.display()))
    })?;
    let file: SourcesFile = toml::from_str(&content).map_err(|e| {
        MfpError::Config(format!("failed to parse sources file {}: {e}", path.display()))
    })?;

    let mut seen = std::collections::BTreeSet::new();
    for server in &file.servers {
        if server.name != mfp_swagger::sanitize_identifier(&server.name) {
            return Err(MfpError::Config(format!(
                "server name {:?} is not a valid identifier",
                server.name
            )));
        }
        if !seen.insert(server.name.clone()) {
            return Err(MfpError::Config(format!(
                "duplicate server name {:?} in sources file",
                server.name
            )));
        }
        if server.swagger_url.is_none() && server.path.is_none() {
            return Err(MfpError::Config(format!(
                "server {:?} declares neither swagger_url nor path",
                server.name
            )));
        }
    }
    Ok(file.servers)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Like [`env_string`], but an explicitly empty value is meaningful (it
/// disables the lint pass).
fn env_var_allow_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, MfpError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| MfpError::Config(format!("invalid value {raw:?} for {key}"))),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, MfpError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(MfpError::Config(format!("invalid value {other:?} for {key}"))),
        },
    }
}
