//! # Types
//!
//! Core domain types for MFP, shared by the compiler, registry, cache, and
//! executor:
//!
//! - [`SwaggerSource`] - One configured API to compile
//! - [`ServerSpec`] - Normalized output of the swagger parser
//! - [`EndpointSpec`] / [`ParamSpec`] - One callable operation and its inputs
//! - [`Manifest`] / [`FunctionInfo`] - The on-disk compiler ↔ registry contract
//! - [`CacheEntry`] - One cached, previously successful snippet
//! - [`ExecutionResult`] - What `execute_code` hands back to the caller
//! - [`MfpError`] - The error taxonomy for every failure the system names
//!
//! ## Serialization
//!
//! All persisted types implement `Serialize`/`Deserialize`. The manifest is a
//! stable cross-process interface: breaking its schema requires bumping
//! [`MANIFEST_VERSION`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version of [`Manifest`]. The registry refuses manifests written
/// with a different version.
pub const MANIFEST_VERSION: u32 = 1;

/// Generated library file inside `compiled/{server}/`.
pub const LIBRARY_FILE: &str = "functions.py";
/// Manifest file inside `compiled/{server}/`.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Package marker inside `compiled/{server}/`, so the sandbox can import
/// `{server}.functions`.
pub const PACKAGE_INIT_FILE: &str = "__init__.py";

/// One API source, as declared in the sources file. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwaggerSource {
    /// Server name. Must survive identifier sanitization unchanged.
    pub name: String,
    /// URL of the swagger document, if fetched over HTTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swagger_url: Option<String>,
    /// Local path of the swagger document, if read from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Base URL the generated library targets at runtime.
    pub base_url: String,
    /// Authorization header value; may contain `${VAR}` placeholders that the
    /// vault expands at execution time. Never embedded in generated code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    /// When true, mutating endpoints are dropped during parsing.
    #[serde(default)]
    pub is_read_only: bool,
}

/// HTTP method of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Parse a lowercase swagger path-item key (`get`, `post`, ...).
    pub fn from_swagger_key(key: &str) -> Option<Self> {
        match key {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "patch" => Some(Self::Patch),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the method can change server-side state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }

    /// Uppercase wire form (`GET`, `POST`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

/// One endpoint parameter.
///
/// `name` is sanitized to a valid identifier for the generated signature;
/// `wire_name` keeps the original spelling for URL, query, and header
/// assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Sanitized identifier used in the generated function signature.
    pub name: String,
    /// Original parameter name, used on the wire.
    pub wire_name: String,
    #[serde(rename = "in")]
    pub location: ParamLocation,
    /// Declared schema type (`string`, `integer`, `object`, ...).
    pub param_type: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// One field of a request or response schema. Nesting is at most one level;
/// anything deeper is flattened to an opaque `object` by the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<SchemaField>,
}

/// Named schema shape attached to a request body or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaShape {
    /// Schema type or resolved `$ref` target name.
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SchemaField>,
}

/// One documented response of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SchemaField>,
}

/// One callable operation of a compiled server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub operation_id: String,
    pub method: HttpMethod,
    /// Path template with `{placeholders}` as written in the document.
    pub path: String,
    #[serde(default)]
    pub summary: String,
    pub parameters: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<SchemaShape>,
    /// Status code → response, ordered for deterministic emission.
    #[serde(default)]
    pub responses: BTreeMap<String, ResponseSpec>,
}

impl EndpointSpec {
    /// Parameters with required ones first, preserving document order within
    /// each group. Every ordered emission (signatures, docstrings, manifests)
    /// goes through this.
    pub fn ordered_parameters(&self) -> Vec<&ParamSpec> {
        let required = self.parameters.iter().filter(|p| p.required);
        let optional = self.parameters.iter().filter(|p| !p.required);
        required.chain(optional).collect()
    }
}

/// Normalized output of the swagger parser for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub base_url: String,
    pub is_read_only: bool,
    /// One-line summary taken from the document's `info` block.
    #[serde(default)]
    pub summary: String,
    pub endpoints: Vec<EndpointSpec>,
    /// Hex SHA-256 of the raw document bytes; drives incremental builds.
    pub source_hash: String,
}

impl ServerSpec {
    /// Invariant check: a read-only spec carries no mutating endpoint.
    pub fn honors_read_only(&self) -> bool {
        !self.is_read_only || self.endpoints.iter().all(|e| !e.method.is_mutating())
    }
}

/// Parameter entry inside a [`FunctionInfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub param_type: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// Return shape of a generated function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnsInfo {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SchemaField>,
}

/// One public function of a compiled server, as recorded in the manifest.
///
/// `source_excerpt` is not persisted; the registry slices it lazily from the
/// generated library when answering `get_function`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    /// Human-readable signature, e.g. `get_forecast(city, units=None)`.
    pub signature: String,
    pub parameters: Vec<ParamInfo>,
    #[serde(default)]
    pub returns: ReturnsInfo,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_excerpt: Option<String>,
}

/// On-disk record of one compiled server, written next to the generated
/// library. This is the stable compiler ↔ registry interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u32,
    pub server_name: String,
    #[serde(default)]
    pub summary: String,
    pub base_url: String,
    pub generated_at: DateTime<Utc>,
    /// Hex SHA-256 of the raw swagger bytes the library was generated from.
    pub swagger_hash: String,
    /// Hex SHA-256 of the written library content (post-enhancement).
    pub library_hash: String,
    pub endpoint_count: usize,
    pub functions: Vec<FunctionInfo>,
}

/// One cached snippet. `id` is the SHA-256 of the normalized code, so
/// whitespace-variant submissions share an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub code: String,
    pub description: String,
    pub servers_used: Vec<String>,
    /// Only successful executions are cached.
    pub success: bool,
    #[serde(default)]
    pub result_summary: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; bumped on every hit.
    pub last_used_at: i64,
    pub use_count: u64,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Whether the entry is logically absent at time `now` (unix seconds).
    /// An age of exactly `ttl_seconds` is still a hit.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now - self.last_used_at > self.ttl_seconds as i64
    }
}

/// Caller-visible failure class of an execution. Serialized lowercase into
/// tool payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Security,
    Lint,
    Timeout,
    Runtime,
    Internal,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Lint => "lint",
            Self::Timeout => "timeout",
            Self::Runtime => "runtime",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `execute_code` call. Always populated; the executor never
/// raises. User code is never echoed back through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<String>,
}

impl ExecutionResult {
    /// A failed result carrying an operator-safe message.
    pub fn failure(error_type: ErrorType, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_type: Some(error_type),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            cache_id: None,
        }
    }
}

/// What the AST guard tripped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BlockedImport,
    UnknownImport,
    BlockedCall,
    DunderAccess,
    ScopeDeclaration,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BlockedImport => "blocked_import",
            Self::UnknownImport => "unknown_import",
            Self::BlockedCall => "blocked_call",
            Self::DunderAccess => "dunder_access",
            Self::ScopeDeclaration => "scope_declaration",
        };
        f.write_str(s)
    }
}

/// The full error taxonomy. Carries only operator-safe material: the
/// submitted code never appears in any variant.
#[derive(Debug, thiserror::Error)]
pub enum MfpError {
    /// Malformed top-level swagger structure.
    #[error("parse error: {reason}")]
    Parse { reason: String },
    /// A source failed to compile (including lint failures on generated
    /// files, with the linter output attached).
    #[error("compile error: {message}")]
    Compile { message: String },
    /// The linter rejected a snippet.
    #[error("lint failed:\n{output}")]
    Lint { output: String },
    /// Bad configuration or environment.
    #[error("configuration error: {0}")]
    Config(String),
    /// The AST guard rejected a snippet. `pattern` is the offending symbol,
    /// never the code itself.
    #[error("security violation: {kind} ({pattern})")]
    Security { kind: ViolationKind, pattern: String },
    /// A policy gate rejected the snippet: a hostname outside the configured
    /// allowlist, or code over the size ceiling.
    #[error("policy violation: {detail}")]
    Policy { detail: String },
    /// The sandbox exceeded its wall-clock budget.
    #[error("execution timed out after {seconds}s")]
    Timeout { seconds: u64 },
    /// The sandbox process itself failed.
    #[error("sandbox runtime failure: {0}")]
    Runtime(String),
    /// Anything else; intentionally opaque to callers.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MfpError {
    /// Caller-visible classification for tool payloads.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Security { .. } | Self::Policy { .. } => ErrorType::Security,
            Self::Lint { .. } => ErrorType::Lint,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Runtime(_) => ErrorType::Runtime,
            Self::Parse { .. } | Self::Compile { .. } | Self::Config(_) | Self::Internal(_) => {
                ErrorType::Internal
            }
        }
    }
}
