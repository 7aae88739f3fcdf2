//! # MFP core
//!
//! The engine behind the `mfp` CLI. MFP (Model Function Protocol) compiles
//! OpenAPI/Swagger documents into callable Python function libraries and
//! exposes exactly four meta-tools to an LLM client, independent of how many
//! endpoints the APIs carry: `list_servers`, `get_function`, `execute_code`,
//! and `get_cached_code`.
//!
//! ## Pipeline
//!
//! The core flow is **compile -> serve -> execute**:
//!
//! 1. [`compile::run_compile`] fetches each configured swagger source,
//!    skips unchanged ones by content hash, parses the rest into normalized
//!    server specs, generates one Python library per server, lints it, and
//!    writes library + manifest atomically.
//! 2. `serve` loads the [`mfp_registry::Registry`] and the snippet cache and
//!    exposes the four tools over stdio or HTTP ([`server`]).
//! 3. [`executor::Executor`] walks each submitted snippet through size
//!    check, AST guard, lint, credential injection, containerized execution,
//!    output parsing, and the cache.
//!
//! ## Modules
//!
//! - [`config`] - `MfpConfig` from `MFP_*` env vars plus the TOML sources file
//! - [`compile`] - The compile orchestrator and its per-source report
//! - [`executor`] - The execution state machine
//! - [`server`] - The four meta-tools and the stdio/HTTP transports
//! - [`events`] - Append-only JSONL evidence log
//! - [`report`] - `Reporter` trait and log-level filtering
//! - [`lint`] - External linter invocation shared by both pipelines

pub mod compile;
pub mod config;
pub mod events;
pub mod lint;
pub mod report;
pub mod server;

pub mod executor;

pub use config::MfpConfig;
pub use report::{LogLevel, NullReporter, Reporter, StderrReporter};
