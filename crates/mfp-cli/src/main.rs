use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use mfp_cache::SnippetCache;
use mfp_core::compile::{CompileOptions, run_compile};
use mfp_core::executor::Executor;
use mfp_core::server::{ToolHandler, serve_http, serve_stdio};
use mfp_core::{MfpConfig, Reporter, StderrReporter};
use mfp_registry::Registry;
use mfp_types::MfpError;

/// Exit code for compile failures.
const EXIT_COMPILE_FAILURE: u8 = 1;
/// Exit code for configuration errors.
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "mfp", version)]
#[command(about = "Compile swagger sources into callable libraries and serve them as four meta-tools")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile every configured swagger source into a function library.
    Compile {
        /// Parse sources only; write nothing.
        #[arg(long)]
        dry_run: bool,
        /// Run the docstring enhancement pass before writing.
        #[arg(long)]
        llm_enhance: bool,
    },
    /// Load compiled servers and serve the four meta-tools.
    Serve {
        #[arg(long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8848)]
        port: u16,
    },
    /// Compile, then serve.
    Run {
        #[arg(long, value_enum, default_value_t = Transport::Stdio)]
        transport: Transport,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8848)]
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match MfpConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[error] {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let mut reporter = StderrReporter::new(config.log_level);

    let code = match cli.cmd {
        Commands::Compile { dry_run, llm_enhance } => {
            compile(&config, dry_run, llm_enhance, &mut reporter)
        }
        Commands::Serve { transport, host, port } => {
            serve(&config, transport, &host, port, &mut reporter)
        }
        Commands::Run { transport, host, port } => {
            match compile(&config, false, false, &mut reporter) {
                0 => serve(&config, transport, &host, port, &mut reporter),
                failure => failure,
            }
        }
    };
    ExitCode::from(code)
}

fn compile(
    config: &MfpConfig,
    dry_run: bool,
    llm_enhance: bool,
    reporter: &mut StderrReporter,
) -> u8 {
    if config.servers.is_empty() {
        reporter.warn(&format!(
            "no servers configured in {}; nothing to compile",
            config.sources_file.display()
        ));
        return 0;
    }

    let options = CompileOptions { dry_run, enhance_docs: llm_enhance };
    match run_compile(config, options, reporter) {
        Ok(report) => {
            reporter.info(&format!(
                "compile finished: {} generated, {} skipped, {} failed",
                report.generated(),
                report.skipped(),
                report.failed()
            ));
            if report.is_success() { 0 } else { EXIT_COMPILE_FAILURE }
        }
        Err(e @ MfpError::Config(_)) => {
            reporter.error(&e.to_string());
            EXIT_CONFIG_ERROR
        }
        Err(e) => {
            reporter.error(&e.to_string());
            EXIT_COMPILE_FAILURE
        }
    }
}

fn serve(
    config: &MfpConfig,
    transport: Transport,
    host: &str,
    port: u16,
    reporter: &mut StderrReporter,
) -> u8 {
    let registry = match Registry::load(&config.compiled_dir) {
        Ok(registry) => registry,
        Err(e) => {
            reporter.error(&e.to_string());
            return EXIT_CONFIG_ERROR;
        }
    };
    for warning in registry.warnings() {
        reporter.warn(warning);
    }
    if registry.is_empty() {
        reporter.warn(&format!(
            "no compiled servers under {}; run `mfp compile` first",
            config.compiled_dir.display()
        ));
    } else {
        reporter.info(&format!(
            "serving {} compiled server(s): {}",
            registry.server_names().len(),
            registry.server_names().join(", ")
        ));
    }

    let cache = if config.cache_enabled {
        match SnippetCache::open(&config.cache_db_path, config.cache_max_entries) {
            Ok(cache) => {
                if let Ok(stats) = cache.stats() {
                    reporter.info(&format!(
                        "snippet cache: {} entries at {}",
                        stats.entries,
                        stats.path.display()
                    ));
                }
                Some(Arc::new(cache))
            }
            Err(e) => {
                reporter.error(&format!("failed to open snippet cache: {e:#}"));
                return EXIT_CONFIG_ERROR;
            }
        }
    } else {
        reporter.info("snippet cache disabled");
        None
    };

    let registry = Arc::new(registry);
    let executor = Executor::new(config, Arc::clone(&registry), cache.clone());
    let handler = Arc::new(ToolHandler::new(registry, cache, executor));

    match run_transport(handler, transport, host, port, reporter) {
        Ok(()) => 0,
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            EXIT_COMPILE_FAILURE
        }
    }
}

fn run_transport(
    handler: Arc<ToolHandler>,
    transport: Transport,
    host: &str,
    port: u16,
    reporter: &mut StderrReporter,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    match transport {
        Transport::Stdio => {
            reporter.info("listening on stdio");
            runtime.block_on(serve_stdio(handler))
        }
        Transport::Http => {
            reporter.info(&format!("listening on http://{host}:{port}"));
            runtime.block_on(serve_http(handler, host, port))
        }
    }
}
