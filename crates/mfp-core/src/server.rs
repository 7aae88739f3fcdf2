//! The four meta-tools and their transport glue.
//!
//! Exactly four operations are exposed regardless of how many endpoints the
//! compiled APIs carry: `list_servers`, `get_function`, `execute_code`, and
//! `get_cached_code`. Each returns a plain dictionary and never raises;
//! anything that escapes the underlying components is converted to
//! `{error, error_type: "internal"}`.
//!
//! Two transports ship here: newline-delimited JSON over stdio, and
//! `POST /tools/{name}` over HTTP. The MCP envelope itself is the client's
//! concern; both transports speak `{tool, arguments}` dictionaries.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::executor::Executor;
use mfp_cache::SnippetCache;
use mfp_registry::Registry;
use mfp_types::{ErrorType, FunctionInfo, MfpError};

/// Tool names, in the order they are advertised.
pub const TOOL_NAMES: &[&str] =
    &["list_servers", "get_function", "execute_code", "get_cached_code"];

/// Default row cap for `get_cached_code`.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Wires the four tools to the registry, cache, and executor.
pub struct ToolHandler {
    registry: Arc<Registry>,
    cache: Option<Arc<SnippetCache>>,
    executor: Executor,
}

impl ToolHandler {
    pub fn new(
        registry: Arc<Registry>,
        cache: Option<Arc<SnippetCache>>,
        executor: Executor,
    ) -> Self {
        Self { registry, cache, executor }
    }

    /// Dispatch one tool call by name. Unknown tools and bad arguments come
    /// back as error dictionaries, never as panics or transport errors.
    pub async fn dispatch(&self, tool: &str, arguments: &Value) -> Value {
        match tool {
            "list_servers" => self.list_servers(),
            "get_function" => {
                let server = arguments.get("server").and_then(Value::as_str);
                let name = arguments.get("name").and_then(Value::as_str);
                match (server, name) {
                    (Some(server), Some(name)) => self.get_function(server, name),
                    _ => argument_error("get_function requires string arguments `server` and `name`"),
                }
            }
            "execute_code" => {
                let code = arguments.get("code").and_then(Value::as_str);
                let description = arguments
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match code {
                    Some(code) => self.execute_code(code, description).await,
                    None => argument_error("execute_code requires a string argument `code`"),
                }
            }
            "get_cached_code" => {
                let search = arguments
                    .get("search")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let limit = arguments
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l as usize)
                    .unwrap_or(DEFAULT_SEARCH_LIMIT);
                self.get_cached_code(search, limit)
            }
            other => argument_error(&format!("unknown tool {other:?}")),
        }
    }

    /// Compact summary of every compiled server.
    pub fn list_servers(&self) -> Value {
        let servers: Vec<Value> = self
            .registry
            .list_servers()
            .into_iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "summary": s.summary,
                    "functions": s.functions,
                    "function_count": s.function_count,
                })
            })
            .collect();
        json!({ "servers": servers })
    }

    /// Full signature, parameter docs, usage example, and source excerpt for
    /// one function.
    pub fn get_function(&self, server: &str, name: &str) -> Value {
        match self.registry.get_function(server, name) {
            Ok(info) => {
                let usage_example = usage_example(server, &info);
                match serde_json::to_value(&info) {
                    Ok(mut value) => {
                        value["usage_example"] = Value::String(usage_example);
                        value
                    }
                    Err(e) => internal_error(&MfpError::Internal(e.to_string())),
                }
            }
            Err(e) => internal_error(&e),
        }
    }

    /// Run a snippet through the execution state machine.
    pub async fn execute_code(&self, code: &str, description: &str) -> Value {
        let result = self.executor.execute(code, description).await;
        serde_json::to_value(&result)
            .unwrap_or_else(|e| internal_error(&MfpError::Internal(e.to_string())))
    }

    /// Search previously successful snippets by description.
    pub fn get_cached_code(&self, search: &str, limit: usize) -> Value {
        let Some(cache) = &self.cache else {
            return json!({ "entries": [] });
        };
        match cache.search(search, limit) {
            Ok(entries) => {
                let rows: Vec<Value> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "id": e.id,
                            "code": e.code,
                            "description": e.description,
                            "servers_used": e.servers_used,
                            "result_summary": e.result_summary,
                            "use_count": e.use_count,
                            "last_used_at": e.last_used_at,
                        })
                    })
                    .collect();
                json!({ "entries": rows })
            }
            Err(e) => internal_error(&MfpError::Internal(format!("cache search failed: {e:#}"))),
        }
    }
}

fn usage_example(server: &str, info: &FunctionInfo) -> String {
    let args: Vec<String> = info
        .parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| format!("{}=...", p.name))
        .collect();
    format!(
        "from {server}.functions import {name}\n\nresult = {name}({args})\nprint(result)\n",
        name = info.name,
        args = args.join(", ")
    )
}

fn argument_error(message: &str) -> Value {
    json!({ "error": message, "error_type": ErrorType::Internal.as_str() })
}

fn internal_error(e: &MfpError) -> Value {
    json!({ "error": e.to_string(), "error_type": e.error_type().as_str() })
}

/// One request line on the stdio transport.
#[derive(Debug, serde::Deserialize)]
struct StdioRequest {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

/// Serve newline-delimited JSON over stdin/stdout until EOF.
pub async fn serve_stdio(handler: Arc<ToolHandler>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<StdioRequest>(&line) {
            Ok(request) => handler.dispatch(&request.tool, &request.arguments).await,
            Err(e) => argument_error(&format!("invalid request line: {e}")),
        };
        let mut payload = serde_json::to_string(&response).context("serialize response")?;
        payload.push('\n');
        stdout
            .write_all(payload.as_bytes())
            .await
            .context("failed to write response")?;
        stdout.flush().await.context("failed to flush stdout")?;
    }
    Ok(())
}

/// Serve `POST /tools/{name}` over HTTP.
pub async fn serve_http(handler: Arc<ToolHandler>, host: &str, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/tools/{name}", post(call_tool))
        .with_state(handler);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}

async fn call_tool(
    State(handler): State<Arc<ToolHandler>>,
    AxumPath(name): AxumPath<String>,
    body: String,
) -> Json<Value> {
    let arguments = if body.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(e) => return Json(argument_error(&format!("invalid request body: {e}"))),
        }
    };
    Json(handler.dispatch(&name, &arguments).await)
}
