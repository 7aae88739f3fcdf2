//! Code generation: [`ServerSpec`] to a Python function library.
//!
//! The mapping is pure and deterministic: identical input produces byte-wise
//! identical output, which is what lets the orchestrator skip unchanged
//! sources by hash alone.
//!
//! Each generated library contains a banner, a private header builder that
//! reads `MFP_{SERVER}_BASE_URL` / `MFP_{SERVER}_AUTH` from the process
//! environment, a private request helper, and one public function per
//! endpoint (required parameters first). Auth values never appear textually
//! in the output; only the environment variable names do.

use std::fmt::Write as _;

use mfp_types::{
    EndpointSpec, FunctionInfo, ParamInfo, ParamLocation, ParamSpec, ReturnsInfo, ServerSpec,
};
use mfp_vault::{auth_var, base_url_var};

/// First line of every generated file.
pub const BANNER: &str = "# GENERATED -- DO NOT EDIT.";

/// Request timeout baked into generated libraries, in seconds.
const REQUEST_TIMEOUT_SECS: u32 = 30;

/// Content of the `__init__.py` package marker.
pub fn package_init(server_name: &str) -> String {
    format!("{BANNER}\n# Package marker for the `{server_name}` server library.\n")
}

/// Human-readable signature of one endpoint, shared between generated code
/// and the manifest.
pub fn function_signature(endpoint: &EndpointSpec) -> String {
    let args: Vec<String> = endpoint
        .ordered_parameters()
        .iter()
        .map(|p| {
            if p.required {
                p.name.clone()
            } else {
                format!("{}={}", p.name, python_literal(p.default.as_ref()))
            }
        })
        .collect();
    format!("{}({})", endpoint.operation_id, args.join(", "))
}

/// Manifest entries for every endpoint, consistent with the emitted library.
pub fn function_infos(spec: &ServerSpec) -> Vec<FunctionInfo> {
    spec.endpoints
        .iter()
        .map(|endpoint| FunctionInfo {
            name: endpoint.operation_id.clone(),
            signature: function_signature(endpoint),
            parameters: endpoint
                .ordered_parameters()
                .iter()
                .map(|p| ParamInfo {
                    name: p.name.clone(),
                    param_type: p.param_type.clone(),
                    required: p.required,
                    default: p.default.clone(),
                    description: p.description.clone(),
                })
                .collect(),
            returns: returns_info(endpoint),
            summary: endpoint.summary.clone(),
            source_excerpt: None,
        })
        .collect()
}

/// Emit the complete function library for one server.
pub fn generate_library(spec: &ServerSpec) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{BANNER}");
    let _ = writeln!(out, "# Function library for the `{}` server.", spec.name);
    let _ = writeln!(out, "\"\"\"Callable client functions for {}.\"\"\"", spec.name);
    let _ = writeln!(out);
    let _ = writeln!(out, "import os");
    let _ = writeln!(out);
    let _ = writeln!(out, "import requests");
    let _ = writeln!(out);
    let _ = writeln!(out);
    let _ = writeln!(out, "def _base_url():");
    let _ = writeln!(
        out,
        "    return os.environ.get(\"{}\", \"{}\").rstrip(\"/\")",
        base_url_var(&spec.name),
        spec.base_url
    );
    let _ = writeln!(out);
    let _ = writeln!(out);
    let _ = writeln!(out, "def _base_headers():");
    let _ = writeln!(out, "    headers = {{\"Accept\": \"application/json\"}}");
    let _ = writeln!(
        out,
        "    auth = os.environ.get(\"{}\", \"\")",
        auth_var(&spec.name)
    );
    let _ = writeln!(out, "    if auth:");
    let _ = writeln!(out, "        headers[\"Authorization\"] = auth");
    let _ = writeln!(out, "    return headers");
    let _ = writeln!(out);
    let _ = writeln!(out);
    let _ = writeln!(out, "def _request(method, path, params=None, headers=None, json_body=None):");
    let _ = writeln!(out, "    merged = _base_headers()");
    let _ = writeln!(out, "    if headers:");
    let _ = writeln!(out, "        merged.update(headers)");
    let _ = writeln!(out, "    response = requests.request(");
    let _ = writeln!(out, "        method,");
    let _ = writeln!(out, "        _base_url() + path,");
    let _ = writeln!(out, "        params=params,");
    let _ = writeln!(out, "        headers=merged,");
    let _ = writeln!(out, "        json=json_body,");
    let _ = writeln!(out, "        timeout={REQUEST_TIMEOUT_SECS},");
    let _ = writeln!(out, "    )");
    let _ = writeln!(out, "    response.raise_for_status()");
    let _ = writeln!(
        out,
        "    if \"application/json\" in response.headers.get(\"Content-Type\", \"\"):"
    );
    let _ = writeln!(out, "        return response.json()");
    let _ = writeln!(out, "    return response.text");

    for endpoint in &spec.endpoints {
        out.push('\n');
        out.push('\n');
        emit_function(&mut out, endpoint);
    }

    out
}

fn emit_function(out: &mut String, endpoint: &EndpointSpec) {
    let ordered = endpoint.ordered_parameters();

    let _ = writeln!(out, "def {}:", function_signature(endpoint));
    emit_docstring(out, endpoint, &ordered);

    // Path template keyed by wire names, filled from sanitized locals.
    if endpoint.path.contains('{') {
        let path_args: Vec<String> = ordered
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
            .map(|p| format!("\"{}\": {}", p.wire_name, p.name))
            .collect();
        let _ = writeln!(
            out,
            "    _path = \"{}\".format(**{{{}}})",
            endpoint.path,
            path_args.join(", ")
        );
    } else {
        let _ = writeln!(out, "    _path = \"{}\"", endpoint.path);
    }

    let _ = writeln!(out, "    _params = {{}}");
    for p in ordered.iter().filter(|p| p.location == ParamLocation::Query) {
        emit_wire_assignment(out, "_params", p);
    }
    let _ = writeln!(out, "    _headers = {{}}");
    for p in ordered.iter().filter(|p| p.location == ParamLocation::Header) {
        emit_wire_assignment(out, "_headers", p);
    }

    let body = ordered.iter().find(|p| p.location == ParamLocation::Body);
    let body_arg = match body {
        Some(p) => format!(", json_body={}", p.name),
        None => String::new(),
    };
    let _ = writeln!(
        out,
        "    return _request(\"{}\", _path, params=_params, headers=_headers{})",
        endpoint.method, body_arg
    );
}

fn emit_wire_assignment(out: &mut String, target: &str, p: &ParamSpec) {
    if p.required {
        let _ = writeln!(out, "    {target}[\"{}\"] = {}", p.wire_name, p.name);
    } else {
        let _ = writeln!(out, "    if {} is not None:", p.name);
        let _ = writeln!(out, "        {target}[\"{}\"] = {}", p.wire_name, p.name);
    }
}

fn emit_docstring(out: &mut String, endpoint: &EndpointSpec, ordered: &[&ParamSpec]) {
    let summary = if endpoint.summary.is_empty() {
        format!("{} {}", endpoint.method, endpoint.path)
    } else {
        endpoint.summary.clone()
    };
    let _ = writeln!(out, "    \"\"\"{}", summary.replace('"', "'"));

    if !ordered.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "    Parameters:");
        for p in ordered {
            let requirement = if p.required { "required" } else { "optional" };
            if p.description.is_empty() {
                let _ = writeln!(out, "        {} ({}, {})", p.name, p.param_type, requirement);
            } else {
                let _ = writeln!(
                    out,
                    "        {} ({}, {}): {}",
                    p.name,
                    p.param_type,
                    requirement,
                    p.description.replace('"', "'")
                );
            }
        }
    }

    let returns = returns_info(endpoint);
    if !returns.type_name.is_empty() {
        let _ = writeln!(out);
        if returns.fields.is_empty() {
            let _ = writeln!(out, "    Returns: {}", returns.type_name);
        } else {
            let names: Vec<&str> = returns.fields.iter().map(|f| f.name.as_str()).collect();
            let _ = writeln!(out, "    Returns: {} ({})", returns.type_name, names.join(", "));
        }
    }
    let _ = writeln!(out, "    \"\"\"");
}

/// Return shape derived from the first 2xx response.
fn returns_info(endpoint: &EndpointSpec) -> ReturnsInfo {
    let success = endpoint
        .responses
        .iter()
        .find(|(status, _)| status.starts_with('2'));
    match success {
        Some((_, response)) => {
            let type_name = if response.fields.is_empty() {
                if response.description.is_empty() {
                    "object".to_string()
                } else {
                    response.description.clone()
                }
            } else {
                "object".to_string()
            };
            ReturnsInfo { type_name, fields: response.fields.clone() }
        }
        None => ReturnsInfo::default(),
    }
}

/// Render a JSON default as a Python literal. Unrepresentable values degrade
/// to `None`.
fn python_literal(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "None".to_string(),
        Some(serde_json::Value::Bool(true)) => "True".to_string(),
        Some(serde_json::Value::Bool(false)) => "False".to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Some(_) => "None".to_string(),
    }
}
