//! OpenAPI 3.x / Swagger 2.0 parsing for MFP.
//!
//! Turns a raw swagger document (JSON or YAML) into a normalized
//! [`ServerSpec`]. The parser is deliberately lossy where the schema language
//! is unbounded:
//!
//! - `$ref` is resolved exactly one level; references nested inside a
//!   referenced schema are left as opaque `object`;
//! - `oneOf` / `anyOf` / `allOf` / `discriminator` are skipped with a
//!   warning;
//! - schema nesting beyond one level is flattened or omitted.
//!
//! A malformed top-level document is a [`MfpError::Parse`]. Individual
//! endpoint failures are collected as warnings and skipped so one bad
//! operation cannot take down a whole source.

use std::collections::BTreeMap;

use serde_json::Value;

use mfp_types::{
    EndpointSpec, HttpMethod, MfpError, ParamLocation, ParamSpec, ResponseSpec, SchemaField,
    SchemaShape, ServerSpec, SwaggerSource,
};

/// Parse result: the normalized spec plus non-fatal warnings for the
/// reporter.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub spec: ServerSpec,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenApi3,
    Swagger2,
}

/// Python keywords that would make a sanitized identifier unusable in a
/// generated signature.
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Sanitize a string into a valid identifier: non-identifier characters
/// become `_`, runs collapse, and the result never collides with a Python
/// keyword or starts with a digit.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    let mut ident = if trimmed.is_empty() { "param".to_string() } else { trimmed };
    if ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        ident.insert_str(0, "p_");
    }
    if PYTHON_KEYWORDS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

/// Parse raw document bytes into a normalized [`ServerSpec`].
pub fn parse_document(source: &SwaggerSource, bytes: &[u8]) -> Result<ParseOutcome, MfpError> {
    let doc = decode(bytes)?;
    let root = doc.as_object().ok_or_else(|| MfpError::Parse {
        reason: "document root is not an object".to_string(),
    })?;

    let dialect = detect_dialect(root)?;
    let schemas = named_schemas(root, dialect);
    let summary = info_summary(root);

    let mut warnings = Vec::new();
    let mut endpoints = Vec::new();

    let no_paths = serde_json::Map::new();
    let paths = match root.get("paths") {
        None => &no_paths,
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(MfpError::Parse { reason: "`paths` is not an object".to_string() });
        }
    };

    for (path, path_item) in paths {
        let Some(item) = path_item.as_object() else {
            warnings.push(format!("{}: path item {path} is not an object; skipped", source.name));
            continue;
        };
        let path_params = item
            .get("parameters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (key, operation) in item {
            let Some(method) = HttpMethod::from_swagger_key(key) else {
                continue;
            };
            if source.is_read_only && method.is_mutating() {
                warnings.push(format!(
                    "{}: dropping {method} {path} (read-only server)",
                    source.name
                ));
                continue;
            }
            match parse_operation(dialect, method, path, operation, &path_params, &schemas) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(reason) => {
                    warnings.push(format!("{}: skipping {method} {path}: {reason}", source.name));
                }
            }
        }
    }

    let spec = ServerSpec {
        name: source.name.clone(),
        base_url: source.base_url.clone(),
        is_read_only: source.is_read_only,
        summary,
        endpoints,
        source_hash: mfp_hash::sha256_hex(bytes),
    };
    debug_assert!(spec.honors_read_only());

    Ok(ParseOutcome { spec, warnings })
}

fn decode(bytes: &[u8]) -> Result<Value, MfpError> {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return Ok(value);
    }
    serde_yaml::from_slice::<Value>(bytes).map_err(|e| MfpError::Parse {
        reason: format!("document is neither valid JSON nor valid YAML: {e}"),
    })
}

fn detect_dialect(root: &serde_json::Map<String, Value>) -> Result<Dialect, MfpError> {
    if root.get("openapi").and_then(Value::as_str).is_some() {
        return Ok(Dialect::OpenApi3);
    }
    match root.get("swagger").and_then(Value::as_str) {
        Some("2.0") => Ok(Dialect::Swagger2),
        Some(other) => Err(MfpError::Parse {
            reason: format!("unsupported swagger version {other:?}"),
        }),
        None => Err(MfpError::Parse {
            reason: "document declares neither `openapi` nor `swagger: \"2.0\"`".to_string(),
        }),
    }
}

fn named_schemas(
    root: &serde_json::Map<String, Value>,
    dialect: Dialect,
) -> serde_json::Map<String, Value> {
    let schemas = match dialect {
        Dialect::OpenApi3 => root.get("components").and_then(|c| c.get("schemas")),
        Dialect::Swagger2 => root.get("definitions"),
    };
    schemas
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn info_summary(root: &serde_json::Map<String, Value>) -> String {
    let info = root.get("info").and_then(Value::as_object);
    let title = info
        .and_then(|i| i.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let description = info
        .and_then(|i| i.get("description"))
        .and_then(Value::as_str)
        .and_then(|d| d.lines().next())
        .unwrap_or_default();
    match (title.is_empty(), description.is_empty()) {
        (false, false) => format!("{title} - {description}"),
        (false, true) => title.to_string(),
        (true, false) => description.to_string(),
        (true, true) => String::new(),
    }
}

fn parse_operation(
    dialect: Dialect,
    method: HttpMethod,
    path: &str,
    operation: &Value,
    path_params: &[Value],
    schemas: &serde_json::Map<String, Value>,
) -> Result<EndpointSpec, String> {
    let op = operation
        .as_object()
        .ok_or_else(|| "operation is not an object".to_string())?;

    let operation_id = match op.get("operationId").and_then(Value::as_str) {
        Some(id) => sanitize_identifier(id),
        None => format!(
            "{}_{}",
            method.as_str().to_ascii_lowercase(),
            sanitize_identifier(path)
        ),
    };

    let summary = op
        .get("summary")
        .and_then(Value::as_str)
        .or_else(|| op.get("description").and_then(Value::as_str))
        .and_then(|s| s.lines().next())
        .unwrap_or_default()
        .to_string();

    // Path-level parameters first, operation-level wins on wire-name
    // collision.
    let mut merged: Vec<&Value> = Vec::new();
    let op_params = op
        .get("parameters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for param in path_params.iter().chain(op_params.iter()) {
        let name = param.get("name").and_then(Value::as_str);
        if let Some(name) = name {
            if let Some(existing) = merged
                .iter()
                .position(|p| p.get("name").and_then(Value::as_str) == Some(name))
            {
                merged[existing] = param;
                continue;
            }
        }
        merged.push(param);
    }

    let mut parameters = Vec::new();
    let mut request_body: Option<SchemaShape> = None;

    for param in merged {
        let obj = param
            .as_object()
            .ok_or_else(|| "parameter is not an object".to_string())?;
        let wire_name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| "parameter without a name".to_string())?;
        let location = obj.get("in").and_then(Value::as_str).unwrap_or("query");

        if dialect == Dialect::Swagger2 && location == "body" {
            let shape = obj
                .get("schema")
                .map(|s| resolve_schema(s, schemas))
                .unwrap_or_else(|| SchemaShape { type_name: "object".to_string(), fields: vec![] });
            parameters.push(body_param(
                wire_name,
                &shape,
                obj.get("required").and_then(Value::as_bool).unwrap_or(false),
                obj.get("description").and_then(Value::as_str).unwrap_or_default(),
            ));
            request_body = Some(shape);
            continue;
        }

        let location = match location {
            "path" => ParamLocation::Path,
            "header" => ParamLocation::Header,
            "query" => ParamLocation::Query,
            other => return Err(format!("unsupported parameter location {other:?}")),
        };
        let schema = match dialect {
            Dialect::OpenApi3 => obj.get("schema").cloned().unwrap_or(Value::Null),
            Dialect::Swagger2 => param.clone(),
        };
        let param_type = schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string")
            .to_string();

        parameters.push(ParamSpec {
            name: sanitize_identifier(wire_name),
            wire_name: wire_name.to_string(),
            location,
            param_type,
            // Path parameters are always required on the wire.
            required: location == ParamLocation::Path
                || obj.get("required").and_then(Value::as_bool).unwrap_or(false),
            default: schema.get("default").cloned(),
            description: obj
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    if dialect == Dialect::OpenApi3 {
        if let Some(body) = op.get("requestBody").and_then(Value::as_object) {
            let schema = body
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.values().next())
                .and_then(|media| media.get("schema"));
            let shape = schema
                .map(|s| resolve_schema(s, schemas))
                .unwrap_or_else(|| SchemaShape { type_name: "object".to_string(), fields: vec![] });
            parameters.push(body_param(
                "body",
                &shape,
                body.get("required").and_then(Value::as_bool).unwrap_or(false),
                body.get("description").and_then(Value::as_str).unwrap_or_default(),
            ));
            request_body = Some(shape);
        }
    }

    let mut responses = BTreeMap::new();
    if let Some(resp_map) = op.get("responses").and_then(Value::as_object) {
        for (status, response) in resp_map {
            let description = response
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let schema = match dialect {
                Dialect::OpenApi3 => response
                    .get("content")
                    .and_then(Value::as_object)
                    .and_then(|content| content.values().next())
                    .and_then(|media| media.get("schema")),
                Dialect::Swagger2 => response.get("schema"),
            };
            let fields = schema
                .map(|s| resolve_schema(s, schemas).fields)
                .unwrap_or_default();
            responses.insert(status.clone(), ResponseSpec { description, fields });
        }
    }

    Ok(EndpointSpec {
        operation_id,
        method,
        path: path.to_string(),
        summary,
        parameters,
        request_body,
        responses,
    })
}

fn body_param(wire_name: &str, shape: &SchemaShape, required: bool, description: &str) -> ParamSpec {
    ParamSpec {
        name: sanitize_identifier(wire_name),
        wire_name: wire_name.to_string(),
        location: ParamLocation::Body,
        param_type: shape.type_name.clone(),
        required,
        default: None,
        description: description.to_string(),
    }
}

/// Resolve a schema value into a [`SchemaShape`], following `$ref` exactly
/// one level. Composition keywords are skipped (the shape degrades to an
/// opaque `object`).
fn resolve_schema(schema: &Value, schemas: &serde_json::Map<String, Value>) -> SchemaShape {
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        let name = reference.rsplit('/').next().unwrap_or(reference);
        return match schemas.get(name) {
            Some(resolved) => SchemaShape {
                type_name: name.to_string(),
                fields: schema_fields(resolved, true),
            },
            None => SchemaShape { type_name: "object".to_string(), fields: vec![] },
        };
    }
    if is_composition(schema) {
        return SchemaShape { type_name: "object".to_string(), fields: vec![] };
    }
    let type_name = schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("object")
        .to_string();
    SchemaShape { type_name, fields: schema_fields(schema, true) }
}

fn is_composition(schema: &Value) -> bool {
    ["oneOf", "anyOf", "allOf", "discriminator"]
        .iter()
        .any(|k| schema.get(k).is_some())
}

/// Fields of an object (or array-of-object) schema. `allow_nested` grants the
/// single permitted nesting level; anything deeper is omitted. References at
/// this depth are left as opaque `object`.
fn schema_fields(schema: &Value, allow_nested: bool) -> Vec<SchemaField> {
    let properties = match schema.get("type").and_then(Value::as_str) {
        Some("array") => schema.get("items").and_then(|i| i.get("properties")),
        _ => schema.get("properties"),
    };
    let Some(props) = properties.and_then(Value::as_object) else {
        return Vec::new();
    };

    props
        .iter()
        .map(|(name, prop)| {
            let is_ref = prop.get("$ref").is_some();
            let field_type = if is_ref || is_composition(prop) {
                "object".to_string()
            } else {
                prop.get("type").and_then(Value::as_str).unwrap_or("object").to_string()
            };
            let nested = if allow_nested && !is_ref && field_type == "object" {
                schema_fields(prop, false)
            } else {
                Vec::new()
            };
            SchemaField {
                name: name.clone(),
                field_type,
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                nested,
            }
        })
        .collect()
}
