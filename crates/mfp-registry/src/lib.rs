//! Registry over compiled MFP servers.
//!
//! On construction the registry scans the compiled output directory for
//! `manifest.json` files and builds its discovery indexes. It is immutable
//! after load and therefore safe to share across concurrent executions;
//! reload is a full reconstruction.
//!
//! Source excerpts are not persisted in manifests. `get_function` slices the
//! requested function out of the generated library on demand; if the library
//! cannot be sliced, the whole file is returned instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use mfp_types::{FunctionInfo, LIBRARY_FILE, MANIFEST_FILE, MANIFEST_VERSION, Manifest, MfpError};

/// Compact discovery entry for one server, as returned by `list_servers`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub summary: String,
    pub functions: Vec<String>,
    pub function_count: usize,
}

/// Immutable snapshot of every compiled server under one output directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    servers: BTreeMap<String, Manifest>,
    warnings: Vec<String>,
}

impl Registry {
    /// Scan `root` and load every valid manifest. Two manifests claiming the
    /// same server name are a configuration error.
    pub fn load(root: &Path) -> Result<Self, MfpError> {
        let mut servers = BTreeMap::new();
        let mut warnings = Vec::new();

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            // A missing output directory is an empty registry, not an error:
            // `serve` may legitimately start before the first compile.
            Err(_) => {
                return Ok(Self { root: root.to_path_buf(), servers, warnings });
            }
        };

        for entry in entries.flatten() {
            let manifest_path = entry.path().join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            let manifest = match read_manifest(&manifest_path) {
                Ok(manifest) => manifest,
                Err(reason) => {
                    warnings.push(format!("{}: {reason}", manifest_path.display()));
                    continue;
                }
            };
            if manifest.manifest_version != MANIFEST_VERSION {
                warnings.push(format!(
                    "{}: manifest version {} is not {MANIFEST_VERSION}; ignored",
                    manifest_path.display(),
                    manifest.manifest_version
                ));
                continue;
            }
            if servers.contains_key(&manifest.server_name) {
                return Err(MfpError::Config(format!(
                    "duplicate compiled server name {:?} under {}",
                    manifest.server_name,
                    root.display()
                )));
            }
            servers.insert(manifest.server_name.clone(), manifest);
        }

        Ok(Self { root: root.to_path_buf(), servers, warnings })
    }

    /// Full reconstruction from the same root.
    pub fn reload(&self) -> Result<Self, MfpError> {
        Self::load(&self.root)
    }

    /// Non-fatal problems found during the scan.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The compiled output directory this registry was loaded from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn manifest(&self, server: &str) -> Option<&Manifest> {
        self.servers.get(server)
    }

    /// Compact summaries for `list_servers`.
    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.servers
            .values()
            .map(|manifest| ServerSummary {
                name: manifest.server_name.clone(),
                summary: manifest.summary.clone(),
                functions: manifest.functions.iter().map(|f| f.name.clone()).collect(),
                function_count: manifest.functions.len(),
            })
            .collect()
    }

    /// Full record for one function, with the source excerpt sliced from the
    /// generated library.
    pub fn get_function(&self, server: &str, function: &str) -> Result<FunctionInfo, MfpError> {
        let manifest = self
            .servers
            .get(server)
            .ok_or_else(|| MfpError::Config(format!("unknown server {server:?}")))?;
        let mut info = manifest
            .functions
            .iter()
            .find(|f| f.name == function)
            .cloned()
            .ok_or_else(|| {
                MfpError::Config(format!("unknown function {function:?} on server {server:?}"))
            })?;

        let library_path = self.root.join(server).join(LIBRARY_FILE);
        if let Ok(library) = fs::read_to_string(&library_path) {
            info.source_excerpt = Some(slice_function(&library, function));
        }
        Ok(info)
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("unreadable manifest: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid manifest JSON: {e}"))
}

/// Slice one top-level `def {name}(...)` block out of a Python library.
/// Falls back to the whole file when the function cannot be located.
pub fn slice_function(library: &str, name: &str) -> String {
    let needle = format!("def {name}(");
    let lines: Vec<&str> = library.lines().collect();
    let Some(start) = lines.iter().position(|l| l.starts_with(&needle)) else {
        return library.to_string();
    };

    let end = lines[start + 1..]
        .iter()
        .position(|l| !l.is_empty() && !l.starts_with(' ') && !l.starts_with('\t'))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    let mut excerpt: Vec<&str> = lines[start..end].to_vec();
    while excerpt.last().is_some_and(|l| l.trim().is_empty()) {
        excerpt.pop();
    }
    excerpt.join("\n")
}
