use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

const WEATHER_DOC: &str = r##"{
    "openapi": "3.0.0",
    "info": {"title": "Weather API"},
    "paths": {
        "/forecast/{city}": {
            "get": {
                "operationId": "get_forecast",
                "summary": "Current forecast",
                "parameters": [
                    {"name": "city", "in": "path", "required": true, "schema": {"type": "string"}}
                ],
                "responses": {"200": {"description": "ok"}}
            }
        },
        "/report": {
            "post": {"operationId": "post_report", "responses": {"201": {"description": "created"}}}
        }
    }
}"##;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

/// Workspace with a sources file pointing at a local swagger document.
fn setup(root: &Path, read_only: bool) {
    write_file(&root.join("weather.json"), WEATHER_DOC);
    write_file(
        &root.join("mfp.toml"),
        &format!(
            r#"
[[servers]]
name = "weather"
path = "{}"
base_url = "https://api.example.com"
is_read_only = {read_only}
"#,
            root.join("weather.json").display()
        ),
    );
}

fn mfp(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("mfp").expect("binary");
    cmd.current_dir(root)
        .env("MFP_SOURCES_FILE", root.join("mfp.toml"))
        .env("MFP_COMPILED_OUTPUT_DIR", root.join("compiled"))
        .env("MFP_STATE_DIR", root.join(".mfp"))
        .env("MFP_LINT_BIN", "")
        .env("MFP_CACHE_ENABLED", "true")
        .env("MFP_CACHE_DB_PATH", root.join(".mfp/cache.db"));
    cmd
}

#[test]
fn compile_generates_library_and_manifest() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);

    mfp(td.path())
        .args(["compile"])
        .assert()
        .success()
        .stderr(contains("weather: generated 2 function(s)"))
        .stderr(contains("1 generated, 0 skipped, 0 failed"));

    let server_dir = td.path().join("compiled/weather");
    assert!(server_dir.join("functions.py").is_file());
    assert!(server_dir.join("manifest.json").is_file());
    assert!(server_dir.join("__init__.py").is_file());
}

#[test]
fn second_compile_skips_unchanged_sources() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);

    mfp(td.path()).args(["compile"]).assert().success();
    mfp(td.path())
        .args(["compile"])
        .assert()
        .success()
        .stderr(contains("weather: unchanged, skipping"))
        .stderr(contains("0 generated, 1 skipped, 0 failed"));
}

#[test]
fn read_only_source_drops_mutating_endpoints() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), true);

    mfp(td.path())
        .args(["compile"])
        .assert()
        .success()
        .stderr(contains("generated 1 function(s)"));

    let library =
        fs::read_to_string(td.path().join("compiled/weather/functions.py")).expect("library");
    assert!(library.contains("get_forecast"));
    assert!(!library.contains("post_report"));
}

#[test]
fn dry_run_writes_nothing() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);

    mfp(td.path()).args(["compile", "--dry-run"]).assert().success();
    assert!(!td.path().join("compiled").exists());
}

#[test]
fn broken_source_exits_one() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);
    write_file(&td.path().join("weather.json"), "{\"title\": \"no version marker\"}");

    mfp(td.path()).args(["compile"]).assert().code(1);
}

#[test]
fn duplicate_sources_exit_two() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);
    let doc = td.path().join("weather.json").display().to_string();
    write_file(
        &td.path().join("mfp.toml"),
        &format!(
            r#"
[[servers]]
name = "weather"
path = "{doc}"
base_url = "https://a"

[[servers]]
name = "weather"
path = "{doc}"
base_url = "https://b"
"#
        ),
    );

    mfp(td.path())
        .args(["compile"])
        .assert()
        .code(2)
        .stderr(contains("duplicate server name"));
}

#[test]
fn malformed_environment_exits_two() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);

    mfp(td.path())
        .args(["compile"])
        .env("MFP_EXECUTION_TIMEOUT_SECONDS", "soon")
        .assert()
        .code(2)
        .stderr(contains("MFP_EXECUTION_TIMEOUT_SECONDS"));
}

#[test]
fn serve_stdio_answers_discovery_tools() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);
    mfp(td.path()).args(["compile"]).assert().success();

    let requests = concat!(
        r#"{"tool": "list_servers"}"#,
        "\n",
        r#"{"tool": "get_function", "arguments": {"server": "weather", "name": "get_forecast"}}"#,
        "\n",
        r#"{"tool": "nonsense"}"#,
        "\n",
    );

    let assert = mfp(td.path())
        .args(["serve", "--transport", "stdio"])
        .write_stdin(requests)
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "stdout: {stdout}");

    let listing: serde_json::Value = serde_json::from_str(lines[0]).expect("listing");
    assert_eq!(listing["servers"][0]["name"], "weather");

    let function: serde_json::Value = serde_json::from_str(lines[1]).expect("function");
    assert_eq!(function["signature"], "get_forecast(city)");
    assert!(function["usage_example"].as_str().expect("usage").contains("import get_forecast"));

    let error: serde_json::Value = serde_json::from_str(lines[2]).expect("error");
    assert_eq!(error["error_type"], "internal");
}

#[test]
fn serve_without_compiled_servers_warns() {
    let td = tempdir().expect("tempdir");
    setup(td.path(), false);

    mfp(td.path())
        .args(["serve", "--transport", "stdio"])
        .write_stdin("")
        .assert()
        .success()
        .stderr(contains("no compiled servers"));
}
