//! Credential vault for MFP.
//!
//! The vault is the only component permitted to read auth material from the
//! process environment. Everything else receives credentials as an already
//! built environment map for the sandbox, and nothing downstream is allowed
//! to echo those values anywhere.
//!
//! Resolution order per server, mirroring token lookup in release tooling:
//! `MFP_{SERVER}_BASE_URL` / `MFP_{SERVER}_AUTH` from the environment first,
//! then the fallbacks registered from the sources file (with `${VAR}`
//! placeholders expanded against the environment).

use std::collections::BTreeMap;
use std::env;

use mfp_types::MfpError;

/// Per-server fallback credentials taken from the sources file.
#[derive(Debug, Clone, Default)]
pub struct ServerCredentials {
    /// Base URL handed to the generated library when the env var is unset.
    pub base_url: String,
    /// Auth header template; may contain `${VAR}` placeholders.
    pub auth_header: Option<String>,
}

/// Builds sandbox environment maps from process env plus configured
/// fallbacks.
#[derive(Debug, Clone, Default)]
pub struct Vault {
    fallbacks: BTreeMap<String, ServerCredentials>,
}

/// Environment prefix for a server name: uppercased, `-` mapped to `_`.
pub fn env_prefix(server_name: &str) -> String {
    let upper: String = server_name
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    format!("MFP_{upper}")
}

/// Name of the base-URL variable for a server.
pub fn base_url_var(server_name: &str) -> String {
    format!("{}_BASE_URL", env_prefix(server_name))
}

/// Name of the auth variable for a server.
pub fn auth_var(server_name: &str) -> String {
    format!("{}_AUTH", env_prefix(server_name))
}

/// Expand `${VAR}` placeholders against the process environment.
///
/// An unresolved reference or an unterminated placeholder is a
/// [`MfpError::Config`]; partial expansion is never returned.
pub fn expand(value: &str) -> Result<String, MfpError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(MfpError::Config(format!(
                "unterminated ${{...}} placeholder in value starting at byte {start}"
            )));
        };
        let var = &after[..end];
        match env::var(var) {
            Ok(resolved) => out.push_str(&resolved),
            Err(_) => {
                return Err(MfpError::Config(format!(
                    "environment variable {var} referenced by ${{{var}}} is not set"
                )));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register sources-file fallbacks for a server.
    pub fn register(&mut self, server_name: &str, credentials: ServerCredentials) {
        self.fallbacks.insert(server_name.to_string(), credentials);
    }

    /// Build the environment map injected into the sandbox for one server.
    ///
    /// Returns `(name, value)` pairs for whatever could be resolved; a server
    /// with no env vars and no fallback yields an empty map, and the snippet
    /// fails inside the sandbox at call time instead.
    pub fn build_server_env(&self, server_name: &str) -> Result<Vec<(String, String)>, MfpError> {
        let mut pairs = Vec::with_capacity(2);
        let fallback = self.fallbacks.get(server_name);

        let base_key = base_url_var(server_name);
        match env::var(&base_key) {
            Ok(value) => pairs.push((base_key, value)),
            Err(_) => {
                if let Some(f) = fallback.filter(|f| !f.base_url.is_empty()) {
                    pairs.push((base_key, f.base_url.clone()));
                }
            }
        }

        let auth_key = auth_var(server_name);
        match env::var(&auth_key) {
            Ok(value) => pairs.push((auth_key, value)),
            Err(_) => {
                if let Some(template) = fallback.and_then(|f| f.auth_header.as_deref()) {
                    pairs.push((auth_key, expand(template)?));
                }
            }
        }

        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn prefix_uppercases_and_maps_hyphens() {
        assert_eq!(env_prefix("weather"), "MFP_WEATHER");
        assert_eq!(env_prefix("pet-store"), "MFP_PET_STORE");
        assert_eq!(base_url_var("weather"), "MFP_WEATHER_BASE_URL");
        assert_eq!(auth_var("weather"), "MFP_WEATHER_AUTH");
    }

    #[test]
    #[serial]
    fn expand_resolves_placeholders() {
        temp_env::with_var("MFP_TEST_TOKEN", Some("s3cret"), || {
            let expanded = expand("Bearer ${MFP_TEST_TOKEN}").expect("expand");
            assert_eq!(expanded, "Bearer s3cret");
        });
    }

    #[test]
    #[serial]
    fn expand_fails_on_missing_variable() {
        temp_env::with_var_unset("MFP_TEST_MISSING", || {
            let err = expand("Bearer ${MFP_TEST_MISSING}").expect_err("should fail");
            assert!(matches!(err, MfpError::Config(_)));
        });
    }

    #[test]
    fn expand_fails_on_unterminated_placeholder() {
        let err = expand("Bearer ${OOPS").expect_err("should fail");
        assert!(matches!(err, MfpError::Config(_)));
    }

    #[test]
    fn expand_passes_through_plain_values() {
        assert_eq!(expand("Bearer abc123").expect("expand"), "Bearer abc123");
    }

    #[test]
    #[serial]
    fn env_vars_win_over_fallbacks() {
        temp_env::with_vars(
            [
                ("MFP_WEATHER_BASE_URL", Some("https://env.example.com")),
                ("MFP_WEATHER_AUTH", Some("Bearer from-env")),
            ],
            || {
                let mut vault = Vault::new();
                vault.register(
                    "weather",
                    ServerCredentials {
                        base_url: "https://fallback.example.com".to_string(),
                        auth_header: Some("Bearer fallback".to_string()),
                    },
                );

                let pairs = vault.build_server_env("weather").expect("env");
                assert!(pairs.contains(&(
                    "MFP_WEATHER_BASE_URL".to_string(),
                    "https://env.example.com".to_string()
                )));
                assert!(pairs.contains(&(
                    "MFP_WEATHER_AUTH".to_string(),
                    "Bearer from-env".to_string()
                )));
            },
        );
    }

    #[test]
    #[serial]
    fn fallback_auth_is_expanded() {
        temp_env::with_vars(
            [
                ("MFP_WEATHER_BASE_URL", None::<&str>),
                ("MFP_WEATHER_AUTH", None),
                ("WEATHER_TOKEN", Some("tok-123")),
            ],
            || {
                let mut vault = Vault::new();
                vault.register(
                    "weather",
                    ServerCredentials {
                        base_url: "https://api.example.com".to_string(),
                        auth_header: Some("Bearer ${WEATHER_TOKEN}".to_string()),
                    },
                );

                let pairs = vault.build_server_env("weather").expect("env");
                assert_eq!(
                    pairs,
                    vec![
                        (
                            "MFP_WEATHER_BASE_URL".to_string(),
                            "https://api.example.com".to_string()
                        ),
                        ("MFP_WEATHER_AUTH".to_string(), "Bearer tok-123".to_string()),
                    ]
                );
            },
        );
    }

    #[test]
    #[serial]
    fn unknown_server_yields_empty_map() {
        temp_env::with_vars(
            [
                ("MFP_GHOST_BASE_URL", None::<&str>),
                ("MFP_GHOST_AUTH", None),
            ],
            || {
                let vault = Vault::new();
                let pairs = vault.build_server_env("ghost").expect("env");
                assert!(pairs.is_empty());
            },
        );
    }
}
