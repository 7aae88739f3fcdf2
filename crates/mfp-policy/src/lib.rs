//! Execution policy for MFP.
//!
//! Two cheap gates that run before anything expensive:
//!
//! - a hard code-size ceiling, checked before the snippet is even parsed;
//! - an outbound-domain allowlist, enforced by static URL extraction over the
//!   snippet before the container starts.
//!
//! An empty allowlist means every host is permitted.

use mfp_types::MfpError;
use url::Url;

/// Default ceiling for submitted code, in bytes.
pub const DEFAULT_MAX_CODE_SIZE_BYTES: usize = 64 * 1024;

/// Size and domain policy, constructed once from config.
#[derive(Debug, Clone)]
pub struct Policy {
    max_code_size_bytes: usize,
    allowed_domains: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_code_size_bytes: DEFAULT_MAX_CODE_SIZE_BYTES,
            allowed_domains: Vec::new(),
        }
    }
}

impl Policy {
    pub fn new(max_code_size_bytes: usize, allowed_domains: Vec<String>) -> Self {
        Self {
            max_code_size_bytes,
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn max_code_size_bytes(&self) -> usize {
        self.max_code_size_bytes
    }

    /// Reject code over the ceiling. Exactly the ceiling is accepted.
    pub fn check_code_size(&self, code: &str) -> Result<(), MfpError> {
        let len = code.len();
        if len > self.max_code_size_bytes {
            return Err(MfpError::Policy {
                detail: format!(
                    "code size {len} bytes exceeds limit of {} bytes",
                    self.max_code_size_bytes
                ),
            });
        }
        Ok(())
    }

    /// Whether a hostname is allowed: exact match or subdomain of an entry.
    pub fn domain_allowed(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    /// Statically extract every `http(s)://` URL in the snippet and reject
    /// the first host outside the allowlist. Misses dynamically constructed
    /// URLs; those fail inside the sandbox instead.
    pub fn check_code_urls(&self, code: &str) -> Result<(), MfpError> {
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        for url in extract_urls(code) {
            if let Ok(parsed) = Url::parse(&url) {
                if let Some(host) = parsed.host_str() {
                    if !self.domain_allowed(host) {
                        return Err(MfpError::Policy {
                            detail: format!("host not allowed: {host}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Every `http://` / `https://` literal in the text, cut at the first
/// character that cannot belong to a URL.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for scheme in ["https://", "http://"] {
        for (idx, _) in text.match_indices(scheme) {
            let tail = &text[idx..];
            let end = tail
                .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | ')' | '>' | ','))
                .unwrap_or(tail.len());
            if end > scheme.len() {
                urls.push(tail[..end].to_string());
            }
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_size_boundary() {
        let policy = Policy::new(16, vec![]);
        let exactly = "a".repeat(16);
        let over = "a".repeat(17);

        assert!(policy.check_code_size(&exactly).is_ok());
        assert!(policy.check_code_size(&over).is_err());
    }

    #[test]
    fn default_policy_uses_64k_ceiling() {
        let policy = Policy::default();
        assert_eq!(policy.max_code_size_bytes(), 65_536);
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let policy = Policy::new(1024, vec![]);
        assert!(policy.domain_allowed("anything.example.com"));
        assert!(policy.check_code_urls("requests.get('https://x.io/a')").is_ok());
    }

    #[test]
    fn allowlist_matches_exact_and_subdomains() {
        let policy = Policy::new(1024, vec!["example.com".to_string()]);
        assert!(policy.domain_allowed("example.com"));
        assert!(policy.domain_allowed("api.example.com"));
        assert!(!policy.domain_allowed("example.org"));
        assert!(!policy.domain_allowed("notexample.com"));
    }

    #[test]
    fn url_extraction_finds_literals() {
        let code = r#"
r = requests.get("https://api.example.com/v1/items?page=2")
s = 'http://other.io/x'
"#;
        let urls = extract_urls(code);
        assert!(urls.contains(&"https://api.example.com/v1/items?page=2".to_string()));
        assert!(urls.contains(&"http://other.io/x".to_string()));
    }

    #[test]
    fn disallowed_host_is_rejected_with_host_name() {
        let policy = Policy::new(1024, vec!["example.com".to_string()]);
        let err = policy
            .check_code_urls("requests.get('https://evil.io/steal')")
            .expect_err("should reject");
        match err {
            MfpError::Policy { detail } => assert!(detail.contains("evil.io")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn allowed_host_passes() {
        let policy = Policy::new(1024, vec!["example.com".to_string()]);
        assert!(
            policy
                .check_code_urls("requests.get('https://api.example.com/ok')")
                .is_ok()
        );
    }
}
