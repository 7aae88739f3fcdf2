//! Content digests and code normalization for MFP.
//!
//! Two digests drive the whole system: the SHA-256 of raw swagger bytes
//! (incremental compilation) and the SHA-256 of *normalized* snippet code
//! (cache identity). Normalization is whitespace-only (comments and
//! semantics are untouched), so formatting variants of the same snippet
//! share one cache entry.
//!
//! # Example
//!
//! ```
//! use mfp_hash::{code_id, normalize_code};
//!
//! let a = code_id("x = 1\n\ny = 2   \n");
//! let b = code_id("x = 1\r\ny = 2");
//! assert_eq!(a, b);
//! assert_eq!(normalize_code("x = 1\r\n\r\n"), "x = 1");
//! ```

use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical form of snippet code used as the cache key:
/// line endings become `\n`, trailing whitespace is stripped from each line,
/// and blank lines (including leading/trailing ones) are dropped.
pub fn normalize_code(code: &str) -> String {
    code.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cache id of a snippet: hex SHA-256 over [`normalize_code`].
pub fn code_id(code: &str) -> String {
    sha256_hex(normalize_code(code).as_bytes())
}
