//! Identifier validation for plan and task ids.

use std::sync::LazyLock;

use regex::Regex;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid id regex"));

/// Check that `id` is safe to embed in file names (`[A-Za-z0-9._-]`, not `.`/`..`).
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id == "." || id == ".." {
        return Err(format!("id must not be '{id}'"));
    }
    if !ID_RE.is_match(id) {
        return Err(format!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(validate_id("plan-1.alpha_2").is_ok());
    }

    #[test]
    fn rejects_separators_and_dot_segments() {
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a b").is_err());
    }
}
