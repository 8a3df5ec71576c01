//! SQL-injection scan stage of the message gate.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

static SQLI_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let build = |pattern: &str| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("static sqli pattern is valid regex")
    };
    vec![
        // SQL keywords at word boundaries
        build(r"\b(select|insert|update|delete|drop|alter|exec|union)\b"),
        // comment markers
        build(r"--"),
        build(r"/\*.*?\*/"),
        // stacked statements
        build(r";"),
        build(r"\bunion\s+select\b"),
        build(r"\binformation_schema\b"),
        build(r"\bsleep\s*\("),
    ]
});

/// True if any field looks like an injection attempt.
pub fn is_suspicious(input: &str) -> bool {
    SQLI_PATTERNS.iter().any(|re| re.is_match(input))
}

/// Required discipline for any caller that must interpolate an identifier
/// (table/column name) into a query string: the identifier must appear in
/// an explicit whitelist, never merely pass the suspicion scan.
pub fn check_identifier(identifier: &str, whitelist: &[&str]) -> bool {
    whitelist.contains(&identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_keyword_at_word_boundary() {
        assert!(is_suspicious("1 OR 1=1; DROP TABLE users;"));
        assert!(is_suspicious("' UNION SELECT password FROM users --"));
    }

    #[test]
    fn detects_comment_markers() {
        assert!(is_suspicious("admin'--"));
        assert!(is_suspicious("/* comment */ SELECT 1"));
    }

    #[test]
    fn detects_sleep_and_information_schema() {
        assert!(is_suspicious("1 AND SLEEP(5)"));
        assert!(is_suspicious("SELECT * FROM INFORMATION_SCHEMA.TABLES"));
    }

    #[test]
    fn benign_text_is_not_flagged() {
        assert!(!is_suspicious("hello, how are you today?"));
    }

    #[test]
    fn check_identifier_requires_whitelist_membership() {
        assert!(check_identifier("users", &["users", "sessions"]));
        assert!(!check_identifier("pg_shadow", &["users", "sessions"]));
    }
}
