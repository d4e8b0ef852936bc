//! Grant pattern compilation (§4.6).
//!
//! A pattern may contain `{placeholder}` (matches one non-space token) and
//! `*` (matches any run of non-space characters). Compile-time guards keep
//! the resulting regex small and non-backtracking: length <= 256, at most
//! 10 `*` outside placeholders, no three consecutive `*`, and any regex
//! engine error is rejected rather than propagated.

use regex::Regex;
use thiserror::Error;

pub const MAX_PATTERN_LEN: usize = 256;
pub const MAX_WILDCARDS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern exceeds {max} characters")]
    TooLong { max: usize },
    #[error("pattern has more than {max} wildcards outside placeholders")]
    TooManyWildcards { max: usize },
    #[error("pattern contains three or more consecutive wildcards")]
    TripleWildcard,
    #[error("pattern failed to compile: {0}")]
    EngineError(String),
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub raw: String,
    regex: Regex,
}

impl CompiledPattern {
    pub fn is_match(&self, normalized_command: &str) -> bool {
        self.regex.is_match(normalized_command)
    }
}

/// Count `*` characters that fall outside any `{...}` placeholder span.
fn count_wildcards_outside_placeholders(pattern: &str) -> usize {
    let mut count = 0;
    let mut in_placeholder = false;
    for c in pattern.chars() {
        match c {
            '{' => in_placeholder = true,
            '}' => in_placeholder = false,
            '*' if !in_placeholder => count += 1,
            _ => {}
        }
    }
    count
}

fn has_triple_wildcard(pattern: &str) -> bool {
    pattern.contains("***")
}

fn build_regex_source(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                // consume until '}', emit a single-token placeholder match
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                }
                out.push_str("[^ ]+");
            }
            '*' => out.push_str("\\S*"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

pub fn compile_pattern(pattern: &str) -> Result<CompiledPattern, PatternError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(PatternError::TooLong {
            max: MAX_PATTERN_LEN,
        });
    }
    if has_triple_wildcard(pattern) {
        return Err(PatternError::TripleWildcard);
    }
    let wildcards = count_wildcards_outside_placeholders(pattern);
    if wildcards > MAX_WILDCARDS {
        return Err(PatternError::TooManyWildcards {
            max: MAX_WILDCARDS,
        });
    }
    let source = build_regex_source(pattern);
    let regex = Regex::new(&source).map_err(|e| PatternError::EngineError(e.to_string()))?;
    Ok(CompiledPattern {
        raw: pattern.to_string(),
        regex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_placeholder_and_wildcard() {
        let p = compile_pattern("aws s3 cp {file} s3://bucket/*").unwrap();
        assert!(p.is_match("aws s3 cp report.txt s3://bucket/archive"));
        assert!(!p.is_match("aws s3 rm report.txt s3://bucket/archive"));
    }

    #[test]
    fn rejects_oversized_pattern() {
        let long = "a".repeat(MAX_PATTERN_LEN + 1);
        let err = compile_pattern(&long).unwrap_err();
        assert_eq!(err, PatternError::TooLong { max: MAX_PATTERN_LEN });
    }

    #[test]
    fn rejects_too_many_wildcards() {
        let pattern = "*".repeat(MAX_WILDCARDS + 1);
        // avoid tripping the triple-wildcard guard first
        let spaced: String = pattern.chars().map(|c| format!("{c} ")).collect();
        let err = compile_pattern(spaced.trim()).unwrap_err();
        assert_eq!(err, PatternError::TooManyWildcards { max: MAX_WILDCARDS });
    }

    #[test]
    fn rejects_triple_wildcard() {
        let err = compile_pattern("aws s3 ls ***").unwrap_err();
        assert_eq!(err, PatternError::TripleWildcard);
    }

    #[test]
    fn wildcards_inside_placeholders_dont_count() {
        // a placeholder's inner text isn't a wildcard count, even if it
        // happens to contain '*' characters in its name.
        let p = compile_pattern("aws s3 cp {fi*le} dest").unwrap();
        assert!(p.is_match("aws s3 cp anything dest"));
    }
}
