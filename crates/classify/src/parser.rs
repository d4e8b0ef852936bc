//! Command Parser (§4.1).
//!
//! Splits a raw command string into argv. The only failure mode is
//! malformed quoting -- an unterminated `'` or `"`. Everything else about
//! the command (what verb it is, whether it's dangerous) is somebody
//! else's problem.

use crate::normalize::clean_raw;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated quote in command")]
    UnterminatedQuote,
    #[error("empty command")]
    Empty,
}

/// Split `raw` into argv using POSIX-ish shell quoting rules (single and
/// double quotes, backslash escapes). Does not expand globs, variables, or
/// execute anything -- it only tokenizes.
///
/// Unicode whitespace is folded to ASCII space first (structurally, so an
/// embedded NBSP becomes a real token boundary) before the shell-style
/// split runs.
pub fn parse_argv(raw: &str) -> Result<Vec<String>, ParseError> {
    let cleaned = clean_raw(raw);
    if cleaned.is_empty() {
        return Err(ParseError::Empty);
    }
    shlex::split(&cleaned).ok_or(ParseError::UnterminatedQuote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_command() {
        let argv = parse_argv("aws s3 ls").unwrap();
        assert_eq!(argv, vec!["aws", "s3", "ls"]);
    }

    #[test]
    fn splits_quoted_argument() {
        let argv = parse_argv(r#"aws s3 cp "my file.txt" s3://bucket/"#).unwrap();
        assert_eq!(argv, vec!["aws", "s3", "cp", "my file.txt", "s3://bucket/"]);
    }

    #[test]
    fn rejects_unterminated_quote() {
        let err = parse_argv(r#"aws s3 cp "unterminated"#).unwrap_err();
        assert_eq!(err, ParseError::UnterminatedQuote);
    }

    #[test]
    fn rejects_empty_command() {
        let err = parse_argv("   ").unwrap_err();
        assert_eq!(err, ParseError::Empty);
    }
}
