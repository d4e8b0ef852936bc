//! Normalizer (§4.1).
//!
//! A pure function: NFC-normalize, fold every Unicode whitespace character
//! to ASCII space, strip zero-width characters, collapse runs of spaces,
//! and lowercase-fold only the first two tokens (service + action),
//! leaving arguments untouched. `Normalize ∘ Normalize ≡ Normalize` (§8).

use unicode_normalization::UnicodeNormalization;

/// Whitespace the normalizer treats as space: Unicode `Z*` categories plus
/// U+00A0, U+2000-U+200A, U+202F, U+205F, U+3000.
fn is_normalizer_whitespace(c: char) -> bool {
    if c == ' ' {
        return false; // already canonical, nothing to fold
    }
    matches!(
        c,
        '\u{0009}'..='\u{000D}'
        | '\u{00A0}'
        | '\u{1680}'
        | '\u{2000}'..='\u{200A}'
        | '\u{2028}'
        | '\u{2029}'
        | '\u{202F}'
        | '\u{205F}'
        | '\u{3000}'
    )
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}

/// Structural pre-clean applied to the raw command string before it is
/// tokenized: NFC-normalize, fold Unicode whitespace to ASCII space, strip
/// zero-width characters, collapse runs of spaces. This runs before argv
/// splitting so that e.g. an embedded NBSP becomes a real token boundary.
pub fn clean_raw(raw: &str) -> String {
    let nfc: String = raw.nfc().collect();
    let mut out = String::with_capacity(nfc.len());
    let mut last_was_space = false;
    for c in nfc.chars() {
        if is_zero_width(c) {
            continue;
        }
        let folded = if is_normalizer_whitespace(c) { ' ' } else { c };
        if folded == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        out.push(folded);
    }
    out.trim().to_string()
}

/// Per-token canonicalization applied to already-split argv: re-run the
/// same NFC/whitespace/zero-width cleanup on each token (defensive against
/// tokens that arrived pre-split with embedded odd characters), then
/// lowercase-fold the first two tokens *after* the CLI verb -- i.e.
/// `argv[1]` (service) and `argv[2]` (action). `argv[0]` is the recognized
/// CLI verb (e.g. "aws"), matched case-insensitively by the caller and
/// otherwise left alone; arguments beyond the action are untouched.
pub fn normalize_argv(argv: &[String]) -> Vec<String> {
    let mut out: Vec<String> = argv.iter().map(|t| clean_raw(t)).collect();
    for idx in 1..=2 {
        if let Some(tok) = out.get_mut(idx) {
            *tok = tok.to_lowercase();
        }
    }
    out
}
