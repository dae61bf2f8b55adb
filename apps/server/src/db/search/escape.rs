//! Translation of DICOM wildcard values to SQL `LIKE` patterns.
//!
//! DICOM wildcards use `*` (any run) and `?` (one character). They map to
//! `%` and `_`, while literal `%`, `_` and `\` are escaped with `\` so the
//! pattern is used with `ESCAPE '\'`.

pub(crate) fn wildcard_to_like(value: &str, escape_brackets: bool) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '[' | ']' if escape_brackets => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Anchored regular expression equivalent to a DICOM wildcard.
pub(crate) fn wildcard_to_regex(value: &str, case_sensitive: bool) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    if !case_sensitive {
        out.push_str("(?i)");
    }
    out.push('^');
    let mut literal = [0u8; 4];
    for c in value.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_literals() {
        assert_eq!(wildcard_to_like("A*B?", false), "A%B_");
        assert_eq!(wildcard_to_like("50%_x\\", false), "50\\%\\_x\\\\");
        assert_eq!(wildcard_to_like("[a]", false), "[a]");
        assert_eq!(wildcard_to_like("[a]", true), "\\[a\\]");
    }

    #[test]
    fn regex_is_anchored() {
        assert_eq!(wildcard_to_regex("a.b*", true), "^a\\.b.*$");
        assert_eq!(wildcard_to_regex("?", false), "(?i)^.$");
    }
}
