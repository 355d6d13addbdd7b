//! Identifier quoting for generated SQL.

/// Double-quote `identifier`, doubling embedded `"` and NUL characters.
///
/// NUL can't travel in protocol strings, so it gets the same treatment as a
/// quote and is never passed through unescaped.
pub fn escape_identifier(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len() + 2);
    out.push('"');
    for c in identifier.chars() {
        if c == '"' || c == '\0' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unescape(escaped: &str) -> String {
        let inner = &escaped[1..escaped.len() - 1];
        inner.replace("\"\"", "\"").replace("\0\0", "\0")
    }

    #[test]
    fn test_plain_identifier() {
        assert_eq!(escape_identifier("users"), "\"users\"");
        assert_eq!(escape_identifier(""), "\"\"");
    }

    #[test]
    fn test_embedded_quote_and_nul() {
        assert_eq!(escape_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(escape_identifier("a\0b"), "\"a\0\0b\"");
    }

    proptest! {
        #[test]
        fn escaped_length(s in ".*") {
            let specials = s.chars().filter(|c| *c == '"' || *c == '\0').count();
            prop_assert_eq!(escape_identifier(&s).len(), s.len() + 2 + specials);
        }

        #[test]
        fn unescape_restores_input(s in "[a-z\"\0 ]*") {
            prop_assert_eq!(unescape(&escape_identifier(&s)), s);
        }
    }
}
