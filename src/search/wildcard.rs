//! Wildcard string patterns.
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one character, and `\` makes the next character literal. A pattern must
//! match the whole string.

use regex::{Regex, RegexBuilder};

/// Compiles a wildcard pattern into an anchored regex.
pub fn compile_wildcard(pattern: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4]))),
                // A trailing backslash stands for itself.
                None => re.push_str(r"\\"),
            },
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    RegexBuilder::new(&re)
        .case_insensitive(!case_sensitive)
        .dot_matches_new_line(true)
        .build()
}
