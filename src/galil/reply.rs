//! Scanner for Galil reply lines.
//!
//! The reply grammar is irregular: most lines are a list of numeric
//! fields followed by descriptive text, where the text is either one key
//! that applies to every value or a comma-separated key list applied
//! pairwise. A small hand-written scanner classifies each line into a
//! tagged union.
//!
//! Example lines:
//! ```text
//! 0000.2,  0362.7,  0000.2,  0000.0,  0000.0 max sec to find reverse limit switch
//! Finding next full step
//!  041,  006.6 microsteps, sec to find full step
//! -000006732,  000014944,  000003741,  999999999,  999999999 position error
//!  1,  1,  1,  0,  0 axis homed
//! OK
//! ```

/// Sentinel the controller reports when a value is not available.
pub const NOT_AVAILABLE: f64 = 999_999_999.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The command-complete sentinel.
    Ok,
    /// Error line beginning with `?`, text included.
    Error(String),
    /// Echo of a command we sent; discarded.
    Echo,
    /// Numeric fields with a single key that applies to all of them.
    Single { key: String, values: Vec<f64> },
    /// Numeric fields with one key per value.
    Pairs(Vec<(String, f64)>),
    /// Numeric fields whose key list does not match the value count.
    KeyMismatch,
    /// A line with no leading numeric field.
    Text(String),
    Blank,
}

/// Strip the prompt and terminator residue from a raw reply line. The
/// controller intermixes `:` prompts freely, so every colon is dropped.
pub fn clean(raw: &str) -> String {
    let no_prompt: String = raw.chars().filter(|c| *c != ':').collect();
    no_prompt
        .trim_matches([' ', ';', '\r', '\n', '\x00', '\x01', '\x03', '\x18'].as_slice())
        .to_string()
}

pub fn parse(line: &str) -> Reply {
    if line.is_empty() {
        return Reply::Blank;
    }
    if line.starts_with('?') {
        return Reply::Error(line.to_string());
    }
    if line.eq_ignore_ascii_case("OK") {
        return Reply::Ok;
    }
    if is_echo(line) {
        return Reply::Echo;
    }
    if !starts_with_number(line) {
        return Reply::Text(line.to_string());
    }

    let (values, suffix) = split_numeric_prefix(line);
    let keys = split_keys(suffix);
    if keys.len() > 1 && keys.len() != values.len() {
        return Reply::KeyMismatch;
    }
    if keys.len() == 1 {
        Reply::Single {
            key: keys.into_iter().next().unwrap_or_default(),
            values,
        }
    } else {
        Reply::Pairs(keys.into_iter().zip(values).collect())
    }
}

fn starts_with_number(line: &str) -> bool {
    let mut chars = line.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Recognize the echo of our own writes: a trailing `XQ #WORD`, any axis
/// assignment `A=123`, or a bare `ST`/`RS`.
fn is_echo(line: &str) -> bool {
    if line.eq_ignore_ascii_case("ST") || line.eq_ignore_ascii_case("RS") {
        return true;
    }
    if has_trailing_xq(line) {
        return true;
    }
    // Axis assignment echo anywhere in the line.
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_uppercase() && bytes.get(i + 1) == Some(&b'=') {
            let mut j = i + 2;
            if bytes.get(j) == Some(&b'-') {
                j += 1;
            }
            if bytes.get(j).is_some_and(u8::is_ascii_digit) {
                return true;
            }
        }
    }
    false
}

fn has_trailing_xq(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    let Some(pos) = lower.rfind("xq") else {
        return false;
    };
    let mut rest = lower[pos + 2..].chars();
    let mut seen_hash = false;
    let mut seen_word = false;
    for c in rest.by_ref() {
        match c {
            ' ' if !seen_hash => continue,
            '#' if !seen_hash => seen_hash = true,
            'a'..='z' if seen_hash => {
                seen_word = true;
            }
            _ => return false,
        }
    }
    seen_hash && seen_word
}

/// Split the leading numeric fields from the descriptive suffix. Fields
/// are whitespace-separated tokens that parse as numbers, possibly with
/// attached commas.
fn split_numeric_prefix(line: &str) -> (Vec<f64>, &str) {
    let mut values = Vec::new();
    let mut rest = line;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            return (values, "");
        }
        let token_end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        let token = &trimmed[..token_end];
        match parse_number_token(token) {
            Some(nums) => {
                values.extend(nums);
                rest = &trimmed[token_end..];
            }
            None => return (values, trimmed),
        }
    }
}

/// Parse a token like `0362.7,` or `1,2` into numbers; `None` if any part
/// is not numeric.
fn parse_number_token(token: &str) -> Option<Vec<f64>> {
    let trimmed = token.trim_end_matches(',');
    if trimmed.is_empty() {
        return Some(vec![]);
    }
    let mut out = Vec::new();
    for part in trimmed.split(',') {
        if part.is_empty() {
            continue;
        }
        out.push(part.parse::<f64>().ok()?);
    }
    Some(out)
}

/// Split a key suffix on commas, and additionally after any `?` that is
/// followed by a space.
fn split_keys(suffix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for chunk in suffix.split(',') {
        let mut rest = chunk;
        while let Some(pos) = rest.find("? ") {
            keys.push(rest[..=pos].trim().to_string());
            rest = &rest[pos + 2..];
        }
        let tail = rest.trim();
        if !tail.is_empty() || keys.is_empty() {
            keys.push(tail.to_string());
        }
    }
    keys
}
