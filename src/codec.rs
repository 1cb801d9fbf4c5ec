//! Stateless codec for the host⇄daemon transport line protocol.
//!
//! Requests arrive as `<verb> <noun> [<data>]` lines, responses leave as
//! `<noun> <code> [<message>]` lines. Parameter strings use the
//! `k1=v1,k2=v2` shape with `\` escaping commas, equals signs, and itself.
//!
//! Parse failures are normal signals (`None`), not errors: the transport is
//! expected to occasionally carry garbage and the caller decides how to
//! answer it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

/// Maximum encoded line length on the transport.
///
/// The transport guarantees atomic writes of 512 bytes; one byte is left for
/// the trailing `\n`, so a response line may never exceed 511 bytes.
pub const MAX_LINE_LEN: usize = 511;

static REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(get|set|send)\s+(\w+)(?:\s+(.*\S))?\s*$")
        .unwrap_or_else(|err| unreachable!("request pattern must compile: {err}"))
});

static RESPONSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\w+)\s+(\d+)(?:\s+(.+\S))?\s*$")
        .unwrap_or_else(|err| unreachable!("response pattern must compile: {err}"))
});

/// Protocol action qualifier.
///
/// Parsed case-insensitively; displays lowercase, which is the form plugins
/// receive as their first argument.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verb {
    /// Query an attribute.
    Get,
    /// Change an attribute or trigger an action.
    Set,
    /// Deliver opaque data to a handler.
    Send,
}

impl Verb {
    /// Lowercase wire form of the verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Send => "send",
        }
    }
}

impl FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("get") {
            Ok(Self::Get)
        } else if s.eq_ignore_ascii_case("set") {
            Ok(Self::Set)
        } else if s.eq_ignore_ascii_case("send") {
            Ok(Self::Send)
        } else {
            Err(())
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse one request line into `(verb, noun, data)`.
///
/// The verb is matched case-insensitively and returned as written; the
/// caller normalizes case. A request without a data field yields an empty
/// `data`. Trailing whitespace is stripped by the grammar itself, so a
/// parameter value can never end in whitespace.
///
/// Returns `None` when the line does not match the grammar — a normal
/// failure signal the caller must check, not an error.
#[must_use]
pub fn parse_request(line: &str) -> Option<(String, String, String)> {
    let caps = REQUEST.captures(line)?;
    let verb = caps.get(1)?.as_str().to_owned();
    let noun = caps.get(2)?.as_str().to_owned();
    let data = caps.get(3).map_or_else(String::new, |m| m.as_str().to_owned());
    Some((verb, noun, data))
}

/// Parse one response line into `(noun, code, message)`.
///
/// Mirror grammar of [`parse_request`]. A code field that does not fit the
/// shared code space is treated as a non-match.
#[must_use]
pub fn parse_response(line: &str) -> Option<(String, i32, String)> {
    let caps = RESPONSE.captures(line)?;
    let noun = caps.get(1)?.as_str().to_owned();
    let code = caps.get(2)?.as_str().parse::<i32>().ok()?;
    let message = caps.get(3).map_or_else(String::new, |m| m.as_str().to_owned());
    Some((noun, code, message))
}

/// Split `s` on `delimiter`, treating `escape` as neutralizing the character
/// immediately following it (including another escape).
///
/// Escape markers are NOT removed: the caller runs [`unescape`] once per
/// split level, so a string can be split first on `,` and then on `=`
/// without double-unescaping.
#[must_use]
pub fn split_with_escape(s: &str, delimiter: char, escape: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == escape {
            current.push(ch);
            escaped = true;
        } else if ch == delimiter {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    pieces.push(current);
    pieces
}

/// Remove one level of escape markers: `\X` becomes `X`.
///
/// A trailing lone escape character is preserved as-is. Applying this once
/// per [`split_with_escape`] level is the intended usage.
#[must_use]
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

/// Parse a `k1=v1,k2=v2` parameter string into a map.
///
/// Keys are lowercased unless `case_sensitive` is set. Empty pieces from the
/// comma split are discarded, which tolerates stray commas and lets a single
/// parameter carry a value with internal whitespace. A piece that does not
/// split into exactly one key and one value invalidates the whole parse.
#[must_use]
pub fn parse_params(s: &str, case_sensitive: bool) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    for piece in split_with_escape(s, ',', '\\') {
        if piece.is_empty() {
            continue;
        }
        let kv = split_with_escape(&piece, '=', '\\');
        if kv.len() != 2 {
            return None;
        }
        let mut key = unescape(&kv[0]);
        if !case_sensitive {
            key = key.to_lowercase();
        }
        params.insert(key, unescape(&kv[1]));
    }
    Some(params)
}

/// Format a `"<noun> <code> <message>"` line, truncating to `max_len` when
/// requested.
///
/// Truncation never touches the numeric code: the message is dropped first
/// and the noun shortened second, so the host can always parse the result
/// code out of whatever survives. Callers that do not need the cap pass
/// `None`.
#[must_use]
pub fn format_log_line(
    noun: Option<&str>,
    code: i32,
    message: Option<&str>,
    max_len: Option<usize>,
) -> String {
    let message = message.filter(|m| !m.is_empty());
    let mut info = match (noun, message) {
        (None, None) => code.to_string(),
        (None, Some(msg)) => format!("{code} {msg}"),
        (Some(cmd), None) => format!("{cmd} {code}"),
        (Some(cmd), Some(msg)) => format!("{cmd} {code} {msg}"),
    };

    let Some(cap) = max_len else {
        return info;
    };
    if info.len() <= cap {
        return info;
    }

    match noun {
        None => {
            // Free-form log text: plain truncation is enough.
            truncate_to_boundary(&mut info, cap);
            info
        }
        Some(cmd) => {
            // A response must keep its return code parseable. Drop the
            // message, then shorten the noun if that still is not enough.
            let code_str = code.to_string();
            if cmd.len() + 1 + code_str.len() > cap {
                let keep = cap.saturating_sub(code_str.len() + 1);
                let mut cmd_short = cmd.to_owned();
                truncate_to_boundary(&mut cmd_short, keep);
                format!("{cmd_short} {code_str}")
            } else {
                format!("{cmd} {code_str}")
            }
        }
    }
}

/// Truncate `s` to at most `max` bytes without splitting a character.
fn truncate_to_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
