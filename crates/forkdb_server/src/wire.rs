//! Line protocol encoding shared by the front end and the client.
//!
//! ```text
//! client                          server
//! AUTH <user> <password>    ->
//!                           <-    OK <connection-id> | ERR <message>
//! <sql>                     ->
//!                           <-    [COLS <c1>\t<c2>...]
//!                           <-    ROW <v1>\t<v2>...      (zero or more)
//!                           <-    OK <row-count> | ERR <message>
//! QUIT                      ->
//!                           <-    BYE
//! ```
//!
//! Column names, values and messages escape `\`, tab, newline and carriage
//! return so every frame stays on one line.

use crate::engine::QueryResult;
use std::fmt;

/// Longest line either side accepts.
pub(crate) const MAX_LINE_LENGTH: usize = 64 * 1024;

pub(crate) const AUTH: &str = "AUTH";
pub(crate) const QUIT: &str = "QUIT";
pub(crate) const BYE: &str = "BYE";

/// Escapes one field.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape`]. Unknown escapes are kept verbatim.
pub(crate) fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn join_fields<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape(f.as_ref()))
        .collect::<Vec<_>>()
        .join("\t")
}

fn split_fields(line: &str) -> Vec<String> {
    line.split('\t').map(unescape).collect()
}

/// Frames a successful statement.
pub(crate) fn render_result(result: &QueryResult) -> Vec<String> {
    let mut lines = Vec::with_capacity(result.rows.len() + 2);
    if !result.columns.is_empty() {
        lines.push(format!("COLS {}", join_fields(&result.columns)));
    }
    for row in &result.rows {
        lines.push(format!("ROW {}", join_fields(row)));
    }
    lines.push(format!("OK {}", result.row_count()));
    lines
}

/// Frames a failure.
pub(crate) fn render_error(message: impl fmt::Display) -> String {
    format!("ERR {}", escape(&message.to_string()))
}

/// Frames a successful handshake.
pub(crate) fn render_greeting(connection_id: u32) -> String {
    format!("OK {connection_id}")
}

/// Frames a handshake request.
pub(crate) fn render_auth(user: &str, password: &str) -> String {
    format!("{AUTH} {} {}", escape(user), escape(password))
}

/// Parses a handshake request into `(user, password)`.
///
/// The password is everything after the second space and may be empty.
pub(crate) fn parse_auth(line: &str) -> Option<(String, String)> {
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    if !verb.eq_ignore_ascii_case(AUTH) {
        return None;
    }
    let (user, password) = rest.split_once(' ').unwrap_or((rest, ""));
    if user.is_empty() {
        return None;
    }
    Some((unescape(user), unescape(password)))
}

/// One server frame, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Columns(Vec<String>),
    Row(Vec<String>),
    Ok(u64),
    Err(String),
    Bye,
}

impl Frame {
    /// Parses one server line. `None` for anything unrecognised.
    pub(crate) fn parse(line: &str) -> Option<Frame> {
        if line == BYE {
            return Some(Frame::Bye);
        }
        let (tag, body) = line.split_once(' ')?;
        match tag {
            "COLS" => Some(Frame::Columns(split_fields(body))),
            "ROW" => Some(Frame::Row(split_fields(body))),
            "OK" => body.parse().ok().map(Frame::Ok),
            "ERR" => Some(Frame::Err(unescape(body))),
            _ => None,
        }
    }
}
