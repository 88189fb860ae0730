//! Binlog file naming: `binlog_<flushMillis>_<firstId>_<lastId>_<count>.log`.
//!
//! Ids are escaped so that `_`, path separators and `%` inside an id cannot
//! make a name ambiguous or escape the directory. The same escaping keeps
//! `,` and line breaks out of log lines.

use std::fmt;

pub(crate) const PREFIX: &str = "binlog_";
pub(crate) const SUFFIX: &str = ".log";
pub(crate) const CURSOR_FILE: &str = "binlog_cursor.txt";

/// Parsed fields of one binlog file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogFileName {
    pub flushed_at: u64,
    pub first_id: String,
    pub last_id: String,
    pub count: usize,
}

impl BinlogFileName {
    /// Parses a file name; returns `None` for anything that is not a binlog.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let body = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
        let mut parts = body.split('_');
        let flushed_at = parts.next()?.parse().ok()?;
        let first_id = unescape(parts.next()?)?;
        let last_id = unescape(parts.next()?)?;
        let count = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            flushed_at,
            first_id,
            last_id,
            count,
        })
    }
}

impl fmt::Display for BinlogFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}_{}_{}_{}{SUFFIX}",
            self.flushed_at,
            escape(&self.first_id),
            escape(&self.last_id),
            self.count
        )
    }
}

fn escape(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '_' => out.push_str("%5F"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            ',' => out.push_str("%2C"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        out.push(match code {
            "25" => '%',
            "5F" => '_',
            "2F" => '/',
            "5C" => '\\',
            "2C" => ',',
            "0A" => '\n',
            "0D" => '\r',
            _ => return None,
        });
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Escapes one field of a `fromId,toId` log line.
pub(crate) fn escape_field(id: &str) -> String {
    escape(id)
}

/// Reverses [`escape_field`]; `None` for an unknown escape.
pub(crate) fn unescape_field(field: &str) -> Option<String> {
    unescape(field)
}
