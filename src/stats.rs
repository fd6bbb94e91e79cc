//! Typed view over HAProxy's CSV stats replies.
//!
//! The reply to `show stat` is a `# `-prefixed header line naming the
//! columns, followed by one comma-separated line per frontend, backend, or
//! server. Empty cells are empty strings; rows carry their component in
//! the `type` column.

use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

/// Server rows only, all columns.
pub const SHOW_STAT_SERVERS: &str = "show stat -1 4 -1";

/// Frontend, backend, and server rows, all columns.
pub const SHOW_STAT_ALL: &str = "show stat -1 7 -1";

pub const TYPE_FRONTEND: &str = "0";
pub const TYPE_BACKEND: &str = "1";
pub const TYPE_SERVER: &str = "2";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("stats reply is empty")]
    EmptyReply,

    #[error("stats reply is missing the `# ` header line")]
    MissingHeader,

    #[error("stats reply is not text")]
    NotText,
}

/// One CSV data line, addressable by header column name.
#[derive(Debug, Clone)]
pub struct StatRow {
    columns: Arc<HashMap<String, usize>>,
    cells: Vec<String>,
}

impl StatRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(|&i| self.cells.get(i)).map(String::as_str)
    }

    pub fn pxname(&self) -> &str {
        self.get("pxname").unwrap_or("")
    }

    pub fn svname(&self) -> &str {
        self.get("svname").unwrap_or("")
    }

    pub fn status(&self) -> &str {
        self.get("status").unwrap_or("")
    }

    pub fn type_code(&self) -> &str {
        self.get("type").unwrap_or("")
    }

    /// The host portion of the `addr` cell. HAProxy reports `ip:port`,
    /// with IPv6 literals bracketed.
    pub fn addr_host(&self) -> &str {
        let addr = self.get("addr").unwrap_or("");
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match addr.rsplit_once(':') {
            Some((host, _port)) => host,
            None => addr,
        }
    }

    /// Administrative maintenance covers both `MAINT` and `MAINT(via …)`.
    pub fn in_maint(&self) -> bool {
        self.status().starts_with("MAINT")
    }
}

pub fn reply_is_blank(reply: &[u8]) -> bool {
    reply.iter().all(|b| b.is_ascii_whitespace())
}

pub fn parse_stats(reply: &[u8]) -> Result<Vec<StatRow>, StatsError> {
    let text = std::str::from_utf8(reply).map_err(|_| StatsError::NotText)?;
    if text.trim().is_empty() {
        return Err(StatsError::EmptyReply);
    }

    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or(StatsError::EmptyReply)?;
    let names = header.strip_prefix("# ").ok_or(StatsError::MissingHeader)?;
    let columns: Arc<HashMap<String, usize>> =
        Arc::new(names.split(',').enumerate().map(|(i, name)| (name.trim().to_string(), i)).collect());

    let rows = lines
        .filter(|line| !line.starts_with('#'))
        .map(|line| StatRow {
            columns: Arc::clone(&columns),
            cells: line.split(',').map(str::to_string).collect(),
        })
        .collect();
    Ok(rows)
}
