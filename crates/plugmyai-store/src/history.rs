use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;

use crate::{parse_col, Result, Store, UnknownValue};

pub const DEFAULT_HISTORY_LIMIT: u32 = 20;
pub const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Error,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Success => "success",
            HistoryStatus::Error => "error",
        }
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(HistoryStatus::Success),
            "error" => Ok(HistoryStatus::Error),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// One completed (or failed) completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    pub model: String,
    pub provider: String,
    /// The request transcript.
    pub messages: serde_json::Value,
    /// `{"content": ...}` with the assembled reply.
    pub response: serde_json::Value,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub duration_ms: i64,
    pub status: HistoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistorySort {
    #[default]
    Recent,
    /// Largest `tokens_in + tokens_out` first.
    Tokens,
}

impl HistorySort {
    /// Anything other than `tokens` sorts by recency.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "tokens" => HistorySort::Tokens,
            _ => HistorySort::Recent,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub limit: Option<u32>,
    pub offset: u32,
    /// Case-insensitive substring of the app name.
    pub app_name: Option<String>,
    pub sort: HistorySort,
}

impl HistoryFilter {
    pub fn effective_limit(&self) -> u32 {
        match self.limit {
            Some(n) if n > 0 && n <= MAX_HISTORY_LIMIT => n,
            _ => DEFAULT_HISTORY_LIMIT,
        }
    }
}

const HISTORY_COLUMNS: &str = "id, app_id, app_name, model, provider, messages, response, \
     tokens_in, tokens_out, duration_ms, status, error_message, created_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        app_id: row.get(1)?,
        app_name: row.get(2)?,
        model: row.get(3)?,
        provider: row.get(4)?,
        messages: row.get(5)?,
        response: row.get(6)?,
        tokens_in: row.get(7)?,
        tokens_out: row.get(8)?,
        duration_ms: row.get(9)?,
        status: parse_col(row, 10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

impl Store {
    pub fn log_history(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO history ({HISTORY_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                entry.id,
                entry.app_id,
                entry.app_name,
                entry.model,
                entry.provider,
                entry.messages,
                entry.response,
                entry.tokens_in,
                entry.tokens_out,
                entry.duration_ms,
                entry.status.as_str(),
                entry.error_message,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_history_entry(&self, id: &str) -> Result<Option<HistoryEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM history WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// One page of entries matching `filter`, plus the total match count.
    pub fn list_history_filtered(&self, filter: &HistoryFilter) -> Result<(Vec<HistoryEntry>, u64)> {
        let mut where_clause = String::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(name) = filter.app_name.as_deref().filter(|n| !n.is_empty()) {
            where_clause.push_str(" WHERE app_name LIKE ? ESCAPE '\\'");
            args.push(SqlValue::Text(like_pattern(name)));
        }
        let order = match filter.sort {
            HistorySort::Recent => " ORDER BY created_at DESC, rowid DESC",
            HistorySort::Tokens => " ORDER BY (tokens_in + tokens_out) DESC, created_at DESC",
        };

        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM history{where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        let total = u64::try_from(total).unwrap_or_default();

        args.push(SqlValue::Integer(filter.effective_limit().into()));
        args.push(SqlValue::Integer(filter.offset.into()));
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history{where_clause}{order} LIMIT ? OFFSET ?"
        ))?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    /// Remove every entry; returns how many were deleted.
    pub fn delete_all_history(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM history", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_caps() {
        let mut f = HistoryFilter::default();
        assert_eq!(f.effective_limit(), DEFAULT_HISTORY_LIMIT);
        f.limit = Some(500);
        assert_eq!(f.effective_limit(), DEFAULT_HISTORY_LIMIT);
        f.limit = Some(7);
        assert_eq!(f.effective_limit(), 7);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn sort_is_lenient() {
        assert_eq!(HistorySort::parse_lenient("tokens"), HistorySort::Tokens);
        assert_eq!(HistorySort::parse_lenient("bogus"), HistorySort::Recent);
    }
}
