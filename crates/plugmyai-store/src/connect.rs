use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::apps::insert_app;
use crate::{parse_col, App, NewApp, Result, Store, UnknownValue};

/// Stored state of a pairing request. Leaves `Pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    Pending,
    Approved,
    Denied,
}

/// Status as observed at a point in time: a pending request past its
/// deadline reads as `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ConnectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectStatus::Pending => "pending",
            ConnectStatus::Approved => "approved",
            ConnectStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectStatus::Pending),
            "approved" => Ok(ConnectStatus::Approved),
            "denied" => Ok(ConnectStatus::Denied),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl PairingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PairingStatus::Pending => "pending",
            PairingStatus::Approved => "approved",
            PairingStatus::Denied => "denied",
            PairingStatus::Expired => "expired",
        }
    }
}

/// A third-party app asking to be paired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectRequest {
    pub id: String,
    pub app_name: String,
    pub app_url: String,
    pub app_icon: String,
    pub requested_scope: plugmyai_core::Scope,
    pub status: ConnectStatus,
    /// Set only once approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConnectRequest {
    pub fn effective_status(&self, now: DateTime<Utc>) -> PairingStatus {
        match self.status {
            ConnectStatus::Pending if now > self.expires_at => PairingStatus::Expired,
            ConnectStatus::Pending => PairingStatus::Pending,
            ConnectStatus::Approved => PairingStatus::Approved,
            ConnectStatus::Denied => PairingStatus::Denied,
        }
    }
}

const CONNECT_COLUMNS: &str =
    "id, app_name, app_url, app_icon, requested_scope, status, token, created_at, expires_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectRequest> {
    Ok(ConnectRequest {
        id: row.get(0)?,
        app_name: row.get(1)?,
        app_url: row.get(2)?,
        app_icon: row.get(3)?,
        requested_scope: parse_col(row, 4)?,
        status: parse_col(row, 5)?,
        token: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
    })
}

impl Store {
    pub fn create_connect_request(&self, req: &ConnectRequest) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO connect_requests ({CONNECT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                req.id,
                req.app_name,
                req.app_url,
                req.app_icon,
                req.requested_scope.as_str(),
                req.status.as_str(),
                req.token,
                req.created_at,
                req.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_connect_request(&self, id: &str) -> Result<Option<ConnectRequest>> {
        let conn = self.conn()?;
        let req = conn
            .query_row(
                &format!("SELECT {CONNECT_COLUMNS} FROM connect_requests WHERE id = ?1"),
                [id],
                request_from_row,
            )
            .optional()?;
        Ok(req)
    }

    /// Approve a request that is still pending and not expired at `now`,
    /// creating the app and recording its token in one transaction.
    ///
    /// Returns `None` when the request is missing, already decided or expired.
    pub fn approve_connect_request(
        &self,
        id: &str,
        app: &NewApp,
        now: DateTime<Utc>,
    ) -> Result<Option<App>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created = insert_app(&tx, app, now)?;
        let updated = tx.execute(
            "UPDATE connect_requests SET status = 'approved', token = ?1 \
             WHERE id = ?2 AND status = 'pending' AND expires_at >= ?3",
            params![created.token, id, now],
        )?;
        if updated == 0 {
            // dropping `tx` rolls the app back
            return Ok(None);
        }
        tx.commit()?;
        Ok(Some(created))
    }

    /// Deny a request that is still pending and not expired at `now`.
    pub fn deny_connect_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE connect_requests SET status = 'denied' \
             WHERE id = ?1 AND status = 'pending' AND expires_at >= ?2",
            params![id, now],
        )?;
        Ok(updated > 0)
    }

    /// Pending requests that have not expired at `now`, newest first.
    pub fn list_pending_connect_requests(&self, now: DateTime<Utc>) -> Result<Vec<ConnectRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECT_COLUMNS} FROM connect_requests \
             WHERE status = 'pending' AND expires_at >= ?1 \
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let requests = stmt
            .query_map([now], request_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(requests)
    }
}
