use chrono::{DateTime, Utc};
use plugmyai_core::{ids, Scope};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{parse_col, Result, Store};

/// A paired application holding a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub url: String,
    pub scope: Scope,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
    /// Allowed provider ids; empty means unrestricted.
    pub providers: Vec<String>,
}

/// Fields supplied when registering an app. Id and token are minted by the
/// store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewApp {
    pub name: String,
    pub url: String,
    pub scope: Scope,
    pub providers: Vec<String>,
}

impl NewApp {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

const APP_COLUMNS: &str = "id, name, url, scope, token, created_at, revoked";

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        scope: parse_col(row, 3)?,
        token: row.get(4)?,
        created_at: row.get(5)?,
        revoked: row.get(6)?,
        providers: Vec::new(),
    })
}

/// Insert a fresh app with its allow-list on `conn`, which may be a
/// transaction.
pub(crate) fn insert_app(conn: &Connection, new: &NewApp, now: DateTime<Utc>) -> Result<App> {
    let app = App {
        id: ids::short_id(),
        name: new.name.clone(),
        url: new.url.clone(),
        scope: new.scope,
        token: ids::app_token(),
        created_at: now,
        revoked: false,
        providers: new.providers.clone(),
    };
    conn.execute(
        "INSERT INTO apps (id, name, url, scope, token, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![app.id, app.name, app.url, app.scope.as_str(), app.token, app.created_at],
    )?;
    replace_providers(conn, &app.id, &app.providers)?;
    Ok(app)
}

fn replace_providers(conn: &Connection, app_id: &str, providers: &[String]) -> Result<()> {
    conn.execute("DELETE FROM app_providers WHERE app_id = ?1", [app_id])?;
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO app_providers (app_id, provider_id) VALUES (?1, ?2)")?;
    for provider in providers {
        stmt.execute(params![app_id, provider])?;
    }
    Ok(())
}

fn providers_of(conn: &Connection, app_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT provider_id FROM app_providers WHERE app_id = ?1 ORDER BY provider_id")?;
    let ids = stmt
        .query_map([app_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

impl Store {
    /// Register an app with a freshly minted id and token.
    pub fn create_app(&self, new: &NewApp) -> Result<App> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let app = insert_app(&tx, new, Utc::now())?;
        tx.commit()?;
        Ok(app)
    }

    /// Look up a non-revoked app by its token.
    pub fn get_app_by_token(&self, token: &str) -> Result<Option<App>> {
        let conn = self.conn()?;
        let app = conn
            .query_row(
                &format!("SELECT {APP_COLUMNS} FROM apps WHERE token = ?1 AND revoked = 0"),
                [token],
                app_from_row,
            )
            .optional()?;
        match app {
            Some(mut app) => {
                app.providers = providers_of(&conn, &app.id)?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    pub fn get_app(&self, id: &str) -> Result<Option<App>> {
        let conn = self.conn()?;
        let app = conn
            .query_row(
                &format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?1"),
                [id],
                app_from_row,
            )
            .optional()?;
        match app {
            Some(mut app) => {
                app.providers = providers_of(&conn, &app.id)?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// All apps, newest first, revoked ones included.
    pub fn list_apps(&self) -> Result<Vec<App>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APP_COLUMNS} FROM apps ORDER BY created_at DESC, rowid DESC"
        ))?;
        let mut apps = stmt
            .query_map([], app_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for app in &mut apps {
            app.providers = providers_of(&conn, &app.id)?;
        }
        Ok(apps)
    }

    /// Mark an app revoked. Returns `false` when no such app exists.
    pub fn revoke_app(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("UPDATE apps SET revoked = 1 WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Replace an app's allow-list; empty means unrestricted.
    pub fn set_app_providers(&self, app_id: &str, providers: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        replace_providers(&tx, app_id, providers)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_app_providers(&self, app_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        providers_of(&conn, app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_replacement() {
        let store = Store::open_in_memory().unwrap();
        let app = store
            .create_app(&NewApp {
                name: "Editor".into(),
                providers: vec!["codex".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.get_app_providers(&app.id).unwrap(), vec!["codex"]);

        store
            .set_app_providers(&app.id, &["openai-compat".into(), "claude-code".into()])
            .unwrap();
        assert_eq!(
            store.get_app_providers(&app.id).unwrap(),
            vec!["claude-code", "openai-compat"]
        );

        store.set_app_providers(&app.id, &[]).unwrap();
        assert!(store.get_app(&app.id).unwrap().unwrap().providers.is_empty());
    }
}
