use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::database::{Database, DatabaseCell};
use crate::error::StoreError;
use crate::row_helpers;

/// Flat key/value table for session-independent preferences.
/// Values are stored as JSON text.
pub struct SettingsRepo {
    db: DatabaseCell,
}

impl SettingsRepo {
    pub fn new(db: Database) -> Self {
        Self::with_cell(DatabaseCell::ready(db))
    }

    pub fn with_cell(db: DatabaseCell) -> Self {
        Self { db }
    }

    fn db(&self) -> Result<&Database, StoreError> {
        self.db
            .get()
            .ok_or_else(|| StoreError::Unavailable("database still opening".into()))
    }

    fn try_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.db()?.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            raw.map(|r| row_helpers::parse_json(&r, "settings", "value"))
                .transpose()
        })
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.try_get(key).unwrap_or_else(|e| {
            warn!(key, error = %e, "setting read failed");
            None
        })
    }

    /// Typed read. A value that no longer matches `T` reads as `None`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "setting has unexpected shape");
                None
            }
        }
    }

    #[instrument(skip(self, value))]
    pub fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.db()?.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, raw],
            )?;
            Ok(())
        })
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set(key, &serde_json::to_value(value)?)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.db()?
            .with_conn(|conn| Ok(conn.execute("DELETE FROM settings WHERE key = ?1", [key])? > 0))
    }

    /// Every setting, ordered by key.
    pub fn all(&self) -> Vec<(String, serde_json::Value)> {
        let result = self.db().and_then(|db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let key: String = row_helpers::get(row, 0, "settings", "key")?;
                    let raw: String = row_helpers::get(row, 1, "settings", "value")?;
                    out.push((key, row_helpers::parse_json(&raw, "settings", "value")?));
                }
                Ok(out)
            })
        });
        result.unwrap_or_else(|e| {
            warn!(error = %e, "settings listing failed");
            Vec::new()
        })
    }
}
