use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{error, info};

use crate::error::StoreError;
use crate::schema;

/// Shared SQLite connection.
///
/// rusqlite connections are not `Sync`, so every access goes through one
/// mutex; clones share it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let db = Self::from_connection(Connection::open(path)?, path.to_owned())?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let recorded: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?;
    if recorded == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [schema::SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

/// A database that may still be opening.
///
/// Repositories hold a cell rather than a `Database` so the process can start
/// serving before storage is ready. Cloning shares the cell.
#[derive(Clone, Default)]
pub struct DatabaseCell {
    inner: Arc<OnceLock<Database>>,
}

impl DatabaseCell {
    /// A cell whose database has not been opened yet.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ready(db: Database) -> Self {
        let cell = Self::pending();
        cell.set(db);
        cell
    }

    /// Open the database on a blocking task. The cell stays pending if the
    /// open fails; the failure is logged.
    pub fn open_in_background(path: PathBuf) -> Self {
        let cell = Self::pending();
        let target = cell.clone();
        tokio::task::spawn_blocking(move || match Database::open(&path) {
            Ok(db) => {
                target.set(db);
            }
            Err(e) => error!(path = %path.display(), error = %e, "failed to open database"),
        });
        cell
    }

    /// Returns false if the cell was already filled.
    pub fn set(&self, db: Database) -> bool {
        self.inner.set(db).is_ok()
    }

    pub fn get(&self) -> Option<&Database> {
        self.inner.get()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.get().is_some()
    }
}
