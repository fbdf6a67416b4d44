use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;
use crate::jobs::Jobs;
use crate::migrations;
use crate::queue::Queue;
use crate::runs::Runs;
use crate::state::State;

/// Cloneable handle to the runner's SQLite database.
///
/// All subsystems share one connection behind a `Mutex`; SQLite serializes
/// writers anyway, and WAL lets readers in other processes (backup tools)
/// proceed. The handle owns schema setup: opening a path creates parent
/// directories, enables WAL + foreign keys, and applies pending migrations.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and migrate it.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::migrate(&mut conn)?;
        info!(path, "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Job declarations.
    pub fn jobs(&self) -> Jobs<'_> {
        Jobs::new(self)
    }

    /// Run records.
    pub fn runs(&self) -> Runs<'_> {
        Runs::new(self)
    }

    /// Scalar state + grouped items.
    pub fn state(&self) -> State<'_> {
        State::new(self)
    }

    /// Durable work queue.
    pub fn queue(&self) -> Queue<'_> {
        Queue::new(self)
    }

    /// Versions recorded in the `schema_version` ledger, ascending.
    pub fn applied_versions(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(versions)
    }

    /// Run `sql` directly against the connection.
    ///
    /// Escape hatch for operational tooling and tests; application code
    /// goes through the typed accessors.
    pub fn execute_raw(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        Ok(self.conn().execute(sql, params)?)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}
