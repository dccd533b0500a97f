//! Persistent build and report store.
//!
//! SQLite is the sole source of truth for pipeline state. Concurrency safety
//! rests on the `UNIQUE (app_address, image_digest)` constraint plus
//! insert-or-skip semantics, not on in-process locks: the chain watcher may
//! re-scan overlapping block ranges after a crash and every re-discovered
//! release collapses onto the existing row.
//!
//! Report rows are immutable once inserted and always carry a signature; a
//! build is only marked `complete` after its report row exists.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors produced by store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("store mutex poisoned")]
    Poisoned,

    /// A referenced build row does not exist.
    #[error("build not found: {0}")]
    BuildNotFound(i64),

    /// A manual reset was attempted on a build that has not failed.
    #[error("build {id} is {status}; only failed builds can be reset")]
    NotResettable { id: i64, status: String },
}

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS monitored_apps (
        app_address TEXT PRIMARY KEY,
        last_seen_block INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS builds (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_address TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        image_digest TEXT NOT NULL,
        registry TEXT,
        repo_url TEXT,
        git_ref TEXT,
        provenance_verified INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        retries INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (app_address, image_digest)
    );

    CREATE INDEX IF NOT EXISTS idx_builds_app ON builds(app_address);
    CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status);
    CREATE INDEX IF NOT EXISTS idx_builds_ref ON builds(repo_url, git_ref);

    CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        build_id INTEGER NOT NULL REFERENCES builds(id),
        app_address TEXT NOT NULL,
        report_json TEXT NOT NULL,
        logs_json TEXT NOT NULL,
        attestation_json TEXT NOT NULL,
        signature TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reports_build ON reports(build_id);
    CREATE INDEX IF NOT EXISTS idx_reports_app ON reports(app_address, created_at);
";

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Discovered, waiting for a worker.
    Pending,
    /// A worker is currently analyzing it.
    Analyzing,
    /// Report persisted.
    Complete,
    /// Retry budget exhausted; terminal until manual reset.
    Failed,
    /// No resolvable provenance; terminal, never auto-retried.
    Unverifiable,
}

impl BuildStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Unverifiable => "unverifiable",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "analyzing" => Some(Self::Analyzing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "unverifiable" => Some(Self::Unverifiable),
            _ => None,
        }
    }
}

/// A monitored application row.
#[derive(Debug, Clone)]
pub struct MonitoredApp {
    pub app_address: String,
    pub last_seen_block: u64,
}

/// A build row.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub id: i64,
    pub app_address: String,
    pub block_number: u64,
    pub image_digest: String,
    pub registry: Option<String>,
    pub repo_url: Option<String>,
    pub git_ref: Option<String>,
    pub provenance_verified: bool,
    pub status: BuildStatus,
    pub retries: u32,
    pub last_attempt_at: Option<i64>,
    pub created_at: i64,
}

/// Fields required to record a newly discovered build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub app_address: String,
    pub block_number: u64,
    pub image_digest: String,
    pub registry: Option<String>,
    pub repo_url: Option<String>,
    pub git_ref: Option<String>,
    pub provenance_verified: bool,
    pub status: BuildStatus,
}

/// A persisted report row.
#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub id: i64,
    pub build_id: i64,
    pub app_address: String,
    pub report_json: String,
    pub logs_json: String,
    pub attestation_json: String,
    pub signature: String,
    pub created_at: i64,
}

/// Handle to the SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory database. Test use.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -------------------------------------------------------------------------
    // Monitored apps
    // -------------------------------------------------------------------------

    /// Registers an app for monitoring. Returns `false` when it was already
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn register_app(&self, app_address: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO monitored_apps (app_address, created_at)
             VALUES (?1, ?2)
             ON CONFLICT (app_address) DO NOTHING",
            params![app_address, Utc::now().timestamp()],
        )?;
        Ok(inserted > 0)
    }

    /// Lists all monitored apps.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list_apps(&self) -> Result<Vec<MonitoredApp>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT app_address, last_seen_block FROM monitored_apps ORDER BY app_address",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MonitoredApp {
                app_address: row.get(0)?,
                last_seen_block: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Looks up a single monitored app.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_app(&self, app_address: &str) -> Result<Option<MonitoredApp>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT app_address, last_seen_block FROM monitored_apps WHERE app_address = ?1",
                params![app_address],
                |row| {
                    Ok(MonitoredApp {
                        app_address: row.get(0)?,
                        last_seen_block: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?)
    }

    /// Advances `last_seen_block` for an app. Monotonic: a smaller or equal
    /// value is ignored, so overlapping re-scans can never move the cursor
    /// backwards.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn advance_last_seen_block(&self, app_address: &str, block: u64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE monitored_apps
             SET last_seen_block = ?2, updated_at = ?3
             WHERE app_address = ?1 AND last_seen_block < ?2",
            params![app_address, block as i64, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Builds
    // -------------------------------------------------------------------------

    /// Returns whether a build for (app, digest) is already recorded.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn build_exists(&self, app_address: &str, image_digest: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM builds WHERE app_address = ?1 AND image_digest = ?2",
                params![app_address, image_digest],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    /// Inserts a build row if none exists for its (app, digest) key.
    ///
    /// Returns the new row id, or `None` when the unique key already exists
    /// (idempotent re-scan).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_build(&self, build: &NewBuild) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO builds
               (app_address, block_number, image_digest, registry, repo_url, git_ref,
                provenance_verified, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (app_address, image_digest) DO NOTHING",
            params![
                build.app_address,
                build.block_number as i64,
                build.image_digest,
                build.registry,
                build.repo_url,
                build.git_ref,
                build.provenance_verified,
                build.status.as_str(),
                Utc::now().timestamp(),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Loads a build row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_build(&self, id: i64) -> Result<Option<BuildRecord>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, app_address, block_number, image_digest, registry, repo_url,
                        git_ref, provenance_verified, status, retries, last_attempt_at, created_at
                 FROM builds WHERE id = ?1",
                params![id],
                map_build_row,
            )
            .optional()?)
    }

    /// Lists builds for an app, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn builds_for_app(&self, app_address: &str) -> Result<Vec<BuildRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, app_address, block_number, image_digest, registry, repo_url,
                    git_ref, provenance_verified, status, retries, last_attempt_at, created_at
             FROM builds WHERE app_address = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![app_address], map_build_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Marks a build as analyzing: bumps `retries`, stamps `last_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] if the row is missing.
    pub fn mark_analyzing(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE builds
             SET status = 'analyzing', retries = retries + 1, last_attempt_at = ?2
             WHERE id = ?1",
            params![id, Utc::now().timestamp()],
        )?;
        if updated == 0 {
            return Err(StoreError::BuildNotFound(id));
        }
        Ok(())
    }

    /// Sets a build's status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] if the row is missing.
    pub fn set_status(&self, id: i64, status: BuildStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE builds SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::BuildNotFound(id));
        }
        Ok(())
    }

    /// Builds that survive a restart: pending or analyzing with retry budget
    /// left. Callers reset them to pending and re-enqueue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn resume_candidates(&self, max_retries: u32) -> Result<Vec<(i64, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, app_address FROM builds
             WHERE status IN ('pending', 'analyzing') AND retries < ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![max_retries], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Operator escape hatch: resets one failed build to a fresh pending
    /// state, zeroing its retry counter. Only failed builds are resettable;
    /// in particular `unverifiable` stays terminal and an in-flight build
    /// cannot be double-admitted.
    ///
    /// Returns the app address for re-enqueueing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] if the row is missing, or
    /// [`StoreError::NotResettable`] if the build has not failed.
    pub fn reset_build(&self, id: i64) -> Result<String, StoreError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT app_address, status FROM builds WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (app, status) = row.ok_or(StoreError::BuildNotFound(id))?;
        if status != BuildStatus::Failed.as_str() {
            return Err(StoreError::NotResettable { id, status });
        }
        conn.execute(
            "UPDATE builds
             SET status = 'pending', retries = 0, last_attempt_at = NULL
             WHERE id = ?1",
            params![id],
        )?;
        Ok(app)
    }

    /// Resets every failed build of an app. Returns the reset build ids.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn reset_failed_for_app(&self, app_address: &str) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let ids: Vec<i64> = {
            let mut stmt = conn
                .prepare("SELECT id FROM builds WHERE app_address = ?1 AND status = 'failed'")?;
            let rows = stmt.query_map(params![app_address], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for id in &ids {
            conn.execute(
                "UPDATE builds
                 SET status = 'pending', retries = 0, last_attempt_at = NULL
                 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Reports
    // -------------------------------------------------------------------------

    /// Persists a report row for a build.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_report(
        &self,
        build_id: i64,
        app_address: &str,
        report_json: &str,
        logs_json: &str,
        attestation_json: &str,
        signature: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reports
               (build_id, app_address, report_json, logs_json, attestation_json, signature,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                build_id,
                app_address,
                report_json,
                logs_json,
                attestation_json,
                signature,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent report for a (repo, ref) pair, across all builds. Used by
    /// the scheduler's dedup copy path.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn latest_report_for_ref(
        &self,
        repo_url: &str,
        git_ref: &str,
    ) -> Result<Option<ReportRecord>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT r.id, r.build_id, r.app_address, r.report_json, r.logs_json,
                        r.attestation_json, r.signature, r.created_at
                 FROM reports r
                 JOIN builds b ON b.id = r.build_id
                 WHERE b.repo_url = ?1 AND b.git_ref = ?2
                 ORDER BY r.created_at DESC, r.id DESC
                 LIMIT 1",
                params![repo_url, git_ref],
                map_report_row,
            )
            .optional()?)
    }

    /// Paged reports for an app, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn reports_for_app(
        &self,
        app_address: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ReportRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, build_id, app_address, report_json, logs_json, attestation_json,
                    signature, created_at
             FROM reports WHERE app_address = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![app_address, limit, offset], map_report_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Most recent report for an app.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn latest_report_for_app(
        &self,
        app_address: &str,
    ) -> Result<Option<ReportRecord>, StoreError> {
        Ok(self.reports_for_app(app_address, 1, 0)?.into_iter().next())
    }

    /// Raw analysis logs for a build.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn logs_for_build(&self, build_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT logs_json FROM reports WHERE build_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![build_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn map_build_row(row: &rusqlite::Row<'_>) -> Result<BuildRecord, rusqlite::Error> {
    let status_raw: String = row.get(8)?;
    Ok(BuildRecord {
        id: row.get(0)?,
        app_address: row.get(1)?,
        block_number: row.get::<_, i64>(2)?.max(0) as u64,
        image_digest: row.get(3)?,
        registry: row.get(4)?,
        repo_url: row.get(5)?,
        git_ref: row.get(6)?,
        provenance_verified: row.get(7)?,
        status: BuildStatus::parse(&status_raw).unwrap_or(BuildStatus::Failed),
        retries: row.get::<_, i64>(9)?.max(0) as u32,
        last_attempt_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn map_report_row(row: &rusqlite::Row<'_>) -> Result<ReportRecord, rusqlite::Error> {
    Ok(ReportRecord {
        id: row.get(0)?,
        build_id: row.get(1)?,
        app_address: row.get(2)?,
        report_json: row.get(3)?,
        logs_json: row.get(4)?,
        attestation_json: row.get(5)?,
        signature: row.get(6)?,
        created_at: row.get(7)?,
    })
}
