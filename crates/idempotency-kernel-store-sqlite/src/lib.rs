#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use idempotency_kernel_core::{
    format_rfc3339, now_utc, DedupStore, Fingerprint, PutOutcome, Record, StoreError,
    META_STATUS_CODE,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

const IDEMPOTENCY_MIGRATION_VERSION: i64 = 1;

const RECORD_COLUMNS: &[&str] = &[
    "issuer",
    "idempotency_key",
    "caller",
    "method",
    "route",
    "body_hash",
    "status_code",
    "content_type",
    "body",
    "created_at_ns",
];

const SCHEMA_IDEMPOTENCY_V1: &str = r"
CREATE TABLE IF NOT EXISTS idempotency_records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  issuer TEXT NOT NULL,
  idempotency_key TEXT NOT NULL,
  caller TEXT NOT NULL,
  method TEXT NOT NULL CHECK (method IN ('POST', 'PUT', 'PATCH', 'DELETE')),
  route TEXT NOT NULL,
  body_hash TEXT NOT NULL,
  status_code INTEGER NOT NULL CHECK (status_code BETWEEN 0 AND 999),
  content_type TEXT NOT NULL,
  body BLOB NOT NULL,
  created_at_ns INTEGER NOT NULL,
  UNIQUE (issuer, idempotency_key, caller, method, route, body_hash)
);

CREATE TRIGGER IF NOT EXISTS trg_idempotency_records_no_update
BEFORE UPDATE ON idempotency_records
BEGIN
  SELECT RAISE(FAIL, 'idempotency_records is write-once');
END;

CREATE INDEX IF NOT EXISTS idx_idempotency_records_created_at
  ON idempotency_records(issuer, created_at_ns);
";

/// Durable dedup store on SQLite.
///
/// Every row is scoped to the `issuer` the store was opened with, so tenants
/// sharing one database never observe each other's fingerprints.
pub struct SqliteDedupStore {
    conn: Mutex<Connection>,
    issuer: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub issuer: String,
    pub meta_records: u64,
    pub response_records: u64,
    pub oldest_created_at: Option<String>,
    pub newest_created_at: Option<String>,
}

impl SqliteDedupStore {
    pub fn open(path: &Path, issuer: &str) -> Result<Self> {
        if issuer.trim().is_empty() {
            return Err(anyhow!("issuer MUST be non-empty"));
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
            issuer: issuer.to_string(),
        })
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        let missing = missing_columns(&conn, "idempotency_records", RECORD_COLUMNS)?;
        if !missing.is_empty() {
            return Err(anyhow!(
                "existing idempotency_records table is incompatible: missing columns {}",
                missing.join(", ")
            ));
        }

        conn.execute_batch(SCHEMA_IDEMPOTENCY_V1)
            .context("failed to apply idempotency schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let registered = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![IDEMPOTENCY_MIGRATION_VERSION, now],
            )
            .context("failed to register idempotency schema migration")?;

        if registered > 0 {
            tracing::info!(
                version = IDEMPOTENCY_MIGRATION_VERSION,
                "applied idempotency schema migration"
            );
        }

        Ok(())
    }

    pub fn schema_versions(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")
            .context("failed to query schema_migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read schema_migrations")
    }

    pub fn find(&self, fingerprint: &Fingerprint) -> Result<Option<Record>> {
        let conn = self.lock()?;
        select_record(&conn, &self.issuer, fingerprint)
    }

    /// Inserts unless present, inside one IMMEDIATE transaction so concurrent
    /// writers on other connections serialize on the database write lock.
    pub fn insert_if_absent(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start idempotency transaction")?;

        let inserted = tx
            .execute(
                "INSERT INTO idempotency_records(
                    issuer, idempotency_key, caller, method, route, body_hash,
                    status_code, content_type, body, created_at_ns
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(issuer, idempotency_key, caller, method, route, body_hash) DO NOTHING",
                params![
                    self.issuer,
                    fingerprint.idempotency_key,
                    fingerprint.caller,
                    fingerprint.method.as_str(),
                    fingerprint.route,
                    fingerprint.body_hash,
                    i64::from(record.status_code),
                    record.content_type,
                    record.body,
                    to_unix_nanos(record.created_at)?,
                ],
            )
            .context("failed to insert idempotency record")?;

        let outcome = if inserted == 1 {
            PutOutcome::Inserted
        } else {
            let existing = select_record(&tx, &self.issuer, fingerprint)?
                .ok_or_else(|| anyhow!("conflicting idempotency record vanished for {fingerprint}"))?;
            PutOutcome::AlreadyPresent(existing)
        };

        tx.commit()
            .context("failed to commit idempotency transaction")?;
        Ok(outcome)
    }

    /// Deletes this issuer's records created strictly before `cutoff`.
    pub fn purge_created_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let conn = self.lock()?;
        let purged = conn
            .execute(
                "DELETE FROM idempotency_records WHERE issuer = ?1 AND created_at_ns < ?2",
                params![self.issuer, to_unix_nanos(cutoff)?],
            )
            .context("failed to purge idempotency records")?;

        tracing::info!(
            issuer = %self.issuer,
            cutoff = %format_rfc3339(cutoff).unwrap_or_default(),
            purged,
            "purged expired idempotency records"
        );
        Ok(purged)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let (meta, response, oldest, newest) = conn
            .query_row(
                "SELECT
                   COALESCE(SUM(CASE WHEN status_code = ?2 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status_code <> ?2 THEN 1 ELSE 0 END), 0),
                   MIN(created_at_ns),
                   MAX(created_at_ns)
                 FROM idempotency_records
                 WHERE issuer = ?1",
                params![self.issuer, i64::from(META_STATUS_CODE)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .context("failed to compute idempotency record stats")?;

        Ok(StoreStats {
            issuer: self.issuer.clone(),
            meta_records: u64::try_from(meta).context("negative meta record count")?,
            response_records: u64::try_from(response).context("negative response record count")?,
            oldest_created_at: oldest.map(format_unix_nanos).transpose()?,
            newest_created_at: newest.map(format_unix_nanos).transpose()?,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    #[cfg(test)]
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        match self.conn.lock() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl DedupStore for SqliteDedupStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, StoreError> {
        self.find(fingerprint).map_err(unavailable)
    }

    fn put(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome, StoreError> {
        self.insert_if_absent(fingerprint, record)
            .map_err(unavailable)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: anyhow::Error) -> StoreError {
    StoreError::Unavailable(format!("{err:#}"))
}

fn select_record(
    conn: &Connection,
    issuer: &str,
    fingerprint: &Fingerprint,
) -> Result<Option<Record>> {
    let row = conn
        .query_row(
            "SELECT status_code, content_type, body, created_at_ns
             FROM idempotency_records
             WHERE issuer = ?1
               AND idempotency_key = ?2
               AND caller = ?3
               AND method = ?4
               AND route = ?5
               AND body_hash = ?6",
            params![
                issuer,
                fingerprint.idempotency_key,
                fingerprint.caller,
                fingerprint.method.as_str(),
                fingerprint.route,
                fingerprint.body_hash,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("failed to read idempotency record for {fingerprint}"))?;

    row.map(|(status_code, content_type, body, created_at_ns)| {
        Ok(Record {
            status_code: u16::try_from(status_code)
                .with_context(|| format!("invalid stored status_code: {status_code}"))?,
            content_type,
            body,
            created_at: from_unix_nanos(created_at_ns)?,
        })
    })
    .transpose()
}

fn to_unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .with_context(|| format!("invalid stored created_at_ns: {value}"))
}

fn format_unix_nanos(value: i64) -> Result<String> {
    format_rfc3339(from_unix_nanos(value)?).map_err(|err| anyhow!(err.to_string()))
}

/// Required columns absent from `table_name`; empty when the table does not
/// exist yet.
fn missing_columns(
    conn: &Connection,
    table_name: &str,
    required: &[&'static str],
) -> Result<Vec<&'static str>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .with_context(|| format!("failed to inspect columns of {table_name}"))?;
    let present = stmt
        .query_map(params![table_name], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read columns of {table_name}"))?;

    if present.is_empty() {
        return Ok(Vec::new());
    }
    Ok(required
        .iter()
        .copied()
        .filter(|column| !present.iter().any(|name| name == column))
        .collect())
}
