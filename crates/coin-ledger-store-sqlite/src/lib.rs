use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use coin_ledger_core::{LedgerSnapshot, LedgerStore, LedgerTable};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Row 0 holds the header; data rows follow in sheet order.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sheet_rows (
  row_index INTEGER PRIMARY KEY CHECK (row_index >= 0),
  cells_json TEXT NOT NULL,
  written_at TEXT NOT NULL
);
";

/// `SQLite`-backed ledger table that mirrors the spreadsheet row by row.
pub struct SqliteLedgerStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableFileDigest {
    pub path: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub stored_rows: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteLedgerStore {
    /// Open a `SQLite` ledger database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to create sheet_rows table")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Read the stored table. A database that was never written yields the
    /// canonical header with no data rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a stored row is not valid JSON.
    pub fn read_table(&self) -> Result<LedgerTable> {
        if !table_exists(&self.conn, "sheet_rows")? {
            return Ok(LedgerTable::with_canonical_header());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT row_index, cells_json FROM sheet_rows ORDER BY row_index ASC")
            .context("failed to prepare sheet_rows query")?;
        let mut rows = stmt.query([])?;

        let mut cells_by_row = Vec::new();
        while let Some(row) = rows.next()? {
            let row_index: i64 = row.get(0)?;
            let cells_json: String = row.get(1)?;
            let cells: Vec<String> = serde_json::from_str(&cells_json)
                .with_context(|| format!("failed to decode stored row {row_index}"))?;
            cells_by_row.push(cells);
        }

        let mut cells_by_row = cells_by_row.into_iter();
        let Some(header) = cells_by_row.next() else {
            return Ok(LedgerTable::with_canonical_header());
        };
        Ok(LedgerTable { header, rows: cells_by_row.collect() })
    }

    /// Replace every stored row with `table` inside one transaction.
    ///
    /// # Errors
    /// Returns an error when migration fails or any write in the transaction fails.
    pub fn write_table(&mut self, table: &LedgerTable) -> Result<()> {
        self.migrate()?;
        let written_at = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM sheet_rows", []).context("failed to clear sheet_rows")?;

        for (row_index, cells) in std::iter::once(&table.header).chain(&table.rows).enumerate() {
            let row_index = i64::try_from(row_index).context("row index exceeds i64")?;
            tx.execute(
                "INSERT INTO sheet_rows(row_index, cells_json, written_at) VALUES (?1, ?2, ?3)",
                params![
                    row_index,
                    serde_json::to_string(cells).context("failed to serialize row cells")?,
                    written_at,
                ],
            )
            .with_context(|| format!("failed to insert sheet row {row_index}"))?;
        }

        tx.commit().context("failed to commit write transaction")?;
        Ok(())
    }

    /// Write the stored table to a JSON file.
    ///
    /// # Errors
    /// Returns an error when the table cannot be read, serialized, or written.
    pub fn export_table(&self, out_file: &Path) -> Result<TableFileDigest> {
        let table = self.read_table()?;
        let bytes = serde_json::to_vec_pretty(&table).context("failed to serialize table")?;

        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for {}", out_file.display())
            })?;
        }
        fs::write(out_file, &bytes)
            .with_context(|| format!("failed to write table file {}", out_file.display()))?;

        Ok(digest(out_file, &bytes, table.rows.len()))
    }

    /// Seed the store from a JSON table file, replacing its contents.
    ///
    /// The table is checked against the ledger schema first, so a file that
    /// could not be loaded as a session never reaches the store.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, fails schema
    /// validation, or cannot be written.
    pub fn import_table(&mut self, in_file: &Path) -> Result<TableFileDigest> {
        let bytes = fs::read(in_file)
            .with_context(|| format!("failed to read table file {}", in_file.display()))?;
        let table: LedgerTable = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse table JSON {}", in_file.display()))?;
        LedgerSnapshot::from_table(&table)
            .map_err(|err| anyhow!("refusing to import {}: {err}", in_file.display()))?;

        self.write_table(&table)?;
        Ok(digest(in_file, &bytes, table.rows.len()))
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let stored_rows = if table_exists(&self.conn, "sheet_rows")? {
            let count: i64 = self
                .conn
                .query_row("SELECT COUNT(*) FROM sheet_rows", [], |row| row.get(0))
                .context("failed to count sheet_rows")?;
            usize::try_from(count).context("row count is negative")?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            stored_rows,
            schema_status: self.schema_status()?,
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    type Error = anyhow::Error;

    fn read_all(&self) -> Result<LedgerTable> {
        self.read_table()
    }

    fn write_all(&mut self, table: &LedgerTable) -> Result<()> {
        self.write_table(table)
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn digest(path: &Path, bytes: &[u8], rows: usize) -> TableFileDigest {
    TableFileDigest {
        path: path.display().to_string(),
        sha256: format!("{:x}", Sha256::digest(bytes)),
        rows,
    }
}
