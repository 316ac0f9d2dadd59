//! SQLite state store for WhaleGuard: fetch cursor, latest roster, delivered alerts

use alloy_primitives::Address;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::modules::enricher::AlertRecord;
use crate::modules::poller::FetchCursor;
use crate::modules::registry::{WhaleEntry, WhaleSnapshot};
use crate::utils::address::checksum;

/// Delivered alert as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAlert {
    pub id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub direction: String,
    pub address: String,
    pub rank: i64,
    pub label: String,
    pub usd_value: String,
    pub message: String,
    pub created_at: String,
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub alerts: i64,
    pub alerts_24h: i64,
    pub snapshots: i64,
    pub cursors: i64,
}

/// SQLite state store
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the store at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        info!(target: "DATABASE", "State store ready at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Throwaway in-memory store
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                token TEXT PRIMARY KEY,
                last_confirmed_block INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS roster_snapshots (
                token TEXT PRIMARY KEY,
                generation INTEGER NOT NULL,
                built_at TEXT NOT NULL,
                entries TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                direction TEXT NOT NULL,
                address TEXT NOT NULL,
                rank INTEGER NOT NULL,
                label TEXT,
                usd_value TEXT NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at)",
            [],
        )?;

        Ok(())
    }

    // ============================================
    // CURSOR
    // ============================================

    pub fn load_cursor(&self, token: &Address) -> Result<Option<FetchCursor>> {
        let conn = self.conn.lock();
        let block: Option<i64> = conn
            .query_row(
                "SELECT last_confirmed_block FROM cursors WHERE token = ?1",
                params![checksum(token)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.map(|b| FetchCursor::new(b.max(0) as u64)))
    }

    pub fn save_cursor(&self, token: &Address, cursor: FetchCursor) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO cursors (token, last_confirmed_block, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![
                checksum(token),
                cursor.last_confirmed_block as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ============================================
    // ROSTER
    // ============================================

    pub fn load_snapshot(&self, token: &Address) -> Result<Option<WhaleSnapshot>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT generation, built_at, entries FROM roster_snapshots WHERE token = ?1",
                params![checksum(token)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((generation, built_at, entries)) = row else {
            return Ok(None);
        };
        let entries: Vec<WhaleEntry> =
            serde_json::from_str(&entries).context("decoding stored roster")?;
        let mut snapshot = WhaleSnapshot::build(generation.max(0) as u64, entries);
        snapshot.built_at = DateTime::parse_from_rfc3339(&built_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(snapshot.built_at);
        Ok(Some(snapshot))
    }

    pub fn save_snapshot(&self, token: &Address, snapshot: &WhaleSnapshot) -> Result<()> {
        let entries: Vec<&WhaleEntry> = snapshot.ranked();
        let json = serde_json::to_string(&entries)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO roster_snapshots (token, generation, built_at, entries)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                checksum(token),
                snapshot.generation as i64,
                snapshot.built_at.to_rfc3339(),
                json
            ],
        )?;
        debug!(
            target: "DATABASE",
            "Saved roster generation {} ({} whales)",
            snapshot.generation,
            snapshot.len()
        );
        Ok(())
    }

    // ============================================
    // ALERTS
    // ============================================

    pub fn save_alert(&self, record: &AlertRecord, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO alerts
            (tx_hash, log_index, block_number, direction, address, rank, label, usd_value, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                format!("{:#x}", record.event.tx_hash),
                record.event.log_index as i64,
                record.event.block_number as i64,
                record.direction.as_str(),
                checksum(&record.whale_address),
                record.rank as i64,
                record.whale_label,
                record.usd_value.round_dp(2).to_string(),
                message,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_alerts(&self, limit: i64) -> Result<Vec<StoredAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tx_hash, log_index, block_number, direction, address, rank, label,
                   usd_value, message, created_at
            FROM alerts ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredAlert {
                id: row.get(0)?,
                tx_hash: row.get(1)?,
                log_index: row.get(2)?,
                block_number: row.get(3)?,
                direction: row.get(4)?,
                address: row.get(5)?,
                rank: row.get(6)?,
                label: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                usd_value: row.get(8)?,
                message: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                created_at: row.get(10)?,
            })
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    // ============================================
    // STATS
    // ============================================

    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.conn.lock();

        let alerts: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;

        let since = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let alerts_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE created_at >= ?1",
            params![since],
            |row| row.get(0),
        )?;

        let snapshots: i64 =
            conn.query_row("SELECT COUNT(*) FROM roster_snapshots", [], |row| row.get(0))?;
        let cursors: i64 = conn.query_row("SELECT COUNT(*) FROM cursors", [], |row| row.get(0))?;

        Ok(DbStats {
            alerts,
            alerts_24h,
            snapshots,
            cursors,
        })
    }
}
