use log::warn;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

use crate::crypto;
use crate::event::{self, Event};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store: timestamp regression for {0}")]
    TimestampRegression(String),
    #[error("store: chain break for {0}")]
    ChainBreak(String),
    #[error("store: another process holds the lock on {0}")]
    Locked(String),
    #[error("store: corrupt row {0}")]
    CorruptRow(i64),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub event_count: u64,
    pub file_count: u64,
    pub integrity_ok: bool,
    pub integrity_error: Option<String>,
    pub oldest_timestamp_ns: Option<i64>,
    pub newest_timestamp_ns: Option<i64>,
    pub rolling_chain_hash: [u8; 32],
}

/// Append-only event log with per-row HMAC and a rolling chain hash over
/// all event hashes. Tampering is detected, surfaced, and never repaired.
#[derive(Debug)]
pub struct SecureStore {
    conn: Connection,
    hmac_key: Vec<u8>,
    rolling_hash: [u8; 32],
    integrity_ok: bool,
    integrity_error: Option<String>,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<std::fs::File>,
}

impl SecureStore {
    /// Open the store, take the single-writer advisory lock, and walk the
    /// whole log recomputing row HMACs and the rolling chain. A mismatch
    /// marks the store instead of refusing to open: reads stay available
    /// and the flag travels with `get_stats()`.
    pub fn open_secure<P: AsRef<Path>>(path: P, hmac_key: Vec<u8>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        #[cfg(unix)]
        let lock = acquire_lock(path)?;

        let conn = Connection::open(path)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;

        let mut store = Self {
            conn,
            hmac_key,
            rolling_hash: [0u8; 32],
            integrity_ok: true,
            integrity_error: None,
            #[cfg(unix)]
            _lock: lock,
        };

        store.init_schema()?;
        store.verify_integrity()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS secure_events (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id           BLOB NOT NULL,
                timestamp_ns        INTEGER NOT NULL,
                file_path           TEXT NOT NULL,
                content_hash        BLOB NOT NULL,
                file_size           INTEGER NOT NULL,
                size_delta          INTEGER NOT NULL,
                context_msg         TEXT,
                vdf_input           BLOB NOT NULL,
                vdf_output          BLOB NOT NULL,
                vdf_iterations      INTEGER NOT NULL DEFAULT 0,
                regions_root        BLOB NOT NULL,
                regions             BLOB NOT NULL,
                previous_hash       BLOB NOT NULL,
                event_hash          BLOB NOT NULL UNIQUE,
                row_hmac            BLOB NOT NULL,
                rolling_chain_hash  BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_secure_events_timestamp ON secure_events(timestamp_ns);
            CREATE INDEX IF NOT EXISTS idx_secure_events_file ON secure_events(file_path, timestamp_ns);",
        )?;
        Ok(())
    }

    fn verify_integrity(&mut self) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, row_hmac, rolling_chain_hash,
                    device_id, timestamp_ns, file_path, content_hash, file_size, size_delta,
                    context_msg, vdf_input, vdf_output, vdf_iterations, regions_root, regions,
                    previous_hash, event_hash
             FROM secure_events ORDER BY id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut rolling = [0u8; 32];
        let mut failure: Option<String> = None;

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let stored_hmac: Vec<u8> = row.get(1)?;
            let stored_rolling: Vec<u8> = row.get(2)?;

            let event = match decode_row_offset(row, 3) {
                Ok(event) => event,
                Err(err) => {
                    failure.get_or_insert(format!("row {id}: {err}"));
                    continue;
                }
            };

            let expected_hmac = crypto::compute_row_hmac(&self.hmac_key, &event.encode());
            if stored_hmac != expected_hmac {
                failure.get_or_insert(format!("row {id}: HMAC mismatch"));
            }

            rolling = crypto::roll_chain_hash(&rolling, &event.event_hash);
            if stored_rolling != rolling {
                failure.get_or_insert(format!("row {id}: rolling chain hash mismatch"));
            }
        }
        drop(rows);
        drop(stmt);

        self.rolling_hash = rolling;
        if let Some(reason) = failure {
            warn!("store integrity check failed: {reason}");
            self.integrity_ok = false;
            self.integrity_error = Some(reason);
        }
        Ok(())
    }

    /// Append a fully built event. Rejects per-file timestamp regressions
    /// and broken chain links; the row HMAC and rolling hash land in the
    /// same row, so a torn append cannot pass the next integrity scan.
    pub fn insert_secure_event(&mut self, event: &Event) -> Result<i64, StoreError> {
        if let Some(last) = self.get_last_secure_event_for_file(&event.file_path)? {
            if event.timestamp_ns < last.timestamp_ns {
                return Err(StoreError::TimestampRegression(event.file_path.clone()));
            }
            if event.previous_hash != last.event_hash {
                return Err(StoreError::ChainBreak(event.file_path.clone()));
            }
        } else if event.previous_hash != [0u8; 32] {
            return Err(StoreError::ChainBreak(event.file_path.clone()));
        }

        let row_hmac = crypto::compute_row_hmac(&self.hmac_key, &event.encode());
        let rolling = crypto::roll_chain_hash(&self.rolling_hash, &event.event_hash);

        self.conn.execute(
            "INSERT INTO secure_events (
                device_id, timestamp_ns, file_path, content_hash, file_size, size_delta,
                context_msg, vdf_input, vdf_output, vdf_iterations, regions_root, regions,
                previous_hash, event_hash, row_hmac, rolling_chain_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                &event.device_id[..],
                event.timestamp_ns,
                &event.file_path,
                &event.content_hash[..],
                event.file_size,
                event.size_delta,
                event.context_msg,
                &event.vdf_input[..],
                &event.vdf_output[..],
                event.vdf_iterations as i64,
                &event.regions_root[..],
                event::encode_regions(&event.regions),
                &event.previous_hash[..],
                &event.event_hash[..],
                &row_hmac[..],
                &rolling[..],
            ],
        )?;

        self.rolling_hash = rolling;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_events_for_file(&self, path: &str) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, timestamp_ns, file_path, content_hash, file_size, size_delta,
                    context_msg, vdf_input, vdf_output, vdf_iterations, regions_root, regions,
                    previous_hash, event_hash
             FROM secure_events WHERE file_path = ? ORDER BY timestamp_ns ASC, id ASC",
        )?;

        let mut rows = stmt.query([path])?;
        let mut events = Vec::new();
        let mut row_id = 0i64;
        while let Some(row) = rows.next()? {
            row_id += 1;
            events.push(decode_row_offset(row, 0).map_err(|_| StoreError::CorruptRow(row_id))?);
        }
        Ok(events)
    }

    pub fn get_last_secure_event_for_file(&self, path: &str) -> Result<Option<Event>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, timestamp_ns, file_path, content_hash, file_size, size_delta,
                    context_msg, vdf_input, vdf_output, vdf_iterations, regions_root, regions,
                    previous_hash, event_hash
             FROM secure_events WHERE file_path = ? ORDER BY id DESC LIMIT 1",
        )?;

        let mut rows = stmt.query([path])?;
        match rows.next()? {
            Some(row) => Ok(Some(
                decode_row_offset(row, 0).map_err(|_| StoreError::CorruptRow(-1))?,
            )),
            None => Ok(None),
        }
    }

    pub fn count_events_for_file(&self, path: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM secure_events WHERE file_path = ?",
            [path],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Total proven elapsed time for a file: sum of iterations over the
    /// advisory rate.
    pub fn get_total_vdf_time(&self, path: &str, ips: u64) -> Result<Duration, StoreError> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(vdf_iterations), 0) FROM secure_events WHERE file_path = ?",
            [path],
            |row| row.get(0),
        )?;
        if ips == 0 {
            return Ok(Duration::ZERO);
        }
        Ok(Duration::from_secs_f64(total as f64 / ips as f64))
    }

    pub fn list_files(&self) -> Result<Vec<(String, i64, u64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, MAX(timestamp_ns) as last_ts, COUNT(*) as event_count
             FROM secure_events GROUP BY file_path ORDER BY last_ts DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let (event_count, oldest, newest): (i64, Option<i64>, Option<i64>) =
            self.conn.query_row(
                "SELECT COUNT(*), MIN(timestamp_ns), MAX(timestamp_ns) FROM secure_events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
        let file_count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT file_path) FROM secure_events",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            event_count: event_count as u64,
            file_count: file_count as u64,
            integrity_ok: self.integrity_ok,
            integrity_error: self.integrity_error.clone(),
            oldest_timestamp_ns: oldest,
            newest_timestamp_ns: newest,
            rolling_chain_hash: self.rolling_hash,
        })
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .map_err(|(_conn, err)| StoreError::Database(err))
    }
}

#[cfg(unix)]
fn acquire_lock(db_path: &Path) -> Result<nix::fcntl::Flock<std::fs::File>, StoreError> {
    use nix::fcntl::{Flock, FlockArg};

    let lock_path = db_path.with_extension("db.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;

    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|_| StoreError::Locked(db_path.display().to_string()))
}

/// Rebuild an [`Event`] from a row where the event columns start at
/// `offset` in the SELECT list.
fn decode_row_offset(row: &rusqlite::Row, offset: usize) -> Result<Event, String> {
    let field = |err: &str| err.to_string();

    let device_id: Vec<u8> = row.get(offset).map_err(|e| e.to_string())?;
    let regions_blob: Vec<u8> = row.get(offset + 11).map_err(|e| e.to_string())?;

    Ok(Event {
        device_id: device_id
            .try_into()
            .map_err(|_| field("invalid device_id"))?,
        timestamp_ns: row.get(offset + 1).map_err(|e| e.to_string())?,
        file_path: row.get(offset + 2).map_err(|e| e.to_string())?,
        content_hash: get_hash(row, offset + 3)?,
        file_size: row.get(offset + 4).map_err(|e| e.to_string())?,
        size_delta: row.get(offset + 5).map_err(|e| e.to_string())?,
        context_msg: row.get(offset + 6).map_err(|e| e.to_string())?,
        vdf_input: get_hash(row, offset + 7)?,
        vdf_output: get_hash(row, offset + 8)?,
        vdf_iterations: row.get::<_, i64>(offset + 9).map_err(|e| e.to_string())? as u64,
        regions_root: get_hash(row, offset + 10)?,
        regions: event::decode_regions(&regions_blob).map_err(|e| e.to_string())?,
        previous_hash: get_hash(row, offset + 12)?,
        event_hash: get_hash(row, offset + 13)?,
    })
}

fn get_hash(row: &rusqlite::Row, idx: usize) -> Result<[u8; 32], String> {
    let bytes: Vec<u8> = row.get(idx).map_err(|e| e.to_string())?;
    bytes.try_into().map_err(|_| "invalid hash column".to_string())
}
