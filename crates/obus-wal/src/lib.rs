//! Durable SQLite write-ahead log for a single peer's delivered order history.
//!
//! # Schema
//! `orders`: one row per sequenced order, keyed by `(epoch, seq)` and,
//! separately, by `payload_id` (a payload is sequenced at most once ever,
//! across every epoch this peer has lived through).
//!
//! # Durability settings
//! Applied at open: `journal_mode=WAL`, `synchronous=FULL`,
//! `wal_autocheckpoint=1000`, `foreign_keys=ON`. `PRAGMA integrity_check`
//! runs at open and fails the open if the file is corrupt.
//!
//! # Atomicity
//! A row either fully commits or doesn't exist; there is no partial-row
//! state to guard against on replay, so `replay` never needs to discard a
//! torn trailing record — SQLite's own transaction boundary gives us that
//! for free.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One durable record: a sequenced order as it was appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub epoch: u64,
    pub seq: u64,
    pub payload_id: String,
    pub submitter_id: u32,
    pub submit_timestamp: u64,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("non-monotonic wal: {0}")]
    NonMonotonic(String),
}

// ---------------------------------------------------------------------------
// Wal
// ---------------------------------------------------------------------------

/// The durable write-ahead log for one peer, identity-scoped by the caller
/// (the file path is expected to encode `node_id`, e.g. `wal_7.sqlite3`).
pub struct Wal {
    conn: Connection,
}

impl Wal {
    /// Open (or create) the WAL at `path`. Applies pragmas, runs an
    /// integrity check, and creates the schema if it doesn't exist yet.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        info!(path = %path.display(), "wal opened");
        Ok(Wal { conn })
    }

    /// Open an in-memory WAL. Useful for tests; no durability guarantees
    /// since SQLite's `:memory:` databases don't survive a crash either way.
    pub fn open_in_memory() -> Result<Self, WalError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Wal { conn })
    }

    /// Append one sequenced order. Returns after the write is durably
    /// persisted (observable after a process crash, given `synchronous=FULL`).
    ///
    /// Per spec.md invariant W1, this must be called before the order is
    /// broadcast (Leader) or delivered to the application (Follower).
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let appended_at = now_iso8601();
        self.conn.execute(
            "INSERT INTO orders
                (epoch, seq, payload_id, submitter_id, submit_timestamp, body, appended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.epoch as i64,
                record.seq as i64,
                record.payload_id,
                record.submitter_id,
                record.submit_timestamp as i64,
                record.body,
                appended_at,
            ],
        )?;
        Ok(())
    }

    /// Replay every record in the order it was appended.
    ///
    /// Validates that `seq` is dense and strictly increasing across the
    /// whole file — spec.md §3 treats `seq` as "a single monotonically
    /// advancing stream across epochs", so a new epoch continues the
    /// counter rather than restarting it at 1 — and that `epoch` is
    /// non-decreasing. A violation is a [`WalError::NonMonotonic`], which
    /// the caller should treat as fatal per spec.md §7 ("invariant
    /// violation at runtime").
    pub fn replay(&self) -> Result<Vec<WalRecord>, WalError> {
        let mut stmt = self.conn.prepare(
            "SELECT epoch, seq, payload_id, submitter_id, submit_timestamp, body
             FROM orders ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WalRecord {
                epoch: row.get::<_, i64>(0)? as u64,
                seq: row.get::<_, i64>(1)? as u64,
                payload_id: row.get(2)?,
                submitter_id: row.get(3)?,
                submit_timestamp: row.get::<_, i64>(4)? as u64,
                body: row.get(5)?,
            })
        })?;

        let mut records = Vec::new();
        let mut last: Option<(u64, u64)> = None;
        for r in rows {
            let record = r?;
            if let Some((last_epoch, last_seq)) = last {
                if record.epoch < last_epoch {
                    return Err(WalError::NonMonotonic(format!(
                        "epoch went backwards: {} after {}",
                        record.epoch, last_epoch
                    )));
                }
                if record.seq != last_seq + 1 {
                    return Err(WalError::NonMonotonic(format!(
                        "seq gap: {} after {}",
                        record.seq, last_seq
                    )));
                }
            }
            last = Some((record.epoch, record.seq));
            records.push(record);
        }
        Ok(records)
    }

    /// The `(epoch, seq)` of the last appended record, if any.
    pub fn last_epoch_and_seq(&self) -> Result<Option<(u64, u64)>, WalError> {
        let result: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT epoch, seq FROM orders ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(result.map(|(e, s)| (e as u64, s as u64)))
    }

    /// All `payload_id`s ever sequenced by this peer, across every epoch.
    /// Reconstructs `seen_payload_ids` on startup (spec.md §9, second Open
    /// Question: this spec requires cross-epoch reconstruction from WAL).
    pub fn seen_payload_ids(&self) -> Result<HashSet<String>, WalError> {
        let mut stmt = self.conn.prepare("SELECT payload_id FROM orders")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut set = HashSet::new();
        for r in rows {
            set.insert(r?);
        }
        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), WalError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), WalError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(WalError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (y, mo, d, h, mi, s) = epoch_to_ymdhms(secs);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}Z")
}

fn epoch_to_ymdhms(secs: u64) -> (u32, u32, u32, u32, u32, u32) {
    let s = (secs % 60) as u32;
    let mins = secs / 60;
    let mi = (mins % 60) as u32;
    let hours = mins / 60;
    let h = (hours % 24) as u32;
    let days = hours / 24;

    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let mo = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if mo <= 2 { y + 1 } else { y } as u32;

    (y, mo, d, h, mi, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(epoch: u64, seq: u64, payload_id: &str) -> WalRecord {
        WalRecord {
            epoch,
            seq,
            payload_id: payload_id.to_owned(),
            submitter_id: 2,
            submit_timestamp: 0,
            body: b"body".to_vec(),
        }
    }

    #[test]
    fn append_then_replay_yields_a_sequence_ending_in_the_appended_record() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        wal.append(&sample(1, 2, "b")).unwrap();

        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.last().unwrap().payload_id, "b");
    }

    #[test]
    fn replay_continues_seq_across_an_epoch_boundary_rather_than_resetting() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        wal.append(&sample(1, 2, "b")).unwrap();
        wal.append(&sample(2, 3, "c")).unwrap();

        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(wal.last_epoch_and_seq().unwrap(), Some((2, 3)));
    }

    #[test]
    fn replay_detects_a_seq_gap() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        wal.append(&sample(1, 3, "b")).unwrap();

        assert!(matches!(wal.replay(), Err(WalError::NonMonotonic(_))));
    }

    #[test]
    fn replay_detects_a_seq_reset_at_an_epoch_boundary() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        wal.append(&sample(2, 1, "b")).unwrap();

        assert!(matches!(wal.replay(), Err(WalError::NonMonotonic(_))));
    }

    #[test]
    fn duplicate_payload_id_is_rejected_by_the_schema() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        let err = wal.append(&sample(1, 2, "a"));
        assert!(err.is_err());
    }

    #[test]
    fn seen_payload_ids_accumulates_across_epochs() {
        let mut wal = Wal::open_in_memory().unwrap();
        wal.append(&sample(1, 1, "a")).unwrap();
        wal.append(&sample(1, 2, "b")).unwrap();
        wal.append(&sample(2, 3, "c")).unwrap();

        let seen = wal.seen_payload_ids().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains("a"));
        assert!(seen.contains("c"));
    }

    #[test]
    fn open_on_a_real_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal_7.sqlite3");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&sample(1, 1, "a")).unwrap();
        }
        {
            let wal = Wal::open(&path).unwrap();
            let records = wal.replay().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].payload_id, "a");
        }
    }

    #[test]
    fn empty_wal_replays_empty_and_has_no_last_seq() {
        let wal = Wal::open_in_memory().unwrap();
        assert!(wal.replay().unwrap().is_empty());
        assert_eq!(wal.last_epoch_and_seq().unwrap(), None);
    }
}
