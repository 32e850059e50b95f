use std::net::Ipv4Addr;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OpenFlags, params, OptionalExtension};
use crate::types::{ClockId, InventoryEntry, StreamDescription};

const SELECT_COLUMNS: &str = "SELECT hash, first_seen, last_seen, source_address, sdp,
        source_type, source_name, source_info, origin, stream_address, multicast_ttl,
        udp_port, payload_type, bit_depth, sample_rate, channel_count, packet_time,
        ptp_domain, ptp_gmid, clock_offset
    FROM sap_announcements";

/// What an upsert did to the row for a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed for the hash
    Inserted,
    /// The row existed and at least one descriptive field changed
    Updated,
    /// Only the timestamp moved
    Refreshed,
}

/// Live stream inventory, one row per SAP message id hash.
pub struct InventoryDb {
    conn: Connection,
}

impl InventoryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Open an existing database for reading only
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open database read-only: {}", path.display()))?;

        Ok(Self { conn })
    }

    /// Create the announcement table if it does not exist yet
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sap_announcements (
                hash           INTEGER PRIMARY KEY,
                first_seen     INTEGER NOT NULL,
                last_seen      INTEGER NOT NULL,
                source_address TEXT NOT NULL,
                sdp            TEXT NOT NULL,
                source_type    TEXT NOT NULL,
                source_name    TEXT NOT NULL,
                source_info    TEXT NOT NULL,
                origin         TEXT NOT NULL,
                stream_address TEXT NOT NULL,
                multicast_ttl  INTEGER NOT NULL,
                udp_port       INTEGER NOT NULL,
                payload_type   INTEGER NOT NULL,
                bit_depth      INTEGER NOT NULL,
                sample_rate    INTEGER NOT NULL,
                channel_count  INTEGER NOT NULL,
                packet_time    INTEGER NOT NULL,
                ptp_domain     INTEGER NOT NULL,
                ptp_gmid       TEXT,
                clock_offset   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_last_seen ON sap_announcements(last_seen);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(())
    }

    /// Insert a stream, or refresh the timestamp and descriptive fields of
    /// the existing row for the same hash. `first_seen` is kept on refresh.
    pub fn upsert(&self, entry: &InventoryEntry) -> Result<UpsertOutcome> {
        let existing = self.get(entry.hash).context("Failed to query existing stream")?;

        let outcome = match &existing {
            None => UpsertOutcome::Inserted,
            Some(old) if stream_data_changed(old, entry) => UpsertOutcome::Updated,
            Some(_) => UpsertOutcome::Refreshed,
        };

        let d = &entry.description;

        self.conn.execute(
            r#"
            INSERT INTO sap_announcements (
                hash, first_seen, last_seen, source_address, sdp,
                source_type, source_name, source_info, origin, stream_address, multicast_ttl,
                udp_port, payload_type, bit_depth, sample_rate, channel_count, packet_time,
                ptp_domain, ptp_gmid, clock_offset
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(hash) DO UPDATE SET
                last_seen = excluded.last_seen,
                source_address = excluded.source_address,
                sdp = excluded.sdp,
                source_type = excluded.source_type,
                source_name = excluded.source_name,
                source_info = excluded.source_info,
                origin = excluded.origin,
                stream_address = excluded.stream_address,
                multicast_ttl = excluded.multicast_ttl,
                udp_port = excluded.udp_port,
                payload_type = excluded.payload_type,
                bit_depth = excluded.bit_depth,
                sample_rate = excluded.sample_rate,
                channel_count = excluded.channel_count,
                packet_time = excluded.packet_time,
                ptp_domain = excluded.ptp_domain,
                ptp_gmid = excluded.ptp_gmid,
                clock_offset = excluded.clock_offset
            "#,
            params![
                entry.hash,
                entry.first_seen.timestamp_millis(),
                entry.last_seen.timestamp_millis(),
                &entry.source_address,
                &entry.sdp,
                &d.source_type,
                &d.source_name,
                &d.source_info,
                &d.origin,
                d.stream_address.to_string(),
                d.multicast_ttl,
                d.udp_port,
                d.payload_type,
                d.bit_depth,
                d.sample_rate,
                d.channel_count,
                d.packet_time,
                d.ptp_domain,
                d.ptp_gmid.map(|id| id.to_string()),
                d.clock_offset,
            ],
        )
        .context("Failed to upsert stream")?;

        Ok(outcome)
    }

    /// Remove the stream with the given hash. Returns false if it was absent.
    pub fn delete(&self, hash: u16) -> Result<bool> {
        let count = self.conn.execute(
            "DELETE FROM sap_announcements WHERE hash = ?1",
            params![hash],
        )
        .context("Failed to delete stream")?;

        Ok(count > 0)
    }

    /// Delete every stream last seen before `now - window`. Returns the count removed.
    pub fn sweep(&self, now: DateTime<Utc>, window: Duration) -> Result<u64> {
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return Ok(0);
        };
        let cutoff = cutoff.timestamp_millis();

        let count = self.conn.execute(
            "DELETE FROM sap_announcements WHERE last_seen < ?1",
            params![cutoff],
        )
        .context("Failed to sweep expired streams")?;

        Ok(count as u64)
    }

    /// All streams, ordered by source name
    pub fn list(&self) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY source_name ASC, hash ASC", SELECT_COLUMNS))
            .context("Failed to prepare query")?;

        let entries = stmt
            .query_map([], |row| {
                Ok(Self::row_to_entry(row)?)
            })
            .context("Failed to query streams")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect streams")?;

        Ok(entries)
    }

    /// Get a single stream by hash
    pub fn get(&self, hash: u16) -> Result<Option<InventoryEntry>> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE hash = ?1", SELECT_COLUMNS),
                params![hash],
                |row| Ok(Self::row_to_entry(row)?),
            )
            .optional()
            .context("Failed to query stream")?;

        Ok(result)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sap_announcements", [], |row| row.get(0))
            .context("Failed to count streams")?;

        Ok(count as u64)
    }

    fn row_to_entry(row: &rusqlite::Row) -> Result<InventoryEntry, rusqlite::Error> {
        let first_seen = millis_to_datetime(row.get(1)?, 1)?;
        let last_seen = millis_to_datetime(row.get(2)?, 2)?;

        let stream_address_str: String = row.get(9)?;
        let stream_address: Ipv4Addr = stream_address_str
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        let ptp_gmid_str: Option<String> = row.get(18)?;
        let ptp_gmid = ptp_gmid_str
            .map(|s| s.parse::<ClockId>())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                18,
                rusqlite::types::Type::Text,
                e.into(),
            ))?;

        Ok(InventoryEntry {
            hash: row.get::<_, u16>(0)?,
            source_address: row.get(3)?,
            sdp: row.get(4)?,
            description: StreamDescription {
                source_type: row.get(5)?,
                source_name: row.get(6)?,
                source_info: row.get(7)?,
                origin: row.get(8)?,
                stream_address,
                multicast_ttl: row.get::<_, u8>(10)?,
                udp_port: row.get::<_, u16>(11)?,
                payload_type: row.get::<_, u8>(12)?,
                bit_depth: row.get::<_, u8>(13)?,
                sample_rate: row.get::<_, u32>(14)?,
                channel_count: row.get::<_, u16>(15)?,
                packet_time: row.get::<_, u32>(16)?,
                ptp_domain: row.get::<_, u8>(17)?,
                ptp_gmid,
                clock_offset: row.get::<_, u32>(19)?,
            },
            first_seen,
            last_seen,
        })
    }
}

fn millis_to_datetime(millis: i64, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

/// Compare descriptive fields only; timestamps move on every refresh.
fn stream_data_changed(old: &InventoryEntry, new: &InventoryEntry) -> bool {
    old.source_address != new.source_address
        || old.sdp != new.sdp
        || old.description != new.description
}
