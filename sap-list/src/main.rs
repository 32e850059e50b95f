//! List the AES67 streams currently known to sap-discoveryd.
//!
//! ```bash
//! # Table of live streams
//! sap-list
//!
//! # Machine-readable output
//! sap-list --csv
//! sap-list --json
//!
//! # Raw session description of one stream
//! sap-list --hash 0x1234
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use clap::Parser;
use tabled::{Table, Tabled};
use anyhow::{Context, Result};
use shared::store::InventoryDb;
use shared::types::InventoryEntry;

const CSV_HEADER: &str =
    "Hash,Stream type,Source name,Stream address,Channels,Bit depth,Sample rate,PTP GMID,PTP domain";

/// List streams discovered through SAP announcements
#[derive(Parser, Debug)]
#[command(name = "sap-list")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated output without table decoration
    #[arg(short = 'u', long, conflicts_with = "json")]
    csv: bool,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// Inventory database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print the raw session description of one stream (decimal or 0x hex)
    #[arg(long, value_parser = parse_hash)]
    hash: Option<u16>,
}

#[derive(Tabled)]
struct StreamRow {
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Stream type")]
    source_type: String,
    #[tabled(rename = "Source name")]
    source_name: String,
    #[tabled(rename = "Stream address")]
    stream_address: String,
    #[tabled(rename = "Channels")]
    channels: u16,
    #[tabled(rename = "Bit depth")]
    bit_depth: u8,
    #[tabled(rename = "Sample rate")]
    sample_rate: u32,
    #[tabled(rename = "PTP GMID")]
    ptp_gmid: String,
    #[tabled(rename = "PTP domain")]
    ptp_domain: u8,
}

impl From<&InventoryEntry> for StreamRow {
    fn from(entry: &InventoryEntry) -> Self {
        let d = &entry.description;
        Self {
            hash: format!("0x{:04X}", entry.hash),
            source_type: d.source_type.clone(),
            source_name: d.source_name.clone(),
            stream_address: format!("{}:{}", d.stream_address, d.udp_port),
            channels: d.channel_count,
            bit_depth: d.bit_depth,
            sample_rate: d.sample_rate,
            ptp_gmid: d.ptp_gmid.map(|id| id.to_string()).unwrap_or_default(),
            ptp_domain: d.ptp_domain,
        }
    }
}

fn parse_hash(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid stream hash {:?}: {}", s, e))
}

fn render_table(entries: &[InventoryEntry]) -> String {
    let rows: Vec<StreamRow> = entries.iter().map(StreamRow::from).collect();
    Table::new(rows).to_string()
}

fn render_csv(entries: &[InventoryEntry]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for entry in entries {
        let row = StreamRow::from(entry);
        let fields = [
            row.hash,
            csv_field(&row.source_type),
            csv_field(&row.source_name),
            row.stream_address,
            row.channels.to_string(),
            row.bit_depth.to_string(),
            row.sample_rate.to_string(),
            row.ptp_gmid,
            row.ptp_domain.to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

/// Quote a free-text field when it would break the row
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Entries from the database at `path`. A database that does not exist yet
/// means the daemon has not recorded anything.
fn load_entries(path: &Path) -> Result<Vec<InventoryEntry>> {
    if !path.exists() {
        tracing::debug!("No database at {}", path.display());
        return Ok(Vec::new());
    }
    let db = InventoryDb::open_read_only(path)?;
    db.list()
}

fn load_entry(path: &Path, hash: u16) -> Result<Option<InventoryEntry>> {
    if !path.exists() {
        return Ok(None);
    }
    let db = InventoryDb::open_read_only(path)?;
    db.get(hash)
}

/// Returns false when a requested stream does not exist.
fn run(args: &Args, db_path: &Path, out: &mut impl Write, err: &mut impl Write) -> Result<bool> {
    if let Some(hash) = args.hash {
        return match load_entry(db_path, hash)? {
            Some(entry) => {
                out.write_all(entry.sdp.as_bytes())?;
                Ok(true)
            }
            None => {
                writeln!(err, "SAP : No stream with hash 0x{:04X}.", hash)?;
                Ok(false)
            }
        };
    }

    let entries = load_entries(db_path)?;

    if args.json {
        serde_json::to_writer_pretty(&mut *out, &entries).context("Failed to encode JSON")?;
        writeln!(out)?;
        return Ok(true);
    }

    if entries.is_empty() {
        writeln!(err, "SAP : No current streams.")?;
        return Ok(true);
    }

    if args.csv {
        out.write_all(render_csv(&entries).as_bytes())?;
    } else {
        writeln!(out, "{}", render_table(&entries))?;
    }
    Ok(true)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sap_list=warn,shared=warn"))
        )
        .init();

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => shared::paths::default_db_path()?,
    };

    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    if run(&args, &db_path, &mut stdout.lock(), &mut stderr.lock())? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use chrono::{DateTime, Utc};
    use shared::types::StreamDescription;

    fn entry(hash: u16, name: &str) -> InventoryEntry {
        let seen = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        InventoryEntry {
            hash,
            source_address: "192.168.0.102".to_string(),
            sdp: format!("v=0\r\ns={}\r\n", name),
            description: StreamDescription {
                source_type: "Dante".to_string(),
                source_name: name.to_string(),
                stream_address: Ipv4Addr::new(239, 69, 207, 194),
                udp_port: 5004,
                payload_type: 97,
                bit_depth: 24,
                sample_rate: 48000,
                channel_count: 2,
                ptp_gmid: Some("00-1D-C1-FF-FE-0D-A9-88".parse().unwrap()),
                ..StreamDescription::default()
            },
            first_seen: seen,
            last_seen: seen,
        }
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["sap-list"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn populated_db(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("SDP.db");
        let db = InventoryDb::open(&path).unwrap();
        db.upsert(&entry(0x00AB, "Stage Left")).unwrap();
        db.upsert(&entry(0x1234, "Foyer, Main")).unwrap();
        path
    }

    fn capture(args: &Args, path: &Path) -> (bool, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let found = run(args, path, &mut out, &mut err).unwrap();
        (found, String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    #[test]
    fn test_parse_hash() {
        assert_eq!(parse_hash("4660"), Ok(0x1234));
        assert_eq!(parse_hash("0x1234"), Ok(0x1234));
        assert_eq!(parse_hash("0XbeEF"), Ok(0xBEEF));
        assert!(parse_hash("65536").is_err());
        assert!(parse_hash("0x").is_err());
        assert!(parse_hash("stream").is_err());
    }

    #[test]
    fn test_missing_database_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SDP.db");

        let (found, out, err) = capture(&args(&[]), &path);
        assert!(found);
        assert!(out.is_empty());
        assert_eq!(err, "SAP : No current streams.\n");
        assert!(!path.exists());
    }

    #[test]
    fn test_table_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_db(&dir);

        let (_, out, err) = capture(&args(&[]), &path);
        assert!(err.is_empty());
        assert!(out.contains("Source name"));
        assert!(out.contains("0x00AB"));
        assert!(out.contains("239.69.207.194:5004"));
        assert!(out.contains("00-1D-C1-FF-FE-0D-A9-88"));

        // Ordered by source name
        assert!(out.find("Foyer, Main").unwrap() < out.find("Stage Left").unwrap());
    }

    #[test]
    fn test_csv_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_db(&dir);

        let (_, out, _) = capture(&args(&["-u"]), &path);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "0x1234,Dante,\"Foyer, Main\",239.69.207.194:5004,2,24,48000,00-1D-C1-FF-FE-0D-A9-88,0"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_db(&dir);

        let (_, out, _) = capture(&args(&["--json"]), &path);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let streams = value.as_array().unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0]["hash"], 0x1234);
        assert_eq!(streams[0]["description"]["ptp_gmid"], "00-1D-C1-FF-FE-0D-A9-88");
    }

    #[test]
    fn test_hash_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_db(&dir);

        let (found, out, _) = capture(&args(&["--hash", "0x00ab"]), &path);
        assert!(found);
        assert_eq!(out, "v=0\r\ns=Stage Left\r\n");

        let (found, out, err) = capture(&args(&["--hash", "1"]), &path);
        assert!(!found);
        assert!(out.is_empty());
        assert!(err.contains("0x0001"));
    }

    #[test]
    fn test_csv_and_json_conflict() {
        assert!(Args::try_parse_from(["sap-list", "--csv", "--json"]).is_err());
    }
}
