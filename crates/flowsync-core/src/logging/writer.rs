//! Append-only JSONL files, one per peer per day, and queries over them

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::Level;

use super::record::LogRecord;

/// Appends records to `<logs_dir>/<date>_<peer>.jsonl`
pub struct PeerLogWriter {
    peer: String,
    out: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for PeerLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLogWriter")
            .field("peer", &self.peer)
            .field("path", &self.path)
            .finish()
    }
}

/// `<date>_<peer>.jsonl`, with path separators in the label replaced
fn file_name(peer: &str) -> String {
    let label: String = peer
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}_{}.jsonl", chrono::Local::now().format("%Y-%m-%d"), label)
}

impl PeerLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> std::io::Result<Self> {
        let peer = peer.into();
        fs::create_dir_all(logs_dir.as_ref())?;
        let path = logs_dir.as_ref().join(file_name(&peer));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            peer,
            out: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line, flushed so concurrent readers see
    /// whole lines only
    pub fn write(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        out.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.out.lock().flush()
    }
}

impl Drop for PeerLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Which records a query keeps; every criterion left unset matches
///
/// ```ignore
/// let handshake = RecordFilter::new()
///     .key(&key.short())
///     .remote(&peer.short())
///     .at_least(Level::DEBUG);
/// for record in read_filtered("./logs", &handshake)? { ... }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    peer: Option<String>,
    key: Option<String>,
    remote: Option<String>,
    min_level: Option<Level>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written by this peer
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Emitted while on this shared flowchart
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// About this remote peer
    pub fn remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// At `level` or more severe
    pub fn at_least(mut self, level: Level) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        fn same(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().is_none_or(|want| have == Some(want))
        }
        same(&self.peer, Some(&record.peer))
            && same(&self.key, record.key.as_deref())
            && same(&self.remote, record.remote.as_deref())
            && self.min_level.is_none_or(|min| {
                // tracing orders more verbose levels higher
                record.level.parse::<Level>().is_ok_and(|level| level <= min)
            })
    }
}

/// Every record under `logs_dir`, merged and sorted by timestamp
///
/// Lines that fail to parse are skipped.
pub fn read_records(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogRecord>> {
    read_filtered(logs_dir, &RecordFilter::default())
}

/// Records matching `filter` across all peers' files, in timestamp order
pub fn read_filtered(logs_dir: impl AsRef<Path>, filter: &RecordFilter) -> std::io::Result<Vec<LogRecord>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(logs_dir)? {
        let path = entry?.path();
        if path.extension().is_none_or(|e| e != "jsonl") {
            continue;
        }
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(record) = LogRecord::from_json_line(line) {
                if filter.matches(&record) {
                    records.push(record);
                }
            }
        }
    }
    // RFC 3339 UTC with fixed precision sorts lexically
    records.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(records)
}

/// Records written by one peer
pub fn records_for_peer(logs_dir: impl AsRef<Path>, peer: &str) -> std::io::Result<Vec<LogRecord>> {
    read_filtered(logs_dir, &RecordFilter::new().peer(peer))
}

/// Every peer's records for one shared flowchart, as a single timeline
pub fn flowchart_timeline(logs_dir: impl AsRef<Path>, key: &str) -> std::io::Result<Vec<LogRecord>> {
    read_filtered(logs_dir, &RecordFilter::new().key(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(level: &str, peer: &str, msg: &str) -> LogRecord {
        LogRecord::new(level, peer, "flowsync_core::sync", msg)
    }

    #[test]
    fn test_writer_appends_lines() {
        let temp = TempDir::new().unwrap();
        let writer = PeerLogWriter::new(temp.path(), "aa11bb22").unwrap();
        writer.write(&record("info", "aa11bb22", "first")).unwrap();
        writer.write(&record("warn", "aa11bb22", "second")).unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(writer.path().to_string_lossy().ends_with("_aa11bb22.jsonl"));
    }

    #[test]
    fn test_label_with_separator_stays_in_logs_dir() {
        let temp = TempDir::new().unwrap();
        let writer = PeerLogWriter::new(temp.path(), "../escape").unwrap();
        assert_eq!(writer.path().parent(), Some(temp.path()));
        assert_eq!(writer.peer(), "../escape");
    }

    #[test]
    fn test_read_merges_peers_and_skips_garbage() {
        let temp = TempDir::new().unwrap();
        let a = PeerLogWriter::new(temp.path(), "alice").unwrap();
        let b = PeerLogWriter::new(temp.path(), "bob").unwrap();
        a.write(&record("info", "alice", "offer sent")).unwrap();
        b.write(&record("info", "bob", "answer sent")).unwrap();
        fs::write(temp.path().join("junk.jsonl"), "not json\n").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored\n").unwrap();
        drop(a);
        drop(b);

        assert_eq!(read_records(temp.path()).unwrap().len(), 2);
        let bob = records_for_peer(temp.path(), "bob").unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].msg, "answer sent");
    }

    #[test]
    fn test_timeline_spans_peers_for_one_flowchart() {
        let temp = TempDir::new().unwrap();
        let a = PeerLogWriter::new(temp.path(), "alice").unwrap();
        let b = PeerLogWriter::new(temp.path(), "bob").unwrap();
        a.write(&record("info", "alice", "Sharing flowchart").with_key("k1"))
            .unwrap();
        b.write(&record("info", "bob", "Joined shared flowchart").with_key("k1"))
            .unwrap();
        b.write(&record("info", "bob", "Joined shared flowchart").with_key("k2"))
            .unwrap();
        a.write(&record("info", "alice", "Session status changed")).unwrap();

        let timeline = flowchart_timeline(temp.path(), "k1").unwrap();
        let mut peers: Vec<&str> = timeline.iter().map(|r| r.peer.as_str()).collect();
        peers.sort();
        assert_eq!(peers, ["alice", "bob"]);
        assert!(timeline.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[test]
    fn test_filter_combines_remote_and_severity() {
        let temp = TempDir::new().unwrap();
        let a = PeerLogWriter::new(temp.path(), "alice").unwrap();
        a.write(&record("debug", "alice", "Offer sent").with_remote("bob"))
            .unwrap();
        a.write(&record("warn", "alice", "Could not connect to peer").with_remote("bob"))
            .unwrap();
        a.write(&record("error", "alice", "Could not connect to peer").with_remote("carol"))
            .unwrap();
        a.write(&record("loud", "alice", "unknown level").with_remote("bob"))
            .unwrap();

        let filter = RecordFilter::new().remote("bob").at_least(Level::WARN);
        let hits = read_filtered(temp.path(), &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].level, "warn");

        let everything_about_bob = read_filtered(temp.path(), &RecordFilter::new().remote("bob")).unwrap();
        assert_eq!(everything_about_bob.len(), 3);
    }

    #[test]
    fn test_missing_dir_reads_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_records(temp.path().join("nope")).unwrap().is_empty());
    }
}
