/// Simulation Event Log
///
/// Append-only JSONL record of a run. Every entry carries the SHA-256 of the
/// previous one, so edited, dropped or reordered lines show up when the file
/// is verified.
use crate::error::{Result, SimError};
use crate::events::{EventSink, SimEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// One line of the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimLogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Label of the run (scenario name)
    pub run: String,
    pub event: SimEvent,
    /// Empty for the first entry
    pub prev_hash: String,
    pub entry_hash: String,
}

impl SimLogEntry {
    fn new(sequence: u64, run: &str, event: SimEvent, prev_hash: String) -> Result<Self> {
        let timestamp = Utc::now();
        let entry_hash = digest(sequence, &timestamp, run, &event, &prev_hash)?;
        Ok(Self {
            sequence,
            timestamp,
            run: run.to_string(),
            event,
            prev_hash,
            entry_hash,
        })
    }

    /// Recompute the hash over the entry's content
    pub fn verify_hash(&self) -> bool {
        digest(self.sequence, &self.timestamp, &self.run, &self.event, &self.prev_hash)
            .map(|expected| expected == self.entry_hash)
            .unwrap_or(false)
    }

    /// `self` directly follows `prev`
    pub fn follows(&self, prev: &SimLogEntry) -> bool {
        self.prev_hash == prev.entry_hash && self.sequence == prev.sequence + 1
    }
}

fn digest(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    run: &str,
    event: &SimEvent,
    prev_hash: &str,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(run.as_bytes());
    hasher.update(serde_json::to_vec(event)?);
    hasher.update(prev_hash.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

struct ChainState {
    writer: BufWriter<File>,
    sequence: u64,
    last_hash: String,
}

/// File-backed event sink with hash chaining
pub struct SimulationLog {
    run: String,
    path: PathBuf,
    chain: Mutex<ChainState>,
    write_errors: AtomicU64,
}

impl SimulationLog {
    /// Create `<dir>/<run>_<timestamp>.jsonl`, creating `dir` if needed
    pub fn create(run: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let path = dir.join(format!("{}_{}.jsonl", run, stamp));
        Self::open(run, path)
    }

    /// Start a fresh chain at `path` (truncating any existing file)
    pub fn open(run: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            run: run.to_string(),
            path,
            chain: Mutex::new(ChainState {
                writer: BufWriter::new(file),
                sequence: 0,
                last_hash: String::new(),
            }),
            write_errors: AtomicU64::new(0),
        })
    }

    /// Append one event and flush it to disk
    pub fn append(&self, event: SimEvent) -> Result<()> {
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = SimLogEntry::new(chain.sequence, &self.run, event, chain.last_hash.clone())?;
        let line = serde_json::to_string(&entry)?;
        writeln!(chain.writer, "{}", line)?;
        chain.writer.flush()?;

        chain.sequence += 1;
        chain.last_hash = entry.entry_hash;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries written so far
    pub fn sequence(&self) -> u64 {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).sequence
    }

    /// Events that could not be written through the `EventSink` interface
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

impl EventSink for SimulationLog {
    fn emit(&self, event: SimEvent) {
        if self.append(event).is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for SimulationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationLog")
            .field("run", &self.run)
            .field("path", &self.path)
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Outcome of `verify_log_file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub total_entries: usize,
    pub verified: bool,
    pub issues: Vec<String>,
}

/// Check every hash and chain link of a log file.
///
/// Unreadable or unparsable lines are errors; broken hashes and links are
/// reported as issues.
pub fn verify_log_file(path: impl AsRef<Path>) -> Result<VerificationResult> {
    let reader = BufReader::new(File::open(path)?);

    let mut entries: Vec<SimLogEntry> = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| {
            SimError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("log line {} is not a valid entry: {}", idx + 1, e),
            ))
        })?;
        entries.push(entry);
    }

    let mut issues = Vec::new();
    if let Some(first) = entries.first() {
        if !first.prev_hash.is_empty() {
            issues.push("entry 0: first entry must not reference a predecessor".to_string());
        }
    }
    for (idx, entry) in entries.iter().enumerate() {
        if entry.sequence != idx as u64 {
            issues.push(format!("entry {}: sequence {} out of order", idx, entry.sequence));
        }
        if !entry.verify_hash() {
            issues.push(format!("entry {}: content does not match its hash", idx));
        }
    }
    for (idx, pair) in entries.windows(2).enumerate() {
        if !pair[1].follows(&pair[0]) {
            issues.push(format!("entry {}: chain broken (missing or reordered entry)", idx + 1));
        }
    }

    Ok(VerificationResult {
        total_entries: entries.len(),
        verified: issues.is_empty(),
        issues,
    })
}
