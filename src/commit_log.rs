use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::error::Result;

/// 0-based monotonically increasing log index. `-1` denotes "no entries"
/// (an empty log), matching the source's use of `-1` as the empty-log
/// sentinel rather than `Option<usize>`, since `prevIndex` arithmetic
/// (`nextIndex[j] - 1`) needs to go negative.
pub type LogIndex = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub term: u64,
    pub command: String,
}

/// Append-only durable log of `(term, command)` records, addressed by
/// dense, 0-based index. See SPEC_FULL.md §4.1.
pub trait CommitLog: Send + Sync {
    fn append(&self, term: u64, command: &str) -> Result<(LogIndex, u64)>;
    fn get_last_index_term(&self) -> (LogIndex, u64);
    fn read_from(&self, start_index: LogIndex) -> Vec<Entry>;
    fn read_range(&self, start_index: LogIndex, end_index: LogIndex) -> Vec<Entry>;
    fn replace_from(&self, term: u64, commands: &[String], start_index: LogIndex) -> Result<(LogIndex, u64)>;
}

/// Single newline-delimited file: `<term> <json-escaped-command>` per line.
/// The in-memory `entries` vector mirrors the file and is rebuilt from it
/// on startup so a replica survives restart; `file` is reopened for append
/// and fully rewritten (truncate + rewrite) on `replace_from`, which is the
/// only operation that can shrink the log.
pub struct FileCommitLog {
    entries: RwLock<Vec<Entry>>,
    file: Mutex<File>,
    path: std::path::PathBuf,
}

impl FileCommitLog {
    /// Opens (creating if absent) the commit log file at `path`, replaying
    /// any existing records into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let entries = replay(&path)?;
        Ok(FileCommitLog { entries: RwLock::new(entries), file: Mutex::new(file), path })
    }

    fn rewrite_file(&self, entries: &[Entry]) -> Result<()> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        for entry in entries {
            write_record(&mut file, entry)?;
        }
        file.sync_data()?;
        let append_handle = OpenOptions::new().append(true).open(&self.path)?;
        *self.file.lock().unwrap() = append_handle;
        Ok(())
    }
}

fn write_record(file: &mut File, entry: &Entry) -> io::Result<()> {
    let encoded = serde_json::to_string(&entry.command).unwrap_or_else(|_| "\"\"".to_string());
    writeln!(file, "{} {}", entry.term, encoded)?;
    Ok(())
}

fn replay(path: &Path) -> Result<Vec<Entry>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if let Some((term_str, command_json)) = line.split_once(' ') {
            let term: u64 = term_str.parse().unwrap_or(0);
            let command: String = serde_json::from_str(command_json).unwrap_or_default();
            entries.push(Entry { term, command });
        }
    }
    Ok(entries)
}

impl CommitLog for FileCommitLog {
    fn append(&self, term: u64, command: &str) -> Result<(LogIndex, u64)> {
        let entry = Entry { term, command: command.to_string() };
        {
            let mut file = self.file.lock().unwrap();
            write_record(&mut file, &entry)?;
            file.flush()?;
            file.sync_data()?;
        }
        let mut entries = self.entries.write().unwrap();
        entries.push(entry);
        Ok((entries.len() as LogIndex - 1, term))
    }

    fn get_last_index_term(&self) -> (LogIndex, u64) {
        let entries = self.entries.read().unwrap();
        match entries.last() {
            Some(entry) => (entries.len() as LogIndex - 1, entry.term),
            None => (-1, 0),
        }
    }

    fn read_from(&self, start_index: LogIndex) -> Vec<Entry> {
        let entries = self.entries.read().unwrap();
        if start_index < 0 || start_index as usize >= entries.len() {
            return Vec::new();
        }
        entries[start_index as usize..].to_vec()
    }

    fn read_range(&self, start_index: LogIndex, end_index: LogIndex) -> Vec<Entry> {
        let entries = self.entries.read().unwrap();
        if start_index < 0 || end_index < start_index {
            return Vec::new();
        }
        let end = (end_index as usize + 1).min(entries.len());
        let start = start_index as usize;
        if start >= entries.len() || start >= end {
            return Vec::new();
        }
        entries[start..end].to_vec()
    }

    fn replace_from(&self, term: u64, commands: &[String], start_index: LogIndex) -> Result<(LogIndex, u64)> {
        let mut entries = self.entries.write().unwrap();
        let truncate_at = start_index.max(0) as usize;
        entries.truncate(truncate_at.min(entries.len()));
        for command in commands {
            entries.push(Entry { term, command: command.clone() });
        }
        self.rewrite_file(&entries)?;
        let last_index = entries.len() as LogIndex - 1;
        let last_term = entries.last().map(|e| e.term).unwrap_or(0);
        Ok((last_index, last_term))
    }
}
