use mesa_domain::repositories::trade_journal::{TradeJournal, TradeJournalReader};
use mesa_domain::value_objects::journal::JournalRecord;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only JSON Lines journal. Every record is flushed before `append` returns, so a
/// crash loses at most the line being written. Records already on disk are never rewritten.
pub struct JsonlTradeJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl JsonlTradeJournal {
    /// Opens the journal of a new run. A journal that already holds records belongs to an
    /// earlier run and is refused; it stays on disk untouched.
    pub fn create(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create dir {}: {}", parent.display(), err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format!("failed to open journal {}: {}", path.display(), err))?;
        let existing = file
            .metadata()
            .map_err(|err| format!("failed to stat journal {}: {}", path.display(), err))?
            .len();
        if existing > 0 {
            return Err(format!(
                "journal {} already holds records from an earlier run; use a new run_id or --out-dir",
                path.display()
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }
}

impl TradeJournal for JsonlTradeJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), String> {
        let line = serde_json::to_string(record)
            .map_err(|err| format!("failed to serialize journal record: {}", err))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|err| format!("failed to write journal {}: {}", self.path.display(), err))?;
        self.records += 1;
        metrics::counter!("mesa.journal.records", "event" => format!("{:?}", record.event))
            .increment(1);
        Ok(())
    }
}

/// Loads every record of a JSONL journal. A malformed final line without a trailing
/// newline is treated as a torn write and skipped; malformed lines elsewhere are errors.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>, String> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read journal {}: {}", path.display(), err))?;
    let complete = text.ends_with('\n');
    let lines: Vec<&str> = text.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if idx + 1 == lines.len() && !complete => {
                warn!(line = idx + 1, error = %err, "skipping torn journal line");
            }
            Err(err) => {
                return Err(format!(
                    "invalid journal record at {}:{}: {}",
                    path.display(),
                    idx + 1,
                    err
                ))
            }
        }
    }
    Ok(records)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlJournalReader;

impl TradeJournalReader for JsonlJournalReader {
    fn read_records(&self, path: &Path) -> Result<Vec<JournalRecord>, String> {
        read_journal(path)
    }
}
