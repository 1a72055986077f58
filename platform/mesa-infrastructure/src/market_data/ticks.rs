use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mesa_domain::repositories::market_stream::{MarketConnector, MarketStream, StreamError};
use mesa_domain::value_objects::tick::Tick;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Integer timestamps at or above this are epoch milliseconds, below it epoch seconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Deserialize)]
pub struct TickRecord {
    pub timestamp: String,
    pub price: f64,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TickRecord {
    fn into_tick(self) -> Result<Tick, String> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(Tick::new(timestamp, self.price, self.size.unwrap_or(1)))
    }
}

/// Parses epoch seconds, epoch milliseconds, fractional epoch seconds or an RFC3339 /
/// `YYYY-MM-DD HH:MM:SS[.fff]` UTC string into epoch milliseconds.
pub fn parse_timestamp(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if let Ok(raw) = value.parse::<i64>() {
        return Ok(if raw.abs() >= MILLIS_THRESHOLD {
            raw
        } else {
            raw * 1_000
        });
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() {
            return Ok((secs * 1_000.0).round() as i64);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    Err(format!("unsupported timestamp format: {}", value))
}

/// Reads a whole tick file. Unparseable rows fail the load.
pub fn load_ticks_csv(path: &Path) -> Result<Vec<Tick>, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open tick CSV {}: {}", path.display(), err))?;
    let mut reader = csv::Reader::from_reader(file);
    let mut ticks = Vec::new();
    for (idx, result) in reader.deserialize::<TickRecord>().enumerate() {
        let record =
            result.map_err(|err| format!("failed to parse tick row {}: {}", idx + 1, err))?;
        let tick = record
            .into_tick()
            .map_err(|err| format!("tick row {}: {}", idx + 1, err))?;
        ticks.push(tick);
    }
    Ok(ticks)
}

struct Pacer {
    scale: u64,
    started: Instant,
    first_timestamp: Option<i64>,
}

impl Pacer {
    fn wait_for(&mut self, timestamp: i64) {
        let first = *self.first_timestamp.get_or_insert(timestamp);
        let offset_ms = (timestamp - first).max(0) as u64 / self.scale.max(1);
        let due = Duration::from_millis(offset_ms);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            thread::sleep(due - elapsed);
        }
    }
}

/// Streams a tick CSV row by row. With a replay scale, ticks are released at their
/// recorded spacing divided by the scale.
pub struct CsvTickStream {
    rows: csv::DeserializeRecordsIntoIter<File, TickRecord>,
    row: u64,
    progress: Option<Arc<AtomicU64>>,
    pacer: Option<Pacer>,
}

impl CsvTickStream {
    pub fn open(path: &Path, replay_scale: Option<u64>) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|err| format!("failed to open tick CSV {}: {}", path.display(), err))?;
        Ok(Self {
            rows: csv::Reader::from_reader(file).into_deserialize(),
            row: 0,
            progress: None,
            pacer: replay_scale.map(|scale| Pacer {
                scale,
                started: Instant::now(),
                first_timestamp: None,
            }),
        })
    }

    fn skip_rows(&mut self, count: u64) {
        while self.row < count {
            if self.rows.next().is_none() {
                break;
            }
            self.row += 1;
        }
    }
}

impl MarketStream for CsvTickStream {
    fn next_tick(&mut self) -> Result<Tick, StreamError> {
        let Some(result) = self.rows.next() else {
            return Err(StreamError::EndOfStream);
        };
        self.row += 1;
        if let Some(progress) = &self.progress {
            progress.store(self.row, Ordering::SeqCst);
        }
        let record = match result {
            Ok(record) => record,
            Err(err) if err.is_io_error() => {
                return Err(StreamError::Disconnected(format!("tick CSV read failed: {err}")))
            }
            Err(err) => return Err(StreamError::InvalidData(format!("row {}: {err}", self.row))),
        };
        let tick = record
            .into_tick()
            .map_err(|err| StreamError::InvalidData(format!("row {}: {err}", self.row)))?;
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait_for(tick.timestamp);
        }
        Ok(tick)
    }
}

/// Opens a tick CSV for the live runtime. A reconnect resumes after the last row handed
/// out instead of replaying the file.
#[derive(Debug, Clone)]
pub struct CsvConnector {
    path: PathBuf,
    replay_scale: Option<u64>,
    progress: Arc<AtomicU64>,
}

impl CsvConnector {
    pub fn new(path: impl Into<PathBuf>, replay_scale: Option<u64>) -> Self {
        Self {
            path: path.into(),
            replay_scale,
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn rows_consumed(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }
}

impl MarketConnector for CsvConnector {
    type Stream = CsvTickStream;

    fn connect(&mut self) -> Result<CsvTickStream, StreamError> {
        let mut stream =
            CsvTickStream::open(&self.path, self.replay_scale).map_err(StreamError::Disconnected)?;
        stream.skip_rows(self.progress.load(Ordering::SeqCst));
        stream.progress = Some(Arc::clone(&self.progress));
        Ok(stream)
    }
}
