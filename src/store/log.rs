//! Append-only record logs, one file per worker
//!
//! Every worker appends to its own `worker-<id>.log` inside a shared
//! directory, so worker processes never contend on a file. Readers (the
//! stats endpoint, or another process) scan the files.
//!
//! Record format (36 bytes, little-endian):
//! [MAGIC][ID u64][WORKER_ID u32][VALUE i64][CREATED_AT_MS i64][CRC32]
//!
//! The checksum covers everything between the magic and itself. A torn or
//! corrupt record ends the scan; the writer truncates such a tail when it
//! reopens the file.

use crate::common::{
    crc32, Error, PersistedNumber, Result, SyncPolicy, WorkerCount, WorkerId,
};
use crate::store::NumberStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const RECORD_MAGIC: [u8; 4] = [0x46, 0x53, 0x4E, 0x31]; // "FSN1"
const BODY_LEN: usize = 8 + 4 + 8 + 8;
const RECORD_LEN: usize = RECORD_MAGIC.len() + BODY_LEN + 4;

const FILE_PREFIX: &str = "worker-";
const FILE_SUFFIX: &str = ".log";

fn log_file_name(worker_id: WorkerId) -> String {
    format!("{}{}{}", FILE_PREFIX, worker_id, FILE_SUFFIX)
}

fn parse_log_file_name(name: &str) -> Option<WorkerId> {
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    WorkerId::new(id.parse().ok()?).ok()
}

fn encode_record(record: &PersistedNumber) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[..4].copy_from_slice(&RECORD_MAGIC);
    buf[4..12].copy_from_slice(&record.id.to_le_bytes());
    buf[12..16].copy_from_slice(&record.worker_id.get().to_le_bytes());
    buf[16..24].copy_from_slice(&record.value.to_le_bytes());
    buf[24..32].copy_from_slice(&record.created_at.timestamp_millis().to_le_bytes());
    let checksum = crc32(&buf[4..4 + BODY_LEN]);
    buf[32..36].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Read one record. `Ok(None)` at a clean end of file.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<PersistedNumber>> {
    let mut buf = [0u8; RECORD_LEN];
    // A partial header at EOF is a torn write, reported as corruption below
    let mut filled = 0;
    while filled < RECORD_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < RECORD_LEN {
        return Err(Error::Corrupted(format!(
            "truncated record ({} of {} bytes)",
            filled, RECORD_LEN
        )));
    }

    if buf[..4] != RECORD_MAGIC {
        return Err(Error::Corrupted("invalid record magic".into()));
    }
    let stored = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);
    if crc32(&buf[4..4 + BODY_LEN]) != stored {
        return Err(Error::Corrupted("checksum mismatch".into()));
    }

    let field = |range: std::ops::Range<usize>| -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&buf[range]);
        out
    };
    let id = u64::from_le_bytes(field(4..12));
    let worker_id = WorkerId::new(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]))?;
    let value = i64::from_le_bytes(field(16..24));
    let created_ms = i64::from_le_bytes(field(24..32));
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .ok_or_else(|| Error::Corrupted(format!("timestamp out of range: {}", created_ms)))?;

    Ok(Some(PersistedNumber {
        id,
        worker_id,
        value,
        created_at,
    }))
}

/// Summary of one log file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    items: u64,
    total: i64,
    last_id: u64,
    /// Bytes covered by valid records
    valid_len: u64,
}

/// Replay a worker log. Returns the tally of the valid prefix; a missing
/// file is an empty log.
fn replay<F>(path: &Path, mut callback: F) -> Result<Tally>
where
    F: FnMut(&PersistedNumber),
{
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tally::default()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut tally = Tally::default();
    loop {
        match read_record(&mut reader) {
            Ok(Some(record)) => {
                tally.items += 1;
                tally.total = tally.total.saturating_add(record.value);
                tally.last_id = tally.last_id.max(record.id);
                tally.valid_len += RECORD_LEN as u64;
                callback(&record);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(path = %path.display(), "log replay stopped at corrupted record: {}", e);
                break;
            }
        }
    }
    Ok(tally)
}

/// The file operations a worker log needs beyond `Write`
trait LogFile: Write {
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Open append handle on one worker's log. Records go straight to the file,
/// nothing is buffered in userspace.
struct WorkerLog<F = File> {
    file: F,
    tally: Tally,
}

impl<F: LogFile> WorkerLog<F> {
    fn write_record(&mut self, record: &PersistedNumber, sync_policy: SyncPolicy) -> Result<()> {
        self.file.write_all(&encode_record(record))?;
        if sync_policy == SyncPolicy::Always {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Append one record and count it.
    ///
    /// On failure the file is cut back to the last committed record and the
    /// tally is left untouched, so a rejected write never surfaces later.
    fn append(&mut self, record: &PersistedNumber, sync_policy: SyncPolicy) -> Result<()> {
        if let Err(e) = self.write_record(record, sync_policy) {
            if let Err(rollback) = self.file.truncate(self.tally.valid_len) {
                return Err(Error::Storage(format!(
                    "{}; rolling back the log tail failed: {}",
                    e, rollback
                )));
            }
            return Err(e);
        }

        self.tally.items += 1;
        self.tally.total = self.tally.total.saturating_add(record.value);
        self.tally.last_id = record.id;
        self.tally.valid_len += RECORD_LEN as u64;
        Ok(())
    }
}

/// Per-worker state. The writer and the committed tally are locked
/// separately: reading a sum never waits for a write or an fsync.
#[derive(Default)]
struct WorkerSlot {
    /// `None` until the first write, and again after a failed one
    log: Mutex<Option<WorkerLog>>,
    /// Tally of the records on disk, once the writer has replayed them
    committed: Mutex<Option<Tally>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// File-backed [`NumberStore`]
pub struct LogStore {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    /// Workers this process writes for. The map lock is only held to look a
    /// slot up.
    slots: Mutex<HashMap<WorkerId, Arc<WorkerSlot>>>,
}

impl LogStore {
    /// Open (and create if needed) the shared log directory.
    pub fn open(dir: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sync_policy,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, worker_id: WorkerId) -> PathBuf {
        self.dir.join(log_file_name(worker_id))
    }

    /// Every valid record of one worker, oldest first
    pub fn records(&self, worker_id: WorkerId) -> Result<Vec<PersistedNumber>> {
        let mut records = Vec::new();
        replay(&self.path_for(worker_id), |r| records.push(r.clone()))?;
        Ok(records)
    }

    fn slot(&self, worker_id: WorkerId) -> Arc<WorkerSlot> {
        lock(&self.slots).entry(worker_id).or_default().clone()
    }

    fn existing_slot(&self, worker_id: WorkerId) -> Option<Arc<WorkerSlot>> {
        lock(&self.slots).get(&worker_id).cloned()
    }

    fn open_writer(&self, worker_id: WorkerId) -> Result<WorkerLog> {
        let path = self.path_for(worker_id);
        let tally = replay(&path, |_| {})?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len > tally.valid_len {
            tracing::warn!(
                worker_id = %worker_id,
                dropped = len - tally.valid_len,
                "truncating corrupt log tail"
            );
            file.set_len(tally.valid_len)?;
        }

        tracing::debug!(
            worker_id = %worker_id,
            items = tally.items,
            total = tally.total,
            "opened worker log"
        );
        Ok(WorkerLog { file, tally })
    }

    fn tally_for(&self, worker_id: WorkerId) -> Result<Tally> {
        let committed = self
            .existing_slot(worker_id)
            .and_then(|slot| {
                let committed = *lock(&slot.committed);
                committed
            });
        match committed {
            Some(tally) => Ok(tally),
            None => replay(&self.path_for(worker_id), |_| {}),
        }
    }

    /// fsync every open writer
    pub fn sync(&self) -> Result<()> {
        let slots: Vec<Arc<WorkerSlot>> = lock(&self.slots).values().cloned().collect();
        for slot in slots {
            if let Some(log) = lock(&slot.log).as_mut() {
                log.file.sync()?;
            }
        }
        Ok(())
    }
}

impl NumberStore for LogStore {
    fn persist(&self, worker_id: WorkerId, value: i64) -> Result<PersistedNumber> {
        let slot = self.slot(worker_id);
        let mut log = lock(&slot.log);
        if log.is_none() {
            let opened = self.open_writer(worker_id)?;
            *lock(&slot.committed) = Some(opened.tally);
            *log = Some(opened);
        }
        let writer = log
            .as_mut()
            .ok_or_else(|| Error::Internal("worker log vanished".into()))?;

        let record = PersistedNumber {
            id: writer.tally.last_id + 1,
            worker_id,
            value,
            created_at: Utc::now(),
        };
        if let Err(e) = writer.append(&record, self.sync_policy) {
            // Reopened (and its tail re-checked) by the next write
            *log = None;
            return Err(e);
        }
        *lock(&slot.committed) = Some(writer.tally);
        Ok(record)
    }

    fn sum_for(&self, worker_id: WorkerId) -> Result<i64> {
        Ok(self.tally_for(worker_id)?.total)
    }

    fn counts_by_worker(&self) -> Result<Vec<WorkerCount>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_log_file_name) {
                ids.push(id);
            }
        }
        ids.sort();

        let mut counts = Vec::with_capacity(ids.len());
        for worker_id in ids {
            let items = self.tally_for(worker_id)?.items;
            if items > 0 {
                counts.push(WorkerCount { worker_id, items });
            }
        }
        Ok(counts)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if self.sync_policy == SyncPolicy::Never {
            return;
        }
        if let Err(e) = self.sync() {
            tracing::warn!("failed to sync worker logs: {}", e);
        }
    }
}
