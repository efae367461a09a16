//! Operation journal
//!
//! Every mutating task is journaled `pending` before it touches storage and
//! then finalized exactly once as `committed` or `canceled`. A committed
//! operation undone afterwards becomes `rolled_back`. The journal also
//! tracks, per database, the last operation the local node executed; that
//! value drives the ordering queue.

use crate::task::{OperationId, ReplicationTask, TaskKind};
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meridian_cluster::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JOURNAL_EXTENSION: &str = "journal";

/// Lifecycle of a journaled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Committed,
    Canceled,
    /// Committed, then undone in storage
    #[serde(rename = "rolled_back")]
    RolledBack,
}

impl OperationStatus {
    /// Whether an entry may move from `self` to `next`
    fn can_become(self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Committed)
                | (Self::Pending, Self::Canceled)
                | (Self::Committed, Self::RolledBack)
        )
    }
}

/// One journaled operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the database journal
    pub offset: u64,
    pub operation: OperationId,
    pub status: OperationStatus,
    pub kind: TaskKind,
    /// Node the task came from, `None` when submitted locally
    pub source: Option<NodeId>,
    pub recorded_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Task that replays this entry on another node
    ///
    /// Canceled and rolled back operations replay as no-ops so the receiver
    /// still consumes their sequence number.
    pub fn replay_task(&self, database: &str) -> ReplicationTask {
        let kind = match self.status {
            OperationStatus::Canceled | OperationStatus::RolledBack => TaskKind::NoOp,
            _ => self.kind.clone(),
        };
        ReplicationTask::new(database, self.operation, kind)
    }
}

/// Durable log of the operations applied on this node
#[async_trait]
pub trait OperationJournal: Send + Sync {
    /// Record `task` as pending and return its offset
    async fn append(&self, task: &ReplicationTask) -> Result<u64>;

    /// Finalize the pending entry at `offset`, or mark a committed one
    /// rolled back
    async fn update_status(&self, database: &str, offset: u64, status: OperationStatus) -> Result<()>;

    /// Mark the committed entry of `operation` rolled back
    async fn roll_back(&self, database: &str, operation: OperationId) -> Result<()>;

    /// Last operation executed locally on `database`
    fn last_executed(&self, database: &str) -> OperationId;

    /// Move the last executed operation forward, or anywhere when `force` is set
    fn advance_last_executed(&self, database: &str, operation: OperationId, force: bool);

    /// Most recently journaled operation with `status`
    async fn last_journaled(&self, database: &str, status: OperationStatus) -> Result<OperationId>;

    /// Finalized entries after `checkpoint` in operation order, up to the
    /// first pending one
    async fn replay_after(&self, database: &str, checkpoint: OperationId) -> Result<Vec<JournalEntry>>;

    /// Databases with a journal on this node
    fn databases(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct DatabaseLog {
    entries: Vec<JournalEntry>,
}

impl DatabaseLog {
    fn next_entry(&self, task: &ReplicationTask) -> Result<JournalEntry> {
        if !task.kind().is_mutable() {
            return Err(ReplicationError::journal(format!(
                "{} is not a mutating task",
                task
            )));
        }
        Ok(JournalEntry {
            offset: self.entries.len() as u64,
            operation: task.operation(),
            status: OperationStatus::Pending,
            kind: task.kind().clone(),
            source: task.source().map(str::to_string),
            recorded_at: Utc::now(),
        })
    }

    fn push(&mut self, entry: JournalEntry) -> Result<()> {
        if entry.offset != self.entries.len() as u64 {
            return Err(ReplicationError::journal(format!(
                "offset {} out of sequence, expected {}",
                entry.offset,
                self.entries.len()
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    fn check_transition(&self, offset: u64, status: OperationStatus) -> Result<()> {
        let entry = self
            .entries
            .get(offset as usize)
            .ok_or_else(|| ReplicationError::journal(format!("unknown offset {}", offset)))?;
        if !entry.status.can_become(status) {
            return Err(ReplicationError::journal(format!(
                "operation {} at offset {} is {:?}, cannot become {:?}",
                entry.operation, offset, entry.status, status
            )));
        }
        Ok(())
    }

    fn set_status(&mut self, offset: u64, status: OperationStatus) -> Result<()> {
        self.check_transition(offset, status)?;
        self.entries[offset as usize].status = status;
        Ok(())
    }

    /// Offset of the committed entry of `operation`
    fn committed_offset(&self, operation: OperationId) -> Result<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.operation == operation && e.status == OperationStatus::Committed)
            .map(|e| e.offset)
            .ok_or_else(|| {
                ReplicationError::journal(format!("operation {} is not committed", operation))
            })
    }

    fn last_with_status(&self, status: OperationStatus) -> OperationId {
        self.entries
            .iter()
            .rev()
            .find(|e| e.status == status)
            .map(|e| e.operation)
            .unwrap_or(OperationId::NONE)
    }

    fn last_finalized(&self) -> OperationId {
        self.entries
            .iter()
            .filter(|e| e.status != OperationStatus::Pending)
            .map(|e| e.operation)
            .max()
            .unwrap_or(OperationId::NONE)
    }

    fn replay_after(&self, checkpoint: OperationId) -> Vec<JournalEntry> {
        // Later entries for the same operation win
        let mut by_operation: BTreeMap<OperationId, &JournalEntry> = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| e.operation > checkpoint) {
            by_operation.insert(entry.operation, entry);
        }

        by_operation
            .into_values()
            .take_while(|e| e.status != OperationStatus::Pending)
            .cloned()
            .collect()
    }
}

/// Last executed operation per database
#[derive(Debug, Default)]
struct ExecutionFrontier {
    last: DashMap<String, OperationId>,
}

impl ExecutionFrontier {
    fn get(&self, database: &str) -> OperationId {
        self.last
            .get(database)
            .map(|op| *op)
            .unwrap_or(OperationId::NONE)
    }

    fn advance(&self, database: &str, operation: OperationId, force: bool) {
        let mut last = self
            .last
            .entry(database.to_string())
            .or_insert(OperationId::NONE);
        if force || operation > *last {
            *last = operation;
        }
    }
}

/// Journal kept in process memory
#[derive(Debug, Default)]
pub struct MemoryJournal {
    logs: DashMap<String, DatabaseLog>,
    frontier: ExecutionFrontier,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entries of `database`
    pub fn entries(&self, database: &str) -> Vec<JournalEntry> {
        self.logs
            .get(database)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OperationJournal for MemoryJournal {
    async fn append(&self, task: &ReplicationTask) -> Result<u64> {
        let mut log = self.logs.entry(task.database().to_string()).or_default();
        let entry = log.next_entry(task)?;
        let offset = entry.offset;
        log.push(entry)?;
        Ok(offset)
    }

    async fn update_status(&self, database: &str, offset: u64, status: OperationStatus) -> Result<()> {
        let mut log = self
            .logs
            .get_mut(database)
            .ok_or_else(|| ReplicationError::journal(format!("no journal for db={}", database)))?;
        log.set_status(offset, status)
    }

    async fn roll_back(&self, database: &str, operation: OperationId) -> Result<()> {
        let mut log = self
            .logs
            .get_mut(database)
            .ok_or_else(|| ReplicationError::journal(format!("no journal for db={}", database)))?;
        let offset = log.committed_offset(operation)?;
        log.set_status(offset, OperationStatus::RolledBack)
    }

    fn last_executed(&self, database: &str) -> OperationId {
        self.frontier.get(database)
    }

    fn advance_last_executed(&self, database: &str, operation: OperationId, force: bool) {
        self.frontier.advance(database, operation, force);
    }

    async fn last_journaled(&self, database: &str, status: OperationStatus) -> Result<OperationId> {
        Ok(self
            .logs
            .get(database)
            .map(|log| log.last_with_status(status))
            .unwrap_or(OperationId::NONE))
    }

    async fn replay_after(&self, database: &str, checkpoint: OperationId) -> Result<Vec<JournalEntry>> {
        Ok(self
            .logs
            .get(database)
            .map(|log| log.replay_after(checkpoint))
            .unwrap_or_default())
    }

    fn databases(&self) -> Vec<String> {
        self.logs.iter().map(|log| log.key().clone()).collect()
    }
}

/// Record written to a journal file, one JSON document per line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
enum JournalRecord {
    Entry(JournalEntry),
    Status { offset: u64, status: OperationStatus },
}

struct FileLog {
    log: DatabaseLog,
    file: File,
}

/// Journal persisted as one append-only JSON-lines file per database
///
/// Status transitions are appended as separate records, so a file is never
/// rewritten. Opening the journal replays the files to rebuild the state and
/// restores the last executed operation of each database.
pub struct FileJournal {
    dir: PathBuf,
    logs: DashMap<String, Arc<Mutex<FileLog>>>,
    frontier: ExecutionFrontier,
}

impl FileJournal {
    /// Open the journal stored in `dir`, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let journal = Self {
            dir,
            logs: DashMap::new(),
            frontier: ExecutionFrontier::default(),
        };

        let mut files = tokio::fs::read_dir(&journal.dir).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            let Some(database) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let (log, torn) = Self::load(&path).await?;
            let last = log.last_finalized();
            info!(
                "Loaded journal of db={} with {} entries, last executed {}",
                database,
                log.entries.len(),
                last
            );
            journal.frontier.advance(&database, last, true);

            let mut file = Self::open_file(&path).await?;
            if torn {
                // Terminate the partial line so the next record starts clean
                file.write_all(b"\n").await?;
            }
            journal
                .logs
                .insert(database, Arc::new(Mutex::new(FileLog { log, file })));
        }

        Ok(journal)
    }

    /// Directory holding the journal files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, database: &str) -> Result<PathBuf> {
        if database.is_empty() || database.contains(['/', '\\', '\0']) {
            return Err(ReplicationError::journal(format!(
                "db name '{}' cannot be used as a journal file name",
                database
            )));
        }
        Ok(self.dir.join(format!("{}.{}", database, JOURNAL_EXTENSION)))
    }

    async fn load(path: &Path) -> Result<(DatabaseLog, bool)> {
        let content = tokio::fs::read_to_string(path).await?;
        let torn = !content.is_empty() && !content.ends_with('\n');
        let mut log = DatabaseLog::default();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(JournalRecord::Entry(entry)) => log.push(entry)?,
                Ok(JournalRecord::Status { offset, status }) => log.set_status(offset, status)?,
                Err(e) => {
                    // A torn last write leaves a partial line behind
                    warn!(
                        "Ignoring malformed record at line {} of {}: {}",
                        line_no + 1,
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok((log, torn))
    }

    async fn open_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| ReplicationError::journal(format!("{}: {}", path.display(), e)))
    }

    async fn log_for(&self, database: &str) -> Result<Arc<Mutex<FileLog>>> {
        if let Some(log) = self.logs.get(database) {
            return Ok(log.clone());
        }

        let path = self.path_for(database)?;
        debug!("Creating journal {}", path.display());
        let file = Self::open_file(&path).await?;
        Ok(self
            .logs
            .entry(database.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(FileLog {
                    log: DatabaseLog::default(),
                    file,
                }))
            })
            .clone())
    }

    async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> Result<()> {
        if let Err(e) = writer.write_all(line).await {
            // Terminate what may be a partial line so the next record starts clean
            if let Err(e) = writer.write_all(b"\n").await {
                warn!("Cannot terminate a partial journal record: {}", e);
            }
            return Err(ReplicationError::journal(format!("write failed: {}", e)));
        }
        Ok(())
    }

    fn existing_log(&self, database: &str) -> Result<Arc<Mutex<FileLog>>> {
        self.logs
            .get(database)
            .map(|log| log.clone())
            .ok_or_else(|| ReplicationError::journal(format!("no journal for db={}", database)))
    }

    async fn record_status(log: &mut FileLog, offset: u64, status: OperationStatus) -> Result<()> {
        log.log.check_transition(offset, status)?;
        Self::write_record(&mut log.file, &JournalRecord::Status { offset, status }).await?;
        log.log.set_status(offset, status)
    }

    async fn write_record(file: &mut File, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        Self::write_line(file, &line).await?;
        file.sync_data()
            .await
            .map_err(|e| ReplicationError::journal(format!("sync failed: {}", e)))
    }
}

#[async_trait]
impl OperationJournal for FileJournal {
    async fn append(&self, task: &ReplicationTask) -> Result<u64> {
        let log = self.log_for(task.database()).await?;
        let mut log = log.lock().await;

        let entry = log.log.next_entry(task)?;
        let offset = entry.offset;
        let record = JournalRecord::Entry(entry);
        Self::write_record(&mut log.file, &record).await?;
        if let JournalRecord::Entry(entry) = record {
            log.log.push(entry)?;
        }
        Ok(offset)
    }

    async fn update_status(&self, database: &str, offset: u64, status: OperationStatus) -> Result<()> {
        let log = self.existing_log(database)?;
        let mut log = log.lock().await;
        Self::record_status(&mut log, offset, status).await
    }

    async fn roll_back(&self, database: &str, operation: OperationId) -> Result<()> {
        let log = self.existing_log(database)?;
        let mut log = log.lock().await;
        let offset = log.log.committed_offset(operation)?;
        Self::record_status(&mut log, offset, OperationStatus::RolledBack).await
    }

    fn last_executed(&self, database: &str) -> OperationId {
        self.frontier.get(database)
    }

    fn advance_last_executed(&self, database: &str, operation: OperationId, force: bool) {
        self.frontier.advance(database, operation, force);
    }

    async fn last_journaled(&self, database: &str, status: OperationStatus) -> Result<OperationId> {
        let Some(log) = self.logs.get(database).map(|log| log.clone()) else {
            return Ok(OperationId::NONE);
        };
        let log = log.lock().await;
        Ok(log.log.last_with_status(status))
    }

    async fn replay_after(&self, database: &str, checkpoint: OperationId) -> Result<Vec<JournalEntry>> {
        let Some(log) = self.logs.get(database).map(|log| log.clone()) else {
            return Ok(Vec::new());
        };
        let log = log.lock().await;
        Ok(log.log.replay_after(checkpoint))
    }

    fn databases(&self) -> Vec<String> {
        self.logs.iter().map(|log| log.key().clone()).collect()
    }
}
