//! State stores.
//!
//! A [`StateStore`] applies keyed full-state upserts. Stores are called from
//! the worker's blocking pool, so their methods are synchronous.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lotbot_core::{GroupId, PositionId, PositionRecord, RiskState, StrategyGroup};

use crate::error::{PersistenceError, PersistenceResult};
use crate::mutation::{Mutation, Payload};

/// Keyed atomic upsert target.
pub trait StateStore: Send + Sync {
    fn upsert(&self, mutation: &Mutation) -> PersistenceResult<()>;

    /// Make everything upserted so far durable.
    fn flush(&self) -> PersistenceResult<()> {
        Ok(())
    }

    /// Store name for logs.
    fn name(&self) -> &str;
}

/// Last-write-wins view of persisted state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub groups: BTreeMap<GroupId, StrategyGroup>,
    pub positions: BTreeMap<PositionId, PositionRecord>,
    pub risk: BTreeMap<PositionId, RiskState>,
}

impl StateSnapshot {
    pub fn apply(&mut self, mutation: &Mutation) {
        match &mutation.payload {
            Payload::Group(group) => {
                self.groups.insert(group.group_id, group.clone());
            }
            Payload::Position(position) => {
                self.positions.insert(position.position_id, position.clone());
            }
            Payload::Risk {
                position_id,
                state: Some(state),
            } => {
                self.risk.insert(*position_id, state.clone());
            }
            Payload::Risk {
                position_id,
                state: None,
            } => {
                self.risk.remove(position_id);
            }
        }
    }

    /// Records of one group, ordered by position id.
    pub fn positions_of(&self, group_id: GroupId) -> Vec<PositionRecord> {
        self.positions
            .values()
            .filter(|p| p.group_id == group_id)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.positions.is_empty() && self.risk.is_empty()
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: StateSnapshot,
    applied: Vec<Mutation>,
    fail: bool,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Every applied mutation, in application order.
    pub fn applied(&self) -> Vec<Mutation> {
        self.inner.lock().applied.clone()
    }

    pub fn applied_count(&self) -> usize {
        self.inner.lock().applied.len()
    }

    /// Make subsequent upserts fail.
    pub fn set_fail(&self, fail: bool) {
        self.inner.lock().fail = fail;
    }
}

impl StateStore for MemoryStore {
    fn upsert(&self, mutation: &Mutation) -> PersistenceResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail {
            return Err(PersistenceError::Store(format!(
                "upsert of {} refused",
                mutation.key
            )));
        }
        inner.snapshot.apply(mutation);
        inner.applied.push(mutation.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// JsonLinesStore
// ============================================================================

/// Active journal file for one day.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only daily journal of mutations, one JSON object per line.
///
/// Append mode is safe for interrupted writes: a torn line only loses that
/// line, and [`JsonLinesStore::replay`] skips it.
pub struct JsonLinesStore {
    base_dir: PathBuf,
    active: Mutex<Option<ActiveWriter>>,
}

impl JsonLinesStore {
    /// Open a journal under `base_dir`, creating the directory.
    pub fn new(base_dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: Mutex::new(None),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn journal_path(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("state_{date}.jsonl"))
    }

    fn open_writer(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let path = self.journal_path(date);
        info!(path = %path.display(), "Opening state journal (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close_writer(active: &mut ActiveWriter) {
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush journal on close");
        }
        info!(
            date = %active.date,
            records = active.records_written,
            "Closed state journal"
        );
    }

    /// Rebuild last-write-wins state from every journal in `base_dir`,
    /// oldest file first.
    pub fn replay(base_dir: impl AsRef<Path>) -> PersistenceResult<StateSnapshot> {
        let base_dir = base_dir.as_ref();
        let mut snapshot = StateSnapshot::default();
        if !base_dir.exists() {
            return Ok(snapshot);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(base_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("state_") && n.ends_with(".jsonl"))
            })
            .collect();
        files.sort();

        let mut applied = 0usize;
        let mut skipped = 0usize;
        for path in &files {
            let reader = BufReader::new(File::open(path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Mutation>(&line) {
                    Ok(mutation) => {
                        snapshot.apply(&mutation);
                        applied += 1;
                    }
                    Err(e) => {
                        skipped += 1;
                        warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping unreadable journal line"
                        );
                    }
                }
            }
        }

        info!(
            files = files.len(),
            applied,
            skipped,
            groups = snapshot.groups.len(),
            positions = snapshot.positions.len(),
            "State journal replayed"
        );
        Ok(snapshot)
    }
}

impl StateStore for JsonLinesStore {
    fn upsert(&self, mutation: &Mutation) -> PersistenceResult<()> {
        let json = serde_json::to_string(mutation)?;
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let mut active = self.active.lock();
        if let Some(current) = active.as_mut() {
            if current.date != today {
                Self::close_writer(current);
                *active = None;
            }
        }
        if active.is_none() {
            *active = Some(self.open_writer(&today)?);
        }
        let Some(writer) = active.as_mut() else {
            return Err(PersistenceError::Store("journal writer unavailable".to_string()));
        };

        writeln!(writer.writer, "{json}")?;
        writer.records_written += 1;
        Ok(())
    }

    fn flush(&self) -> PersistenceResult<()> {
        if let Some(active) = self.active.lock().as_mut() {
            active.writer.flush()?;
            debug!(
                date = %active.date,
                records = active.records_written,
                "Flushed state journal"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

impl Drop for JsonLinesStore {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().as_mut() {
            Self::close_writer(active);
        }
    }
}
