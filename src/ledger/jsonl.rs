//! Newline-delimited JSON ledger backend
//!
//! One `LedgerRecord` per line, append-only, fsync'd per append. Existing
//! records are replayed into memory on open, so reads never touch the file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use parking_lot::RwLock;

use super::{fold_run, summarize, ExecutionLedger, LedgerRecord, RunEvent};
use crate::error::StrandError;
use crate::run::{RunFilter, RunId, RunSummary, WorkflowRun};

/// File-backed ledger for durable local runs.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    file: Mutex<File>,
    index: RwLock<HashMap<RunId, Vec<RunEvent>>>,
}

impl JsonlLedger {
    /// Open (or create) a ledger file and replay its records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StrandError> {
        let path = path.as_ref().to_path_buf();
        let mut index: HashMap<RunId, Vec<RunEvent>> = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: LedgerRecord = serde_json::from_str(&line)
                    .map_err(|e| StrandError::Ledger(format!("corrupt ledger line: {e}")))?;
                let events = index.entry(record.run_id).or_default();
                // A failed rollback after an interrupted append can leave a
                // repeated record; replay keeps the first copy per sequence
                // number.
                if (record.seq as usize) < events.len() {
                    continue;
                }
                events.push(record.event);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExecutionLedger for JsonlLedger {
    fn append(&self, run_id: RunId, event: RunEvent) -> Result<u64, StrandError> {
        // File lock taken for the whole append keeps the write atomic
        // relative to other runs' appends.
        let mut file = self.file.lock();
        let seq = {
            let index = self.index.read();
            index.get(&run_id).map(|e| e.len() as u64).unwrap_or(0)
        };
        let record = LedgerRecord {
            seq,
            run_id,
            event: event.clone(),
        };
        let line = serde_json::to_string(&record)?;

        // The record is committed once written and synced. On failure the
        // partial line is truncated away so a reopen does not replay a
        // transition the caller was told never happened.
        let committed_len = file.metadata()?.len();
        if let Err(e) = writeln!(file, "{line}").and_then(|()| file.sync_data()) {
            let _ = file.set_len(committed_len);
            return Err(e.into());
        }

        self.index.write().entry(run_id).or_default().push(event);
        Ok(seq)
    }

    fn read_run(&self, run_id: RunId) -> Result<WorkflowRun, StrandError> {
        let index = self.index.read();
        let events = index.get(&run_id).ok_or(StrandError::NotFound { run_id })?;
        fold_run(run_id, events).ok_or(StrandError::NotFound { run_id })
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StrandError> {
        let index = self.index.read();
        let mut summaries: Vec<RunSummary> = index
            .iter()
            .filter_map(|(&run_id, events)| summarize(run_id, events))
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(summaries)
    }
}
