// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only local transaction history.
//!
//! Display-only: the queue never reads it back.

use super::types::{OperationStatus, QueuedOperation};
use crate::types::{ActionKind, OperationId, ResultHandle, TimestampMs};
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tracing::warn;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: OperationId,
    pub kind: ActionKind,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    pub asset: Option<String>,
    pub status: OperationStatus,
    pub result_handle: Option<ResultHandle>,
    pub timestamp: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn from_operation(op: &QueuedOperation) -> Self {
        Self {
            id: op.id,
            kind: op.kind,
            amount: op.request.amount(),
            asset: op.request.asset().map(str::to_string),
            status: op.status,
            result_handle: op.result_handle.clone(),
            timestamp: op.updated_at,
            error: op.last_error.clone(),
        }
    }
}

pub trait HistoryLog: Send + Sync {
    fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()>;
}

enum WriterCommand {
    Line(Vec<u8>),
    Sync(mpsc::Sender<()>),
}

/// One JSON object per line.
///
/// Appends are handed to a dedicated writer thread, so callers on the async
/// runtime never wait on the disk. [`JsonlHistoryLog::sync`] blocks until
/// everything appended so far has been flushed.
pub struct JsonlHistoryLog {
    path: PathBuf,
    commands: mpsc::Sender<WriterCommand>,
}

impl JsonlHistoryLog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening history log {:?}", path))?;
        let (commands, receiver) = mpsc::channel();
        let writer_path = path.clone();
        thread::Builder::new()
            .name("history-writer".to_string())
            .spawn(move || run_writer(file, &writer_path, receiver))
            .context("spawning history writer")?;
        Ok(Self { path, commands })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every entry appended so far is on disk
    pub fn sync(&self) -> anyhow::Result<()> {
        let (ack, done) = mpsc::channel();
        self.commands
            .send(WriterCommand::Sync(ack))
            .map_err(|_| anyhow::anyhow!("history writer for {:?} has exited", self.path))?;
        done.recv()
            .map_err(|_| anyhow::anyhow!("history writer for {:?} has exited", self.path))
    }

    /// Parse every entry in the file. Used for display and tests.
    pub fn read_all(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        self.sync()?;
        let file = File::open(&self.path)
            .with_context(|| format!("reading history log {:?}", self.path))?;
        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .with_context(|| format!("history log {:?} line {}", self.path, n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl HistoryLog for JsonlHistoryLog {
    fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.commands
            .send(WriterCommand::Line(line))
            .map_err(|_| anyhow::anyhow!("history writer for {:?} has exited", self.path))
    }
}

impl Drop for JsonlHistoryLog {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("[TxQueue] history not flushed on close: {:?}", e);
        }
    }
}

fn run_writer(file: File, path: &Path, commands: mpsc::Receiver<WriterCommand>) {
    let mut writer = BufWriter::new(file);
    while let Ok(first) = commands.recv() {
        // Drain whatever is already queued, then flush once
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                WriterCommand::Line(line) => {
                    if let Err(e) = writer.write_all(&line) {
                        warn!("[TxQueue] failed to write history {:?}: {:?}", path, e);
                    }
                }
                WriterCommand::Sync(ack) => {
                    if let Err(e) = writer.flush() {
                        warn!("[TxQueue] failed to flush history {:?}: {:?}", path, e);
                    }
                    let _ = ack.send(());
                }
            }
            next = commands.try_recv().ok();
        }
        if let Err(e) = writer.flush() {
            warn!("[TxQueue] failed to flush history {:?}: {:?}", path, e);
        }
    }
}

#[derive(Default)]
pub struct MemoryHistoryLog {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().clone()
    }
}

impl HistoryLog for MemoryHistoryLog {
    fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
