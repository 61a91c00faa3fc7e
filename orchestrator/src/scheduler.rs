// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Time source and deferred-task abstraction.
//!
//! Retry backoff and entry garbage collection are expressed as
//! `after(delay, task)` calls instead of ad-hoc timers, so the queue and the
//! optimistic ledger can be driven deterministically with [`ManualScheduler`].

use crate::types::TimestampMs;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the unix epoch
    fn now(&self) -> TimestampMs;

    /// Run `task` once, no earlier than `delay` from now
    fn after(&self, delay: Duration, task: ScheduledTask);
}

/// Wall-clock scheduler backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> TimestampMs {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as TimestampMs
    }

    fn after(&self, delay: Duration, task: ScheduledTask) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
            }
            Err(_) => {
                warn!(
                    "[Scheduler] no tokio runtime, running task scheduled in {:?} immediately",
                    delay
                );
                task();
            }
        }
    }
}

/// Virtual-time scheduler: tasks only run when time is advanced explicitly.
pub struct ManualScheduler {
    now: AtomicU64,
    tasks: Mutex<ManualQueue>,
}

#[derive(Default)]
struct ManualQueue {
    next_seq: u64,
    // (due, seq) keeps same-instant tasks in scheduling order
    due: BTreeMap<(TimestampMs, u64), ScheduledTask>,
}

impl ManualScheduler {
    pub fn new(start: TimestampMs) -> Self {
        Self {
            now: AtomicU64::new(start),
            tasks: Mutex::new(ManualQueue::default()),
        }
    }

    /// Move the clock forward, running every task that falls due on the way.
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now().saturating_add(by.as_millis() as TimestampMs);
        let mut ran = 0;
        loop {
            // Pop under the lock, run outside it: tasks may schedule more tasks.
            let next = {
                let mut tasks = self.tasks.lock();
                match tasks.due.first_key_value() {
                    Some((&(due, _), _)) if due <= target => tasks.due.pop_first(),
                    _ => None,
                }
            };
            let Some(((due, _), task)) = next else {
                break;
            };
            self.now.fetch_max(due, Ordering::SeqCst);
            task();
            ran += 1;
        }
        self.now.fetch_max(target, Ordering::SeqCst);
        ran
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().due.len()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }

    fn after(&self, delay: Duration, task: ScheduledTask) {
        let due = self.now().saturating_add(delay.as_millis() as TimestampMs);
        let mut tasks = self.tasks.lock();
        let seq = tasks.next_seq;
        tasks.next_seq += 1;
        tasks.due.insert((due, seq), task);
    }
}
