//! Write path: group commit and memtable switching.
//!
//! Writers queue up behind the engine mutex. The writer at the front of the
//! queue becomes the leader: it folds the batches of the writers queued
//! behind it into one log record, appends and inserts that record with the
//! mutex released, then hands each absorbed writer its outcome.

use super::{DbInner, DbState};
use crate::batch::WriteBatch;
use crate::filename::log_file_name;
use crate::memtable::MemTable;
use crate::options::WriteOptions;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Error, Result};
use strata_snapshot::Snapshot;
use strata_wal::LogWriter;
use tracing::{debug, trace, warn};

/// Upper bound on the bytes of one commit group
const MAX_GROUP_SIZE: usize = 1 << 20;

/// Groups led by a batch this small grow by at most this much
const SMALL_BATCH_SIZE: usize = 128 << 10;

type WriteOutcome = Result<Option<Snapshot>>;

/// A queued write; `batch` is `None` for a forced memtable switch
pub(super) struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,
    want_snapshot: bool,
    outcome: Mutex<Option<WriteOutcome>>,
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, options: WriteOptions) -> Self {
        Self {
            batch,
            sync: options.sync,
            want_snapshot: options.snapshot,
            outcome: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Called by the leader with the engine mutex held
    fn complete(&self, outcome: WriteOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.cv.notify_one();
    }

    fn take_outcome(&self) -> Option<WriteOutcome> {
        self.outcome.lock().take()
    }
}

/// Batches of consecutive queued writers merged into one log record
struct BatchGroup {
    batch: WriteBatch,
    sync: bool,
    /// (operation count, wants a snapshot) per absorbed writer, in queue order
    members: Vec<(u32, bool)>,
}

/// Merge the writers at the front of the queue, starting with the leader.
///
/// Stops at a forced switch, at a sync writer when the leader does not
/// sync, and when the group would outgrow its size cap.
fn build_batch_group(writers: &VecDeque<Arc<Writer>>) -> BatchGroup {
    let mut group = BatchGroup {
        batch: WriteBatch::new(),
        sync: false,
        members: Vec::new(),
    };
    let mut queued = writers.iter();
    let Some(leader) = queued.next() else {
        return group;
    };
    let Some(first) = &leader.batch else {
        return group;
    };

    let mut size = first.approximate_size();
    let max_size = if size <= SMALL_BATCH_SIZE {
        size + SMALL_BATCH_SIZE
    } else {
        MAX_GROUP_SIZE
    };
    group.batch = first.clone();
    group.sync = leader.sync;
    group.members.push((first.count(), leader.want_snapshot));

    for writer in queued {
        if writer.sync && !leader.sync {
            break;
        }
        let Some(batch) = &writer.batch else {
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        group.batch.append(batch);
        group.members.push((batch.count(), writer.want_snapshot));
    }
    group
}

impl DbInner {
    /// Queue `batch` and block until it is durable in the log and visible in
    /// the memtable. `None` forces the memtable to be frozen.
    pub(super) fn write(&self, batch: Option<WriteBatch>, options: WriteOptions) -> WriteOutcome {
        let writer = Arc::new(Writer::new(batch, options));
        let mut state = self.state.lock();
        state.writers.push_back(Arc::clone(&writer));
        while !writer.is_done()
            && !state
                .writers
                .front()
                .is_some_and(|front| Arc::ptr_eq(front, &writer))
        {
            writer.cv.wait(&mut state);
        }
        if let Some(outcome) = writer.take_outcome() {
            return outcome;
        }

        let force = writer.batch.is_none();
        let outcomes = match self.make_room_for_write(&mut state, force) {
            Err(e) => vec![Err(e)],
            Ok(()) if force => vec![Ok(None)],
            Ok(()) => self.commit_group(&mut state),
        };

        let mut outcomes = outcomes.into_iter();
        let own = outcomes.next().unwrap_or(Ok(None));
        state.writers.pop_front();
        for outcome in outcomes {
            if let Some(follower) = state.writers.pop_front() {
                follower.complete(outcome);
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }
        own
    }

    /// Log and apply the leader's group; one outcome per absorbed writer
    fn commit_group(&self, state: &mut MutexGuard<'_, DbState>) -> Vec<WriteOutcome> {
        let BatchGroup {
            mut batch,
            sync,
            members,
        } = build_batch_group(&state.writers);

        let last_sequence = state.versions.last_sequence();
        batch.set_sequence(last_sequence + 1);
        let mem = Arc::clone(&state.mem);
        trace!(
            writers = members.len(),
            count = batch.count(),
            bytes = batch.approximate_size(),
            sync,
            "Committing write group"
        );

        let (result, log_failed) = MutexGuard::unlocked(state, || {
            let logged = match self.log.lock().as_mut() {
                Some(log) => log
                    .add_record(batch.contents())
                    .and_then(|()| if sync { log.sync() } else { Ok(()) }),
                None => Err(Error::ShuttingDown),
            };
            match logged {
                Ok(()) => (batch.insert_into(&mem), false),
                Err(e) => (Err(e), true),
            }
        });

        if log_failed {
            if let Err(e) = &result {
                // The log may now hold a partial record
                self.record_background_error(state, e.clone());
            }
        }
        state
            .versions
            .set_last_sequence(last_sequence + u64::from(batch.count()));

        match result {
            Ok(()) => {
                let mut sequence = last_sequence;
                members
                    .into_iter()
                    .map(|(count, want_snapshot)| {
                        sequence += u64::from(count);
                        Ok(want_snapshot.then(|| state.snapshots.acquire(sequence)))
                    })
                    .collect()
            }
            Err(e) => members.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    /// Make sure the memtable has room for the leader's write, freezing it
    /// and starting a new log when it is full (or when `force` is set).
    ///
    /// Applies level-0 backpressure: one short delay per write past the
    /// slowdown trigger, a full stall at the stop trigger.
    fn make_room_for_write(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut force: bool,
    ) -> Result<()> {
        let mut allow_delay = !force;
        let compaction = &self.options.compaction;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            DbInner::background_error(state)?;
            let level0_files = state.versions.num_level_files(0);

            if allow_delay && level0_files >= compaction.l0_slowdown_writes_trigger {
                trace!(files = level0_files, "Delaying write for level-0 backlog");
                MutexGuard::unlocked(state, || std::thread::sleep(Duration::from_millis(1)));
                allow_delay = false;
            } else if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return Ok(());
            } else if state.imm.is_some() {
                debug!("Memtable full; waiting for the previous flush");
                self.bg_cv.wait(state);
            } else if level0_files >= compaction.l0_stop_writes_trigger {
                warn!(files = level0_files, "Too many level-0 files; stalling writes");
                self.bg_cv.wait(state);
            } else {
                let number = state.versions.new_file_number();
                let log = match LogWriter::create(&log_file_name(&self.dbname, number)) {
                    Ok(log) => log,
                    Err(e) => {
                        state.versions.reuse_file_number(number);
                        return Err(e);
                    }
                };
                *self.log.lock() = Some(log);
                state.logfile_number = number;

                let fresh = Arc::new(MemTable::new(self.icmp.clone()));
                let frozen = std::mem::replace(&mut state.mem, fresh);
                debug!(
                    log = number,
                    bytes = frozen.approximate_memory_usage(),
                    "Switched to a new memtable"
                );
                state.imm = Some(frozen);
                self.has_imm.store(true, Ordering::Release);
                force = false;
                self.maybe_schedule_compaction(state);
            }
        }
    }

    /// Freeze the memtable and wait until the background thread has
    /// written it out.
    pub(super) fn flush_memtable(&self) -> Result<()> {
        self.write(None, WriteOptions::default())?;
        let mut state = self.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() && !self.is_shutting_down() {
            self.bg_cv.wait(&mut state);
        }
        DbInner::background_error(&state)?;
        if state.imm.is_some() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}
