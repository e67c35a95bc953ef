//! Opening a database: manifest bootstrap, manifest recovery and log replay.

use super::{DbInner, DbState};
use crate::batch::{WriteBatch, BATCH_HEADER_SIZE};
use crate::filename::{
    current_file_name, descriptor_file_name, log_file_name, parse_file_name, set_current_file,
    table_file_name, FileType,
};
use crate::memtable::MemTable;
use crate::version_edit::VersionEdit;
use parking_lot::MutexGuard;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use strata_core::{Error, Result, SequenceNumber};
use strata_wal::{LogWriter, RecoveryManager};
use tracing::{debug, info, warn};

impl DbInner {
    /// Write the manifest of an empty database and point CURRENT at it
    fn new_db(&self) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_format_header();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(&self.dbname, 1);
        let result = (|| -> Result<()> {
            let mut writer = LogWriter::create(&manifest)?;
            writer.add_record(&edit.encode()?)?;
            writer.sync()?;
            drop(writer);
            set_current_file(&self.dbname, 1)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&manifest);
        }
        result
    }

    /// Rebuild the engine state from disk.
    ///
    /// Tables written while replaying logs are recorded in `edit`. Returns
    /// true if a manifest record must be written before the database is
    /// usable.
    pub(super) fn recover(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        edit: &mut VersionEdit,
    ) -> Result<bool> {
        if !current_file_name(&self.dbname).exists() {
            if !self.options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.dbname.display()
                )));
            }
            info!(path = %self.dbname.display(), "Creating database");
            self.new_db()?;
        } else if self.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                self.dbname.display()
            )));
        }

        let mut save_manifest = state.versions.recover()?;

        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();
        let mut expected = HashSet::new();
        state.versions.add_live_files(&mut expected);

        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.dbname)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((file_type, number)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if file_type == FileType::Table {
                expected.remove(&number);
            }
            if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                logs.push(number);
            }
        }
        if let Some(&missing) = expected.iter().min() {
            return Err(Error::Corruption(format!(
                "{} missing files; e.g. {}",
                expected.len(),
                table_file_name(&self.dbname, missing).display()
            )));
        }

        // Tables built during replay must not take a log's number
        logs.sort_unstable();
        for &log in &logs {
            state.versions.mark_file_number_used(log);
        }

        let mut max_sequence = 0;
        for (i, &log) in logs.iter().enumerate() {
            let last_log = i + 1 == logs.len();
            self.recover_log_file(
                state,
                log,
                last_log,
                &mut save_manifest,
                edit,
                &mut max_sequence,
            )?;
        }
        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }
        Ok(save_manifest)
    }

    /// Replay one log into memtables, flushing them to level 0 as they fill.
    ///
    /// With `reuse_logs`, the last log keeps being appended to if replay
    /// did not have to flush anything.
    fn recover_log_file(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        number: u64,
        last_log: bool,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> Result<()> {
        let path = log_file_name(&self.dbname, number);
        let paranoid = self.options.paranoid_checks;
        info!(log = number, "Recovering log");

        let mut mem: Option<Arc<MemTable>> = None;
        let mut flushes = 0;
        let stats = RecoveryManager::new(&path, paranoid).replay(|record| {
            if record.len() < BATCH_HEADER_SIZE {
                if paranoid {
                    return Err(Error::Corruption(format!(
                        "log record too small: {} bytes",
                        record.len()
                    )));
                }
                warn!(log = number, bytes = record.len(), "Skipping short log record");
                return Ok(());
            }
            let batch = match WriteBatch::from_contents(record) {
                Ok(batch) => batch,
                Err(e) if !paranoid => {
                    warn!(log = number, error = %e, "Skipping malformed log record");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = batch.validate() {
                if paranoid {
                    return Err(e);
                }
                warn!(log = number, error = %e, "Ignoring bad batch during replay");
                return Ok(());
            }

            let table = mem.get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
            batch.insert_into(table)?;
            if batch.count() > 0 {
                let last = batch.sequence() + u64::from(batch.count()) - 1;
                *max_sequence = (*max_sequence).max(last);
            }

            if table.approximate_memory_usage() > self.options.write_buffer_size {
                flushes += 1;
                *save_manifest = true;
                if let Some(full) = mem.take() {
                    self.write_level0_table(state, &full, edit, None)?;
                }
            }
            Ok(())
        })?;
        debug!(
            log = number,
            records = stats.records,
            bytes = stats.bytes,
            dropped_bytes = stats.dropped_bytes,
            "Replayed log"
        );
        if stats.corruptions > 0 {
            warn!(
                log = number,
                corruptions = stats.corruptions,
                dropped_bytes = stats.dropped_bytes,
                "Log contained corrupt records"
            );
        }

        if self.options.reuse_logs && last_log && flushes == 0 {
            match LogWriter::append_to(&path) {
                Ok(writer) => {
                    info!(log = number, size = writer.size(), "Reusing log");
                    *self.log.lock() = Some(writer);
                    state.logfile_number = number;
                    if let Some(mem) = mem.take() {
                        state.mem = mem;
                    }
                    return Ok(());
                }
                Err(e) => warn!(log = number, error = %e, "Cannot reuse log"),
            }
        }

        if let Some(mem) = mem {
            if !mem.is_empty() {
                *save_manifest = true;
                self.write_level0_table(state, &mem, edit, None)?;
            }
        }
        Ok(())
    }
}
