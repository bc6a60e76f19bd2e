use std::path::Path;
use std::time;

use tracing::{debug, info};

use crate::accelerator::Accelerator;
use crate::error::{ChainError, Result};
use crate::round::dispatch_rounds;
use crate::table::{completed_entries, ChainEntry, TableReader, TableWriter};

/// Computes table chains over a linear seed range, one batch of seeds at a time
///
/// Every batch runs all of its rounds on the accelerator before any of it comes back to the host,
/// so host memory is bounded by the batch size rather than the table size.
pub struct ChainTableBuilder<'a, A: ?Sized> {
    accelerator: &'a A,
    rounds: u64,
    batch_size: u64,
    rounds_per_dispatch: u32,
}

impl<'a, A: Accelerator + ?Sized> ChainTableBuilder<'a, A> {
    /// `rounds_per_dispatch` splits each batch into several dispatches to keep a single dispatch
    /// short; it must divide `rounds`. Zero means one dispatch per batch.
    pub fn new(
        accelerator: &'a A,
        rounds: u64,
        batch_size: u64,
        rounds_per_dispatch: u32,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ChainError::Config("table batch size must be positive".into()));
        }
        if rounds_per_dispatch != 0 && rounds % rounds_per_dispatch as u64 != 0 {
            return Err(ChainError::Config(format!(
                "table rounds {} must be a multiple of rounds per dispatch {}",
                rounds, rounds_per_dispatch
            )));
        }
        let rounds_per_dispatch = if rounds_per_dispatch == 0 {
            dispatch_rounds(rounds, u32::MAX).max(1)
        } else {
            rounds_per_dispatch
        };
        Ok(ChainTableBuilder {
            accelerator,
            rounds,
            batch_size,
            rounds_per_dispatch,
        })
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Streams the entries for seeds `[start, start + count)`, one batch per item.
    pub fn batches(&self, start: u64, count: u64) -> Result<BuildBatches<'_, 'a, A>> {
        if count % self.batch_size != 0 {
            return Err(ChainError::Config(format!(
                "table count {} must be a multiple of the batch size {}",
                count, self.batch_size
            )));
        }
        start.checked_add(count).ok_or_else(|| {
            ChainError::Config(format!("seed range {:#x}+{} overflows", start, count))
        })?;
        Ok(BuildBatches {
            builder: self,
            next: start,
            end: start + count,
        })
    }

    /// Computes every entry for `[start, start + count)` into memory.
    pub fn build(&self, start: u64, count: u64) -> Result<Vec<ChainEntry>> {
        let mut entries = Vec::with_capacity(count as usize);
        for batch in self.batches(start, count)? {
            entries.extend(batch?);
        }
        Ok(entries)
    }

    /// Writes the entries for `[start, start + count)` to `writer`, committing after every batch.
    ///
    /// Any error aborts the build; batches committed before it stay on disk.
    pub fn build_into(&self, writer: &mut TableWriter, start: u64, count: u64) -> Result<u64> {
        let build_start = time::Instant::now();
        let mut written = 0u64;
        for batch in self.batches(start, count)? {
            let batch_start = time::Instant::now();
            let batch = batch?;
            for entry in &batch {
                writer.write_entry(entry)?;
            }
            writer.commit()?;
            written += batch.len() as u64;

            let rate = batch.len() as f32 / batch_start.elapsed().as_secs_f32();
            info!(written, total = count, chains_per_sec = rate, "table batch committed");
        }
        info!(
            written,
            secs = build_start.elapsed().as_secs_f32(),
            "table build complete"
        );
        Ok(written)
    }

    /// Continues an interrupted build of `[start, start + count)` into `path`.
    ///
    /// The records already in the file must be canonical and cover a whole number of batches
    /// from `start`. A file that does not qualify is left untouched.
    pub fn resume(&self, path: impl AsRef<Path>, start: u64, count: u64) -> Result<u64> {
        let path = path.as_ref();
        let done = completed_entries(path)?;
        if done > count {
            return Err(ChainError::Config(format!(
                "{} already holds {} records, more than the requested {}",
                path.display(),
                done,
                count
            )));
        }
        if done % self.batch_size != 0 {
            return Err(ChainError::Config(format!(
                "{} holds {} records, not a whole number of batches of {}",
                path.display(),
                done,
                self.batch_size
            )));
        }
        if done > 0 {
            let first = TableReader::open(path)?.next().transpose()?.map(|entry| entry.seed);
            if first != Some(start) {
                return Err(ChainError::Config(format!(
                    "{} starts at seed {:?}, not the requested {:#x}",
                    path.display(),
                    first,
                    start
                )));
            }
            info!(path = %path.display(), done, "resuming table build");
        }
        let mut writer = TableWriter::append(path)?;
        self.build_into(&mut writer, start + done, count - done)
    }

    fn run_batch(&self, first: u64, len: u64) -> Result<Vec<ChainEntry>> {
        let mut values: Vec<u64> = (first..first + len).collect();
        let mut remaining = self.rounds;
        while remaining > 0 {
            let rounds = dispatch_rounds(remaining, self.rounds_per_dispatch);
            self.accelerator.advance(&mut values, rounds)?;
            remaining -= rounds as u64;
        }
        debug!(first, len, rounds = self.rounds, "table batch computed");
        Ok((first..first + len)
            .zip(values)
            .map(|(seed, endpoint)| ChainEntry::new(seed, endpoint))
            .collect())
    }
}

pub struct BuildBatches<'b, 'a, A: ?Sized> {
    builder: &'b ChainTableBuilder<'a, A>,
    next: u64,
    end: u64,
}

impl<'b, 'a, A: Accelerator + ?Sized> Iterator for BuildBatches<'b, 'a, A> {
    type Item = Result<Vec<ChainEntry>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let first = self.next;
        let len = self.builder.batch_size.min(self.end - first);
        self.next += len;
        let batch = self.builder.run_batch(first, len);
        if batch.is_err() {
            self.next = self.end;
        }
        Some(batch)
    }
}
