use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{ChainError, Result};
use crate::round::{Md5Fold, RoundFunction};

/// A parallel compute resource that advances many independent chains at once.
///
/// A dispatch is atomic from the caller's point of view: it either completes every lane or
/// reports an error, and no partial state is observed in between.
pub trait Accelerator: Send + Sync {
    /// Advances every value by `rounds` digests in place.
    fn advance(&self, values: &mut [u64], rounds: u32) -> Result<()>;

    /// Advances every value by `rounds` digests in place, recording every intermediate value.
    ///
    /// `out` is resized to `values.len() * rounds` and laid out lane-major: lane `i` occupies
    /// `out[i * rounds..(i + 1) * rounds]`, whose `r`th entry is the value after `r + 1` digests.
    fn trace(&self, values: &mut [u64], rounds: u32, out: &mut Vec<u64>) -> Result<()>;
}

/// Runs dispatches on a dedicated rayon pool.
///
/// The pool is acquired in `new` and its threads are released when the accelerator is dropped.
pub struct CpuAccelerator<F = Md5Fold> {
    pool: ThreadPool,
    round: F,
}

impl CpuAccelerator<Md5Fold> {
    pub fn new(threads: usize) -> Result<Self> {
        CpuAccelerator::with_round(threads, Md5Fold)
    }
}

impl<F: RoundFunction> CpuAccelerator<F> {
    /// Builds a pool of `threads` workers, or one per CPU when `threads` is zero.
    pub fn with_round(threads: usize, round: F) -> Result<Self> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("otp-accel-{}", i))
            .build()
            .map_err(|e| ChainError::Accelerator(e.to_string()))?;
        debug!(threads, "accelerator pool acquired");
        Ok(CpuAccelerator { pool, round })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn round(&self) -> &F {
        &self.round
    }
}

impl<F: RoundFunction> Accelerator for CpuAccelerator<F> {
    fn advance(&self, values: &mut [u64], rounds: u32) -> Result<()> {
        if rounds == 0 {
            return Ok(());
        }
        let round = &self.round;
        self.pool.install(|| {
            values
                .par_iter_mut()
                .for_each(|value| *value = round.chain(*value, rounds as u64));
        });
        Ok(())
    }

    fn trace(&self, values: &mut [u64], rounds: u32, out: &mut Vec<u64>) -> Result<()> {
        let rounds = rounds as usize;
        out.clear();
        if rounds == 0 || values.is_empty() {
            return Ok(());
        }
        let needed = values
            .len()
            .checked_mul(rounds)
            .ok_or_else(|| ChainError::Accelerator("trace buffer size overflows".into()))?;
        out.resize(needed, 0);

        let round = &self.round;
        self.pool.install(|| {
            out.par_chunks_mut(rounds)
                .zip(values.par_iter_mut())
                .for_each(|(lane, value)| {
                    let mut current = *value;
                    for slot in lane.iter_mut() {
                        current = round.digest(current);
                        *slot = current;
                    }
                    *value = current;
                });
        });
        Ok(())
    }
}
