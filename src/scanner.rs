use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::accelerator::Accelerator;
use crate::error::{ChainError, Result};

/// Requests a scan to stop at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Chain values for rounds `first_round..first_round + rounds` of every lane.
///
/// Values are lane-major: lane `i` holds its `rounds` consecutive values at
/// `values[i * rounds..(i + 1) * rounds]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub first_round: u64,
    pub rounds: usize,
    pub values: Vec<u64>,
}

impl RoundSnapshot {
    pub fn lanes(&self) -> usize {
        if self.rounds == 0 {
            0
        } else {
            self.values.len() / self.rounds
        }
    }

    pub fn lane(&self, lane: usize) -> &[u64] {
        &self.values[lane * self.rounds..(lane + 1) * self.rounds]
    }

    /// `(round, value)` pairs of one lane in increasing round order.
    pub fn rounds_of(&self, lane: usize) -> impl Iterator<Item = (u64, u64)> + '_ {
        let first = self.first_round;
        self.lane(lane)
            .iter()
            .enumerate()
            .map(move |(i, value)| (first + i as u64, *value))
    }

    pub fn last_round(&self) -> u64 {
        self.first_round + self.rounds as u64 - 1
    }
}

/// Advances candidate chains round by round up to a horizon, yielding every round exactly once
///
/// The first snapshot is round 0, the untouched seeds. Every later snapshot covers up to
/// `batch` rounds computed in a single accelerator dispatch; the last one is cut short so no
/// round past the horizon is reported. The stream cannot be restarted, and an error or a
/// cancellation ends it.
pub struct BatchChainScanner<'a, A: ?Sized> {
    accelerator: &'a A,
    values: Vec<u64>,
    horizon: u64,
    batch: u32,
    next_round: u64,
    started: bool,
    done: bool,
    cancel: Option<CancelToken>,
}

impl<'a, A: Accelerator + ?Sized> BatchChainScanner<'a, A> {
    pub fn new(accelerator: &'a A, seeds: Vec<u64>, horizon: u64, batch: u32) -> Result<Self> {
        if batch == 0 {
            return Err(ChainError::Config("scan batch size must be positive".into()));
        }
        Ok(BatchChainScanner {
            accelerator,
            values: seeds,
            horizon,
            batch,
            next_round: 0,
            started: false,
            done: false,
            cancel: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn lanes(&self) -> usize {
        self.values.len()
    }

    /// The first round not yet reported.
    pub fn next_round(&self) -> u64 {
        self.next_round
    }

    fn dispatch(&mut self) -> Result<RoundSnapshot> {
        let remaining = self.horizon - self.next_round + 1;
        let rounds = crate::round::dispatch_rounds(remaining, self.batch);
        let mut out = Vec::new();
        self.accelerator.trace(&mut self.values, rounds, &mut out)?;
        debug!(first_round = self.next_round, rounds, "scan batch dispatched");

        let snapshot = RoundSnapshot {
            first_round: self.next_round,
            rounds: rounds as usize,
            values: out,
        };
        match self.next_round.checked_add(rounds as u64) {
            Some(next) => self.next_round = next,
            None => self.done = true,
        }
        Ok(snapshot)
    }
}

impl<'a, A: Accelerator + ?Sized> Iterator for BatchChainScanner<'a, A> {
    type Item = Result<RoundSnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            self.next_round = 1;
            if self.horizon == 0 {
                self.done = true;
            }
            return Some(Ok(RoundSnapshot {
                first_round: 0,
                rounds: 1,
                values: self.values.clone(),
            }));
        }
        if self.next_round > self.horizon {
            self.done = true;
            return None;
        }
        if self.cancel.as_ref().map_or(false, CancelToken::is_cancelled) {
            self.done = true;
            return Some(Err(ChainError::Cancelled));
        }

        let snapshot = self.dispatch();
        if snapshot.is_err() {
            self.done = true;
        }
        Some(snapshot)
    }
}
