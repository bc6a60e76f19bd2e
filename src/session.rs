use std::sync::mpsc;
use std::thread;
use std::time;

use tracing::{debug, info, warn};

use crate::accelerator::Accelerator;
use crate::candidate::{CandidateOtp, CandidateState};
use crate::config::{EngineConfig, StopPolicy};
use crate::error::{ChainError, Result};
use crate::finder::BreakFinder;
use crate::index::ChainLookup;
use crate::round::{Md5Fold, RoundFunction};
use crate::scanner::{BatchChainScanner, CancelToken, RoundSnapshot};
use crate::validator::BreakValidator;

/// Snapshots between progress lines.
const PROGRESS_SNAPSHOTS: u64 = 1024;

/// Snapshots a pipelined dispatch worker may hold ready beyond the one being probed.
const PIPELINE_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub horizon: u64,
    pub batch: u32,
    pub stop_policy: StopPolicy,
    pub pipelined: bool,
}

impl From<&EngineConfig> for ScanOptions {
    fn from(config: &EngineConfig) -> Self {
        ScanOptions {
            horizon: config.scan_horizon,
            batch: config.scan_batch,
            stop_policy: config.stop_policy,
            pipelined: config.pipelined,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Highest round reported by the scanner.
    pub last_round: u64,
    pub snapshots: u64,
    pub probes: u64,
    pub breaks: u64,
    pub confirmed: u64,
    pub faulted: u64,
    pub cancelled: bool,
}

impl SessionReport {
    fn merge(&mut self, other: &SessionReport) {
        self.last_round = self.last_round.max(other.last_round);
        self.snapshots += other.snapshots;
        self.probes += other.probes;
        self.breaks += other.breaks;
        self.confirmed += other.confirmed;
        self.faulted += other.faulted;
        self.cancelled |= other.cancelled;
    }
}

/// One scan of a set of candidates against a loaded table
///
/// Candidates move Created -> Scanning -> (BreakFound -> Validating)* and finish as Exhausted
/// or ConfirmedBreak. Breaks recorded before a cancellation or an error stay on the candidates.
pub struct ScanSession<'a, A: ?Sized, L: ?Sized, F = Md5Fold> {
    accelerator: &'a A,
    index: &'a L,
    validator: BreakValidator<F>,
    options: ScanOptions,
    cancel: CancelToken,
}

impl<'a, A, L, F> ScanSession<'a, A, L, F>
where
    A: Accelerator + ?Sized,
    L: ChainLookup + ?Sized,
    F: RoundFunction,
{
    pub fn new(
        accelerator: &'a A,
        index: &'a L,
        validator: BreakValidator<F>,
        options: ScanOptions,
    ) -> Self {
        ScanSession {
            accelerator,
            index,
            validator,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Scans `candidates` as `groups` disjoint groups on their own threads.
    pub fn run_groups(&self, candidates: &mut [CandidateOtp], groups: usize) -> Result<SessionReport> {
        if candidates.is_empty() {
            return Ok(SessionReport::default());
        }
        let groups = groups.max(1).min(candidates.len());
        if groups == 1 {
            return self.run(candidates);
        }
        let per_group = (candidates.len() + groups - 1) / groups;

        let results: Vec<Result<SessionReport>> = thread::scope(|s| {
            let handles: Vec<_> = candidates
                .chunks_mut(per_group)
                .map(|group| s.spawn(move || self.run(group)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(ChainError::Accelerator("scan thread panicked".into())))
                })
                .collect()
        });

        let mut report = SessionReport::default();
        for result in results {
            report.merge(&result?);
        }
        Ok(report)
    }

    pub fn run(&self, candidates: &mut [CandidateOtp]) -> Result<SessionReport> {
        let start = time::Instant::now();
        let seeds: Vec<u64> = candidates.iter().map(|c| c.otp).collect();
        for candidate in candidates.iter_mut().filter(|c| c.is_active()) {
            candidate.state = CandidateState::Scanning;
        }

        let scanner =
            BatchChainScanner::new(self.accelerator, seeds, self.options.horizon, self.options.batch)?
                .with_cancel(self.cancel.clone());
        let mut finder = BreakFinder::new(self.index);
        let mut report = SessionReport::default();

        if self.options.pipelined {
            // The worker dispatches the next batch while this thread probes the current one.
            thread::scope(|s| {
                let (tx, rx) = mpsc::sync_channel(PIPELINE_DEPTH);
                let worker = s.spawn(move || {
                    for snapshot in scanner {
                        if tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                });
                let drained = self.drain(rx, candidates, &mut finder, &mut report, start);
                if worker.join().is_err() {
                    return Err(ChainError::Accelerator("dispatch thread panicked".into()));
                }
                drained
            })?;
        } else {
            self.drain(scanner, candidates, &mut finder, &mut report, start)?;
        }

        report.probes = finder.probes();
        if !report.cancelled {
            for candidate in candidates.iter_mut().filter(|c| c.is_active()) {
                candidate.state = if candidate.confirmed.is_empty() {
                    CandidateState::Exhausted
                } else {
                    CandidateState::ConfirmedBreak
                };
            }
        }
        info!(
            last_round = report.last_round,
            breaks = report.breaks,
            confirmed = report.confirmed,
            secs = start.elapsed().as_secs_f32(),
            "scan session finished"
        );
        Ok(report)
    }

    /// Consumes snapshots until the stream ends, is cancelled, or every candidate is finished.
    ///
    /// Returning early drops `snapshots`, which stops a pipelined worker at its next send.
    fn drain<I>(
        &self,
        snapshots: I,
        candidates: &mut [CandidateOtp],
        finder: &mut BreakFinder<'_, L>,
        report: &mut SessionReport,
        start: time::Instant,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<RoundSnapshot>>,
    {
        for next in snapshots {
            let snapshot = match next {
                Ok(snapshot) => snapshot,
                Err(ChainError::Cancelled) => {
                    warn!(last_round = report.last_round, "scan cancelled");
                    report.cancelled = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.consume(&snapshot, candidates, finder, report)?;

            if report.snapshots % PROGRESS_SNAPSHOTS == 0 {
                let rate = report.last_round as f32 / start.elapsed().as_secs_f32();
                info!(round = report.last_round, rounds_per_sec = rate, breaks = report.breaks, "scan progress");
            }
            if candidates.iter().all(|c| !c.is_active()) {
                debug!(round = report.last_round, "every candidate finished early");
                return Ok(());
            }
        }
        Ok(())
    }

    fn consume(
        &self,
        snapshot: &RoundSnapshot,
        candidates: &mut [CandidateOtp],
        finder: &mut BreakFinder<'_, L>,
        report: &mut SessionReport,
    ) -> Result<()> {
        let was_faulted = count_faulted(candidates);
        let discoveries = finder.process(snapshot, candidates)?;
        report.faulted += (count_faulted(candidates) - was_faulted) as u64;
        report.snapshots += 1;
        report.last_round = snapshot.last_round();

        for (i, found) in discoveries.iter().enumerate() {
            let candidate = &mut candidates[found.candidate];
            if candidate.state == CandidateState::ConfirmedBreak {
                continue;
            }
            report.breaks += 1;
            candidate.state = CandidateState::Validating;
            if self.validator.confirm(candidate.otp, &found.brk, found.value) {
                info!(candidate = %candidate, round = found.brk.round, "break confirmed");
                candidate.confirmed.push(found.brk);
                report.confirmed += 1;
                if self.options.stop_policy == StopPolicy::StopOnFirstConfirmed {
                    // Later hits in this snapshot lie past the stopping point.
                    let later = discoveries[i + 1..]
                        .iter()
                        .filter(|d| d.candidate == found.candidate)
                        .count();
                    let kept = candidate.breaks.len() - later;
                    candidate.breaks.truncate(kept);
                    candidate.state = CandidateState::ConfirmedBreak;
                    continue;
                }
            } else {
                debug!(candidate = %candidate, round = found.brk.round, "break not reconstructable");
            }
            candidate.state = CandidateState::Scanning;
        }
        Ok(())
    }
}

fn count_faulted(candidates: &[CandidateOtp]) -> usize {
    candidates
        .iter()
        .filter(|c| matches!(c.state, CandidateState::Faulted(_)))
        .count()
}
