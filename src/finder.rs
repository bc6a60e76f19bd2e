use tracing::{info, warn};

use crate::candidate::{Break, CandidateOtp, CandidateState};
use crate::error::Result;
use crate::index::ChainLookup;
use crate::round::to_hex;
use crate::scanner::RoundSnapshot;

/// A break found while probing a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    /// Position of the candidate in the scanned slice.
    pub candidate: usize,
    pub brk: Break,
    /// The chain value that matched a table endpoint.
    pub value: u64,
}

/// Probes every snapshot value against the table.
///
/// Each scanning thread owns its finder; the lookup backend is shared.
pub struct BreakFinder<'a, L: ?Sized> {
    index: &'a L,
    matches: Vec<u64>,
    probes: u64,
}

impl<'a, L: ChainLookup + ?Sized> BreakFinder<'a, L> {
    pub fn new(index: &'a L) -> Self {
        BreakFinder {
            index,
            matches: Vec::new(),
            probes: 0,
        }
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    /// Records every break in `snapshot` on the matching candidate, lane `i` being
    /// `candidates[i]`.
    ///
    /// Candidates in a terminal state are not probed. A recoverable lookup failure faults only
    /// its own candidate; a fatal one is returned.
    pub fn process(
        &mut self,
        snapshot: &RoundSnapshot,
        candidates: &mut [CandidateOtp],
    ) -> Result<Vec<Discovery>> {
        let mut found = Vec::new();
        let lanes = snapshot.lanes().min(candidates.len());

        for (lane, candidate) in candidates.iter_mut().enumerate().take(lanes) {
            if !candidate.is_active() {
                continue;
            }
            for (round, value) in snapshot.rounds_of(lane) {
                self.matches.clear();
                self.probes += 1;
                if let Err(e) = self.index.lookup_into(value, &mut self.matches) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(candidate = %candidate, round, error = %e, "lookup failed, dropping candidate");
                    candidate.state = CandidateState::Faulted(e.to_string());
                    break;
                }
                self.matches.sort_unstable();
                self.matches.dedup();

                for &source in &self.matches {
                    let brk = Break { round, source };
                    info!(
                        candidate = %candidate,
                        round,
                        source = %to_hex(source),
                        value = %to_hex(value),
                        "found break"
                    );
                    candidate.breaks.push(brk);
                    candidate.state = CandidateState::BreakFound;
                    found.push(Discovery {
                        candidate: lane,
                        brk,
                        value,
                    });
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainError;
    use crate::index::ChainIndex;
    use crate::table::ChainEntry;

    struct FlakyLookup;

    impl ChainLookup for FlakyLookup {
        fn lookup_into(&self, key: u64, out: &mut Vec<u64>) -> Result<()> {
            match key {
                13 => Err(ChainError::Sql(rusqlite::Error::InvalidQuery)),
                99 => Err(ChainError::LookupInconsistency { key, found: 98 }),
                _ => {
                    out.push(key + 1000);
                    Ok(())
                }
            }
        }
    }

    fn snapshot(first_round: u64, lanes: &[&[u64]]) -> RoundSnapshot {
        RoundSnapshot {
            first_round,
            rounds: lanes[0].len(),
            values: lanes.iter().flat_map(|l| l.iter().copied()).collect(),
        }
    }

    #[test]
    fn records_every_seed_of_a_collision() -> Result<()> {
        let index = ChainIndex::from_entries(
            4,
            &[
                ChainEntry::new(7, 50),
                ChainEntry::new(8, 50),
                ChainEntry::new(9, 60),
            ],
        )?;
        let mut candidates = vec![CandidateOtp::new(1), CandidateOtp::new(2)];
        let mut finder = BreakFinder::new(&index);

        let found = finder.process(&snapshot(4, &[&[1, 50], &[60, 3]]), &mut candidates)?;
        assert_eq!(found.len(), 3);
        assert_eq!(
            candidates[0].breaks,
            vec![Break { round: 5, source: 7 }, Break { round: 5, source: 8 }]
        );
        assert_eq!(candidates[1].breaks, vec![Break { round: 4, source: 9 }]);
        assert_eq!(candidates[1].state, CandidateState::BreakFound);
        assert_eq!(finder.probes(), 4);
        Ok(())
    }

    #[test]
    fn recoverable_failure_faults_only_its_candidate() -> Result<()> {
        let mut candidates = vec![CandidateOtp::new(1), CandidateOtp::new(2)];
        let mut finder = BreakFinder::new(&FlakyLookup);

        let found = finder.process(&snapshot(0, &[&[13], &[14]]), &mut candidates)?;
        assert!(matches!(candidates[0].state, CandidateState::Faulted(_)));
        assert!(candidates[0].breaks.is_empty());
        assert_eq!(found.len(), 1);
        assert_eq!(candidates[1].breaks, vec![Break { round: 0, source: 1014 }]);

        // The faulted candidate is no longer probed.
        let found = finder.process(&snapshot(1, &[&[13], &[15]]), &mut candidates)?;
        assert_eq!(found.len(), 1);
        Ok(())
    }

    #[test]
    fn inconsistency_is_fatal() {
        let mut candidates = vec![CandidateOtp::new(1)];
        let mut finder = BreakFinder::new(&FlakyLookup);
        let result = finder.process(&snapshot(0, &[&[99]]), &mut candidates);
        assert!(matches!(result, Err(ChainError::LookupInconsistency { .. })));
    }
}
