use crate::candidate::{Break, CandidateOtp};
use crate::round::{Md5Fold, RoundFunction};

/// Where a candidate chain and a table chain first meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePoint {
    pub candidate_round: u64,
    pub source_round: u64,
}

/// Confirms index hits by replaying both chains on the host.
///
/// A break at candidate round `r` against a table built with `T` rounds claims that the
/// candidate chain at round `r` and the source chain at round `T` agree. Aligning the chains on
/// that claim, candidate round `j` corresponds to source round `j + T - r`. Replay walks the
/// aligned pairs from the earliest one where both rounds exist and stops at the first equal pair.
/// A genuine break always meets by round `r`; a table whose real round count differs from `T`
/// never does.
pub struct BreakValidator<F = Md5Fold> {
    round: F,
    table_rounds: u64,
}

impl BreakValidator<Md5Fold> {
    pub fn new(table_rounds: u64) -> Self {
        BreakValidator::with_round(table_rounds, Md5Fold)
    }
}

impl<F: RoundFunction> BreakValidator<F> {
    pub fn with_round(table_rounds: u64, round: F) -> Self {
        BreakValidator {
            round,
            table_rounds,
        }
    }

    pub fn table_rounds(&self) -> u64 {
        self.table_rounds
    }

    pub fn validate(&self, candidate: &CandidateOtp, brk: &Break) -> bool {
        self.merge_point(candidate.otp, brk).is_some()
    }

    /// Confirms a hit given `value`, the candidate's chain value at `brk.round` as the scan saw it.
    ///
    /// Costs at most `T` digests whatever the break round. `validate` replays the candidate
    /// from its OTP and costs `max(r, T)`.
    pub fn confirm(&self, otp: u64, brk: &Break, value: u64) -> bool {
        if brk.round <= self.table_rounds {
            self.merge_point(otp, brk).is_some()
        } else {
            // The aligned pairs merge by round r exactly when the last pair is equal.
            self.round.chain(brk.source, self.table_rounds) == value
        }
    }

    pub fn merge_point(&self, otp: u64, brk: &Break) -> Option<MergePoint> {
        let (mut candidate_round, mut source_round) = if brk.round >= self.table_rounds {
            (brk.round - self.table_rounds, 0)
        } else {
            (0, self.table_rounds - brk.round)
        };
        let mut candidate = self.round.chain(otp, candidate_round);
        let mut source = self.round.chain(brk.source, source_round);

        loop {
            if candidate == source {
                return Some(MergePoint {
                    candidate_round,
                    source_round,
                });
            }
            if candidate_round == brk.round {
                return None;
            }
            candidate = self.round.digest(candidate);
            source = self.round.digest(source);
            candidate_round += 1;
            source_round += 1;
        }
    }

    /// The value one round before `otp`, when the table chain passes through `otp` itself.
    ///
    /// This is the next password of the S/Key sequence the candidate came from.
    pub fn preimage(&self, otp: u64, brk: &Break) -> Option<u64> {
        match self.merge_point(otp, brk)? {
            MergePoint {
                candidate_round: 0,
                source_round,
            } if source_round > 0 => Some(self.round.chain(brk.source, source_round - 1)),
            _ => None,
        }
    }
}
