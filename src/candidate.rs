use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::Result;
use crate::round::{create, to_hex};

/// Sequence number given to generated test OTPs.
pub const TEST_SEQUENCE: u64 = 50;

const PASSWORD_LEN: usize = 16;

/// An index hit: the candidate's chain value `round` rounds in equals the endpoint of the table
/// chain starting at `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Break {
    pub round: u64,
    pub source: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateState {
    Created,
    Scanning,
    BreakFound,
    Validating,
    /// Scanned to the horizon.
    Exhausted,
    ConfirmedBreak,
    /// A lookup for this candidate failed; it is no longer probed.
    Faulted(String),
}

impl CandidateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateState::Exhausted | CandidateState::ConfirmedBreak | CandidateState::Faulted(_)
        )
    }
}

/// How an OTP was constructed, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpLabel {
    pub seed: String,
    pub sequence: u64,
    pub password: String,
}

impl OtpLabel {
    /// A test OTP shaped like a real S/Key challenge: a seed of two lowercase letters and five
    /// digits, and a 16 character alphanumeric password.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let seed = format!(
            "{}{}{:05}",
            rng.gen_range(b'a'..=b'z') as char,
            rng.gen_range(b'a'..=b'z') as char,
            rng.gen_range(0..100_000u32)
        );
        let password = (0..PASSWORD_LEN)
            .map(|_| rng.sample(Alphanumeric) as char)
            .collect();
        OtpLabel {
            seed,
            sequence: TEST_SEQUENCE,
            password,
        }
    }

    pub fn otp(&self) -> u64 {
        create(&self.seed, &self.password, self.sequence)
    }
}

#[derive(Debug, Clone)]
pub struct CandidateOtp {
    pub label: Option<OtpLabel>,
    pub otp: u64,
    pub breaks: Vec<Break>,
    pub confirmed: Vec<Break>,
    pub state: CandidateState,
}

impl CandidateOtp {
    pub fn new(otp: u64) -> Self {
        CandidateOtp {
            label: None,
            otp,
            breaks: Vec::new(),
            confirmed: Vec::new(),
            state: CandidateState::Created,
        }
    }

    pub fn from_label(label: OtpLabel) -> Self {
        let mut candidate = CandidateOtp::new(label.otp());
        candidate.label = Some(label);
        candidate
    }

    pub fn random<R: Rng>(rng: &mut R) -> Self {
        CandidateOtp::from_label(OtpLabel::random(rng))
    }

    /// Whether the scanner output for this candidate still needs probing.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn artifact_name(&self) -> String {
        match &self.label {
            Some(label) => format!(
                "otpmd5_{}_{}_{}_candidates",
                label.seed, label.sequence, label.password
            ),
            None => format!("otpmd5_{}_candidates", to_hex(self.otp)),
        }
    }

    /// Writes the break artifact into `dir`, one `<round>\t<source>` line per break.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join(self.artifact_name());
        let mut out = BufWriter::new(File::create(&path)?);
        for brk in &self.breaks {
            writeln!(out, "{}\t{}", brk.round, to_hex(brk.source))?;
        }
        out.flush()?;
        Ok(path)
    }
}

impl fmt::Display for CandidateOtp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(
                f,
                "otp(seed={}, seq={}, pass={}, otp={})",
                label.seed,
                label.sequence,
                label.password,
                to_hex(self.otp)
            ),
            None => write!(f, "otp({})", to_hex(self.otp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn random_labels_have_skey_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let label = OtpLabel::random(&mut rng);
            assert_eq!(label.seed.len(), 7);
            assert!(label.seed[..2].bytes().all(|b| b.is_ascii_lowercase()));
            assert!(label.seed[2..].bytes().all(|b| b.is_ascii_digit()));
            assert_eq!(label.password.len(), 16);
            assert!(label.password.bytes().all(|b| b.is_ascii_alphanumeric()));
            assert_eq!(label.sequence, TEST_SEQUENCE);
        }
    }

    #[test]
    fn labelled_otp_matches_create() {
        let label = OtpLabel {
            seed: "ke12345".into(),
            sequence: 50,
            password: "abcdefghijklmnop".into(),
        };
        let candidate = CandidateOtp::from_label(label);
        assert_eq!(candidate.otp, create("ke12345", "abcdefghijklmnop", 50));
        assert_eq!(candidate.state, CandidateState::Created);
        assert_eq!(
            candidate.artifact_name(),
            "otpmd5_ke12345_50_abcdefghijklmnop_candidates"
        );
    }

    #[test]
    fn save_writes_round_and_source() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let mut candidate = CandidateOtp::new(0x0102_0304_0506_0708);
        candidate.breaks.push(Break { round: 5, source: 2 });
        candidate.breaks.push(Break { round: 0, source: 0x10 });

        let path = candidate.save(tmp.path())?;
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("otpmd5_0807060504030201_candidates")
        );
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text, "5\t0200000000000000\n0\t1000000000000000\n");
        Ok(())
    }

    #[test]
    fn terminal_states() {
        assert!(CandidateState::Exhausted.is_terminal());
        assert!(CandidateState::ConfirmedBreak.is_terminal());
        assert!(CandidateState::Faulted("sql".into()).is_terminal());
        assert!(!CandidateState::BreakFound.is_terminal());
        assert!(!CandidateState::Scanning.is_terminal());
    }
}
