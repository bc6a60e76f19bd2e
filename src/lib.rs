//! Break search over OTP-MD5 (S/Key) chains.
//!
//! A table of `(seed, endpoint)` chains is precomputed with [`ChainTableBuilder`] and loaded
//! into a [`ChainLookup`] backend. Candidate OTPs are then advanced round by round with a
//! [`BatchChainScanner`]; every round is probed against the table by a [`BreakFinder`], and hits
//! are replayed by a [`BreakValidator`]. [`ScanSession`] ties the scan phase together.

pub mod accelerator;
pub mod builder;
pub mod candidate;
pub mod config;
pub mod error;
pub mod finder;
pub mod index;
pub mod round;
pub mod scanner;
pub mod session;
pub mod sqlite;
pub mod table;
pub mod validator;

pub use crate::accelerator::{Accelerator, CpuAccelerator};
pub use crate::builder::ChainTableBuilder;
pub use crate::candidate::{Break, CandidateOtp, CandidateState, OtpLabel};
pub use crate::config::{EngineConfig, StopPolicy};
pub use crate::error::{ChainError, Result};
pub use crate::finder::{BreakFinder, Discovery};
pub use crate::index::{ChainIndex, ChainLookup};
pub use crate::round::{chain, create, digest, Md5Fold, RoundFunction};
pub use crate::scanner::{BatchChainScanner, CancelToken, RoundSnapshot};
pub use crate::session::{ScanOptions, ScanSession, SessionReport};
pub use crate::sqlite::SqliteChainStore;
pub use crate::table::{ChainEntry, MalformedPolicy, TableReader, TableWriter};
pub use crate::validator::{BreakValidator, MergePoint};
