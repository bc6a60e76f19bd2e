use std::str::FromStr;

use crate::error::{ChainError, Result};
use crate::index::DEFAULT_BUCKET_BITS;
use crate::table::MalformedPolicy;

/// Whether a candidate keeps scanning after its first confirmed break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    CollectAll,
    StopOnFirstConfirmed,
}

impl Default for StopPolicy {
    fn default() -> Self {
        StopPolicy::CollectAll
    }
}

impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" | "collect-all" => Ok(StopPolicy::CollectAll),
            "first" | "stop-on-first" => Ok(StopPolicy::StopOnFirstConfirmed),
            other => Err(format!("unknown stop policy '{}'", other)),
        }
    }
}

/// Every knob of a build or scan run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Rounds each table chain is advanced from its seed.
    pub table_rounds: u64,
    pub table_start: u64,
    pub table_count: u64,
    /// Seeds computed per table batch.
    pub table_batch: u64,
    /// Rounds per accelerator dispatch while building; 0 runs each batch in one dispatch.
    pub rounds_per_dispatch: u32,
    /// Highest candidate round probed.
    pub scan_horizon: u64,
    /// Rounds per scan snapshot.
    pub scan_batch: u32,
    pub candidate_count: usize,
    pub bucket_bits: u32,
    /// Accelerator threads; 0 uses one per CPU.
    pub threads: usize,
    pub stop_policy: StopPolicy,
    /// Probe one snapshot while the next is being computed.
    pub pipelined: bool,
    pub malformed: MalformedPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            table_rounds: 1 << 16,
            table_start: 0,
            table_count: 65536,
            table_batch: 65536,
            rounds_per_dispatch: 0,
            scan_horizon: 1 << 28,
            scan_batch: 1024,
            candidate_count: 64,
            bucket_bits: DEFAULT_BUCKET_BITS,
            threads: 0,
            stop_policy: StopPolicy::CollectAll,
            pipelined: false,
            malformed: MalformedPolicy::Abort,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.table_batch == 0 || self.table_count % self.table_batch != 0 {
            return Err(ChainError::Config(format!(
                "table batch {} must be positive and divide the table count {}",
                self.table_batch, self.table_count
            )));
        }
        if self.rounds_per_dispatch != 0 && self.table_rounds % self.rounds_per_dispatch as u64 != 0 {
            return Err(ChainError::Config(format!(
                "rounds per dispatch {} must divide the table rounds {}",
                self.rounds_per_dispatch, self.table_rounds
            )));
        }
        if self.table_start.checked_add(self.table_count).is_none() {
            return Err(ChainError::Config("table seed range overflows 64 bits".into()));
        }
        if self.scan_batch == 0 {
            return Err(ChainError::Config("scan batch must be positive".into()));
        }
        if self.candidate_count == 0 {
            return Err(ChainError::Config("candidate count must be positive".into()));
        }
        if self.bucket_bits == 0 || self.bucket_bits > 32 {
            return Err(ChainError::Config(format!(
                "bucket bits must be within 1..=32, got {}",
                self.bucket_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn batch_must_divide_count() {
        let config = EngineConfig {
            table_count: 1000,
            table_batch: 300,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn dispatch_rounds_must_divide_table_rounds() {
        let config = EngineConfig {
            table_rounds: 100,
            rounds_per_dispatch: 30,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            table_rounds: 100,
            rounds_per_dispatch: 25,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_scan_settings() {
        for config in vec![
            EngineConfig {
                scan_batch: 0,
                ..EngineConfig::default()
            },
            EngineConfig {
                candidate_count: 0,
                ..EngineConfig::default()
            },
            EngineConfig {
                bucket_bits: 40,
                ..EngineConfig::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn stop_policy_parses() {
        assert_eq!("first".parse(), Ok(StopPolicy::StopOnFirstConfirmed));
        assert_eq!("all".parse(), Ok(StopPolicy::CollectAll));
        assert!("sometimes".parse::<StopPolicy>().is_err());
    }
}
