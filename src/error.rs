use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed table record at line {line}: {reason}")]
    Parse { line: u64, reason: String },
    #[error("accelerator failure: {0}")]
    Accelerator(String),
    #[error("index returned endpoint {found:016x} for lookup key {key:016x}")]
    LookupInconsistency { key: u64, found: u64 },
    #[error("scan cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl ChainError {
    /// Whether the error must end the current build or scan session.
    ///
    /// Parse errors only cover one record and SQL errors only cover one
    /// probe, so callers may skip past them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChainError::Parse { .. } | ChainError::Sql(_))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::ChainError;

    #[test]
    fn parse_and_sql_errors_are_recoverable() {
        let parse = ChainError::Parse {
            line: 3,
            reason: "bad hex".into(),
        };
        assert!(!parse.is_fatal());
        assert!(!ChainError::Sql(rusqlite::Error::InvalidQuery).is_fatal());
    }

    #[test]
    fn invariant_violations_are_fatal() {
        let err = ChainError::LookupInconsistency { key: 1, found: 2 };
        assert!(err.is_fatal());
        assert!(ChainError::Accelerator("lost device".into()).is_fatal());
        assert!(ChainError::Config("zero batch".into()).is_fatal());
        assert_eq!(
            err.to_string(),
            "index returned endpoint 0000000000000002 for lookup key 0000000000000001"
        );
    }
}
