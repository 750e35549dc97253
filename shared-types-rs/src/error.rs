// shared-types-rs/src/error.rs
//
// Standardized error taxonomy for the custody core.
//
// Component crates keep their own thiserror enums at their seams; everything
// that crosses the pipeline boundary is converted into CustodyError so
// callers see a stable kind and message, never a stack trace.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to CustodyError.
pub type Result<T, E = CustodyError> = std::result::Result<T, E>;

/// Caller-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Entity does not exist (record, key, CID, permission).
    NotFound,
    /// A policy or ledger ACL decision denied the operation.
    Forbidden,
    /// State rejects the operation (archived record, duplicate commit).
    Conflict,
    /// Malformed or out-of-range input.
    InvalidInput,
    /// Hash, auth-tag or chain mismatch. Never retried.
    IntegrityViolation,
    /// Wrap/unwrap/sign/verify failure.
    CryptoError,
    /// Ledger submit/evaluate failure.
    LedgerError,
    /// Object-store failure.
    StorageError,
    /// Transient I/O failure against a collaborator.
    DependencyUnavailable,
    /// A bounded deadline elapsed.
    Timeout,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Whether local bounded retry is permitted for this kind.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::DependencyUnavailable | ErrorKind::Timeout)
    }

    /// Stable wire code for the kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::IntegrityViolation => "INTEGRITY_VIOLATION",
            ErrorKind::CryptoError => "CRYPTO_ERROR",
            ErrorKind::LedgerError => "LEDGER_ERROR",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Severity attached to audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// Core error type crossing the pipeline boundary.
///
/// The source chain is kept for logs but is intentionally dropped from
/// serialization; callers get `KIND: message` and nothing else.
#[derive(Debug)]
pub struct CustodyError {
    pub kind: ErrorKind,
    pub message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl CustodyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IntegrityViolation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for CustodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for CustodyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ErrorKind::DependencyUnavailable.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::IntegrityViolation.is_transient());
        assert!(!ErrorKind::Forbidden.is_transient());
    }

    #[test]
    fn display_is_code_and_message() {
        let err = CustodyError::forbidden("read denied by policy p-42");
        assert_eq!(err.to_string(), "FORBIDDEN: read denied by policy p-42");
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = CustodyError::with_source(ErrorKind::StorageError, "chunk write failed", io);
        assert!(err.source().is_some());
    }
}
