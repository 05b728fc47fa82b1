//! Error types for pdkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Step of the region creation workflow that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateRegionStep {
    AllocateId,
    SelectNodes,
    StartLocal,
    RecordMapping,
    NotifyPeers,
}

impl std::fmt::Display for CreateRegionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateRegionStep::AllocateId => write!(f, "allocate_id"),
            CreateRegionStep::SelectNodes => write!(f, "select_nodes"),
            CreateRegionStep::StartLocal => write!(f, "start_local"),
            CreateRegionStep::RecordMapping => write!(f, "record_mapping"),
            CreateRegionStep::NotifyPeers => write!(f, "notify_peers"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Metadata Errors ===
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Region not found: {0}")]
    RegionNotFound(u64),

    #[error("No region found for key {0:?}")]
    NoRegionFound(String),

    #[error("Insufficient nodes: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    // === Consensus Errors ===
    #[error("Group not found: {0}")]
    GroupNotFound(u64),

    #[error("Group {0} already started on this host")]
    GroupAlreadyStarted(u64),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Membership change timeout: {0}")]
    MembershipChangeTimeout(String),

    // === Orchestration Errors ===
    #[error("Create region failed at step {step}: {cause}")]
    CreateRegionFailed {
        step: CreateRegionStep,
        cause: Box<Error>,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Input / Config Errors ===
    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::MembershipChangeTimeout(_)
                | Error::Consensus(_)
                | Error::Http(_)
        )
    }

    /// Is this a timeout of any kind?
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::MembershipChangeTimeout(_) => true,
            Error::CreateRegionFailed { cause, .. } => cause.is_timeout(),
            _ => false,
        }
    }

    /// Wrap a failure of one region creation step.
    pub fn create_region(step: CreateRegionStep, cause: Error) -> Self {
        Error::CreateRegionFailed {
            step,
            cause: Box::new(cause),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("propose".into()).is_retryable());
        assert!(Error::Consensus("no quorum".into()).is_retryable());
        assert!(!Error::RegionNotFound(7).is_retryable());
        assert!(!Error::InsufficientNodes {
            needed: 3,
            available: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_create_region_context() {
        let err = Error::create_region(
            CreateRegionStep::SelectNodes,
            Error::InsufficientNodes {
                needed: 3,
                available: 2,
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("select_nodes"));
        assert!(msg.contains("need 3, have 2"));
        assert!(!err.is_timeout());

        let timed_out = Error::create_region(
            CreateRegionStep::AllocateId,
            Error::Timeout("propose".into()),
        );
        assert!(timed_out.is_timeout());
    }
}
