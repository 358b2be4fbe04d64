//! Unified error system for Tessera
//!
//! A single error enum covers every crate in the workspace. Variants map
//! one-to-one onto the recovery failure taxonomy so callers can match on the
//! exact failure without string inspection.
//!
//! # Fatality
//!
//! Governance errors are local to the caller and never affect the cluster.
//! Ledger corruption, unreachable quorum, barrier timeouts and failed
//! recoveries abort the current recovery attempt. See [`TesseraError::is_fatal`].

use serde::{Deserialize, Serialize};

/// Unified error type for all Tessera operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TesseraError {
    /// Snapshot has a gap, a duplicate or an out-of-order record
    #[error("Ledger corrupt: {message}")]
    LedgerCorrupt {
        /// Description of the first inconsistency found
        message: String,
    },

    /// Sealed secrets could not be opened, or do not decrypt the ledger
    #[error("Secrets mismatch: {message}")]
    SecretsMismatch {
        /// Description of the mismatch
        message: String,
    },

    /// A replica disagreed with the snapshot during public replay
    #[error("Divergent replica {node}: {message}")]
    DivergentReplica {
        /// Replica that diverged
        node: String,
        /// Description of the divergence
        message: String,
    },

    /// Not enough replicas to run consensus
    #[error("Quorum unreachable: {started} replicas started, {required} required")]
    QuorumUnreachable {
        /// Replicas that started successfully
        started: usize,
        /// Minimum viable replica count
        required: usize,
    },

    /// A recovery barrier exceeded its deadline
    #[error("Recovery timeout: {barrier} exceeded {timeout_ms}ms")]
    RecoveryTimeout {
        /// Barrier that timed out
        barrier: String,
        /// Configured deadline
        timeout_ms: u64,
    },

    /// Recovery could not bring every node to full operation
    #[error("Recovery failed: {message}")]
    RecoveryFailed {
        /// Description of the failure
        message: String,
    },

    /// Caller is not a governance member
    #[error("Not a member: {member}")]
    NotAMember {
        /// Unknown member identifier
        member: String,
    },

    /// An identical one-shot proposal is already pending
    #[error("Duplicate proposal: {existing} is already pending")]
    DuplicateProposal {
        /// Pending proposal with the same kind
        existing: String,
    },

    /// Member already voted on this proposal
    #[error("Member {member} already voted on proposal {proposal}")]
    AlreadyVoted {
        /// Voting member
        member: String,
        /// Target proposal
        proposal: String,
    },

    /// Proposal is no longer open for votes
    #[error("Proposal {proposal} already decided: {outcome}")]
    ProposalAlreadyDecided {
        /// Target proposal
        proposal: String,
        /// Outcome recorded for the proposal
        outcome: String,
    },

    /// Proposal does not exist
    #[error("Proposal not found: {proposal}")]
    ProposalNotFound {
        /// Requested proposal
        proposal: String,
    },

    /// Lifecycle operation invoked from a state that does not allow it
    #[error("Invalid transition: cannot {operation} from {from}")]
    InvalidTransition {
        /// State the node was in
        from: String,
        /// Operation attempted
        operation: String,
    },

    /// Node is not in a state that serves this kind of request
    #[error("Node {node} not serving: {message}")]
    NotServing {
        /// Node that refused the request
        node: String,
        /// Reason
        message: String,
    },

    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Storage operation failed
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl TesseraError {
    /// Create a ledger corruption error
    pub fn ledger_corrupt(message: impl Into<String>) -> Self {
        Self::LedgerCorrupt {
            message: message.into(),
        }
    }

    /// Create a secrets mismatch error
    pub fn secrets_mismatch(message: impl Into<String>) -> Self {
        Self::SecretsMismatch {
            message: message.into(),
        }
    }

    /// Create a divergent replica error
    pub fn divergent_replica(node: impl ToString, message: impl Into<String>) -> Self {
        Self::DivergentReplica {
            node: node.to_string(),
            message: message.into(),
        }
    }

    /// Create a quorum unreachable error
    pub fn quorum_unreachable(started: usize, required: usize) -> Self {
        Self::QuorumUnreachable { started, required }
    }

    /// Create a recovery timeout error
    pub fn recovery_timeout(barrier: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RecoveryTimeout {
            barrier: barrier.into(),
            timeout_ms,
        }
    }

    /// Create a recovery failed error
    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            message: message.into(),
        }
    }

    /// Create a not-a-member error
    pub fn not_a_member(member: impl ToString) -> Self {
        Self::NotAMember {
            member: member.to_string(),
        }
    }

    /// Create a duplicate proposal error
    pub fn duplicate_proposal(existing: impl ToString) -> Self {
        Self::DuplicateProposal {
            existing: existing.to_string(),
        }
    }

    /// Create an already-voted error
    pub fn already_voted(member: impl ToString, proposal: impl ToString) -> Self {
        Self::AlreadyVoted {
            member: member.to_string(),
            proposal: proposal.to_string(),
        }
    }

    /// Create a proposal-already-decided error
    pub fn proposal_already_decided(proposal: impl ToString, outcome: impl ToString) -> Self {
        Self::ProposalAlreadyDecided {
            proposal: proposal.to_string(),
            outcome: outcome.to_string(),
        }
    }

    /// Create a proposal-not-found error
    pub fn proposal_not_found(proposal: impl ToString) -> Self {
        Self::ProposalNotFound {
            proposal: proposal.to_string(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl ToString, operation: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a not-serving error
    pub fn not_serving(node: impl ToString, message: impl Into<String>) -> Self {
        Self::NotServing {
            node: node.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error aborts the recovery attempt it occurred in.
    ///
    /// Governance errors are local to the caller. `SecretsMismatch` and
    /// `DivergentReplica` are retried or absorbed by the coordinator before
    /// they surface as `RecoveryFailed`, so they are not fatal on their own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LedgerCorrupt { .. }
                | Self::QuorumUnreachable { .. }
                | Self::RecoveryTimeout { .. }
                | Self::RecoveryFailed { .. }
                | Self::Internal { .. }
        )
    }

    /// Whether this is one of the governance errors.
    pub fn is_governance(&self) -> bool {
        matches!(
            self,
            Self::NotAMember { .. }
                | Self::DuplicateProposal { .. }
                | Self::AlreadyVoted { .. }
                | Self::ProposalAlreadyDecided { .. }
                | Self::ProposalNotFound { .. }
        )
    }
}

/// Standard Result type for Tessera operations
pub type TesseraResult<T> = std::result::Result<T, TesseraError>;

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TesseraError::ledger_corrupt("gap at index 3");
        assert!(matches!(err, TesseraError::LedgerCorrupt { .. }));
        assert_eq!(err.to_string(), "Ledger corrupt: gap at index 3");
    }

    #[test]
    fn test_fatality_classification() {
        assert!(TesseraError::ledger_corrupt("x").is_fatal());
        assert!(TesseraError::quorum_unreachable(1, 2).is_fatal());
        assert!(TesseraError::recovery_timeout("public sync", 10).is_fatal());
        assert!(!TesseraError::secrets_mismatch("x").is_fatal());
        assert!(!TesseraError::not_a_member("m9").is_fatal());
        assert!(TesseraError::already_voted("m1", "p1").is_governance());
        assert!(!TesseraError::recovery_failed("x").is_governance());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = TesseraError::from(io_err);
        assert!(matches!(err, TesseraError::NotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(matches!(
            TesseraError::from(io_err),
            TesseraError::Storage { .. }
        ));
    }
}
