//! Error taxonomy shared by the node server, the consensus runtime and the
//! router.
//!
//! Each variant maps to one HTTP status (see [`ShardError::status`]) and to a
//! retry policy: validation and not-found errors are terminal, leadership and
//! connectivity errors may be retried against another node, and timeouts are
//! surfaced with an unknown outcome because blind retries can duplicate
//! writes.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("{0}")]
    Validation(String),
    #[error("not the leader; leader hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("consensus timeout: the operation may or may not have been applied")]
    ConsensusTimeout,
    #[error("leadership lost before commit: the operation may or may not have been applied")]
    LeadershipLost,
    #[error("Key not found")]
    KeyNotFound,
    #[error("membership change rejected: {0}")]
    Membership(String),
    #[error("peer {addr} unreachable: {reason}")]
    UnreachablePeer { addr: String, reason: String },
    #[error("no leader available after {attempts} attempts")]
    NoLeader { attempts: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ShardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ShardError::Validation(_) => StatusCode::BAD_REQUEST,
            ShardError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ShardError::ConsensusTimeout => StatusCode::GATEWAY_TIMEOUT,
            ShardError::LeadershipLost => StatusCode::SERVICE_UNAVAILABLE,
            ShardError::KeyNotFound => StatusCode::NOT_FOUND,
            ShardError::Membership(_) => StatusCode::CONFLICT,
            ShardError::UnreachablePeer { .. } => StatusCode::BAD_GATEWAY,
            ShardError::NoLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ShardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the router may transparently retry the request on another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardError::NotLeader { .. } | ShardError::UnreachablePeer { .. }
        )
    }

    /// Stable machine-readable tag included in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ShardError::Validation(_) => "validation",
            ShardError::NotLeader { .. } => "not_leader",
            ShardError::ConsensusTimeout => "consensus_timeout",
            ShardError::LeadershipLost => "leadership_lost",
            ShardError::KeyNotFound => "key_not_found",
            ShardError::Membership(_) => "membership",
            ShardError::UnreachablePeer { .. } => "unreachable_peer",
            ShardError::NoLeader { .. } => "no_leader",
            ShardError::Internal(_) => "internal",
        }
    }

    /// Leader address carried by a not-leader error, if any.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            ShardError::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ShardError {
    fn from(err: anyhow::Error) -> Self {
        ShardError::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_leadership_and_connectivity_errors_are_retryable() {
        assert!(ShardError::NotLeader { leader: None }.is_retryable());
        assert!(ShardError::UnreachablePeer {
            addr: "127.0.0.1:1".into(),
            reason: "refused".into()
        }
        .is_retryable());
        assert!(!ShardError::ConsensusTimeout.is_retryable());
        assert!(!ShardError::LeadershipLost.is_retryable());
        assert!(!ShardError::KeyNotFound.is_retryable());
        assert!(!ShardError::Validation("empty key".into()).is_retryable());
    }

    #[test]
    fn key_not_found_keeps_wire_message() {
        assert_eq!(ShardError::KeyNotFound.to_string(), "Key not found");
        assert_eq!(ShardError::KeyNotFound.status(), StatusCode::NOT_FOUND);
    }
}
