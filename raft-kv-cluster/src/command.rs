use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identifies a proposal so the proposing node can hand the apply result
/// back to the waiting caller.
///
/// The proposer's member id is part of the key: after a leadership change the
/// new leader may still commit entries proposed by the old one, and those
/// must never be mistaken for its own pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub proposer: u64,
    pub seq: u64,
}

/// Key-value operations replicated through the log.
///
/// GET is replicated as well so that reads are ordered with writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Operation::Put { key, .. } | Operation::Get { key } | Operation::Delete { key } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Put { .. } => "PUT",
            Operation::Get { .. } => "GET",
            Operation::Delete { .. } => "DEL",
        }
    }
}

/// Commands that flow through the Raft replicated log as normal entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub request: RequestId,
    pub op: Operation,
}

impl CommandPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Addressing metadata for one member of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub shard_id: u64,
    pub raft_addr: String,
    pub http_addr: Option<String>,
}

/// Carried in the context of a conf-change entry, so every member learns the
/// new member's addresses at the same log position as the voter change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipContext {
    pub request: RequestId,
    pub member: Option<MemberInfo>,
}

impl MembershipContext {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_survives_encoding() {
        let payload = CommandPayload {
            request: RequestId { proposer: 2, seq: 41 },
            op: Operation::Put {
                key: "user1".into(),
                value: "john_doe".into(),
            },
        };
        let decoded = CommandPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.op.key(), "user1");
        assert_eq!(decoded.op.name(), "PUT");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CommandPayload::decode(&[0xff, 0x01]).is_err());
        assert!(MembershipContext::decode(&[]).is_err());
    }
}
