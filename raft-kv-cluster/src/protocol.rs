//! JSON bodies exchanged over HTTP by clients, nodes and the router.
//!
//! Field names follow the wire format clients already use (`shardID`,
//! `memberID`, camelCase elsewhere). Ids are accepted either as numbers or as
//! numeric strings.

use std::collections::BTreeMap;

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ShardError;
use crate::membership::{JoinState, ServerEntry};
use crate::runtime::NodeRole;

/// Header set on a GET a follower forwards to its leader. A request carrying
/// it is never forwarded again.
pub const FORWARDED_HEADER: &str = "x-kv-forwarded";

/// Envelope used by every endpoint except `/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
        }
    }
}

/// Body of every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(default)]
    pub kind: String,
    /// HTTP address of the leader, on not-leader errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl From<&ShardError> for ErrorBody {
    fn from(err: &ShardError) -> Self {
        Self {
            success: false,
            error: err.to_string(),
            kind: err.kind().to_string(),
            leader: err.leader_hint().map(str::to_owned),
        }
    }
}

impl IntoResponse for ShardError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::from(&self))).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default, alias = "val")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetQuery {
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvData {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// `/get` answers with a flat body rather than the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GetResponse {
    pub fn found(key: String, value: String) -> Self {
        Self {
            success: true,
            key,
            value,
            error: None,
        }
    }

    pub fn missing(key: String) -> Self {
        Self {
            success: false,
            key,
            value: String::new(),
            error: Some(ShardError::KeyNotFound.to_string()),
        }
    }
}

/// `{shardID, address, term?}` as posted to `/addshard` and `/newleader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAnnouncement {
    #[serde(rename = "shardID", deserialize_with = "flexible_id")]
    pub shard_id: u64,
    #[serde(alias = "shardAddress")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementAck {
    #[serde(rename = "shardID")]
    pub shard_id: u64,
    pub address: String,
    pub term: u64,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "memberID", deserialize_with = "flexible_id")]
    pub member_id: u64,
    /// Raft transport address of the joiner.
    pub address: String,
    #[serde(rename = "httpAddress", default)]
    pub http_address: Option<String>,
    #[serde(rename = "shardID", default, deserialize_with = "flexible_id_opt")]
    pub shard_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    #[serde(rename = "memberID", deserialize_with = "flexible_id")]
    pub member_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberData {
    #[serde(rename = "memberID")]
    pub member_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigData {
    pub shard_count: usize,
    pub shards: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatusData {
    pub id: u64,
    #[serde(rename = "shardID")]
    pub shard_id: u64,
    pub state: NodeRole,
    pub term: u64,
    #[serde(default)]
    pub leader: Option<u64>,
    #[serde(default)]
    pub leader_address: Option<String>,
    pub num_peers: usize,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub join_state: JoinState,
    pub latest_configuration: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    pub address: String,
    pub term: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub address: String,
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    pub node_count: usize,
    pub leader: Option<String>,
    pub nodes: Vec<NodeHealth>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(u64),
    Text(String),
}

impl IdRepr {
    fn into_id<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            IdRepr::Number(id) => Ok(id),
            IdRepr::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid id format: {text:?}"))),
        }
    }
}

fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    IdRepr::deserialize(deserializer)?.into_id()
}

fn flexible_id_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<IdRepr>::deserialize(deserializer)?
        .map(IdRepr::into_id)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_accepts_val_alias() {
        let req: PutRequest = serde_json::from_value(json!({"key": "user1", "val": "john_doe"})).unwrap();
        assert_eq!(req.value, "john_doe");
        let req: PutRequest = serde_json::from_value(json!({"key": "user1"})).unwrap();
        assert!(req.value.is_empty());
    }

    #[test]
    fn announcement_accepts_string_ids_and_alias() {
        let ann: ShardAnnouncement =
            serde_json::from_value(json!({"shardID": "2", "shardAddress": "shard2:8021"})).unwrap();
        assert_eq!(ann.shard_id, 2);
        assert_eq!(ann.address, "shard2:8021");
        assert_eq!(ann.term, None);

        let bad = serde_json::from_value::<ShardAnnouncement>(json!({"shardID": "two", "address": "x"}));
        assert!(bad.is_err());
    }

    #[test]
    fn join_request_optional_fields() {
        let req: JoinRequest =
            serde_json::from_value(json!({"memberID": "3", "address": "127.0.0.1:18031"})).unwrap();
        assert_eq!(req.member_id, 3);
        assert_eq!(req.shard_id, None);
        assert_eq!(req.http_address, None);

        let req: JoinRequest = serde_json::from_value(json!({
            "memberID": 3, "address": "127.0.0.1:18031",
            "httpAddress": "127.0.0.1:8031", "shardID": 3
        }))
        .unwrap();
        assert_eq!(req.shard_id, Some(3));
    }

    #[test]
    fn missing_key_body_matches_wire_format() {
        let body = serde_json::to_value(GetResponse::missing("missing-key".into())).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["key"], json!("missing-key"));
        assert_eq!(body["error"], json!("Key not found"));
    }

    #[test]
    fn not_leader_body_carries_hint() {
        let err = ShardError::NotLeader {
            leader: Some("127.0.0.1:8011".into()),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, "not_leader");
        assert_eq!(body.leader.as_deref(), Some("127.0.0.1:8011"));
        assert!(!body.success);
    }
}
