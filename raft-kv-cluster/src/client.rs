//! HTTP client for talking to node servers: used by the router, by leader
//! broadcasts, by GET forwarding and by the join guard.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::redirect::Policy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ShardError;
use crate::protocol::{
    ApiResponse, DeleteRequest, FORWARDED_HEADER, JoinRequest, PutRequest, RaftStatusData,
    ShardAnnouncement,
};

/// Status and JSON body of a node's answer, relayed as-is by the router.
#[derive(Debug, Clone)]
pub struct NodeReply {
    pub status: StatusCode,
    pub body: Value,
}

impl NodeReply {
    pub fn is_not_leader(&self) -> bool {
        self.status == StatusCode::MISDIRECTED_REQUEST
    }

    /// Leader hint carried by a not-leader body, if any.
    pub fn leader_hint(&self) -> Option<&str> {
        self.body.get("leader").and_then(Value::as_str)
    }
}

impl IntoResponse for NodeReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(timeout: Duration) -> Result<Self, ShardError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| ShardError::Internal(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    pub async fn put(&self, addr: &str, key: &str, value: &str) -> Result<NodeReply, ShardError> {
        let body = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.send(addr, self.client.put(url(addr, "/put")).json(&body)).await
    }

    pub async fn get(&self, addr: &str, key: &str, forwarded: bool) -> Result<NodeReply, ShardError> {
        let mut request = self.client.get(url(addr, "/get")).query(&[("key", key)]);
        if forwarded {
            request = request.header(FORWARDED_HEADER, "1");
        }
        self.send(addr, request).await
    }

    pub async fn delete(&self, addr: &str, key: &str) -> Result<NodeReply, ShardError> {
        let body = DeleteRequest { key: key.to_string() };
        self.send(addr, self.client.delete(url(addr, "/delete")).json(&body)).await
    }

    pub async fn raft_status(&self, addr: &str) -> Result<RaftStatusData, ShardError> {
        let reply = self.send(addr, self.client.get(url(addr, "/raft/status"))).await?;
        envelope_data(addr, reply)
    }

    pub async fn join(&self, addr: &str, request: &JoinRequest) -> Result<NodeReply, ShardError> {
        self.post(addr, "/raft/join", request).await
    }

    pub async fn announce_leader(&self, addr: &str, announcement: &ShardAnnouncement) -> Result<(), ShardError> {
        let reply = self.post(addr, "/newleader", announcement).await?;
        if reply.status.is_success() {
            Ok(())
        } else {
            Err(ShardError::UnreachablePeer {
                addr: addr.to_string(),
                reason: format!("announcement rejected with {}", reply.status),
            })
        }
    }

    async fn post<B: Serialize>(&self, addr: &str, path: &str, body: &B) -> Result<NodeReply, ShardError> {
        self.send(addr, self.client.post(url(addr, path)).json(body)).await
    }

    async fn send(&self, addr: &str, request: reqwest::RequestBuilder) -> Result<NodeReply, ShardError> {
        let unreachable = |err: reqwest::Error| ShardError::UnreachablePeer {
            addr: addr.to_string(),
            reason: err.to_string(),
        };
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(unreachable)?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(NodeReply { status, body })
    }
}

fn envelope_data<T: DeserializeOwned>(addr: &str, reply: NodeReply) -> Result<T, ShardError> {
    if !reply.status.is_success() {
        return Err(ShardError::UnreachablePeer {
            addr: addr.to_string(),
            reason: format!("status endpoint answered {}", reply.status),
        });
    }
    let envelope: ApiResponse<T> = serde_json::from_value(reply.body)
        .map_err(|err| ShardError::Internal(format!("malformed response from {addr}: {err}")))?;
    envelope
        .data
        .ok_or_else(|| ShardError::Internal(format!("response from {addr} carried no data")))
}

/// Node addresses are configured as `host:port`; a scheme is added when missing.
pub fn url(addr: &str, path: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}{path}", addr.trim_end_matches('/'))
    } else {
        format!("http://{addr}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_adds_scheme_only_when_missing() {
        assert_eq!(url("shard1:8011", "/put"), "http://shard1:8011/put");
        assert_eq!(url("http://127.0.0.1:8011/", "/get"), "http://127.0.0.1:8011/get");
    }

    #[test]
    fn reply_exposes_leader_hint() {
        let reply = NodeReply {
            status: StatusCode::MISDIRECTED_REQUEST,
            body: json!({"success": false, "error": "not the leader", "leader": "127.0.0.1:8011"}),
        };
        assert!(reply.is_not_leader());
        assert_eq!(reply.leader_hint(), Some("127.0.0.1:8011"));
    }

    #[tokio::test]
    async fn unreachable_node_is_retryable() {
        let client = NodeClient::new(Duration::from_millis(200)).unwrap();
        let err = client.raft_status("127.0.0.1:1").await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
