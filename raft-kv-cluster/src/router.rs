//! Leader-aware request router.
//!
//! Writes go to the cached leader. When that guess fails (connection error
//! or a not-leader answer) the router asks every node for its Raft status
//! at once, keeps the highest-term leader, and retries with exponential
//! backoff. Reads are spread round-robin across all nodes; a follower
//! forwards them to its leader.
//!
//! Consensus timeouts come back as ordinary replies (504) and are never
//! retried: the write may already have been applied.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use futures_util::future::join_all;
use rand::Rng;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::client::{NodeClient, NodeReply};
use crate::config::RouterConfig;
use crate::error::ShardError;
use crate::protocol::{ApiResponse, DeleteRequest, GetQuery, NodeHealth, PutRequest, RouterStatus};
use crate::runtime::NodeRole;

const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone)]
enum Write {
    Put { key: String, value: String },
    Delete { key: String },
}

#[derive(Clone)]
pub struct ShardRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    nodes: Vec<String>,
    client: NodeClient,
    leader: RwLock<Option<String>>,
    cursor: AtomicUsize,
    discoveries: AtomicUsize,
    max_retries: usize,
    backoff_base: Duration,
}

impl ShardRouter {
    pub fn new(config: &RouterConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(anyhow!("router needs at least one node"));
        }
        let client = NodeClient::new(config.request_timeout)?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                nodes: config.nodes.clone(),
                client,
                leader: RwLock::new(None),
                cursor: AtomicUsize::new(0),
                discoveries: AtomicUsize::new(0),
                max_retries: config.max_retries,
                backoff_base: config.backoff_base,
            }),
        })
    }

    pub fn cached_leader(&self) -> Option<String> {
        self.inner
            .leader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overrides the leader guess.
    pub fn remember_leader(&self, addr: Option<String>) {
        *self.inner.leader.write().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    /// Number of discovery rounds run so far.
    pub fn discoveries(&self) -> usize {
        self.inner.discoveries.load(Ordering::Relaxed)
    }

    pub async fn put(&self, key: String, value: String) -> Result<NodeReply, ShardError> {
        self.write(Write::Put { key, value }).await
    }

    pub async fn delete(&self, key: String) -> Result<NodeReply, ShardError> {
        self.write(Write::Delete { key }).await
    }

    /// Queries every node's status concurrently and caches the leader with
    /// the highest term.
    pub async fn discover_leader(&self) -> Option<String> {
        self.inner.discoveries.fetch_add(1, Ordering::Relaxed);
        let client = &self.inner.client;
        let requests = self.inner.nodes.iter().map(|addr| async move {
            (addr, client.raft_status(addr).await)
        });
        let leader = join_all(requests)
            .await
            .into_iter()
            .filter_map(|(addr, status)| match status {
                Ok(status) if status.state == NodeRole::Leader => Some((status.term, addr.clone())),
                Ok(_) => None,
                Err(err) => {
                    debug!(%addr, error = %err, "status request failed");
                    None
                }
            })
            .max_by_key(|(term, _)| *term)
            .map(|(_, addr)| addr);

        match &leader {
            Some(addr) => info!(leader = %addr, "discovered leader"),
            None => warn!("no node reports itself as leader"),
        }
        self.remember_leader(leader.clone());
        leader
    }

    async fn write(&self, op: Write) -> Result<NodeReply, ShardError> {
        let mut target = self.cached_leader();
        for attempt in 0..=self.inner.max_retries {
            if target.is_none() {
                target = self.discover_leader().await;
            }
            let Some(addr) = target.take() else {
                if attempt < self.inner.max_retries {
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                continue;
            };

            let result = match &op {
                Write::Put { key, value } => self.inner.client.put(&addr, key, value).await,
                Write::Delete { key } => self.inner.client.delete(&addr, key).await,
            };
            match result {
                Ok(reply) if !reply.is_not_leader() => return Ok(reply),
                Ok(reply) => {
                    debug!(%addr, hint = ?reply.leader_hint(), "leader guess was wrong");
                    self.forget_leader(&addr);
                }
                Err(err) if err.is_retryable() => {
                    debug!(%addr, error = %err, "leader unreachable");
                    self.forget_leader(&addr);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ShardError::NoLeader {
            attempts: self.inner.max_retries + 1,
        })
    }

    /// Round-robin over nodes; a node that cannot serve the read is skipped.
    pub async fn get(&self, key: &str) -> Result<NodeReply, ShardError> {
        let nodes = &self.inner.nodes;
        let attempts = nodes.len().max(self.inner.max_retries + 1);
        let mut last_err = None;
        for _ in 0..attempts {
            let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
            let addr = &nodes[idx];
            match self.inner.client.get(addr, key, false).await {
                Ok(reply) if !reply.is_not_leader() => return Ok(reply),
                Ok(_) => {
                    debug!(%addr, "node has no leader to forward to");
                    last_err = Some(ShardError::NoLeader { attempts });
                }
                Err(err) if err.is_retryable() => {
                    debug!(%addr, error = %err, "read target unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(ShardError::NoLeader { attempts }))
    }

    pub async fn status(&self) -> RouterStatus {
        let client = &self.inner.client;
        let requests = self.inner.nodes.iter().map(|addr| async move {
            match client.raft_status(addr).await {
                Ok(status) => NodeHealth {
                    address: addr.clone(),
                    reachable: true,
                    state: Some(status.state),
                    term: Some(status.term),
                },
                Err(_) => NodeHealth {
                    address: addr.clone(),
                    reachable: false,
                    state: None,
                    term: None,
                },
            }
        });
        RouterStatus {
            node_count: self.inner.nodes.len(),
            leader: self.cached_leader(),
            nodes: join_all(requests).await,
        }
    }

    fn forget_leader(&self, addr: &str) {
        let mut leader = self.inner.leader.write().unwrap_or_else(PoisonError::into_inner);
        if leader.as_deref() == Some(addr) {
            *leader = None;
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let shift = (attempt as u32).min(MAX_BACKOFF_SHIFT);
        let base = self.inner.backoff_base * 2u32.pow(shift);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

pub fn app(router: ShardRouter) -> Router {
    Router::new()
        .route("/put", put(route_put).post(route_put))
        .route("/get", get(route_get))
        .route("/delete", delete(route_delete).post(route_delete))
        .route("/status", get(route_status))
        .layer(TraceLayer::new_for_http())
        .with_state(router)
}

/// Binds `config.listen` and serves until the server fails.
pub async fn serve(config: RouterConfig) -> Result<()> {
    let router = ShardRouter::new(&config)?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind router address {}", config.listen))?;
    info!(addr = %listener.local_addr()?, nodes = ?config.nodes, "router listening");
    if router.discover_leader().await.is_none() {
        warn!("starting without a known leader");
    }
    axum::serve(listener, app(router)).await?;
    Ok(())
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ShardError> {
    body.map(|Json(value)| value)
        .map_err(|_| ShardError::Validation("Invalid JSON format".into()))
}

async fn route_put(
    State(router): State<ShardRouter>,
    body: Result<Json<PutRequest>, JsonRejection>,
) -> Result<Response, ShardError> {
    let req = parse_body(body)?;
    if req.key.is_empty() || req.value.is_empty() {
        return Err(ShardError::Validation("Key and value are required in JSON body".into()));
    }
    Ok(router.put(req.key, req.value).await?.into_response())
}

async fn route_get(
    State(router): State<ShardRouter>,
    Query(query): Query<GetQuery>,
) -> Result<Response, ShardError> {
    let key = query
        .key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ShardError::Validation("Key parameter is required".into()))?;
    Ok(router.get(&key).await?.into_response())
}

async fn route_delete(
    State(router): State<ShardRouter>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Response, ShardError> {
    let req = parse_body(body)?;
    if req.key.is_empty() {
        return Err(ShardError::Validation("Key parameter is required in JSON body".into()));
    }
    Ok(router.delete(req.key).await?.into_response())
}

async fn route_status(State(router): State<ShardRouter>) -> Json<ApiResponse<RouterStatus>> {
    Json(ApiResponse::ok("Router status retrieved successfully", router.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(nodes: Vec<&str>) -> ShardRouter {
        let mut config = RouterConfig::new(nodes.into_iter().map(String::from).collect());
        config.max_retries = 2;
        config.backoff_base = Duration::from_millis(10);
        config.request_timeout = Duration::from_millis(200);
        ShardRouter::new(&config).unwrap()
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let r = router(vec!["127.0.0.1:1"]);
        for attempt in 0..4 {
            let base = Duration::from_millis(10 * (1 << attempt));
            let delay = r.backoff(attempt);
            assert!(delay >= base && delay <= base + base / 2, "attempt {attempt}: {delay:?}");
        }
        assert!(r.backoff(50) >= Duration::from_millis(640));
    }

    #[test]
    fn forgetting_only_clears_matching_guess() {
        let r = router(vec!["a:1", "b:2"]);
        r.remember_leader(Some("a:1".into()));
        r.forget_leader("b:2");
        assert_eq!(r.cached_leader().as_deref(), Some("a:1"));
        r.forget_leader("a:1");
        assert_eq!(r.cached_leader(), None);
    }

    #[tokio::test]
    async fn writes_give_up_without_a_leader() {
        let r = router(vec!["127.0.0.1:1"]);
        let err = r.put("k".into(), "v".into()).await.unwrap_err();
        assert_eq!(err, ShardError::NoLeader { attempts: 3 });
        assert_eq!(r.discoveries(), 3);
    }

    #[tokio::test]
    async fn last_failed_discovery_returns_without_sleeping() {
        let mut config = RouterConfig::new(vec!["127.0.0.1:1".into()]);
        config.max_retries = 0;
        config.backoff_base = Duration::from_secs(30);
        config.request_timeout = Duration::from_millis(200);
        let r = ShardRouter::new(&config).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), r.put("k".into(), "v".into()))
            .await
            .expect("no backoff after the final attempt")
            .unwrap_err();
        assert_eq!(err, ShardError::NoLeader { attempts: 1 });
        assert_eq!(r.discoveries(), 1);
    }

    #[test]
    fn empty_node_list_is_rejected() {
        assert!(ShardRouter::new(&RouterConfig::new(Vec::new())).is_err());
    }
}
