//! Leader-change announcements between nodes.
//!
//! When a node becomes leader it tells every known peer `{shardID, address,
//! term}` via `/newleader`. Receivers merge the announcement into their
//! [`KnownPeers`] and pass it on only when it changed something, so a flood
//! dies out after one hop per peer. Delivery is fire-and-forget.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::NodeClient;
use crate::peers::{KnownPeers, MergeOutcome};
use crate::protocol::ShardAnnouncement;
use crate::runtime::{ConsensusHandle, NodeRole};

#[derive(Clone)]
pub struct Broadcaster {
    client: NodeClient,
    peers: Arc<KnownPeers>,
}

impl Broadcaster {
    pub fn new(client: NodeClient, peers: Arc<KnownPeers>) -> Self {
        Self { client, peers }
    }

    pub fn peers(&self) -> &Arc<KnownPeers> {
        &self.peers
    }

    /// Merges an incoming announcement and relays it when it was news.
    pub fn accept(&self, announcement: ShardAnnouncement) -> MergeOutcome {
        let outcome = self.peers.merge(
            announcement.shard_id,
            announcement.address.clone(),
            announcement.term,
        );
        debug!(shard = announcement.shard_id, address = %announcement.address, ?outcome, "merged shard announcement");
        if outcome.changed() {
            let term = self
                .peers
                .get(announcement.shard_id)
                .map(|entry| entry.term)
                .unwrap_or_default();
            self.announce(ShardAnnouncement {
                term: Some(term),
                ..announcement
            });
        }
        outcome
    }

    /// Sends `announcement` to every known peer except this node and the
    /// announced shard. Returns the spawned deliveries.
    pub fn announce(&self, announcement: ShardAnnouncement) -> Vec<JoinHandle<()>> {
        let targets = self.peers.broadcast_targets(announcement.shard_id);
        let announcement = Arc::new(announcement);
        targets
            .into_iter()
            .map(|(shard, addr)| {
                let client = self.client.clone();
                let announcement = announcement.clone();
                tokio::spawn(async move {
                    match client.announce_leader(&addr, &announcement).await {
                        Ok(()) => debug!(peer_shard = shard, %addr, "announcement delivered"),
                        Err(err) => warn!(peer_shard = shard, %addr, error = %err, "announcement failed"),
                    }
                })
            })
            .collect()
    }
}

/// Watches leadership changes and announces this node whenever it becomes
/// leader.
pub fn spawn_leader_observer(
    consensus: ConsensusHandle,
    broadcaster: Broadcaster,
    http_addr: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shard_id = consensus.shard_id();
        let mut leadership = consensus.subscribe();
        let mut was_leader = false;
        loop {
            let view = leadership.borrow_and_update().clone();
            let is_leader = view.role == NodeRole::Leader;
            if is_leader && !was_leader {
                info!(shard = shard_id, term = view.term, "became leader, announcing to peers");
                broadcaster
                    .peers()
                    .merge(shard_id, http_addr.clone(), Some(view.term));
                broadcaster.announce(ShardAnnouncement {
                    shard_id,
                    address: http_addr.clone(),
                    term: Some(view.term),
                });
            }
            was_leader = is_leader;

            if leadership.changed().await.is_err() {
                debug!(shard = shard_id, "consensus worker gone, leader observer exiting");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn recording_peer() -> (String, mpsc::UnboundedReceiver<ShardAnnouncement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/newleader",
                post(
                    |State(tx): State<mpsc::UnboundedSender<ShardAnnouncement>>,
                     Json(ann): Json<ShardAnnouncement>| async move {
                        let _ = tx.send(ann);
                        Json(serde_json::json!({"success": true}))
                    },
                ),
            )
            .with_state(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, rx)
    }

    fn broadcaster(self_shard: u64, seeds: Vec<(u64, String)>) -> Broadcaster {
        let client = NodeClient::new(Duration::from_secs(1)).unwrap();
        Broadcaster::new(client, Arc::new(KnownPeers::with_seeds(self_shard, seeds)))
    }

    #[tokio::test]
    async fn new_information_is_relayed_once() {
        let (peer_addr, mut rx) = recording_peer().await;
        let b = broadcaster(1, vec![(2, peer_addr)]);

        let ann = ShardAnnouncement {
            shard_id: 3,
            address: "127.0.0.1:8031".into(),
            term: Some(4),
        };
        assert_eq!(b.accept(ann.clone()), MergeOutcome::Inserted);
        let relayed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed, ann);

        assert_eq!(b.accept(ann), MergeOutcome::Unchanged);
        let quiet = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(quiet.is_err(), "duplicate announcement must not be relayed");
    }

    #[tokio::test]
    async fn unreachable_peer_is_tolerated() {
        let (peer_addr, mut rx) = recording_peer().await;
        let b = broadcaster(1, vec![(2, "127.0.0.1:1".into()), (3, peer_addr)]);

        let handles = b.announce(ShardAnnouncement {
            shard_id: 1,
            address: "127.0.0.1:8011".into(),
            term: Some(2),
        });
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().shard_id, 1);
    }
}
