//! Realtime refresh fan-out.
//!
//! Business writes call [`RefreshBus::broadcast_refresh`]; every connected
//! sink (a websocket) receives a JSON envelope telling the browser which
//! topics to reload. With a [`PeerTransport`] wired in, the envelope is also
//! published to the other nodes, whose listeners deliver it to their own
//! sinks.

pub mod transport;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub use transport::{LocalPeerNetwork, PeerTransport, PgNotifyTransport};

use crate::automation::value::format_datetime;
use crate::clock::Clock;
use crate::error::RefreshError;

/// A connected client.
#[async_trait]
pub trait RefreshSink: Send + Sync {
    /// Complete the client handshake.
    async fn accept(&self) -> Result<(), RefreshError>;

    /// Deliver one serialized envelope.
    async fn send_json(&self, message: &str) -> Result<(), RefreshError>;
}

pub type SinkId = u64;

/// What to tell clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub reason: Option<String>,
    pub topics: Option<Vec<String>>,
    pub data: Option<serde_json::Value>,
}

impl RefreshRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request carrying a single topic.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::new().topics([topic.into()])
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Wire form sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Largest peer message; Postgres rejects `NOTIFY` payloads from 8000 bytes.
pub const PEER_MESSAGE_LIMIT: usize = 7900;

/// Envelope as relayed between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerEnvelope {
    source: String,
    payload: RefreshEnvelope,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Serialize for peers, dropping `data` when the message would not fit.
fn encode_peer(mut relay: PeerEnvelope) -> Result<String, serde_json::Error> {
    let message = serde_json::to_string(&relay)?;
    if message.len() <= PEER_MESSAGE_LIMIT || relay.payload.data.is_none() {
        return Ok(message);
    }
    tracing::warn!(
        bytes = message.len(),
        limit = PEER_MESSAGE_LIMIT,
        "Refresh data too large for peers, relaying topics only"
    );
    relay.payload.data = None;
    serde_json::to_string(&relay)
}

/// Lowercase and deduplicate, keeping first-seen order. Blank topics vanish.
pub fn normalize_topics(topics: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(topics.len());
    for topic in topics {
        let topic = topic.trim().to_lowercase();
        if !topic.is_empty() && !seen.contains(&topic) {
            seen.push(topic);
        }
    }
    seen
}

pub struct RefreshBus {
    sinks: RwLock<HashMap<SinkId, Arc<dyn RefreshSink>>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    node_id: String,
    peer: Option<Arc<dyn PeerTransport>>,
}

impl RefreshBus {
    pub fn new(clock: Arc<dyn Clock>, node_id: impl Into<String>) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock,
            node_id: node_id.into(),
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: Arc<dyn PeerTransport>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Accept and register a sink.
    pub async fn connect(&self, sink: Arc<dyn RefreshSink>) -> Result<SinkId, RefreshError> {
        sink.accept().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.write().await.insert(id, sink);
        tracing::debug!(sink_id = id, "Refresh sink connected");
        Ok(id)
    }

    pub async fn disconnect(&self, id: SinkId) -> bool {
        let removed = self.sinks.write().await.remove(&id).is_some();
        if removed {
            tracing::debug!(sink_id = id, "Refresh sink disconnected");
        }
        removed
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    fn envelope(&self, request: RefreshRequest) -> RefreshEnvelope {
        RefreshEnvelope {
            kind: "refresh".to_string(),
            timestamp: format_datetime(&self.clock.now()),
            reason: request.reason,
            topics: request
                .topics
                .map(|t| normalize_topics(&t))
                .filter(|t| !t.is_empty()),
            data: request.data,
        }
    }

    /// Fan a refresh out to local sinks and, when configured, to peers.
    pub async fn broadcast_refresh(&self, request: RefreshRequest) -> BroadcastStats {
        if self.peer.is_none() && self.sinks.read().await.is_empty() {
            return BroadcastStats::default();
        }

        let envelope = self.envelope(request);
        let stats = self.deliver_local(&envelope).await;

        if let Some(peer) = &self.peer {
            let relay = PeerEnvelope {
                source: self.node_id.clone(),
                payload: envelope,
            };
            match encode_peer(relay) {
                Ok(message) => {
                    if let Err(e) = peer.publish(message).await {
                        tracing::warn!(error = %e, "Failed to publish refresh to peers");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode peer refresh"),
            }
        }
        stats
    }

    /// Send to a snapshot of local sinks; failing sinks are removed.
    async fn deliver_local(&self, envelope: &RefreshEnvelope) -> BroadcastStats {
        let snapshot: Vec<(SinkId, Arc<dyn RefreshSink>)> = self
            .sinks
            .read()
            .await
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();
        if snapshot.is_empty() {
            return BroadcastStats::default();
        }

        let message = match serde_json::to_string(envelope) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode refresh envelope");
                return BroadcastStats {
                    attempted: snapshot.len(),
                    ..Default::default()
                };
            }
        };

        let results = futures::future::join_all(snapshot.iter().map(|(id, sink)| {
            let message = message.as_str();
            async move { (*id, sink.send_json(message).await) }
        }))
        .await;

        let failed: Vec<SinkId> = results
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::debug!(sink_id = id, error = %e, "Dropping refresh sink");
                    Some(id)
                }
            })
            .collect();

        if !failed.is_empty() {
            let mut sinks = self.sinks.write().await;
            for id in &failed {
                sinks.remove(id);
            }
        }

        BroadcastStats {
            attempted: snapshot.len(),
            delivered: snapshot.len() - failed.len(),
            dropped: failed.len(),
        }
    }

    /// Deliver a message received from the peer transport. Our own echoes and
    /// malformed messages are ignored.
    pub async fn apply_peer_message(&self, raw: &str) -> Option<BroadcastStats> {
        let relay: PeerEnvelope = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed peer refresh");
                return None;
            }
        };
        if relay.source == self.node_id {
            return None;
        }
        Some(self.deliver_local(&relay.payload).await)
    }

    /// Subscribe to the peer transport and apply messages until it closes.
    pub async fn spawn_listener(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>, RefreshError> {
        let Some(peer) = self.peer.clone() else {
            return Ok(None);
        };
        let mut messages = peer.subscribe().await?;
        let bus = Arc::clone(self);

        Ok(Some(tokio::spawn(async move {
            tracing::info!(node_id = %bus.node_id, "Refresh peer listener started");
            while let Some(message) = messages.next().await {
                bus.apply_peer_message(&message).await;
            }
            tracing::warn!("Refresh peer listener stopped");
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        accepted: Mutex<bool>,
        messages: Mutex<Vec<String>>,
        broken: bool,
    }

    impl RecordingSink {
        fn broken() -> Self {
            Self {
                broken: true,
                ..Default::default()
            }
        }

        fn messages(&self) -> Vec<serde_json::Value> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|m| serde_json::from_str(m).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl RefreshSink for RecordingSink {
        async fn accept(&self) -> Result<(), RefreshError> {
            *self.accepted.lock().unwrap() = true;
            Ok(())
        }

        async fn send_json(&self, message: &str) -> Result<(), RefreshError> {
            if self.broken {
                return Err(RefreshError::Sink("closed".into()));
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()))
    }

    #[test]
    fn test_topic_normalization() {
        let topics = vec![
            "Tickets".to_string(),
            "tickets".to_string(),
            " Assets ".to_string(),
            "".to_string(),
            "TICKETS".to_string(),
        ];
        assert_eq!(normalize_topics(&topics), vec!["tickets", "assets"]);
    }

    #[tokio::test]
    async fn test_no_sinks_no_peer_is_a_noop() {
        let bus = RefreshBus::new(clock(), "node-a");
        let stats = bus.broadcast_refresh(RefreshRequest::topic("tickets")).await;
        assert_eq!(stats, BroadcastStats::default());
    }

    #[tokio::test]
    async fn test_failed_sinks_are_dropped() {
        let bus = RefreshBus::new(clock(), "node-a");
        let good = Arc::new(RecordingSink::default());
        let bad = Arc::new(RecordingSink::broken());
        bus.connect(good.clone()).await.unwrap();
        bus.connect(bad).await.unwrap();
        assert!(*good.accepted.lock().unwrap());

        let stats = bus
            .broadcast_refresh(
                RefreshRequest::new()
                    .reason("ticket updated")
                    .topics(["Tickets", "tickets", "Dashboard"]),
            )
            .await;
        assert_eq!(
            stats,
            BroadcastStats {
                attempted: 2,
                delivered: 1,
                dropped: 1
            }
        );
        assert_eq!(bus.sink_count().await, 1);

        let messages = good.messages();
        assert_eq!(
            messages[0],
            serde_json::json!({
                "type": "refresh",
                "timestamp": "2025-01-01T12:00:00+00:00",
                "reason": "ticket updated",
                "topics": ["tickets", "dashboard"]
            })
        );
    }

    #[tokio::test]
    async fn test_peer_fanout_ignores_own_echo() {
        let network = LocalPeerNetwork::new();
        let a = Arc::new(RefreshBus::new(clock(), "node-a").with_peer(Arc::new(network.transport())));
        let b = Arc::new(RefreshBus::new(clock(), "node-b").with_peer(Arc::new(network.transport())));

        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        a.connect(sink_a.clone()).await.unwrap();
        b.connect(sink_b.clone()).await.unwrap();

        let _la = a.spawn_listener().await.unwrap();
        let _lb = b.spawn_listener().await.unwrap();

        a.broadcast_refresh(RefreshRequest::topic("assets")).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink_b.messages().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer delivery");
        // Give node-a's listener a chance to see its own echo.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink_a.messages().len(), 1);
        assert_eq!(sink_b.messages().len(), 1);
        assert_eq!(sink_b.messages()[0]["topics"], serde_json::json!(["assets"]));
    }

    #[derive(Default)]
    struct RecordingPeer {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingPeer {
        async fn publish(&self, message: String) -> Result<(), RefreshError> {
            self.published.lock().unwrap().push(message);
            Ok(())
        }

        async fn subscribe(
            &self,
        ) -> Result<futures::stream::BoxStream<'static, String>, RefreshError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn test_oversized_data_is_not_relayed_to_peers() {
        let peer = Arc::new(RecordingPeer::default());
        let bus = RefreshBus::new(clock(), "node-a").with_peer(peer.clone());
        let sink = Arc::new(RecordingSink::default());
        bus.connect(sink.clone()).await.unwrap();

        let big = serde_json::json!({"blob": "x".repeat(PEER_MESSAGE_LIMIT)});
        bus.broadcast_refresh(RefreshRequest::topic("assets").data(big.clone()))
            .await;
        bus.broadcast_refresh(RefreshRequest::topic("tickets").data(serde_json::json!({"id": 1})))
            .await;

        // Local sinks still get the full payload.
        assert_eq!(sink.messages()[0]["data"], big);

        let published = peer.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|m| m.len() <= PEER_MESSAGE_LIMIT));
        let first: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(first["payload"]["topics"], serde_json::json!(["assets"]));
        assert!(first["payload"].get("data").is_none());
        let second: serde_json::Value = serde_json::from_str(&published[1]).unwrap();
        assert_eq!(second["payload"]["data"], serde_json::json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_malformed_peer_message_is_ignored() {
        let bus = RefreshBus::new(clock(), "node-a");
        assert!(bus.apply_peer_message("not json").await.is_none());
        let own = r#"{"source":"node-a","payload":{"type":"refresh","timestamp":"x"}}"#;
        assert!(bus.apply_peer_message(own).await.is_none());
    }
}
