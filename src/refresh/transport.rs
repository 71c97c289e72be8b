//! Node-to-node relay for refresh envelopes.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::error::RefreshError;

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Publishes serialized peer envelopes and yields those from other nodes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn publish(&self, message: String) -> Result<(), RefreshError>;

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, RefreshError>;
}

/// In-process "network" shared by several buses.
#[derive(Clone)]
pub struct LocalPeerNetwork {
    tx: broadcast::Sender<String>,
}

impl LocalPeerNetwork {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            tx: self.tx.clone(),
        }
    }
}

impl Default for LocalPeerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalTransport {
    tx: broadcast::Sender<String>,
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn publish(&self, message: String) -> Result<(), RefreshError> {
        // No subscribers is not an error.
        let _ = self.tx.send(message);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, RefreshError> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|r| async move { r.ok() });
        Ok(stream.boxed())
    }
}

/// `LISTEN/NOTIFY` relay. Publishing goes through the pool; listening holds a
/// dedicated connection for as long as the returned stream lives.
pub struct PgNotifyTransport {
    pool: Pool,
    url: SecretString,
    channel: String,
}

impl PgNotifyTransport {
    pub fn new(pool: Pool, url: SecretString, channel: impl Into<String>) -> Result<Self, RefreshError> {
        let channel = channel.into();
        if channel.is_empty()
            || !channel
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(RefreshError::Transport(format!(
                "invalid notify channel name: {channel:?}"
            )));
        }
        Ok(Self { pool, url, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl PeerTransport for PgNotifyTransport {
    async fn publish(&self, message: String) -> Result<(), RefreshError> {
        if message.len() > MAX_NOTIFY_PAYLOAD {
            tracing::warn!(
                bytes = message.len(),
                "Refresh envelope too large for NOTIFY, not relayed"
            );
            return Ok(());
        }
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        conn.execute("SELECT pg_notify($1, $2)", &[&self.channel, &message])
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, RefreshError> {
        let (client, mut connection) = tokio_postgres::connect(self.url.expose_secret(), NoTls)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<String>(256);
        let channel = self.channel.clone();
        let forward = tx.clone();

        // Drive the connection; notifications arrive as async messages.
        tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) if n.channel() == channel => {
                        if forward.send(n.payload().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Refresh listener connection failed");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        tracing::info!(channel = %self.channel, "Listening for peer refreshes");

        // Keep the client alive until the subscriber goes away; dropping it
        // closes the connection and ends the driver above.
        tokio::spawn(async move {
            tx.closed().await;
            drop(client);
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_delivers_to_every_subscriber() {
        let network = LocalPeerNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut sub_a = a.subscribe().await.unwrap();
        let mut sub_b = b.subscribe().await.unwrap();

        a.publish("hello".into()).await.unwrap();
        assert_eq!(sub_a.next().await.as_deref(), Some("hello"));
        assert_eq!(sub_b.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let network = LocalPeerNetwork::new();
        assert!(network.transport().publish("x".into()).await.is_ok());
    }
}
