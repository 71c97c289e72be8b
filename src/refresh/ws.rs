//! Websocket clients as refresh sinks.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::{RefreshBus, RefreshSink};
use crate::error::RefreshError;

/// Messages buffered per client before it is treated as too slow.
const CLIENT_BUFFER: usize = 64;

/// Queues envelopes for a socket writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RefreshSink for ChannelSink {
    async fn accept(&self) -> Result<(), RefreshError> {
        if self.tx.is_closed() {
            return Err(RefreshError::Sink("client already gone".into()));
        }
        Ok(())
    }

    async fn send_json(&self, message: &str) -> Result<(), RefreshError> {
        self.tx
            .try_send(message.to_string())
            .map_err(|e| RefreshError::Sink(e.to_string()))
    }
}

/// Pump one upgraded socket until either side closes.
pub async fn serve_socket(socket: WebSocket, bus: Arc<RefreshBus>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

    let id = match bus.connect(Arc::new(ChannelSink::new(tx))).await {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(error = %e, "Refresh client rejected");
            return;
        }
    };

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; we only watch for close.
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    bus.disconnect(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_buffer_fails_the_sink() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        sink.accept().await.unwrap();
        sink.send_json("one").await.unwrap();
        assert!(sink.send_json("two").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_client_is_not_accepted() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(ChannelSink::new(tx).accept().await.is_err());
    }
}
