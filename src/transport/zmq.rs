// ZeroMQ SUB transport
//
// Connects a SUB socket to the publisher endpoint and subscribes to the feed
// topic. Publishers send either two frames [topic, json] or a single frame
// "topic json".

use async_trait::async_trait;
use bytes::Bytes;
use zeromq::{Socket, SocketRecv, SubSocket};

use super::{FeedMessage, FeedTransport, TransportError, TransportResult};

pub struct ZmqTransport {
    /// Publisher endpoint (e.g. "tcp://localhost:5556")
    endpoint: String,
    /// Subscription filter
    topic: String,
    socket: Option<SubSocket>,
}

impl ZmqTransport {
    pub fn new(endpoint: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            topic: topic.into(),
            socket: None,
        }
    }
}

#[async_trait]
impl FeedTransport for ZmqTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        self.disconnect().await;

        let mut socket = SubSocket::new();
        socket
            .connect(&self.endpoint)
            .await
            .map_err(|e| TransportError::Connect(format!("ZMQ SUB connect error: {}", e)))?;
        socket
            .subscribe(&self.topic)
            .await
            .map_err(|e| TransportError::Connect(format!("ZMQ subscribe error: {}", e)))?;

        tracing::debug!(endpoint = %self.endpoint, topic = %self.topic, "ZMQ SUB socket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Option<FeedMessage>> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        let message = socket
            .recv()
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        Ok(split_frames(message.into_vec()))
    }

    async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.unsubscribe(&self.topic).await {
                tracing::debug!(endpoint = %self.endpoint, "ZMQ unsubscribe failed: {}", e);
            }
            let errors = socket.close().await;
            if !errors.is_empty() {
                tracing::debug!(endpoint = %self.endpoint, "ZMQ socket closed with {} errors", errors.len());
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Split ZMQ frames into topic and payload
fn split_frames(mut frames: Vec<Bytes>) -> Option<FeedMessage> {
    match frames.len() {
        0 => None,
        1 => {
            let frame = frames.remove(0);
            if frame.first() == Some(&b'{') {
                return Some(FeedMessage {
                    topic: None,
                    payload: frame,
                });
            }
            match frame.iter().position(|b| *b == b' ') {
                Some(split) => Some(FeedMessage {
                    topic: Some(String::from_utf8_lossy(&frame[..split]).into_owned()),
                    payload: frame.slice(split + 1..),
                }),
                None => Some(FeedMessage {
                    topic: None,
                    payload: frame,
                }),
            }
        }
        _ => {
            let payload = frames.remove(1);
            let topic = String::from_utf8_lossy(&frames[0]).into_owned();
            Some(FeedMessage {
                topic: Some(topic),
                payload,
            })
        }
    }
}
