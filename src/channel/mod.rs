//! Chat Channel (§4.7).
//!
//! A bidirectional message adapter between the core and the assistant.
//! Messages are delivered in send-order; the only concrete adapter is an
//! in-process one backed by `tokio::sync::mpsc`, with an ordered history
//! buffer the controller and Context Manager can both read.

pub mod markers;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

pub use markers::ChannelSignal;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub from_assistant: bool,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("chat channel is disconnected")]
    Disconnected,
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), ChannelError>;
    async fn recv(&self) -> Option<ChannelMessage>;
    async fn history(&self) -> Vec<ChannelMessage>;
}

/// In-process adapter. `outbound` carries core -> assistant messages (which
/// are appended to history immediately), `inbound` carries assistant -> core
/// messages.
pub struct InProcessChannel {
    outbound_tx: mpsc::UnboundedSender<ChannelMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    inbound_tx: mpsc::UnboundedSender<ChannelMessage>,
    history: Mutex<Vec<ChannelMessage>>,
}

impl InProcessChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                inbound_tx,
                history: Mutex::new(Vec::new()),
            },
            outbound_rx,
        )
    }

    /// Feeds an assistant-authored message into the channel, as if it had
    /// arrived over the wire. Used by adapters and by tests.
    pub fn deliver_inbound(&self, text: impl Into<String>) {
        let message = ChannelMessage {
            from_assistant: true,
            text: text.into(),
        };
        let _ = self.inbound_tx.send(message);
    }
}

#[async_trait]
impl ChatChannel for InProcessChannel {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let message = ChannelMessage {
            from_assistant: false,
            text: text.to_string(),
        };
        self.history.lock().await.push(message.clone());
        self.outbound_tx.send(message).map_err(|_| ChannelError::Disconnected)
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let message = self.inbound_rx.lock().await.recv().await?;
        self.history.lock().await.push(message.clone());
        Some(message)
    }

    async fn history(&self) -> Vec<ChannelMessage> {
        self.history.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sent_messages_land_in_history_in_send_order() {
        let (channel, _outbound_rx) = InProcessChannel::new();
        channel.send("first").await.unwrap();
        channel.send("second").await.unwrap();

        let history = channel.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "first");
        assert_eq!(history[1].text, "second");
        assert!(!history[0].from_assistant);
    }

    #[tokio::test]
    async fn inbound_messages_are_received_and_recorded() {
        let (channel, _outbound_rx) = InProcessChannel::new();
        channel.deliver_inbound("@codor done");

        let received = channel.recv().await.unwrap();
        assert!(received.from_assistant);
        assert_eq!(received.text, "@codor done");
        assert_eq!(channel.history().await.len(), 1);
    }
}
