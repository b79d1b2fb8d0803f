//! Per-message-type handler registry.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use sentinel_types::{Message, MessageType};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Application callback for verified messages of one type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self)(message.clone()).await
    }
}

/// Registration handle returned by [`HandlerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Vec<(HandlerId, Arc<dyn MessageHandler>)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(message_type)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.handlers
            .read()
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Run every handler registered for the message's type. A handler that
    /// fails or panics is logged and does not affect the others.
    pub async fn dispatch(&self, message: &Message) -> usize {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .get(&message.message_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut succeeded = 0;
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(err)) => warn!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %err,
                    "message handler failed"
                ),
                Err(_) => error!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "message handler panicked"
                ),
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn message(message_type: MessageType) -> Message {
        Message::unsigned(message_type, "node-a", "node-b", json!({}))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        let counter = Arc::clone(counter);
        Arc::new(move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn dispatch_reaches_only_matching_type() {
        let registry = HandlerRegistry::new();
        let signals = Arc::new(AtomicUsize::new(0));
        let votes = Arc::new(AtomicUsize::new(0));
        registry.register(MessageType::ThreatSignal, counting(&signals));
        registry.register(MessageType::ConsensusVote, counting(&votes));

        assert_eq!(registry.dispatch(&message(MessageType::ThreatSignal)).await, 1);
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        assert_eq!(votes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register(
            MessageType::ThreatSignal,
            Arc::new(|_message: Message| async { Err::<(), _>(anyhow::anyhow!("boom")) }),
        );
        registry.register(
            MessageType::ThreatSignal,
            Arc::new(|message: Message| async move {
                if message.sender_id == "node-a" {
                    panic!("handler bug");
                }
                Ok::<(), anyhow::Error>(())
            }),
        );
        registry.register(MessageType::ThreatSignal, counting(&hits));

        assert_eq!(registry.dispatch(&message(MessageType::ThreatSignal)).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_handlers_stop_receiving() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = registry.register(MessageType::NodeUpdate, counting(&hits));

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.handler_count(MessageType::NodeUpdate), 0);
        assert_eq!(registry.dispatch(&message(MessageType::NodeUpdate)).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
