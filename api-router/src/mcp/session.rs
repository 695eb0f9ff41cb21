use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// Capacity of a session's outbound queue. Progress notifications beyond it
/// are dropped; responses always wait for room.
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

/// One server-push payload, delivered as an SSE `message` event.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub data: String,
}

/// Live SSE sessions by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, mpsc::Sender<OutboundMessage>>>>,
}

impl SessionRegistry {
    pub async fn register(&self, session_id: String) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        self.inner.write().await.insert(session_id, tx);
        rx
    }

    pub async fn remove(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }

    pub async fn sender(&self, session_id: &str) -> Option<mpsc::Sender<OutboundMessage>> {
        self.inner.read().await.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_lookup_remove() {
        let registry = SessionRegistry::default();
        let mut rx = registry.register("s1".into()).await;

        let sender = registry.sender("s1").await.expect("registered session");
        sender
            .send(OutboundMessage {
                data: "hello".into(),
            })
            .await
            .expect("send");
        assert_eq!(rx.recv().await.expect("receive").data, "hello");

        registry.remove("s1").await;
        assert!(registry.sender("s1").await.is_none());
    }
}
