use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;

use super::messages::WsIncomingMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    MaxReconnects { attempts: u32 },
    AuthRejected { code: u16 },
    Socket(String),
}

impl LinkError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::Socket(_))
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected { reconnect: bool },
    Disconnected { code: u16, reason: String },
    Message(WsIncomingMessage),
    Error(LinkError),
}

type Registry = Mutex<HashMap<u64, mpsc::UnboundedSender<LinkEvent>>>;

#[derive(Clone, Default)]
pub struct Subscribers {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn emit(&self, event: LinkEvent) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<LinkEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_subscriber_gets_every_event() {
        let subscribers = Subscribers::new();
        let mut a = subscribers.subscribe();
        let mut b = subscribers.subscribe();

        subscribers.emit(LinkEvent::Connected { reconnect: false });

        assert!(matches!(a.try_recv(), Some(LinkEvent::Connected { .. })));
        assert!(matches!(b.try_recv(), Some(LinkEvent::Connected { .. })));
    }

    #[test]
    fn test_unsubscribe_is_individual() {
        let subscribers = Subscribers::new();
        let a = subscribers.subscribe();
        let mut b = subscribers.subscribe();
        assert_eq!(subscribers.len(), 2);

        a.unsubscribe();
        assert_eq!(subscribers.len(), 1);

        subscribers.emit(LinkEvent::Error(LinkError::Socket("reset".to_string())));
        assert!(matches!(b.try_recv(), Some(LinkEvent::Error(_))));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(LinkError::MaxReconnects { attempts: 10 }.is_fatal());
        assert!(LinkError::AuthRejected { code: 4001 }.is_fatal());
        assert!(!LinkError::Socket("eof".to_string()).is_fatal());
    }
}
