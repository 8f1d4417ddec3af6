use super::{ReceiveHandler, SignalMessage, SignalingTransport};
use crate::utils::lock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Relay внутри процесса. Маршрутизирует так же, как сервер:
/// исходящий `peer_id` - адресат, доставленный - отправитель.
#[derive(Default)]
pub struct MemoryRelay {
    endpoints: Mutex<HashMap<String, Weak<MemoryTransport>>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, id: impl Into<String>) -> Arc<MemoryTransport> {
        let id = id.into();
        let transport = Arc::new(MemoryTransport {
            id: id.clone(),
            relay: self.clone(),
            connected: AtomicBool::new(true),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        });
        lock(&self.endpoints).insert(id, Arc::downgrade(&transport));
        transport
    }

    fn route(&self, from: &str, message: SignalMessage) {
        let target = lock(&self.endpoints)
            .get(message.peer_id())
            .and_then(Weak::upgrade);
        match target {
            Some(target) => target.deliver(message.with_peer_id(from)),
            None => debug!(from, to = message.peer_id(), kind = %message.kind(), "relay: no such endpoint, message dropped"),
        }
    }
}

pub struct MemoryTransport {
    id: String,
    relay: Arc<MemoryRelay>,
    connected: AtomicBool,
    handler: Mutex<Option<Arc<ReceiveHandler>>>,
    sent: Mutex<Vec<SignalMessage>>,
}

impl MemoryTransport {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Всё, что этот endpoint отправил, в порядке отправки
    pub fn sent(&self) -> Vec<SignalMessage> {
        lock(&self.sent).clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    /// Имитация обрыва: пока false, сообщения в обе стороны теряются
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Входящее сообщение так, будто его доставил relay
    pub fn deliver(&self, message: SignalMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            debug!(endpoint = %self.id, "disconnected, inbound message dropped");
            return;
        }
        if let Err(e) = message.validate() {
            debug!(endpoint = %self.id, error = %e, "invalid inbound message dropped");
            return;
        }
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(endpoint = %self.id, "no receive handler, message dropped"),
        }
    }
}

impl SignalingTransport for MemoryTransport {
    fn send(&self, message: SignalMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            debug!(endpoint = %self.id, kind = %message.kind(), "disconnected, outbound message dropped");
            return;
        }
        lock(&self.sent).push(message.clone());
        self.relay.route(&self.id, message);
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *lock(&self.handler) = Some(Arc::new(handler));
    }
}
