use super::{ReceiveHandler, SignalMessage, SignalingTransport};
use crate::error::{Error, Result};
use crate::utils::lock;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type SharedHandler = Arc<Mutex<Option<Arc<ReceiveHandler>>>>;

/// Клиент relay-сервера поверх WebSocket.
/// Обрыв не переподключается: сообщения просто перестают ходить.
pub struct WsTransport {
    local_id: String,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    handler: SharedHandler,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub async fn connect(relay_url: &str, local_id: &str) -> Result<Arc<Self>> {
        let url = endpoint_url(relay_url, local_id);
        info!(url = %url, "connecting to signaling relay");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(Error::transport)?;
        let (mut sink, mut stream) = ws.split();

        let connected = Arc::new(AtomicBool::new(true));
        let handler: SharedHandler = Arc::new(Mutex::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn({
            let connected = connected.clone();
            async move {
                while let Some(msg) = rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode signaling message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "relay write failed");
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                let _ = sink.close().await;
            }
        });

        let reader = tokio::spawn({
            let connected = connected.clone();
            let handler = handler.clone();
            async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                            Ok(msg) => {
                                debug!(kind = %msg.kind(), peer_id = msg.peer_id(), "signaling message received");
                                let current = lock(&handler).clone();
                                match current {
                                    Some(h) => h(msg),
                                    None => debug!("no receive handler, message dropped"),
                                }
                            }
                            Err(e) => warn!(error = %e, "invalid signaling frame dropped"),
                        },
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "relay closed the connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "relay read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                warn!("signaling relay connection lost");
            }
        });

        Ok(Arc::new(Self {
            local_id: local_id.to_string(),
            outbound: tx,
            handler,
            connected,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl SignalingTransport for WsTransport {
    fn send(&self, message: SignalMessage) {
        if !self.is_connected() {
            warn!(kind = %message.kind(), peer_id = message.peer_id(), "relay disconnected, message dropped");
            return;
        }
        if self.outbound.send(message).is_err() {
            warn!("relay writer gone, message dropped");
        }
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *lock(&self.handler) = Some(Arc::new(handler));
    }
}

/// relay узнаёт endpoint по параметру `id`
fn endpoint_url(relay_url: &str, local_id: &str) -> String {
    let sep = if relay_url.contains('?') { '&' } else { '?' };
    format!("{relay_url}{sep}id={local_id}")
}
