use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::backoff::Backoff;
use super::messages::{WsIncomingMessage, WsOutgoingMessage};
use super::subscription::{LinkError, LinkEvent, LinkState, Subscribers, Subscription};
use crate::config::TransportConfig;

const ABNORMAL_CLOSURE: u16 = 1006;
const NO_STATUS: u16 = 1005;
const NORMAL_CLOSURE: u16 = 1000;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct LinkShared {
    state: LinkState,
    outgoing: Option<mpsc::UnboundedSender<WsOutgoingMessage>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct LinkInner {
    config: TransportConfig,
    shared: Mutex<LinkShared>,
    subscribers: Subscribers,
}

enum SessionEnd {
    Shutdown,
    Closed { code: u16, reason: String },
}

#[derive(Clone)]
pub struct TransportLink {
    inner: Arc<LinkInner>,
}

impl TransportLink {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                shared: Mutex::new(LinkShared {
                    state: LinkState::Disconnected,
                    outgoing: None,
                    shutdown: None,
                }),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribers.subscribe()
    }

    pub fn connect(&self) {
        let shutdown_rx = {
            let mut shared = self.inner.lock();
            if matches!(shared.state, LinkState::Connected | LinkState::Connecting) {
                debug!(target: "Call/Link", "connect() ignored, link is {:?}", shared.state);
                return;
            }
            let (tx, rx) = oneshot::channel();
            shared.state = LinkState::Connecting;
            shared.shutdown = Some(tx);
            rx
        };

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(shutdown_rx).await });
    }

    /// Closes the connection and suppresses reconnection. Subscribers see a
    /// normal-closure `Disconnected` event unless the link was already down.
    pub fn disconnect(&self) {
        let previous = {
            let mut shared = self.inner.lock();
            if let Some(shutdown) = shared.shutdown.take() {
                let _ = shutdown.send(());
            }
            shared.outgoing = None;
            std::mem::replace(&mut shared.state, LinkState::Disconnected)
        };
        if previous == LinkState::Disconnected {
            return;
        }
        info!(target: "Call/Link", "Disconnected by request");
        self.inner.subscribers.emit(LinkEvent::Disconnected {
            code: NORMAL_CLOSURE,
            reason: "client disconnect".to_string(),
        });
    }

    /// Returns `false` when the message was dropped because the link is down.
    pub fn send(&self, message: WsOutgoingMessage) -> bool {
        let shared = self.inner.lock();
        match (&shared.state, &shared.outgoing) {
            (LinkState::Connected, Some(outgoing)) => outgoing.send(message).is_ok(),
            _ => {
                debug!(target: "Call/Link", "Dropping outgoing message while {:?}", shared.state);
                false
            }
        }
    }
}

impl LinkInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LinkState) {
        self.lock().state = state;
    }

    fn still_wanted(&self) -> bool {
        self.lock().shutdown.is_some()
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let url = format!("{}?token={}", self.config.url, self.config.auth_token);
        let mut backoff = Backoff::from_config(&self.config);
        let mut rng = StdRng::from_entropy();
        let mut reconnect = false;

        loop {
            let connected = tokio::select! {
                _ = &mut shutdown => return,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    backoff.reset();
                    match self.run_session(socket, reconnect, &mut shutdown).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Closed { code, reason } => {
                            self.subscribers.emit(LinkEvent::Disconnected {
                                code,
                                reason: reason.clone(),
                            });
                            if self.config.is_auth_rejection(code) {
                                error!(target: "Call/Link", "Authentication rejected (close {code}): {reason}");
                                self.fail(LinkError::AuthRejected { code });
                                return;
                            }
                            warn!(target: "Call/Link", "Connection closed ({code}): {reason}");
                        }
                    }
                    reconnect = true;
                }
                Err(tungstenite::Error::Http(response))
                    if self.config.is_auth_rejection(response.status().as_u16())
                        || matches!(response.status().as_u16(), 401 | 403) =>
                {
                    let code = response.status().as_u16();
                    error!(target: "Call/Link", "Handshake refused with HTTP {code}");
                    self.fail(LinkError::AuthRejected { code });
                    return;
                }
                Err(e) => {
                    warn!(target: "Call/Link", "Connect failed: {e}");
                    self.subscribers
                        .emit(LinkEvent::Error(LinkError::Socket(e.to_string())));
                }
            }

            let Some(delay) = backoff.next_delay(&mut rng) else {
                let attempts = backoff.attempts();
                error!(target: "Call/Link", "Giving up after {attempts} reconnect attempts");
                self.fail(LinkError::MaxReconnects { attempts });
                return;
            };

            if !self.still_wanted() {
                return;
            }
            self.set_state(LinkState::Connecting);
            info!(
                target: "Call/Link",
                "Reconnecting in {:?} (attempt {})",
                delay,
                backoff.attempts()
            );
            tokio::select! {
                _ = &mut shutdown => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        socket: Socket,
        reconnect: bool,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsOutgoingMessage>();

        {
            let mut shared = self.lock();
            shared.outgoing = Some(outgoing_tx);
            shared.state = LinkState::Connected;
        }
        info!(target: "Call/Link", "Connected (reconnect: {reconnect})");
        self.subscribers.emit(LinkEvent::Connected { reconnect });

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    let _ = write.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(message) = outgoing_rx.recv() => {
                    let Some(json) = encode(&message) else { continue };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                    }
                }
                _ = heartbeat.tick() => {
                    let Some(ping) = encode(&WsOutgoingMessage::Ping) else { continue };
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsIncomingMessage>(&text) {
                            Ok(WsIncomingMessage::Pong) => {}
                            Ok(incoming) => self.subscribers.emit(LinkEvent::Message(incoming)),
                            Err(e) => debug!(target: "Call/Link", "Ignoring unrecognised message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NO_STATUS, String::new()));
                        break SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                    }
                    None => {
                        break SessionEnd::Closed { code: ABNORMAL_CLOSURE, reason: "stream ended".to_string() };
                    }
                },
            }
        };

        let mut shared = self.lock();
        shared.outgoing = None;
        if shared.state == LinkState::Connected {
            shared.state = LinkState::Disconnected;
        }
        end
    }

    fn fail(&self, error: LinkError) {
        {
            let mut shared = self.lock();
            shared.state = LinkState::Failed;
            shared.outgoing = None;
            shared.shutdown = None;
        }
        self.subscribers.emit(LinkEvent::Error(error));
    }
}

fn encode(message: &WsOutgoingMessage) -> Option<String> {
    serde_json::to_string(message)
        .map_err(|e| warn!(target: "Call/Link", "Failed to encode outgoing message: {e}"))
        .ok()
}
