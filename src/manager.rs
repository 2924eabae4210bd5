use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};

use crate::call::{AdmissionQueue, CallSession, EndReason};
use crate::client::messages::{GroupCallRingEvent, IncomingCallOffer, WsIncomingMessage, WsOutgoingMessage};
use crate::client::subscription::{LinkEvent, Subscription};
use crate::client::SignalingApi;
use crate::config::CallConfig;
use crate::engine::NativeCallEngine;
use crate::error::CallError;
use crate::group_call::GroupCallSession;
use crate::liveness::EnvironmentEvent;
use crate::timers::{TimerFired, TimerKind, TimerSet};

const NOTIFICATION_CAPACITY: usize = 256;

pub trait MessageSink: Send + Sync {
    fn send(&self, message: WsOutgoingMessage) -> bool;
}

#[cfg(feature = "client")]
impl MessageSink for crate::client::TransportLink {
    fn send(&self, message: WsOutgoingMessage) -> bool {
        crate::client::TransportLink::send(self, message)
    }
}

#[derive(Debug, Clone)]
pub enum CallNotification {
    IncomingCall(IncomingCallOffer),
    BringToForeground,
    CallUpdated(CallSession),
    CallEnded {
        call_id: String,
        reason: EndReason,
    },
    GroupCallRinging(GroupCallRingEvent),
    GroupCallUpdated(GroupCallSession),
    GroupCallEnded {
        call_id: String,
        reason: String,
    },
    Error {
        call_id: Option<String>,
        message: String,
        user_facing: bool,
    },
}

pub(crate) struct State {
    pub(crate) user_id: String,
    next_epoch: u64,
    pub(crate) direct: Option<CallSession>,
    pub(crate) admission: AdmissionQueue,
    pub(crate) group: Option<GroupCallSession>,
    pub(crate) direct_timers: TimerSet,
    pub(crate) admission_timers: TimerSet,
    pub(crate) group_timers: TimerSet,
}

impl State {
    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

type LoopChannels = (
    mpsc::UnboundedReceiver<TimerFired>,
    mpsc::UnboundedReceiver<EnvironmentEvent>,
);

pub(crate) struct Inner {
    pub(crate) config: CallConfig,
    pub(crate) engine: Arc<dyn NativeCallEngine>,
    pub(crate) api: Arc<dyn SignalingApi>,
    pub(crate) sink: Arc<dyn MessageSink>,
    state: Mutex<State>,
    notifications: broadcast::Sender<CallNotification>,
    environment: mpsc::UnboundedSender<EnvironmentEvent>,
    channels: Mutex<Option<LoopChannels>>,
}

#[derive(Clone)]
pub struct CallManager {
    pub(crate) inner: Arc<Inner>,
}

impl CallManager {
    pub fn new(
        user_id: impl Into<String>,
        config: CallConfig,
        engine: Arc<dyn NativeCallEngine>,
        api: Arc<dyn SignalingApi>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (env_tx, env_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let state = State {
            user_id: user_id.into(),
            next_epoch: 0,
            direct: None,
            admission: AdmissionQueue::new(config.incoming_queue_capacity),
            group: None,
            direct_timers: TimerSet::new(timer_tx.clone()),
            admission_timers: TimerSet::new(timer_tx.clone()),
            group_timers: TimerSet::new(timer_tx),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                api,
                sink,
                state: Mutex::new(state),
                notifications,
                environment: env_tx,
                channels: Mutex::new(Some((timer_rx, env_rx))),
            }),
        }
    }

    pub fn notifications(&self) -> broadcast::Receiver<CallNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn environment(&self, event: EnvironmentEvent) {
        if self.inner.environment.send(event).is_err() {
            debug!(target: "Call/Manager", "Environment event {event:?} dropped, loop is gone");
        }
    }

    pub async fn user_id(&self) -> String {
        self.lock().await.user_id.clone()
    }

    pub async fn run(&self, mut link: Subscription) {
        let Some((mut timers, mut environment)) = self.inner.channels.lock().await.take() else {
            warn!(target: "Call/Manager", "run() called twice, ignoring");
            return;
        };
        info!(target: "Call/Manager", "Call event loop started");

        loop {
            tokio::select! {
                Some(fired) = timers.recv() => self.on_timer(fired).await,
                Some(event) = environment.recv() => self.on_environment(event).await,
                event = link.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => break,
                },
            }
        }

        info!(target: "Call/Manager", "Call event loop stopped");
        *self.inner.channels.lock().await = Some((timers, environment));
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().await
    }

    pub(crate) fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub(crate) fn notify(&self, notification: CallNotification) {
        // No receivers is fine; the UI may not be listening yet.
        let _ = self.inner.notifications.send(notification);
    }

    pub(crate) fn notify_error(&self, call_id: Option<&str>, error: &CallError) {
        self.notify(CallNotification::Error {
            call_id: call_id.map(str::to_string),
            message: error.to_string(),
            user_facing: error.is_user_facing(),
        });
    }

    pub(crate) async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Message(message) => self.on_message(message).await,
            LinkEvent::Connected { reconnect } => {
                info!(target: "Call/Manager", "Transport connected (reconnect: {reconnect})");
                if reconnect {
                    self.recover().await;
                }
            }
            LinkEvent::Disconnected { code, reason } => {
                debug!(target: "Call/Manager", "Transport closed ({code}): {reason}");
            }
            LinkEvent::Error(error) => {
                let error = match error {
                    crate::client::LinkError::MaxReconnects { attempts } => {
                        CallError::MaxReconnects { attempts }
                    }
                    crate::client::LinkError::AuthRejected { code } => {
                        CallError::AuthRejected { code }
                    }
                    crate::client::LinkError::Socket(message) => CallError::Transport(message),
                };
                warn!(target: "Call/Manager", "Transport error: {error}");
                self.notify_error(None, &error);
            }
        }
    }

    pub(crate) async fn on_message(&self, message: WsIncomingMessage) {
        let user_id = self.user_id().await;
        if message.is_echo_of(&user_id) {
            debug!(target: "Call/Manager", "Ignoring echo of our own event");
            return;
        }

        match message {
            WsIncomingMessage::CallOffer(offer) => self.on_call_offer(offer).await,
            WsIncomingMessage::CallAnswer(answer) => self.on_call_answer(answer).await,
            WsIncomingMessage::CallKeyComplete(event) => self.on_key_complete(event).await,
            WsIncomingMessage::CallReject(signal) => {
                self.on_remote_end(&signal.call_id, EndReason::RemoteRejected)
                    .await
            }
            WsIncomingMessage::CallCancel(signal) => {
                self.on_remote_withdraw(&signal.call_id, EndReason::RemoteCancelled)
                    .await
            }
            WsIncomingMessage::CallMissed(signal) => {
                self.on_remote_withdraw(&signal.call_id, EndReason::Missed)
                    .await
            }
            WsIncomingMessage::CallEnd(signal) => {
                self.on_remote_end(&signal.call_id, EndReason::RemoteEnded)
                    .await
            }
            WsIncomingMessage::CallMediaReady(event) => self.on_media_ready(event).await,
            WsIncomingMessage::CallLeave(signal) => self.on_peer_left(&signal.call_id).await,
            WsIncomingMessage::CallRejoin(signal) => self.on_peer_rejoined(&signal.call_id).await,
            WsIncomingMessage::ScreenShareStart(event) => self.on_screen_share(event, true).await,
            WsIncomingMessage::ScreenShareStop(event) => self.on_screen_share(event, false).await,
            WsIncomingMessage::CallMuteUpdate(event) => self.on_peer_mute(event).await,
            WsIncomingMessage::GroupCallRing(event) | WsIncomingMessage::GroupCallStarted(event) => {
                self.on_group_ring(event).await
            }
            WsIncomingMessage::GroupCallParticipantJoined(event) => {
                self.on_participant_joined(event).await
            }
            WsIncomingMessage::GroupCallParticipantLeft(event) => {
                self.on_participant_left(event).await
            }
            WsIncomingMessage::GroupCallEnded(event) => {
                let reason = event.reason.unwrap_or_else(|| "ended".to_string());
                self.teardown_group(&event.call_id, &reason).await;
            }
            WsIncomingMessage::GroupCallMuteUpdate(event) => self.on_group_mute(event).await,
            WsIncomingMessage::GroupCallSpeakingUpdate(event) => {
                self.on_group_speaking(event).await
            }
            WsIncomingMessage::GroupCallSenderKey(event) => self.on_sender_key(event).await,
            WsIncomingMessage::Pong => {}
        }
    }

    pub(crate) async fn on_timer(&self, fired: TimerFired) {
        let current = {
            let mut state = self.lock().await;
            let timers = match fired.kind {
                TimerKind::IncomingRing => &mut state.admission_timers,
                TimerKind::GroupTokenRefresh | TimerKind::GroupSpeakingPoll => {
                    &mut state.group_timers
                }
                TimerKind::Ring
                | TimerKind::KeyExchange
                | TimerKind::PeerLeftGrace
                | TimerKind::RejoinWindow
                | TimerKind::HealthCheck => &mut state.direct_timers,
            };
            let current = timers.accepts(&fired);
            if current && !is_periodic(fired.kind) {
                timers.consume(fired.kind);
            }
            current
        };
        if !current {
            debug!(target: "Call/Timers", "Dropping stale {:?} (epoch {})", fired.kind, fired.epoch);
            return;
        }

        match fired.kind {
            TimerKind::Ring => {
                self.on_direct_timeout(fired.epoch, EndReason::NoAnswer).await
            }
            TimerKind::KeyExchange => {
                self.on_direct_timeout(fired.epoch, EndReason::KeyExchangeTimeout)
                    .await
            }
            TimerKind::PeerLeftGrace => {
                self.on_direct_timeout(fired.epoch, EndReason::PeerLeftTimeout)
                    .await
            }
            TimerKind::RejoinWindow => {
                self.on_direct_timeout(fired.epoch, EndReason::RejoinExpired)
                    .await
            }
            TimerKind::IncomingRing => self.on_incoming_ring_timeout(fired.epoch).await,
            TimerKind::HealthCheck => self.check_direct_health().await,
            TimerKind::GroupTokenRefresh => self.refresh_group_token().await,
            TimerKind::GroupSpeakingPoll => self.poll_speaking().await,
        }
    }
}

fn is_periodic(kind: TimerKind) -> bool {
    matches!(
        kind,
        TimerKind::HealthCheck | TimerKind::GroupTokenRefresh | TimerKind::GroupSpeakingPoll
    )
}
