use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::client::api::{
    CallStatusResponse, CreateGroupCallRequest, GroupCallCreated, GroupCallInfo, GroupCallJoined,
    InitiateCallRequest, InitiateCallResponse, JoinGroupCallRequest, KeyCompleteRequest,
    KeyExchangeResponse, ParticipantInfo, ParticipantStatus, RejoinableCall, RelayCredentials,
    SendSenderKeyRequest, ServerCallStatus, AnswerCallRequest,
};
use crate::client::messages::{
    CallAnswerEvent, CallSignal, IncomingCallOffer, KeyCompleteEvent, MediaReadyEvent,
    WsIncomingMessage, WsOutgoingMessage,
};
use crate::client::subscription::{LinkEvent, Subscribers};
use crate::client::SignalingApi;
use crate::config::CallConfig;
use crate::engine::{
    AnswerMaterial, CallStats, EngineCallState, GroupAnnouncement, JoinMaterial,
    KeyCompleteMaterial, NativeCallEngine, OfferMaterial, SenderKeyBundle, SenderKeySeed,
    SpeakingLevel,
};
use crate::error::{CallError, Result};
use crate::manager::{CallManager, CallNotification, MessageSink};

pub fn relay_expiring_in(expires_in: chrono::Duration) -> RelayCredentials {
    RelayCredentials {
        relay_endpoint: "relay.test:443".to_string(),
        relay_token: "token".to_string(),
        expires_at: Utc::now() + expires_in,
    }
}

pub fn relay() -> RelayCredentials {
    relay_expiring_in(chrono::Duration::hours(1))
}

pub fn offer(call_id: &str, caller_id: &str, callee_id: &str) -> IncomingCallOffer {
    IncomingCallOffer {
        call_id: call_id.to_string(),
        caller_id: caller_id.to_string(),
        caller_username: Some(caller_id.to_string()),
        callee_id: callee_id.to_string(),
        caller_identity_key: vec![1, 1],
        ephemeral_kem_public: vec![2, 2],
        signature: vec![3, 3],
        created_at: Utc::now(),
    }
}

pub fn answer(call_id: &str, callee_id: &str) -> WsIncomingMessage {
    WsIncomingMessage::CallAnswer(CallAnswerEvent {
        call_id: call_id.to_string(),
        callee_id: callee_id.to_string(),
        ephemeral_kem_public: vec![4],
        kem_ciphertext: vec![5],
        signature: vec![6],
    })
}

pub fn key_complete(call_id: &str) -> WsIncomingMessage {
    WsIncomingMessage::CallKeyComplete(KeyCompleteEvent {
        call_id: call_id.to_string(),
        kem_ciphertext: vec![7],
    })
}

pub fn media_ready(call_id: &str, relay: RelayCredentials) -> WsIncomingMessage {
    WsIncomingMessage::CallMediaReady(MediaReadyEvent {
        call_id: call_id.to_string(),
        relay,
    })
}

pub fn signal(call_id: &str, user_id: &str) -> CallSignal {
    CallSignal {
        call_id: call_id.to_string(),
        user_id: Some(user_id.to_string()),
        reason: None,
    }
}

pub fn participant(user_id: &str, status: ParticipantStatus) -> ParticipantInfo {
    ParticipantInfo {
        user_id: user_id.to_string(),
        status,
        identity_public: format!("{user_id}-identity").into_bytes(),
        ephemeral_public: format!("{user_id}-ephemeral").into_bytes(),
        is_muted: false,
        joined_at: Utc::now(),
    }
}

pub fn bundle_for(to_user_id: &str, from: &str) -> SenderKeyBundle {
    SenderKeyBundle {
        to_user_id: to_user_id.to_string(),
        kem_ciphertext: vec![8],
        encrypted_sender_key: from.as_bytes().to_vec(),
        key_id: 1,
        signature: vec![9],
        sender_identity_public: vec![10],
        sender_ephemeral_public: vec![11],
    }
}

fn injected(method: &str) -> CallError {
    CallError::Api {
        status: 500,
        message: format!("injected failure in {method}"),
    }
}

#[derive(Default)]
struct Failures(Mutex<HashMap<&'static str, u32>>);

impl Failures {
    fn set(&self, method: &'static str, times: u32) {
        self.0.lock().unwrap().insert(method, times);
    }

    fn check(&self, method: &'static str) -> Result<()> {
        let mut failures = self.0.lock().unwrap();
        match failures.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(injected(method))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct Calls(Mutex<Vec<(&'static str, String)>>);

impl Calls {
    fn record(&self, method: &'static str, detail: impl Into<String>) {
        self.0.lock().unwrap().push((method, detail.into()));
    }

    fn named(&self, method: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == method)
            .map(|(_, detail)| detail.clone())
            .collect()
    }
}

#[derive(Default)]
pub struct MockApi {
    calls: Calls,
    failures: Failures,
    pub key_exchange_relay: Mutex<Option<RelayCredentials>>,
    pub rejoinable: Mutex<Option<RejoinableCall>>,
    pub call_status: Mutex<Option<CallStatusResponse>>,
    pub group_info: Mutex<Option<GroupCallInfo>>,
    pub join_participants: Mutex<Vec<ParticipantInfo>>,
    pub group_relay_expires_in: Mutex<Option<chrono::Duration>>,
    pub assigned_call_id: Mutex<Option<String>>,
}

impl MockApi {
    pub fn fail(&self, method: &'static str, times: u32) {
        self.failures.set(method, times);
    }

    pub fn calls(&self, method: &str) -> Vec<String> {
        self.calls.named(method)
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.named(method).len()
    }

    pub fn set_group_info(&self, info: GroupCallInfo) {
        *self.group_info.lock().unwrap() = Some(info);
    }

    fn group_relay(&self) -> RelayCredentials {
        match *self.group_relay_expires_in.lock().unwrap() {
            Some(expires_in) => relay_expiring_in(expires_in),
            None => relay(),
        }
    }
}

#[async_trait]
impl SignalingApi for MockApi {
    async fn initiate_call(&self, request: &InitiateCallRequest) -> Result<InitiateCallResponse> {
        self.calls.record("initiate_call", request.callee_id.clone());
        self.failures.check("initiate_call")?;
        let assigned = self.assigned_call_id.lock().unwrap().clone();
        Ok(InitiateCallResponse {
            call_id: assigned.unwrap_or_else(|| request.call_id.clone()),
            status: ServerCallStatus::Ringing,
        })
    }

    async fn answer_call(&self, call_id: &str, _request: &AnswerCallRequest) -> Result<()> {
        self.calls.record("answer_call", call_id);
        self.failures.check("answer_call")
    }

    async fn reject_call(&self, call_id: &str, reason: &str) -> Result<()> {
        self.calls.record("reject_call", format!("{call_id}:{reason}"));
        self.failures.check("reject_call")
    }

    async fn cancel_call(&self, call_id: &str) -> Result<()> {
        self.calls.record("cancel_call", call_id);
        self.failures.check("cancel_call")
    }

    async fn end_call(&self, call_id: &str, reason: &str) -> Result<()> {
        self.calls.record("end_call", format!("{call_id}:{reason}"));
        self.failures.check("end_call")
    }

    async fn leave_call(&self, call_id: &str) -> Result<()> {
        self.calls.record("leave_call", call_id);
        self.failures.check("leave_call")
    }

    async fn rejoin_call(&self, call_id: &str) -> Result<RelayCredentials> {
        self.calls.record("rejoin_call", call_id);
        self.failures.check("rejoin_call")?;
        Ok(relay())
    }

    async fn complete_key_exchange(
        &self,
        call_id: &str,
        _request: &KeyCompleteRequest,
    ) -> Result<KeyExchangeResponse> {
        self.calls.record("complete_key_exchange", call_id);
        self.failures.check("complete_key_exchange")?;
        Ok(KeyExchangeResponse {
            relay: self.key_exchange_relay.lock().unwrap().clone(),
        })
    }

    async fn get_call(&self, call_id: &str) -> Result<CallStatusResponse> {
        self.calls.record("get_call", call_id);
        self.failures.check("get_call")?;
        Ok(self
            .call_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(CallStatusResponse {
                call_id: call_id.to_string(),
                status: ServerCallStatus::Active,
                can_rejoin: true,
                rejoin_remaining_secs: None,
                relay_expires_at: None,
            }))
    }

    async fn get_rejoinable_call(&self) -> Result<Option<RejoinableCall>> {
        self.calls.record("get_rejoinable_call", "");
        self.failures.check("get_rejoinable_call")?;
        Ok(self.rejoinable.lock().unwrap().clone())
    }

    async fn create_group_call(
        &self,
        request: &CreateGroupCallRequest<'_>,
    ) -> Result<GroupCallCreated> {
        self.calls
            .record("create_group_call", request.conversation_id.to_string());
        self.failures.check("create_group_call")?;
        Ok(GroupCallCreated {
            call_id: "group-1".to_string(),
            relay: self.group_relay(),
        })
    }

    async fn get_group_call(&self, call_id: &str) -> Result<GroupCallInfo> {
        self.calls.record("get_group_call", call_id);
        self.failures.check("get_group_call")?;
        self.group_info
            .lock()
            .unwrap()
            .clone()
            .ok_or(CallError::Api {
                status: 404,
                message: "no such group call".to_string(),
            })
    }

    async fn join_group_call(
        &self,
        call_id: &str,
        request: &JoinGroupCallRequest<'_>,
    ) -> Result<GroupCallJoined> {
        let recipients: Vec<_> = request
            .sender_keys
            .iter()
            .map(|b| b.to_user_id.as_str())
            .collect();
        self.calls
            .record("join_group_call", format!("{call_id}:{}", recipients.join(",")));
        self.failures.check("join_group_call")?;
        Ok(GroupCallJoined {
            relay: self.group_relay(),
            participants: self.join_participants.lock().unwrap().clone(),
        })
    }

    async fn leave_group_call(&self, call_id: &str) -> Result<()> {
        self.calls.record("leave_group_call", call_id);
        self.failures.check("leave_group_call")
    }

    async fn decline_group_call(&self, call_id: &str) -> Result<()> {
        self.calls.record("decline_group_call", call_id);
        self.failures.check("decline_group_call")
    }

    async fn rejoin_group_call(&self, call_id: &str) -> Result<GroupCallJoined> {
        self.calls.record("rejoin_group_call", call_id);
        self.failures.check("rejoin_group_call")?;
        Ok(GroupCallJoined {
            relay: self.group_relay(),
            participants: self.join_participants.lock().unwrap().clone(),
        })
    }

    async fn refresh_group_token(&self, call_id: &str) -> Result<RelayCredentials> {
        self.calls.record("refresh_group_token", call_id);
        self.failures.check("refresh_group_token")?;
        Ok(relay())
    }

    async fn end_group_call(&self, call_id: &str) -> Result<()> {
        self.calls.record("end_group_call", call_id);
        self.failures.check("end_group_call")
    }

    async fn update_group_mute(&self, call_id: &str, muted: bool) -> Result<()> {
        self.calls
            .record("update_group_mute", format!("{call_id}:{muted}"));
        self.failures.check("update_group_mute")
    }

    async fn send_sender_key(
        &self,
        call_id: &str,
        request: &SendSenderKeyRequest<'_>,
    ) -> Result<()> {
        self.calls
            .record("send_sender_key", format!("{call_id}:{}", request.to_user_id));
        self.failures.check("send_sender_key")
    }

    async fn get_active_group_call(&self, conversation_id: &str) -> Result<Option<GroupCallInfo>> {
        self.calls
            .record("get_active_group_call", conversation_id.to_string());
        self.failures.check("get_active_group_call")?;
        Ok(self.group_info.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockEngine {
    calls: Calls,
    failures: Failures,
    pub speaking: Mutex<Vec<SpeakingLevel>>,
}

impl MockEngine {
    pub fn fail(&self, method: &'static str, times: u32) {
        self.failures.set(method, times);
    }

    pub fn calls(&self, method: &str) -> Vec<String> {
        self.calls.named(method)
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.named(method).len()
    }
}

#[async_trait]
impl NativeCallEngine for MockEngine {
    async fn create_offer(&self, call_id: &str, callee_id: &str) -> Result<OfferMaterial> {
        self.calls.record("create_offer", format!("{call_id}:{callee_id}"));
        self.failures.check("create_offer")?;
        Ok(OfferMaterial {
            ephemeral_kem_public: vec![1],
            signature: vec![2],
        })
    }

    async fn accept_offer(&self, offer: &IncomingCallOffer) -> Result<AnswerMaterial> {
        self.calls.record("accept_offer", offer.call_id.clone());
        self.failures.check("accept_offer")?;
        Ok(AnswerMaterial {
            ephemeral_kem_public: vec![1],
            kem_ciphertext: vec![2],
            signature: vec![3],
        })
    }

    async fn complete_key_exchange_caller(
        &self,
        answer: &CallAnswerEvent,
        _callee_identity_key: &[u8],
    ) -> Result<KeyCompleteMaterial> {
        self.calls
            .record("complete_key_exchange_caller", answer.call_id.clone());
        self.failures.check("complete_key_exchange_caller")?;
        Ok(KeyCompleteMaterial {
            kem_ciphertext: vec![4],
        })
    }

    async fn complete_key_exchange_callee(&self, key_complete: &KeyCompleteEvent) -> Result<()> {
        self.calls
            .record("complete_key_exchange_callee", key_complete.call_id.clone());
        self.failures.check("complete_key_exchange_callee")
    }

    async fn start_media(&self, call_id: &str, relay: &RelayCredentials) -> Result<()> {
        self.calls
            .record("start_media", format!("{call_id}:{}", relay.relay_endpoint));
        self.failures.check("start_media")
    }

    async fn stop_media(&self) -> Result<()> {
        self.calls.record("stop_media", "");
        self.failures.check("stop_media")
    }

    async fn set_muted(&self, muted: bool) -> Result<()> {
        self.calls.record("set_muted", muted.to_string());
        self.failures.check("set_muted")
    }

    async fn set_deafened(&self, deafened: bool) -> Result<()> {
        self.calls.record("set_deafened", deafened.to_string());
        self.failures.check("set_deafened")
    }

    async fn start_screen_share(&self) -> Result<()> {
        self.calls.record("start_screen_share", "");
        self.failures.check("start_screen_share")
    }

    async fn stop_screen_share(&self) -> Result<()> {
        self.calls.record("stop_screen_share", "");
        self.failures.check("stop_screen_share")
    }

    async fn call_state(&self) -> Result<EngineCallState> {
        self.calls.record("call_state", "");
        Ok(EngineCallState::default())
    }

    async fn call_stats(&self) -> Result<CallStats> {
        self.calls.record("call_stats", "");
        self.failures.check("call_stats")?;
        Ok(CallStats {
            round_trip_ms: 42,
            packet_loss: 0.01,
            jitter_ms: 3,
            bitrate_kbps: 64,
        })
    }

    async fn clear_state(&self) -> Result<()> {
        self.calls.record("clear_state", "");
        self.failures.check("clear_state")
    }

    async fn leave_call(&self) -> Result<()> {
        self.calls.record("leave_call", "");
        self.failures.check("leave_call")
    }

    async fn end_call(&self) -> Result<()> {
        self.calls.record("end_call", "");
        self.failures.check("end_call")
    }

    async fn prepare_rejoin(&self, call_id: &str) -> Result<()> {
        self.calls.record("prepare_rejoin", call_id);
        self.failures.check("prepare_rejoin")
    }

    async fn create_group_announcement(&self, conversation_id: &str) -> Result<GroupAnnouncement> {
        self.calls
            .record("create_group_announcement", conversation_id.to_string());
        self.failures.check("create_group_announcement")?;
        Ok(GroupAnnouncement(vec![0xA0]))
    }

    async fn accept_group_announcement(
        &self,
        call_id: &str,
        _announcement: &GroupAnnouncement,
    ) -> Result<JoinMaterial> {
        self.calls.record("accept_group_announcement", call_id);
        self.failures.check("accept_group_announcement")?;
        Ok(JoinMaterial {
            identity_public: vec![0xB0],
            ephemeral_public: vec![0xB1],
            signature: vec![0xB2],
        })
    }

    async fn start_group_media(
        &self,
        call_id: &str,
        _relay: &RelayCredentials,
        participants: &[SenderKeySeed],
    ) -> Result<()> {
        let seeded: Vec<_> = participants.iter().map(|p| p.user_id.as_str()).collect();
        self.calls
            .record("start_group_media", format!("{call_id}:{}", seeded.join(",")));
        self.failures.check("start_group_media")
    }

    async fn stop_group_media(&self) -> Result<()> {
        self.calls.record("stop_group_media", "");
        self.failures.check("stop_group_media")
    }

    async fn create_sender_key(
        &self,
        call_id: &str,
        recipient: &SenderKeySeed,
    ) -> Result<SenderKeyBundle> {
        self.calls
            .record("create_sender_key", format!("{call_id}:{}", recipient.user_id));
        self.failures.check("create_sender_key")?;
        Ok(bundle_for(&recipient.user_id, "me"))
    }

    async fn handle_sender_key(
        &self,
        call_id: &str,
        from_user_id: &str,
        _bundle: &SenderKeyBundle,
    ) -> Result<()> {
        self.calls
            .record("handle_sender_key", format!("{call_id}:{from_user_id}"));
        self.failures.check("handle_sender_key")
    }

    async fn remove_participant(&self, user_id: &str) -> Result<()> {
        self.calls.record("remove_participant", user_id);
        self.failures.check("remove_participant")
    }

    async fn update_relay_token(&self, relay: &RelayCredentials) -> Result<()> {
        self.calls
            .record("update_relay_token", relay.relay_endpoint.clone());
        self.failures.check("update_relay_token")
    }

    async fn speaking_levels(&self) -> Result<Vec<SpeakingLevel>> {
        self.calls.record("speaking_levels", "");
        self.failures.check("speaking_levels")?;
        Ok(self.speaking.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<WsOutgoingMessage>>,
}

impl MessageSink for RecordingSink {
    fn send(&self, message: WsOutgoingMessage) -> bool {
        self.sent.lock().unwrap().push(message);
        true
    }
}

pub struct Harness {
    pub manager: CallManager,
    pub engine: Arc<MockEngine>,
    pub api: Arc<MockApi>,
    pub sink: Arc<RecordingSink>,
    pub link: Subscribers,
    pub notifications: broadcast::Receiver<CallNotification>,
}

impl Harness {
    pub fn new(user_id: &str) -> Self {
        Self::with_config(user_id, CallConfig::default())
    }

    pub fn with_config(user_id: &str, config: CallConfig) -> Self {
        let engine = Arc::new(MockEngine::default());
        let api = Arc::new(MockApi::default());
        let sink = Arc::new(RecordingSink::default());
        let manager = CallManager::new(user_id, config, engine.clone(), api.clone(), sink.clone());
        let notifications = manager.notifications();

        let link = Subscribers::new();
        let subscription = link.subscribe();
        let running = manager.clone();
        tokio::spawn(async move { running.run(subscription).await });

        Self {
            manager,
            engine,
            api,
            sink,
            link,
            notifications,
        }
    }

    pub fn push(&self, message: WsIncomingMessage) {
        self.link.emit(LinkEvent::Message(message));
    }

    pub fn emit(&self, event: LinkEvent) {
        self.link.emit(event);
    }

    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pub fn drain_notifications(&mut self) -> Vec<CallNotification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }

    pub fn sent(&self) -> Vec<WsOutgoingMessage> {
        self.sink.sent.lock().unwrap().clone()
    }
}

pub fn rejoinable(call_id: &str, peer_id: &str, expires_at: Option<DateTime<Utc>>) -> RejoinableCall {
    RejoinableCall {
        call_id: call_id.to_string(),
        peer_id: peer_id.to_string(),
        peer_username: None,
        is_caller: true,
        can_rejoin: true,
        rejoin_remaining_secs: Some(300),
        relay_expires_at: expires_at,
    }
}

pub fn group_info(
    call_id: &str,
    status: ServerCallStatus,
    participants: Vec<ParticipantInfo>,
    announcement: Option<GroupAnnouncement>,
) -> GroupCallInfo {
    GroupCallInfo {
        call_id: call_id.to_string(),
        conversation_id: "conv-1".to_string(),
        initiator_id: "alice".to_string(),
        status,
        participants,
        announcement,
    }
}
