use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::api::RelayCredentials;
use crate::engine::{GroupAnnouncement, SenderKeyBundle};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsIncomingMessage {
    #[serde(rename = "call_offer")]
    CallOffer(IncomingCallOffer),
    #[serde(rename = "call_answer")]
    CallAnswer(CallAnswerEvent),
    #[serde(rename = "call_key_complete")]
    CallKeyComplete(KeyCompleteEvent),
    #[serde(rename = "call_reject")]
    CallReject(CallSignal),
    #[serde(rename = "call_cancel")]
    CallCancel(CallSignal),
    #[serde(rename = "call_end")]
    CallEnd(CallSignal),
    #[serde(rename = "call_media_ready")]
    CallMediaReady(MediaReadyEvent),
    #[serde(rename = "call_missed")]
    CallMissed(CallSignal),
    #[serde(rename = "call_leave")]
    CallLeave(CallSignal),
    #[serde(rename = "call_rejoin")]
    CallRejoin(CallSignal),
    #[serde(rename = "screen_share_start")]
    ScreenShareStart(ScreenShareEvent),
    #[serde(rename = "screen_share_stop")]
    ScreenShareStop(ScreenShareEvent),
    #[serde(rename = "call_mute_update")]
    CallMuteUpdate(MuteUpdateEvent),
    #[serde(rename = "group_call_ring")]
    GroupCallRing(GroupCallRingEvent),
    #[serde(rename = "group_call_started")]
    GroupCallStarted(GroupCallRingEvent),
    #[serde(rename = "group_call_participant_joined")]
    GroupCallParticipantJoined(ParticipantJoinedEvent),
    #[serde(rename = "group_call_participant_left")]
    GroupCallParticipantLeft(ParticipantLeftEvent),
    #[serde(rename = "group_call_ended")]
    GroupCallEnded(GroupCallEndedEvent),
    #[serde(rename = "group_call_mute_update")]
    GroupCallMuteUpdate(MuteUpdateEvent),
    #[serde(rename = "group_call_speaking_update")]
    GroupCallSpeakingUpdate(SpeakingUpdateEvent),
    #[serde(rename = "group_call_sender_key")]
    GroupCallSenderKey(SenderKeyEvent),
    #[serde(rename = "pong")]
    Pong,
}

impl WsIncomingMessage {
    pub fn origin_user_id(&self) -> Option<&str> {
        match self {
            WsIncomingMessage::CallOffer(offer) => Some(&offer.caller_id),
            WsIncomingMessage::CallReject(signal)
            | WsIncomingMessage::CallCancel(signal)
            | WsIncomingMessage::CallEnd(signal)
            | WsIncomingMessage::CallMissed(signal)
            | WsIncomingMessage::CallLeave(signal)
            | WsIncomingMessage::CallRejoin(signal) => signal.user_id.as_deref(),
            WsIncomingMessage::ScreenShareStart(event) | WsIncomingMessage::ScreenShareStop(event) => {
                Some(&event.user_id)
            }
            WsIncomingMessage::CallMuteUpdate(event)
            | WsIncomingMessage::GroupCallMuteUpdate(event) => Some(&event.user_id),
            WsIncomingMessage::GroupCallParticipantJoined(event) => Some(&event.user_id),
            WsIncomingMessage::GroupCallSenderKey(event) => Some(&event.from_user_id),
            WsIncomingMessage::CallAnswer(_)
            | WsIncomingMessage::CallKeyComplete(_)
            | WsIncomingMessage::CallMediaReady(_)
            | WsIncomingMessage::GroupCallRing(_)
            | WsIncomingMessage::GroupCallStarted(_)
            | WsIncomingMessage::GroupCallParticipantLeft(_)
            | WsIncomingMessage::GroupCallEnded(_)
            | WsIncomingMessage::GroupCallSpeakingUpdate(_)
            | WsIncomingMessage::Pong => None,
        }
    }

    pub fn is_echo_of(&self, our_user_id: &str) -> bool {
        self.origin_user_id() == Some(our_user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingCallOffer {
    pub call_id: String,
    pub caller_id: String,
    #[serde(default)]
    pub caller_username: Option<String>,
    pub callee_id: String,
    pub caller_identity_key: Vec<u8>,
    pub ephemeral_kem_public: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnswerEvent {
    pub call_id: String,
    pub callee_id: String,
    pub ephemeral_kem_public: Vec<u8>,
    pub kem_ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCompleteEvent {
    pub call_id: String,
    pub kem_ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSignal {
    pub call_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaReadyEvent {
    pub call_id: String,
    pub relay: RelayCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareEvent {
    pub call_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuteUpdateEvent {
    pub call_id: String,
    pub user_id: String,
    pub is_muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCallRingEvent {
    pub call_id: String,
    pub conversation_id: String,
    pub initiator_id: String,
    #[serde(default)]
    pub announcement: Option<GroupAnnouncement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantJoinedEvent {
    pub call_id: String,
    pub user_id: String,
    pub identity_public: Vec<u8>,
    pub ephemeral_public: Vec<u8>,
    #[serde(default)]
    pub sender_key: Option<SenderKeyBundle>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantLeftEvent {
    pub call_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCallEndedEvent {
    pub call_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakingUpdateEvent {
    pub call_id: String,
    pub user_id: String,
    pub is_speaking: bool,
    #[serde(default)]
    pub audio_level: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyEvent {
    pub call_id: String,
    pub from_user_id: String,
    pub bundle: SenderKeyBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsOutgoingMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "screen_share_start")]
    ScreenShareStart(ScreenShareEvent),
    #[serde(rename = "screen_share_stop")]
    ScreenShareStop(ScreenShareEvent),
    #[serde(rename = "call_mute_update")]
    CallMuteUpdate(MuteUpdateEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_offer() {
        let json = r#"{
            "type": "call_offer",
            "data": {
                "call_id": "c1",
                "caller_id": "alice",
                "callee_id": "bob",
                "caller_identity_key": [1, 2],
                "ephemeral_kem_public": [3],
                "signature": [4],
                "created_at": "2026-01-01T00:00:00Z"
            }
        }"#;
        let msg: WsIncomingMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsIncomingMessage::CallOffer(offer) => {
                assert_eq!(offer.call_id, "c1");
                assert_eq!(offer.caller_identity_key, vec![1, 2]);
                assert!(offer.caller_username.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_ping_envelope() {
        let json = serde_json::to_string(&WsOutgoingMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type": "typing_started", "data": {"conversation_id": "x"}}"#;
        assert!(serde_json::from_str::<WsIncomingMessage>(json).is_err());
    }

    #[test]
    fn test_self_echo_detection() {
        let msg = WsIncomingMessage::CallMuteUpdate(MuteUpdateEvent {
            call_id: "c1".to_string(),
            user_id: "me".to_string(),
            is_muted: true,
        });
        assert!(msg.is_echo_of("me"));
        assert!(!msg.is_echo_of("peer"));

        let end = WsIncomingMessage::CallEnd(CallSignal {
            call_id: "c1".to_string(),
            user_id: None,
            reason: None,
        });
        assert!(!end.is_echo_of("me"));
    }
}
