use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{CallRole, CallStatus, EndReason};
use crate::client::api::RelayCredentials;

#[derive(Debug, Clone)]
pub enum CallTransition {
    Initiated,
    IncomingAccepted,
    AnswerReceived,
    AnswerSent,
    MediaStarted,
    Left { can_rejoin: bool },
    Rejoined,
    Restored,
    Ended { reason: EndReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: String,
    pub peer_id: String,
    pub peer_username: Option<String>,
    pub role: CallRole,
    status: CallStatus,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub peer_muted: bool,
    pub is_screen_sharing: bool,
    pub peer_screen_sharing: bool,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub relay_expires_at: Option<DateTime<Utc>>,
    pub can_rejoin: bool,
    pub rejoin_remaining_secs: Option<u64>,
    pub peer_left: bool,
    pub end_reason: Option<EndReason>,
    #[serde(skip)]
    pub(crate) epoch: u64,
    #[serde(skip)]
    pub(crate) peer_identity_key: Option<Vec<u8>>,
    #[serde(skip)]
    pub(crate) key_exchange_done: bool,
    #[serde(skip)]
    pub(crate) pending_media_ready: Option<RelayCredentials>,
    #[serde(skip)]
    pub(crate) media_applied: bool,
    #[serde(skip)]
    pub(crate) auto_rejoin: bool,
    #[serde(skip)]
    pub(crate) was_screen_sharing: bool,
}

impl CallSession {
    fn new(call_id: String, peer_id: String, role: CallRole, epoch: u64) -> Self {
        Self {
            call_id,
            peer_id,
            peer_username: None,
            role,
            status: CallStatus::Idle,
            is_muted: false,
            is_deafened: false,
            peer_muted: false,
            is_screen_sharing: false,
            peer_screen_sharing: false,
            started_at: Utc::now(),
            connected_at: None,
            left_at: None,
            relay_expires_at: None,
            can_rejoin: false,
            rejoin_remaining_secs: None,
            peer_left: false,
            end_reason: None,
            epoch,
            peer_identity_key: None,
            key_exchange_done: false,
            pending_media_ready: None,
            media_applied: false,
            auto_rejoin: false,
            was_screen_sharing: false,
        }
    }

    pub fn new_outgoing(
        call_id: String,
        peer_id: String,
        peer_identity_key: Vec<u8>,
        epoch: u64,
    ) -> Self {
        let mut session = Self::new(call_id, peer_id, CallRole::Caller, epoch);
        session.peer_identity_key = Some(peer_identity_key);
        session
    }

    pub fn new_incoming(call_id: String, caller_id: String, epoch: u64) -> Self {
        Self::new(call_id, caller_id, CallRole::Callee, epoch)
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn matches(&self, call_id: &str, epoch: u64) -> bool {
        self.call_id == call_id && self.epoch == epoch
    }

    pub fn refresh_rejoin_estimate(&mut self, now: DateTime<Utc>) {
        self.rejoin_remaining_secs = self
            .relay_expires_at
            .map(|expires| expires.signed_duration_since(now).num_seconds().max(0) as u64);
        if self.rejoin_remaining_secs == Some(0) {
            self.can_rejoin = false;
        }
    }

    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        use CallStatus::*;

        let now = Utc::now();
        let next = match (self.status, &transition) {
            (Idle, CallTransition::Initiated) if self.is_caller() => Initiating,
            (Idle, CallTransition::IncomingAccepted) if !self.is_caller() => Ringing,
            (Idle, CallTransition::Restored) => {
                self.left_at = Some(now);
                self.can_rejoin = true;
                Left
            }
            (Initiating, CallTransition::AnswerReceived) => Connecting,
            (Ringing, CallTransition::AnswerSent) => Connecting,
            (Connecting, CallTransition::MediaStarted) => {
                self.connected_at = Some(now);
                Active
            }
            (Active, CallTransition::Left { can_rejoin }) => {
                self.left_at = Some(now);
                self.can_rejoin = *can_rejoin;
                self.was_screen_sharing = self.is_screen_sharing;
                self.is_screen_sharing = false;
                self.refresh_rejoin_estimate(now);
                Left
            }
            (Left, CallTransition::Rejoined) => {
                self.left_at = None;
                self.auto_rejoin = false;
                if self.connected_at.is_none() {
                    self.connected_at = Some(now);
                }
                Active
            }
            (Initiating | Ringing | Connecting | Active | Left, CallTransition::Ended { reason }) => {
                self.end_reason = Some(*reason);
                self.can_rejoin = false;
                self.pending_media_ready = None;
                Ended
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CallSession {
        CallSession::new_outgoing("c1".into(), "bob".into(), vec![9; 4], 1)
    }

    #[test]
    fn test_caller_flow() {
        let mut call = outgoing();
        call.apply_transition(CallTransition::Initiated).unwrap();
        assert_eq!(call.status(), CallStatus::Initiating);
        call.apply_transition(CallTransition::AnswerReceived).unwrap();
        call.apply_transition(CallTransition::MediaStarted).unwrap();
        assert_eq!(call.status(), CallStatus::Active);
        assert!(call.connected_at.is_some());

        call.apply_transition(CallTransition::Left { can_rejoin: true })
            .unwrap();
        assert_eq!(call.status(), CallStatus::Left);
        call.apply_transition(CallTransition::Rejoined).unwrap();
        assert_eq!(call.status(), CallStatus::Active);

        call.apply_transition(CallTransition::Ended {
            reason: EndReason::Hangup,
        })
        .unwrap();
        assert_eq!(call.status(), CallStatus::Ended);
        assert_eq!(call.end_reason, Some(EndReason::Hangup));
    }

    #[test]
    fn test_caller_never_rings() {
        let mut call = outgoing();
        assert!(call
            .apply_transition(CallTransition::IncomingAccepted)
            .is_err());
        assert_eq!(call.status(), CallStatus::Idle);
    }

    #[test]
    fn test_callee_flow() {
        let mut call = CallSession::new_incoming("c2".into(), "alice".into(), 2);
        assert!(call.apply_transition(CallTransition::Initiated).is_err());
        call.apply_transition(CallTransition::IncomingAccepted)
            .unwrap();
        assert_eq!(call.status(), CallStatus::Ringing);
        assert!(call
            .apply_transition(CallTransition::AnswerReceived)
            .is_err());
        call.apply_transition(CallTransition::AnswerSent).unwrap();
        assert_eq!(call.status(), CallStatus::Connecting);
    }

    #[test]
    fn test_leave_remembers_screen_share() {
        let mut call = outgoing();
        call.apply_transition(CallTransition::Initiated).unwrap();
        call.apply_transition(CallTransition::AnswerReceived).unwrap();
        call.apply_transition(CallTransition::MediaStarted).unwrap();
        call.is_screen_sharing = true;

        call.apply_transition(CallTransition::Left { can_rejoin: true })
            .unwrap();
        assert!(!call.is_screen_sharing);
        assert!(call.was_screen_sharing);
        assert!(call.left_at.is_some());
    }

    #[test]
    fn test_rejoin_requires_left() {
        let mut call = outgoing();
        call.apply_transition(CallTransition::Initiated).unwrap();
        assert!(call.apply_transition(CallTransition::Rejoined).is_err());
        assert!(call
            .apply_transition(CallTransition::Left { can_rejoin: true })
            .is_err());
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut call = outgoing();
        call.apply_transition(CallTransition::Initiated).unwrap();
        call.apply_transition(CallTransition::Ended {
            reason: EndReason::NoAnswer,
        })
        .unwrap();
        assert!(call.apply_transition(CallTransition::AnswerReceived).is_err());
        assert!(call
            .apply_transition(CallTransition::Ended {
                reason: EndReason::Hangup
            })
            .is_err());
        assert_eq!(call.end_reason, Some(EndReason::NoAnswer));
    }

    #[test]
    fn test_restored_session_is_left() {
        let mut call = CallSession::new_incoming("c3".into(), "alice".into(), 3);
        call.apply_transition(CallTransition::Restored).unwrap();
        assert_eq!(call.status(), CallStatus::Left);
        assert!(call.can_rejoin);
    }

    #[test]
    fn test_rejoin_estimate_expires() {
        let mut call = outgoing();
        let now = Utc::now();
        call.can_rejoin = true;
        call.relay_expires_at = Some(now - chrono::Duration::seconds(5));
        call.refresh_rejoin_estimate(now);
        assert_eq!(call.rejoin_remaining_secs, Some(0));
        assert!(!call.can_rejoin);
    }
}
