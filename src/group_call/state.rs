use chrono::{DateTime, Utc};
use serde::Serialize;

use super::participant::ParticipantRoster;
use super::types::{GroupCallStatus, GroupCallTransition};
use crate::call::InvalidTransition;
use crate::client::api::ParticipantStatus;
use crate::engine::GroupAnnouncement;

#[derive(Debug, Clone, Serialize)]
pub struct GroupCallSession {
    pub call_id: String,
    pub conversation_id: String,
    pub initiator_id: String,
    status: GroupCallStatus,
    pub participants: ParticipantRoster,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_screen_sharing: bool,
    pub can_rejoin: bool,
    pub relay_expires_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    #[serde(skip)]
    pub(crate) identity_public: Option<Vec<u8>>,
    #[serde(skip)]
    pub(crate) announcement: Option<GroupAnnouncement>,
    #[serde(skip)]
    pub(crate) epoch: u64,
    #[serde(skip)]
    pub(crate) auto_rejoin: bool,
    #[serde(skip)]
    pub(crate) was_screen_sharing: bool,
}

impl GroupCallSession {
    fn new(
        call_id: String,
        conversation_id: String,
        initiator_id: String,
        user_id: &str,
        status: GroupCallStatus,
        epoch: u64,
    ) -> Self {
        Self {
            call_id,
            conversation_id,
            initiator_id,
            status,
            participants: ParticipantRoster::new(user_id),
            is_muted: false,
            is_deafened: false,
            is_screen_sharing: false,
            can_rejoin: false,
            relay_expires_at: None,
            left_at: None,
            end_reason: None,
            identity_public: None,
            announcement: None,
            epoch,
            auto_rejoin: false,
            was_screen_sharing: false,
        }
    }

    pub fn ringing(
        call_id: String,
        conversation_id: String,
        initiator_id: String,
        user_id: &str,
        announcement: Option<GroupAnnouncement>,
        epoch: u64,
    ) -> Self {
        let mut session = Self::new(
            call_id,
            conversation_id,
            initiator_id,
            user_id,
            GroupCallStatus::Ringing,
            epoch,
        );
        session.announcement = announcement;
        session
    }

    pub fn connecting(
        call_id: String,
        conversation_id: String,
        initiator_id: String,
        user_id: &str,
        epoch: u64,
    ) -> Self {
        let mut session = Self::new(
            call_id,
            conversation_id,
            initiator_id,
            user_id,
            GroupCallStatus::Connecting,
            epoch,
        );
        session
            .participants
            .set_self_status(ParticipantStatus::Connecting);
        session
    }

    pub fn status(&self) -> GroupCallStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_announcement(&self) -> bool {
        self.announcement.is_some()
    }

    pub fn matches(&self, call_id: &str, epoch: u64) -> bool {
        self.call_id == call_id && self.epoch == epoch
    }

    pub fn apply_transition(
        &mut self,
        transition: GroupCallTransition,
    ) -> Result<(), InvalidTransition> {
        use GroupCallStatus::*;

        let next = match (self.status, &transition) {
            (Ringing, GroupCallTransition::JoinRequested) => {
                self.participants.set_self_status(ParticipantStatus::Connecting);
                Connecting
            }
            (Connecting, GroupCallTransition::MediaStarted) => {
                self.participants.set_self_status(ParticipantStatus::Active);
                self.can_rejoin = false;
                Active
            }
            (Active, GroupCallTransition::Left) => {
                self.participants.set_self_status(ParticipantStatus::Left);
                self.left_at = Some(Utc::now());
                self.can_rejoin = self.announcement.is_some();
                self.was_screen_sharing = self.is_screen_sharing;
                self.is_screen_sharing = false;
                Left
            }
            (Left, GroupCallTransition::Rejoined) => {
                self.participants.set_self_status(ParticipantStatus::Active);
                self.left_at = None;
                self.can_rejoin = false;
                self.auto_rejoin = false;
                Active
            }
            (Ringing | Connecting | Active | Left, GroupCallTransition::Ended { reason }) => {
                self.end_reason = Some(reason.clone());
                self.can_rejoin = false;
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

    fn joining() -> GroupCallSession {
        let mut session = GroupCallSession::connecting(
            "g1".into(),
            "conv".into(),
            "alice".into(),
            "me",
            1,
        );
        session.announcement = Some(GroupAnnouncement(vec![7]));
        session
    }

    #[test]
    fn test_join_leave_rejoin() {
        let mut session = joining();
        assert_eq!(
            session.participants.get("me").unwrap().status,
            ParticipantStatus::Connecting
        );
        session
            .apply_transition(GroupCallTransition::MediaStarted)
            .unwrap();
        assert_eq!(session.status(), GroupCallStatus::Active);

        session.is_screen_sharing = true;
        session.apply_transition(GroupCallTransition::Left).unwrap();
        assert!(session.can_rejoin);
        assert!(session.was_screen_sharing);
        assert_eq!(
            session.participants.get("me").unwrap().status,
            ParticipantStatus::Left
        );

        session.apply_transition(GroupCallTransition::Rejoined).unwrap();
        assert_eq!(session.status(), GroupCallStatus::Active);
        assert!(session.left_at.is_none());
    }

    #[test]
    fn test_left_without_announcement_is_not_rejoinable() {
        let mut session = joining();
        session.announcement = None;
        session
            .apply_transition(GroupCallTransition::MediaStarted)
            .unwrap();
        session.apply_transition(GroupCallTransition::Left).unwrap();
        assert!(!session.can_rejoin);
    }

    #[test]
    fn test_ringing_must_join_first() {
        let mut session = GroupCallSession::ringing(
            "g2".into(),
            "conv".into(),
            "alice".into(),
            "me",
            None,
            2,
        );
        assert!(session.participants.is_empty());
        assert!(session
            .apply_transition(GroupCallTransition::MediaStarted)
            .is_err());
        session
            .apply_transition(GroupCallTransition::JoinRequested)
            .unwrap();
        assert_eq!(session.status(), GroupCallStatus::Connecting);
        assert!(session.participants.get("me").unwrap().is_self);
    }

    #[test]
    fn test_ended_is_final() {
        let mut session = joining();
        session
            .apply_transition(GroupCallTransition::Ended {
                reason: "ended".into(),
            })
            .unwrap();
        assert!(session.status().is_terminal());
        assert!(session.apply_transition(GroupCallTransition::Rejoined).is_err());
        assert_eq!(session.end_reason.as_deref(), Some("ended"));
    }
}
