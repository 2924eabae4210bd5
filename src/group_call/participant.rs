use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::api::{ParticipantInfo, ParticipantStatus};
use crate::engine::{SenderKeySeed, SpeakingLevel};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub user_id: String,
    pub status: ParticipantStatus,
    pub is_muted: bool,
    pub is_speaking: bool,
    pub audio_level: f32,
    pub is_screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
    pub is_self: bool,
    #[serde(skip)]
    pub(crate) identity_public: Vec<u8>,
    #[serde(skip)]
    pub(crate) ephemeral_public: Vec<u8>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, status: ParticipantStatus, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            is_muted: false,
            is_speaking: false,
            audio_level: 0.0,
            is_screen_sharing: false,
            joined_at,
            is_self: false,
            identity_public: Vec::new(),
            ephemeral_public: Vec::new(),
        }
    }

    pub fn with_keys(mut self, identity_public: Vec<u8>, ephemeral_public: Vec<u8>) -> Self {
        self.identity_public = identity_public;
        self.ephemeral_public = ephemeral_public;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    pub fn seed(&self) -> SenderKeySeed {
        SenderKeySeed {
            user_id: self.user_id.clone(),
            identity_public: self.identity_public.clone(),
            ephemeral_public: self.ephemeral_public.clone(),
        }
    }

    fn from_info(info: &ParticipantInfo) -> Self {
        let mut participant = Self::new(info.user_id.clone(), info.status, info.joined_at)
            .with_keys(info.identity_public.clone(), info.ephemeral_public.clone());
        participant.is_muted = info.is_muted;
        participant
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantRoster {
    self_id: String,
    entries: Vec<Participant>,
    #[serde(skip)]
    optimistic: HashMap<String, Participant>,
}

impl ParticipantRoster {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            entries: Vec::new(),
            optimistic: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter()
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.entries.iter().find(|p| p.user_id == user_id)
    }

    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.entries.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Inserts at the end, or updates in place keeping the original position.
    /// Returns `true` for a new participant.
    pub fn upsert(&mut self, mut participant: Participant) -> bool {
        participant.is_self = participant.user_id == self.self_id;
        match self.get_mut(&participant.user_id) {
            Some(existing) => {
                existing.status = participant.status;
                existing.joined_at = participant.joined_at;
                if !participant.identity_public.is_empty() {
                    existing.identity_public = participant.identity_public;
                }
                if !participant.ephemeral_public.is_empty() {
                    existing.ephemeral_public = participant.ephemeral_public;
                }
                false
            }
            None => {
                self.entries.push(participant);
                true
            }
        }
    }

    pub fn mark_left(&mut self, user_id: &str) -> bool {
        match self.get_mut(user_id) {
            Some(participant) => {
                participant.status = ParticipantStatus::Left;
                participant.is_speaking = false;
                participant.audio_level = 0.0;
                participant.is_screen_sharing = false;
                true
            }
            None => false,
        }
    }

    pub fn set_self_status(&mut self, status: ParticipantStatus) {
        let self_id = self.self_id.clone();
        match self.get_mut(&self_id) {
            Some(me) => me.status = status,
            None => {
                self.upsert(Participant::new(self_id, status, Utc::now()));
            }
        }
    }

    pub fn active_others(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter().filter(|p| !p.is_self && p.is_active())
    }

    pub fn all_others_left(&self) -> bool {
        self.entries
            .iter()
            .filter(|p| !p.is_self)
            .all(|p| p.status == ParticipantStatus::Left)
    }

    pub fn seeds(&self) -> Vec<SenderKeySeed> {
        self.active_others().map(Participant::seed).collect()
    }

    /// Applies a local change before the server has confirmed it. The first
    /// unconfirmed snapshot for a participant is the one rolled back to.
    pub fn apply_optimistic(&mut self, user_id: &str, change: impl FnOnce(&mut Participant)) -> bool {
        let Some(index) = self.entries.iter().position(|p| p.user_id == user_id) else {
            return false;
        };
        self.optimistic
            .entry(user_id.to_string())
            .or_insert_with(|| self.entries[index].clone());
        change(&mut self.entries[index]);
        true
    }

    pub fn confirm(&mut self, user_id: &str) {
        self.optimistic.remove(user_id);
    }

    pub fn rollback(&mut self, user_id: &str) -> bool {
        let Some(snapshot) = self.optimistic.remove(user_id) else {
            return false;
        };
        match self.get_mut(user_id) {
            Some(entry) => {
                *entry = snapshot;
                true
            }
            None => false,
        }
    }

    pub fn reconcile(&mut self, server: &[ParticipantInfo]) {
        let pending: Vec<String> = self.optimistic.keys().cloned().collect();
        for user_id in pending {
            self.rollback(&user_id);
        }
        for info in server {
            let is_new = self.upsert(Participant::from_info(info));
            if !is_new {
                if let Some(existing) = self.get_mut(&info.user_id) {
                    existing.is_muted = info.is_muted;
                }
            }
        }
        for entry in self.entries.iter_mut() {
            if !entry.is_self && !server.iter().any(|info| info.user_id == entry.user_id) {
                entry.status = ParticipantStatus::Left;
                entry.is_speaking = false;
            }
        }
    }

    pub fn update_speaking(&mut self, levels: &[SpeakingLevel]) -> bool {
        let mut changed = false;
        for level in levels {
            if let Some(participant) = self.get_mut(&level.user_id) {
                if participant.is_speaking != level.is_speaking
                    || (participant.audio_level - level.audio_level).abs() > f32::EPSILON
                {
                    participant.is_speaking = level.is_speaking;
                    participant.audio_level = level.audio_level;
                    changed = true;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user_id: &str, status: ParticipantStatus) -> ParticipantInfo {
        ParticipantInfo {
            user_id: user_id.to_string(),
            status,
            identity_public: vec![1],
            ephemeral_public: vec![2],
            is_muted: false,
            joined_at: Utc::now(),
        }
    }

    fn roster_with(ids: &[&str]) -> ParticipantRoster {
        let mut roster = ParticipantRoster::new("me");
        for id in ids {
            roster.upsert(Participant::new(*id, ParticipantStatus::Active, Utc::now()));
        }
        roster
    }

    #[test]
    fn test_upsert_keeps_order() {
        let mut roster = roster_with(&["me", "alice", "bob"]);
        assert!(!roster.upsert(Participant::new(
            "alice",
            ParticipantStatus::Connecting,
            Utc::now()
        )));
        let order: Vec<_> = roster.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(order, vec!["me", "alice", "bob"]);
        assert_eq!(roster.get("alice").unwrap().status, ParticipantStatus::Connecting);
        assert!(roster.get("me").unwrap().is_self);
    }

    #[test]
    fn test_left_participants_are_kept() {
        let mut roster = roster_with(&["me", "alice", "bob"]);
        assert!(roster.mark_left("alice"));
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.get("alice").unwrap().status, ParticipantStatus::Left);
        let active: Vec<_> = roster.active_others().map(|p| p.user_id.as_str()).collect();
        assert_eq!(active, vec!["bob"]);
        assert!(!roster.mark_left("nobody"));
    }

    #[test]
    fn test_all_others_left_ignores_self() {
        let mut roster = roster_with(&["me", "alice", "bob"]);
        assert!(!roster.all_others_left());
        roster.mark_left("alice");
        assert!(!roster.all_others_left());
        roster.mark_left("bob");
        assert!(roster.all_others_left());
    }

    #[test]
    fn test_optimistic_rollback() {
        let mut roster = roster_with(&["me"]);
        roster.apply_optimistic("me", |p| p.is_muted = true);
        roster.apply_optimistic("me", |p| p.is_muted = false);
        roster.apply_optimistic("me", |p| p.is_muted = true);
        assert!(roster.get("me").unwrap().is_muted);

        assert!(roster.rollback("me"));
        assert!(!roster.get("me").unwrap().is_muted);
        assert!(!roster.rollback("me"));
    }

    #[test]
    fn test_optimistic_confirm() {
        let mut roster = roster_with(&["me"]);
        roster.apply_optimistic("me", |p| p.is_muted = true);
        roster.confirm("me");
        assert!(!roster.rollback("me"));
        assert!(roster.get("me").unwrap().is_muted);
    }

    #[test]
    fn test_reconcile_is_authoritative() {
        let mut roster = roster_with(&["me", "alice"]);
        roster.apply_optimistic("alice", |p| p.is_muted = true);

        roster.reconcile(&[
            info("me", ParticipantStatus::Active),
            info("bob", ParticipantStatus::Active),
        ]);

        assert!(!roster.rollback("alice"));
        assert_eq!(roster.get("alice").unwrap().status, ParticipantStatus::Left);
        assert!(!roster.get("alice").unwrap().is_muted);
        let order: Vec<_> = roster.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(order, vec!["me", "alice", "bob"]);
        assert_eq!(roster.seeds().len(), 1);
        assert_eq!(roster.seeds()[0].identity_public, vec![1]);
    }

    #[test]
    fn test_speaking_updates_report_change() {
        let mut roster = roster_with(&["me", "alice"]);
        let level = SpeakingLevel {
            user_id: "alice".to_string(),
            is_speaking: true,
            audio_level: 0.4,
        };
        assert!(roster.update_speaking(&[level.clone()]));
        assert!(!roster.update_speaking(&[level]));
        assert!(roster.get("alice").unwrap().is_speaking);
    }
}
