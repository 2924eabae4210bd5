use log::{debug, error, info, warn};
use tokio::time::sleep;

use super::participant::Participant;
use super::state::GroupCallSession;
use super::types::{GroupCallStatus, GroupCallTransition};
use crate::client::api::{
    CreateGroupCallRequest, GroupCallJoined, JoinGroupCallRequest, ParticipantStatus,
    SendSenderKeyRequest,
};
use crate::client::messages::{
    GroupCallRingEvent, MuteUpdateEvent, ParticipantJoinedEvent, ParticipantLeftEvent,
    ScreenShareEvent, SenderKeyEvent, SpeakingUpdateEvent, WsOutgoingMessage,
};
use crate::config::CallConfig;
use crate::engine::{GroupAnnouncement, SenderKeySeed};
use crate::error::{CallError, RejoinBlock, Result};
use crate::manager::{CallManager, CallNotification, State};
use crate::timers::TimerKind;

impl State {
    pub(crate) fn transition_group(
        &mut self,
        transition: GroupCallTransition,
        config: &CallConfig,
    ) -> Result<GroupCallSession> {
        let session = self.group.as_mut().ok_or(CallError::NoSuchCall)?;
        session.apply_transition(transition)?;
        let epoch = session.epoch;
        let timers = &mut self.group_timers;

        match session.status() {
            GroupCallStatus::Active => {
                timers.ensure_periodic(
                    TimerKind::GroupTokenRefresh,
                    config.group_token_check_interval,
                    epoch,
                );
                timers.ensure_periodic(
                    TimerKind::GroupSpeakingPoll,
                    config.speaking_poll_interval,
                    epoch,
                );
            }
            GroupCallStatus::Left => {
                timers.clear(TimerKind::GroupTokenRefresh);
                timers.clear(TimerKind::GroupSpeakingPoll);
            }
            GroupCallStatus::Ended => timers.clear_all(),
            GroupCallStatus::Ringing | GroupCallStatus::Connecting => {}
        }

        Ok(session.clone())
    }

    pub(crate) fn group_matching(&mut self, call_id: &str, epoch: u64) -> Option<&mut GroupCallSession> {
        self.group
            .as_mut()
            .filter(|session| session.matches(call_id, epoch))
    }

    fn group_by_id(&mut self, call_id: &str) -> Option<&mut GroupCallSession> {
        self.group
            .as_mut()
            .filter(|session| session.call_id == call_id && !session.status().is_terminal())
    }

    fn group_joined(&self) -> bool {
        self.group
            .as_ref()
            .is_some_and(|session| session.status().is_joined())
    }
}

impl CallManager {
    pub async fn start_group_call(&self, conversation_id: &str) -> Result<GroupCallSession> {
        if self.lock().await.group_joined() {
            return Err(CallError::AlreadyInCall);
        }

        let announcement = match self
            .inner
            .engine
            .create_group_announcement(conversation_id)
            .await
        {
            Ok(announcement) => announcement,
            Err(e) => {
                error!(target: "Call/Group", "Failed to create announcement: {e}");
                self.notify_error(None, &e);
                return Err(e);
            }
        };
        let request = CreateGroupCallRequest {
            conversation_id,
            announcement: &announcement,
        };
        let created = match self.inner.api.create_group_call(&request).await {
            Ok(created) => created,
            Err(e) => {
                error!(target: "Call/Group", "Failed to create group call: {e}");
                self.notify_error(None, &e);
                return Err(e);
            }
        };
        let call_id = created.call_id.clone();

        let epoch = {
            let mut state = self.lock().await;
            if state.group_joined() {
                drop(state);
                warn!(target: "Call/Group", "Another group call was joined while starting {call_id}");
                if let Err(e) = self.inner.api.leave_group_call(&call_id).await {
                    warn!(target: "Call/Group", "Failed to leave {call_id} after losing the race: {e}");
                }
                return Err(CallError::AlreadyInCall);
            }
            let epoch = state.next_epoch();
            let user_id = state.user_id.clone();
            let mut session = GroupCallSession::connecting(
                call_id.clone(),
                conversation_id.to_string(),
                user_id.clone(),
                &user_id,
                epoch,
            );
            session.announcement = Some(announcement);
            session.relay_expires_at = Some(created.relay.expires_at);
            state.group = Some(session);
            epoch
        };

        // Nobody else is in the call yet, so no sender keys to seed.
        if let Err(e) = self
            .inner
            .engine
            .start_group_media(&call_id, &created.relay, &[])
            .await
        {
            error!(target: "Call/Group", "Media start failed for {call_id}: {e}");
            self.notify_error(Some(&call_id), &e);
            if let Err(end) = self.inner.api.end_group_call(&call_id).await {
                warn!(target: "Call/Group", "Failed to end {call_id} after media failure: {end}");
            }
            self.teardown_group(&call_id, "media_failed").await;
            return Err(e);
        }

        let snapshot = {
            let mut state = self.lock().await;
            if state.group_matching(&call_id, epoch).is_none() {
                return Err(CallError::Stale);
            }
            state.transition_group(GroupCallTransition::MediaStarted, self.config())?
        };
        info!(target: "Call/Group", "Started group call {call_id} in {conversation_id}");
        self.notify(CallNotification::GroupCallUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn join_group_call(&self, call_id: &str) -> Result<GroupCallSession> {
        let (epoch, known_announcement, superseded) = {
            let mut state = self.lock().await;
            match state.group.as_ref() {
                Some(session) if session.call_id == call_id && session.status() == GroupCallStatus::Ringing => {
                    let announcement = session.announcement.clone();
                    let epoch = session.epoch;
                    state.transition_group(GroupCallTransition::JoinRequested, self.config())?;
                    (epoch, announcement, None)
                }
                _ if state.group_joined() => return Err(CallError::AlreadyInCall),
                previous => {
                    let superseded = previous
                        .filter(|s| s.status() == GroupCallStatus::Ringing)
                        .map(|s| s.call_id.clone());
                    let epoch = state.next_epoch();
                    let user_id = state.user_id.clone();
                    state.group = Some(GroupCallSession::connecting(
                        call_id.to_string(),
                        String::new(),
                        String::new(),
                        &user_id,
                        epoch,
                    ));
                    (epoch, None, superseded)
                }
            }
        };
        if let Some(previous) = superseded {
            info!(target: "Call/Group", "Declining ringing call {previous} to join {call_id}");
            self.notify(CallNotification::GroupCallEnded {
                call_id: previous.clone(),
                reason: "declined".to_string(),
            });
            if let Err(e) = self.inner.api.decline_group_call(&previous).await {
                warn!(target: "Call/Group", "Failed to decline {previous}: {e}");
            }
        }

        let outcome = match self.request_group_join(call_id, epoch, known_announcement).await {
            Ok(joined) => self
                .start_joined_group(call_id, epoch, &joined)
                .await
                .map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };
        match outcome {
            Ok(snapshot) => {
                info!(target: "Call/Group", "Joined group call {call_id}");
                self.notify(CallNotification::GroupCallUpdated(snapshot.clone()));
                Ok(snapshot)
            }
            Err((CallError::Stale, _)) => Err(CallError::Stale),
            Err((e, server_joined)) => {
                error!(target: "Call/Group", "Join of {call_id} failed: {e}");
                self.notify_error(Some(call_id), &e);
                if server_joined {
                    if let Err(leave) = self.inner.api.leave_group_call(call_id).await {
                        warn!(target: "Call/Group", "Failed to leave {call_id} after failed join: {leave}");
                    }
                }
                self.teardown_group(call_id, "join_failed").await;
                Err(e)
            }
        }
    }

    async fn request_group_join(
        &self,
        call_id: &str,
        epoch: u64,
        known_announcement: Option<GroupAnnouncement>,
    ) -> Result<GroupCallJoined> {
        let info = self.inner.api.get_group_call(call_id).await?;
        if info.status.is_terminal() {
            return Err(CallError::NoSuchCall);
        }
        let announcement = known_announcement
            .or_else(|| info.announcement.clone())
            .ok_or(CallError::RejoinUnavailable(RejoinBlock::MissingAnnouncement))?;

        let user_id = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let session = state.group_matching(call_id, epoch).ok_or(CallError::Stale)?;
            session.conversation_id = info.conversation_id.clone();
            session.initiator_id = info.initiator_id.clone();
            session.announcement = Some(announcement.clone());
            user_id
        };

        let join = self
            .inner
            .engine
            .accept_group_announcement(call_id, &announcement)
            .await?;

        let recipients: Vec<SenderKeySeed> = info
            .participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Active && p.user_id != user_id)
            .map(|p| SenderKeySeed {
                user_id: p.user_id.clone(),
                identity_public: p.identity_public.clone(),
                ephemeral_public: p.ephemeral_public.clone(),
            })
            .collect();
        let mut sender_keys = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            match self.inner.engine.create_sender_key(call_id, recipient).await {
                Ok(bundle) => sender_keys.push(bundle),
                Err(e) => {
                    warn!(target: "Call/Group", "No sender key for {}: {e}", recipient.user_id)
                }
            }
        }

        let request = JoinGroupCallRequest {
            identity_public: &join.identity_public,
            ephemeral_public: &join.ephemeral_public,
            signature: &join.signature,
            sender_keys: &sender_keys,
        };
        let joined = self.inner.api.join_group_call(call_id, &request).await?;

        let mut state = self.lock().await;
        let session = state.group_matching(call_id, epoch).ok_or(CallError::Stale)?;
        session.identity_public = Some(join.identity_public);
        Ok(joined)
    }

    async fn start_joined_group(
        &self,
        call_id: &str,
        epoch: u64,
        joined: &GroupCallJoined,
    ) -> Result<GroupCallSession> {
        let seeds = {
            let mut state = self.lock().await;
            let session = state.group_matching(call_id, epoch).ok_or(CallError::Stale)?;
            self.absorb_joined(session, joined)
        };
        self.inner
            .engine
            .start_group_media(call_id, &joined.relay, &seeds)
            .await?;

        let mut state = self.lock().await;
        if state.group_matching(call_id, epoch).is_none() {
            return Err(CallError::Stale);
        }
        state.transition_group(GroupCallTransition::MediaStarted, self.config())
    }

    /// Applies the server's view after join or rejoin and returns the
    /// sender-key placeholders for everyone still in the call.
    fn absorb_joined(&self, session: &mut GroupCallSession, joined: &GroupCallJoined) -> Vec<SenderKeySeed> {
        session.participants.reconcile(&joined.participants);
        session.relay_expires_at = Some(joined.relay.expires_at);
        session.participants.seeds()
    }

    pub async fn decline_group_call(&self, call_id: &str) -> Result<()> {
        let ringing = {
            let state = self.lock().await;
            state
                .group
                .as_ref()
                .is_some_and(|s| s.call_id == call_id && s.status() == GroupCallStatus::Ringing)
        };
        if ringing {
            self.teardown_group(call_id, "declined").await;
        }
        self.inner.api.decline_group_call(call_id).await
    }

    pub async fn leave_group_call(&self) -> Result<()> {
        self.leave_group(false).await
    }

    pub(crate) async fn leave_group(&self, auto_rejoin: bool) -> Result<()> {
        let snapshot = {
            let mut state = self.lock().await;
            let session = state.group.as_mut().ok_or(CallError::NoSuchCall)?;
            if session.status() != GroupCallStatus::Active {
                return Err(CallError::NoSuchCall);
            }
            session.auto_rejoin = auto_rejoin;
            state.transition_group(GroupCallTransition::Left, self.config())?
        };
        let call_id = snapshot.call_id.clone();
        info!(target: "Call/Group", "Left group call {call_id} (auto rejoin: {auto_rejoin})");

        if let Err(e) = self.inner.engine.stop_group_media().await {
            warn!(target: "Call/Group", "Engine stop failed for {call_id}: {e}");
        }
        if let Err(e) = self.inner.api.leave_group_call(&call_id).await {
            warn!(target: "Call/Group", "Failed to sync leave for {call_id}: {e}");
        }

        if snapshot.participants.all_others_left() && !auto_rejoin {
            self.teardown_group(&call_id, "everyone_left").await;
        } else {
            self.notify(CallNotification::GroupCallUpdated(snapshot));
        }
        Ok(())
    }

    pub async fn rejoin_group_call(&self) -> Result<GroupCallSession> {
        self.rejoin_group().await
    }

    pub(crate) async fn rejoin_group(&self) -> Result<GroupCallSession> {
        let (call_id, epoch, reshare) = {
            let state = self.lock().await;
            let session = state.group.as_ref().ok_or(CallError::NoSuchCall)?;
            if session.status() != GroupCallStatus::Left {
                return Err(CallError::RejoinUnavailable(RejoinBlock::NotLeft));
            }
            if !session.has_announcement() {
                return Err(CallError::RejoinUnavailable(RejoinBlock::MissingAnnouncement));
            }
            if !session.can_rejoin {
                return Err(CallError::RejoinUnavailable(RejoinBlock::WindowElapsed));
            }
            (session.call_id.clone(), session.epoch, session.was_screen_sharing)
        };

        let joined = match self.inner.api.rejoin_group_call(&call_id).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!(target: "Call/Group", "Rejoin of {call_id} failed: {e}");
                self.notify_error(Some(&call_id), &e);
                return Err(e);
            }
        };
        let seeds = {
            let mut state = self.lock().await;
            let session = state.group_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            self.absorb_joined(session, &joined)
        };
        if let Err(e) = self
            .inner
            .engine
            .start_group_media(&call_id, &joined.relay, &seeds)
            .await
        {
            warn!(target: "Call/Group", "Media restart failed for {call_id}: {e}");
            self.notify_error(Some(&call_id), &e);
            return Err(e);
        }

        let user_id = {
            let mut state = self.lock().await;
            if state.group_matching(&call_id, epoch).is_none() {
                return Err(CallError::Stale);
            }
            state.transition_group(GroupCallTransition::Rejoined, self.config())?;
            state.user_id.clone()
        };
        info!(target: "Call/Group", "Rejoined group call {call_id}");

        if reshare {
            match self.inner.engine.start_screen_share().await {
                Ok(()) => {
                    self.mark_group_screen_share(&call_id, epoch, &user_id, true)
                        .await;
                }
                Err(e) => warn!(target: "Call/Group", "Could not resume screen share: {e}"),
            }
        }

        let snapshot = self.group_snapshot().await.ok_or(CallError::Stale)?;
        self.notify(CallNotification::GroupCallUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn end_group_call(&self) -> Result<()> {
        let call_id = {
            let state = self.lock().await;
            match state.group.as_ref() {
                Some(session) if session.status().is_joined() => session.call_id.clone(),
                _ => return Err(CallError::NoSuchCall),
            }
        };
        self.teardown_group(&call_id, "ended").await;
        if let Err(e) = self.inner.api.end_group_call(&call_id).await {
            warn!(target: "Call/Group", "Failed to end {call_id} on the server: {e}");
        }
        Ok(())
    }

    pub async fn set_group_muted(&self, muted: bool) -> Result<()> {
        let (call_id, epoch, previous, snapshot) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let session = state
                .group
                .as_mut()
                .filter(|s| s.status() == GroupCallStatus::Active)
                .ok_or(CallError::NoSuchCall)?;
            let previous = session.is_muted;
            session.is_muted = muted;
            session
                .participants
                .apply_optimistic(&user_id, |me| me.is_muted = muted);
            (session.call_id.clone(), session.epoch, previous, session.clone())
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));

        let result = match self.inner.engine.set_muted(muted).await {
            Ok(()) => self.inner.api.update_group_mute(&call_id, muted).await,
            Err(e) => Err(e),
        };

        let (snapshot, result) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let Some(session) = state.group_matching(&call_id, epoch) else {
                return result;
            };
            match result {
                Ok(()) => {
                    session.participants.confirm(&user_id);
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "Call/Group", "Mute update failed, rolling back: {e}");
                    session.participants.rollback(&user_id);
                    session.is_muted = previous;
                    (session.clone(), Err(e))
                }
            }
        };
        if let Err(e) = self.inner.engine.set_muted(previous).await {
            debug!(target: "Call/Group", "Engine mute rollback failed: {e}");
        }
        self.notify(CallNotification::GroupCallUpdated(snapshot));
        result
    }

    pub async fn set_group_deafened(&self, deafened: bool) -> Result<()> {
        let (call_id, epoch) = self.active_group().await?;
        self.inner.engine.set_deafened(deafened).await?;
        let snapshot = {
            let mut state = self.lock().await;
            let session = state.group_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            session.is_deafened = deafened;
            session.clone()
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));
        Ok(())
    }

    pub async fn start_group_screen_share(&self) -> Result<()> {
        self.set_group_screen_share(true).await
    }

    pub async fn stop_group_screen_share(&self) -> Result<()> {
        self.set_group_screen_share(false).await
    }

    async fn set_group_screen_share(&self, sharing: bool) -> Result<()> {
        let (call_id, epoch) = self.active_group().await?;
        let result = if sharing {
            self.inner.engine.start_screen_share().await
        } else {
            self.inner.engine.stop_screen_share().await
        };
        if let Err(e) = result {
            self.notify_error(Some(&call_id), &e);
            return Err(e);
        }
        let user_id = self.user_id().await;
        self.mark_group_screen_share(&call_id, epoch, &user_id, sharing)
            .await;
        if let Some(snapshot) = self.group_snapshot().await {
            self.notify(CallNotification::GroupCallUpdated(snapshot));
        }
        Ok(())
    }

    async fn mark_group_screen_share(&self, call_id: &str, epoch: u64, user_id: &str, sharing: bool) {
        {
            let mut state = self.lock().await;
            let Some(session) = state.group_matching(call_id, epoch) else {
                return;
            };
            session.is_screen_sharing = sharing;
            if let Some(me) = session.participants.get_mut(user_id) {
                me.is_screen_sharing = sharing;
            }
        }
        let event = ScreenShareEvent {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.inner.sink.send(if sharing {
            WsOutgoingMessage::ScreenShareStart(event)
        } else {
            WsOutgoingMessage::ScreenShareStop(event)
        });
    }

    pub async fn active_group_call(
        &self,
        conversation_id: &str,
    ) -> Result<Option<crate::client::api::GroupCallInfo>> {
        self.inner.api.get_active_group_call(conversation_id).await
    }

    pub async fn group_snapshot(&self) -> Option<GroupCallSession> {
        self.lock().await.group.clone()
    }

    async fn active_group(&self) -> Result<(String, u64)> {
        let state = self.lock().await;
        match state.group.as_ref() {
            Some(session) if session.status() == GroupCallStatus::Active => {
                Ok((session.call_id.clone(), session.epoch))
            }
            _ => Err(CallError::NoSuchCall),
        }
    }

    /// Ends the group call locally. Nothing is sent to the server.
    pub(crate) async fn teardown_group(&self, call_id: &str, reason: &str) {
        let joined = {
            let mut state = self.lock().await;
            let Some(session) = state.group_by_id(call_id) else {
                return;
            };
            let joined = session.status().is_joined();
            if let Err(e) = state.transition_group(
                GroupCallTransition::Ended {
                    reason: reason.to_string(),
                },
                self.config(),
            ) {
                warn!(target: "Call/Group", "Cannot end {call_id}: {e}");
                return;
            }
            state.group = None;
            joined
        };
        info!(target: "Call/Group", "Group call {call_id} ended: {reason}");
        if joined {
            if let Err(e) = self.inner.engine.stop_group_media().await {
                debug!(target: "Call/Group", "Engine stop: {e}");
            }
        }
        self.notify(CallNotification::GroupCallEnded {
            call_id: call_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub(crate) async fn on_group_ring(&self, event: GroupCallRingEvent) {
        let (snapshot, superseded) = {
            let mut state = self.lock().await;
            if event.initiator_id == state.user_id {
                return;
            }
            if state.group.as_ref().is_some_and(|s| s.call_id == event.call_id) {
                debug!(target: "Call/Group", "Already tracking group call {}", event.call_id);
                return;
            }
            if state.group_joined() {
                (None, None)
            } else {
                let superseded = state.group.as_ref().map(|s| s.call_id.clone());
                let epoch = state.next_epoch();
                let user_id = state.user_id.clone();
                let session = GroupCallSession::ringing(
                    event.call_id.clone(),
                    event.conversation_id.clone(),
                    event.initiator_id.clone(),
                    &user_id,
                    event.announcement.clone(),
                    epoch,
                );
                state.group = Some(session.clone());
                (Some(session), superseded)
            }
        };
        if let Some(previous) = superseded {
            self.notify(CallNotification::GroupCallEnded {
                call_id: previous,
                reason: "superseded".to_string(),
            });
        }
        info!(target: "Call/Group", "Group call {} ringing in {}", event.call_id, event.conversation_id);
        self.notify(CallNotification::GroupCallRinging(event));
        if let Some(snapshot) = snapshot {
            self.notify(CallNotification::GroupCallUpdated(snapshot));
        }
    }

    pub(crate) async fn on_participant_joined(&self, event: ParticipantJoinedEvent) {
        let call_id = event.call_id.clone();
        let (epoch, distribute, snapshot) = {
            let mut state = self.lock().await;
            let Some(session) = state.group_by_id(&call_id) else {
                return;
            };
            session.participants.upsert(
                Participant::new(event.user_id.clone(), ParticipantStatus::Active, event.joined_at)
                    .with_keys(event.identity_public.clone(), event.ephemeral_public.clone()),
            );
            let distribute =
                session.has_announcement() && session.status() == GroupCallStatus::Active;
            (session.epoch, distribute, session.clone())
        };
        info!(target: "Call/Group", "{} joined group call {call_id}", event.user_id);
        self.notify(CallNotification::GroupCallUpdated(snapshot));

        if !distribute {
            debug!(target: "Call/Group", "Not exchanging keys with {} yet", event.user_id);
            return;
        }

        if let Some(bundle) = &event.sender_key {
            if let Err(e) = self
                .inner
                .engine
                .handle_sender_key(&call_id, &event.user_id, bundle)
                .await
            {
                warn!(target: "Call/Group", "Could not ingest sender key from {}: {e}", event.user_id);
            }
        }

        let seed = SenderKeySeed {
            user_id: event.user_id,
            identity_public: event.identity_public,
            ephemeral_public: event.ephemeral_public,
        };
        let manager = self.clone();
        tokio::spawn(async move {
            manager.distribute_sender_key(call_id, epoch, seed).await;
        });
    }

    pub(crate) async fn distribute_sender_key(&self, call_id: String, epoch: u64, recipient: SenderKeySeed) {
        let attempts = self.config().sender_key_attempts.max(1);
        let step = self.config().sender_key_retry_step;

        for attempt in 1..=attempts {
            if !self.still_in_group(&call_id, epoch, &recipient.user_id).await {
                debug!(target: "Call/Group", "Skipping sender key for {}, no longer relevant", recipient.user_id);
                return;
            }
            match self.send_sender_key_once(&call_id, &recipient).await {
                Ok(()) => {
                    debug!(target: "Call/Group", "Sent sender key to {} (attempt {attempt})", recipient.user_id);
                    return;
                }
                Err(e) if attempt < attempts => {
                    debug!(target: "Call/Group", "Sender key to {} failed (attempt {attempt}): {e}", recipient.user_id);
                    sleep(step * attempt).await;
                }
                Err(e) => {
                    warn!(
                        target: "Call/Group",
                        "Giving up on sender key for {} after {attempts} attempts: {e}",
                        recipient.user_id
                    );
                }
            }
        }
    }

    async fn send_sender_key_once(&self, call_id: &str, recipient: &SenderKeySeed) -> Result<()> {
        let bundle = self.inner.engine.create_sender_key(call_id, recipient).await?;
        let request = SendSenderKeyRequest {
            to_user_id: &recipient.user_id,
            bundle: &bundle,
        };
        self.inner.api.send_sender_key(call_id, &request).await
    }

    async fn still_in_group(&self, call_id: &str, epoch: u64, user_id: &str) -> bool {
        let mut state = self.lock().await;
        state
            .group_matching(call_id, epoch)
            .filter(|session| session.status() == GroupCallStatus::Active)
            .and_then(|session| session.participants.get(user_id))
            .is_some_and(Participant::is_active)
    }

    pub(crate) async fn on_sender_key(&self, event: SenderKeyEvent) {
        {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            if state.group_by_id(&event.call_id).is_none() {
                debug!(target: "Call/Group", "Sender key for unknown call {}", event.call_id);
                return;
            }
            if event.bundle.to_user_id != user_id {
                debug!(target: "Call/Group", "Sender key addressed to {}", event.bundle.to_user_id);
                return;
            }
        }
        if let Err(e) = self
            .inner
            .engine
            .handle_sender_key(&event.call_id, &event.from_user_id, &event.bundle)
            .await
        {
            warn!(target: "Call/Group", "Could not ingest sender key from {}: {e}", event.from_user_id);
        }
    }

    pub(crate) async fn on_participant_left(&self, event: ParticipantLeftEvent) {
        let (teardown, snapshot) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            if event.user_id == user_id {
                return;
            }
            let Some(session) = state.group_by_id(&event.call_id) else {
                return;
            };
            session.participants.mark_left(&event.user_id);
            let teardown = session.status() == GroupCallStatus::Left
                && session.participants.all_others_left();
            (teardown, session.clone())
        };
        info!(target: "Call/Group", "{} left group call {}", event.user_id, event.call_id);

        if let Err(e) = self.inner.engine.remove_participant(&event.user_id).await {
            debug!(target: "Call/Group", "Engine remove_participant: {e}");
        }
        if teardown {
            self.teardown_group(&event.call_id, "everyone_left").await;
        } else {
            self.notify(CallNotification::GroupCallUpdated(snapshot));
        }
    }

    pub(crate) async fn on_group_mute(&self, event: MuteUpdateEvent) {
        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.group_by_id(&event.call_id) else {
                return;
            };
            let Some(participant) = session.participants.get_mut(&event.user_id) else {
                return;
            };
            participant.is_muted = event.is_muted;
            session.clone()
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));
    }

    pub(crate) async fn on_group_speaking(&self, event: SpeakingUpdateEvent) {
        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.group_by_id(&event.call_id) else {
                return;
            };
            let level = crate::engine::SpeakingLevel {
                user_id: event.user_id,
                is_speaking: event.is_speaking,
                audio_level: event.audio_level,
            };
            if !session.participants.update_speaking(&[level]) {
                return;
            }
            session.clone()
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));
    }

    pub(crate) async fn on_group_screen_share(&self, event: ScreenShareEvent, sharing: bool) {
        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.group_by_id(&event.call_id) else {
                return;
            };
            let Some(participant) = session.participants.get_mut(&event.user_id) else {
                return;
            };
            participant.is_screen_sharing = sharing;
            session.clone()
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));
    }
}
