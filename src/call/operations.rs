use log::{debug, error, info, warn};
use std::time::Duration;
use uuid::Uuid;

use super::admission::Admission;
use super::session::{CallSession, CallTransition};
use super::types::{CallStatus, EndReason};
use crate::client::api::{AnswerCallRequest, InitiateCallRequest, KeyCompleteRequest, RelayCredentials};
use crate::client::messages::{
    CallAnswerEvent, IncomingCallOffer, KeyCompleteEvent, MediaReadyEvent, MuteUpdateEvent,
    ScreenShareEvent, WsOutgoingMessage,
};
use crate::config::CallConfig;
use crate::engine::CallStats;
use crate::error::{CallError, RejoinBlock, Result};
use crate::manager::{CallManager, CallNotification, State};
use crate::timers::TimerKind;

#[derive(Debug, Clone, Default)]
pub struct IncomingSnapshot {
    pub current: Option<IncomingCallOffer>,
    pub queued: Vec<IncomingCallOffer>,
}

impl State {
    pub(crate) fn transition_direct(
        &mut self,
        transition: CallTransition,
        config: &CallConfig,
    ) -> Result<CallSession> {
        let session = self.direct.as_mut().ok_or(CallError::NoSuchCall)?;
        session.apply_transition(transition)?;
        let epoch = session.epoch;
        let timers = &mut self.direct_timers;

        match session.status() {
            CallStatus::Initiating => timers.arm(TimerKind::Ring, config.ring_timeout, epoch),
            CallStatus::Connecting => {
                timers.clear(TimerKind::Ring);
                timers.arm(TimerKind::KeyExchange, config.key_exchange_timeout, epoch);
            }
            CallStatus::Active => {
                timers.clear(TimerKind::Ring);
                timers.clear(TimerKind::KeyExchange);
                timers.clear(TimerKind::RejoinWindow);
                if !session.peer_left {
                    timers.clear(TimerKind::PeerLeftGrace);
                } else if !timers.is_armed(TimerKind::PeerLeftGrace) {
                    timers.arm(TimerKind::PeerLeftGrace, config.peer_left_grace, epoch);
                }
                timers.ensure_periodic(TimerKind::HealthCheck, config.health_check_interval, epoch);
            }
            CallStatus::Left => {
                timers.clear(TimerKind::PeerLeftGrace);
                if let Some(secs) = session.rejoin_remaining_secs {
                    timers.arm(TimerKind::RejoinWindow, Duration::from_secs(secs), epoch);
                }
                timers.ensure_periodic(TimerKind::HealthCheck, config.health_check_interval, epoch);
            }
            CallStatus::Ended => timers.clear_all(),
            CallStatus::Idle | CallStatus::Ringing => {}
        }

        Ok(session.clone())
    }

    fn direct_matching(&mut self, call_id: &str, epoch: u64) -> Option<&mut CallSession> {
        self.direct
            .as_mut()
            .filter(|session| session.matches(call_id, epoch))
    }

    fn direct_busy(&self) -> bool {
        self.direct
            .as_ref()
            .is_some_and(|session| !session.status().is_terminal())
    }

    pub(crate) fn surface_next_offer(&mut self, config: &CallConfig) -> Option<IncomingCallOffer> {
        let offer = self.admission.promote()?.clone();
        let seq = self.admission.seq();
        self.admission_timers
            .arm(TimerKind::IncomingRing, config.ring_timeout, seq);
        Some(offer)
    }
}

impl CallManager {
    pub async fn initiate_call(
        &self,
        peer_id: &str,
        peer_identity_key: Vec<u8>,
    ) -> Result<CallSession> {
        let replaced = {
            let state = self.lock().await;
            match state.direct.as_ref() {
                Some(session) if matches!(session.status(), CallStatus::Active | CallStatus::Left) => {
                    Some(session.call_id.clone())
                }
                Some(session) if state.direct_busy() => {
                    debug!(target: "Call/Direct", "Refusing to initiate, {} is {:?}", session.call_id, session.status());
                    return Err(CallError::AlreadyInCall);
                }
                _ => None,
            }
        };
        if let Some(previous) = replaced {
            info!(target: "Call/Direct", "Leaving {previous} to place a new call");
            self.step_out_direct(&previous).await;
        }

        let call_id = Uuid::new_v4().to_string();
        let offer = match self.inner.engine.create_offer(&call_id, peer_id).await {
            Ok(offer) => offer,
            Err(e) => {
                error!(target: "Call/Direct", "Failed to create offer: {e}");
                self.notify_error(Some(&call_id), &e);
                return Err(e);
            }
        };

        let request = InitiateCallRequest {
            call_id: call_id.clone(),
            callee_id: peer_id.to_string(),
            ephemeral_kem_public: offer.ephemeral_kem_public,
            signature: offer.signature,
        };
        match self.inner.api.initiate_call(&request).await {
            Ok(response) if response.call_id != call_id => {
                let e = CallError::CallIdMismatch {
                    offered: call_id.clone(),
                    assigned: response.call_id.clone(),
                };
                error!(target: "Call/Direct", "{e}");
                if let Err(clear) = self.inner.engine.clear_state().await {
                    warn!(target: "Call/Direct", "Engine rollback failed: {clear}");
                }
                if let Err(cancel) = self.inner.api.cancel_call(&response.call_id).await {
                    warn!(target: "Call/Direct", "Failed to cancel {}: {cancel}", response.call_id);
                }
                self.notify_error(Some(&call_id), &e);
                return Err(e);
            }
            Ok(_) => {}
            Err(e) => {
                error!(target: "Call/Direct", "Initiate failed, rolling back engine state: {e}");
                if let Err(clear) = self.inner.engine.clear_state().await {
                    warn!(target: "Call/Direct", "Engine rollback failed: {clear}");
                }
                self.notify(CallNotification::Error {
                    call_id: Some(call_id),
                    message: e.to_string(),
                    user_facing: true,
                });
                return Err(e);
            }
        }

        let snapshot = {
            let mut state = self.lock().await;
            if state.direct_busy() {
                None
            } else {
                let epoch = state.next_epoch();
                state.direct = Some(CallSession::new_outgoing(
                    call_id.clone(),
                    peer_id.to_string(),
                    peer_identity_key,
                    epoch,
                ));
                Some(state.transition_direct(CallTransition::Initiated, self.config())?)
            }
        };
        let Some(snapshot) = snapshot else {
            warn!(target: "Call/Direct", "Another call started while initiating {call_id}");
            if let Err(e) = self.inner.engine.clear_state().await {
                warn!(target: "Call/Direct", "Engine rollback failed: {e}");
            }
            if let Err(e) = self.inner.api.cancel_call(&call_id).await {
                warn!(target: "Call/Direct", "Failed to cancel superseded call: {e}");
            }
            return Err(CallError::AlreadyInCall);
        };

        info!(target: "Call/Direct", "Calling {peer_id} ({})", snapshot.call_id);
        self.notify(CallNotification::CallUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn accept_incoming(&self) -> Result<CallSession> {
        let replaced = {
            let state = self.lock().await;
            if state.admission.current().is_none() {
                return Err(CallError::NoSuchCall);
            }
            match state.direct.as_ref() {
                Some(session) if matches!(session.status(), CallStatus::Active | CallStatus::Left) => {
                    Some(session.call_id.clone())
                }
                Some(_) if state.direct_busy() => return Err(CallError::AlreadyInCall),
                _ => None,
            }
        };
        if let Some(previous) = replaced {
            info!(target: "Call/Direct", "Leaving {previous} to take an incoming call");
            self.step_out_direct(&previous).await;
        }

        let (offer, epoch, snapshot, promoted) = {
            let mut state = self.lock().await;
            if state.direct_busy() {
                return Err(CallError::AlreadyInCall);
            }
            let offer = state.admission.take_current().ok_or(CallError::NoSuchCall)?;
            state.admission_timers.clear(TimerKind::IncomingRing);
            let epoch = state.next_epoch();
            let mut session =
                CallSession::new_incoming(offer.call_id.clone(), offer.caller_id.clone(), epoch);
            session.peer_username = offer.caller_username.clone();
            state.direct = Some(session);
            let snapshot = state.transition_direct(CallTransition::IncomingAccepted, self.config())?;
            let promoted = state.surface_next_offer(self.config());
            (offer, epoch, snapshot, promoted)
        };
        let call_id = offer.call_id.clone();
        info!(target: "Call/Direct", "Accepted call {call_id} from {}", offer.caller_id);
        self.notify(CallNotification::CallUpdated(snapshot));
        self.announce_offer(promoted);

        let answer = match self.inner.engine.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(target: "Call/Direct", "Engine refused offer {call_id}: {e}");
                self.notify_error(Some(&call_id), &e);
                self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                    .await;
                return Err(e);
            }
        };

        let snapshot = {
            let mut state = self.lock().await;
            if state.direct_matching(&call_id, epoch).is_none() {
                return Err(CallError::Stale);
            }
            state.transition_direct(CallTransition::AnswerSent, self.config())?
        };
        self.notify(CallNotification::CallUpdated(snapshot.clone()));

        let request = AnswerCallRequest {
            ephemeral_kem_public: answer.ephemeral_kem_public,
            kem_ciphertext: answer.kem_ciphertext,
            signature: answer.signature,
        };
        if let Err(e) = self.inner.api.answer_call(&call_id, &request).await {
            error!(target: "Call/Direct", "Failed to answer {call_id}: {e}");
            self.notify_error(Some(&call_id), &e);
            self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                .await;
            return Err(e);
        }
        Ok(snapshot)
    }

    pub async fn decline_incoming(&self) -> Result<()> {
        let (offer, promoted) = {
            let mut state = self.lock().await;
            let offer = state.admission.take_current().ok_or(CallError::NoSuchCall)?;
            state.admission_timers.clear(TimerKind::IncomingRing);
            let promoted = state.surface_next_offer(self.config());
            (offer, promoted)
        };
        self.finish_offer(&offer.call_id, EndReason::Declined, true)
            .await;
        self.announce_offer(promoted);
        Ok(())
    }

    pub async fn leave_call(&self) -> Result<()> {
        self.leave_direct(false).await
    }

    pub async fn end_call(&self) -> Result<()> {
        let call_id = {
            let state = self.lock().await;
            match state.direct.as_ref() {
                Some(session) if !session.status().is_terminal() => session.call_id.clone(),
                _ => return Err(CallError::NoSuchCall),
            }
        };
        self.terminate_direct(&call_id, EndReason::Hangup, true)
            .await;
        Ok(())
    }

    pub async fn rejoin_call(&self) -> Result<CallSession> {
        self.rejoin_direct().await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        let (call_id, epoch) = self.active_direct().await?;
        self.inner.engine.set_muted(muted).await?;

        let (snapshot, user_id) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let session = state.direct_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            session.is_muted = muted;
            (session.clone(), user_id)
        };
        self.inner.sink.send(WsOutgoingMessage::CallMuteUpdate(MuteUpdateEvent {
            call_id,
            user_id,
            is_muted: muted,
        }));
        self.notify(CallNotification::CallUpdated(snapshot));
        Ok(())
    }

    pub async fn set_deafened(&self, deafened: bool) -> Result<()> {
        let (call_id, epoch) = self.active_direct().await?;
        self.inner.engine.set_deafened(deafened).await?;

        let snapshot = {
            let mut state = self.lock().await;
            let session = state.direct_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            session.is_deafened = deafened;
            session.clone()
        };
        self.notify(CallNotification::CallUpdated(snapshot));
        Ok(())
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.set_screen_share(true).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.set_screen_share(false).await
    }

    pub async fn call_stats(&self) -> Result<CallStats> {
        self.active_direct().await?;
        self.inner.engine.call_stats().await
    }

    pub async fn call_snapshot(&self) -> Option<CallSession> {
        self.lock().await.direct.clone()
    }

    pub async fn incoming_snapshot(&self) -> IncomingSnapshot {
        let state = self.lock().await;
        IncomingSnapshot {
            current: state.admission.current().cloned(),
            queued: state.admission.queued().cloned().collect(),
        }
    }

    /// Seeds a `Left` session from a call the server still considers
    /// rejoinable, e.g. after an app restart.
    pub async fn resume_rejoinable(&self) -> Result<Option<CallSession>> {
        let Some(rejoinable) = self.inner.api.get_rejoinable_call().await? else {
            return Ok(None);
        };
        if !rejoinable.can_rejoin {
            debug!(target: "Call/Direct", "Call {} is not rejoinable", rejoinable.call_id);
            return Ok(None);
        }
        // The engine may outlive the app's view of the call.
        let engine_state = match self.inner.engine.call_state().await {
            Ok(engine_state) => {
                Some(engine_state).filter(|e| e.call_id.as_deref() == Some(&*rejoinable.call_id))
            }
            Err(e) => {
                debug!(target: "Call/Direct", "Engine state unavailable: {e}");
                None
            }
        };

        let snapshot = {
            let mut state = self.lock().await;
            if state.direct_busy() {
                return Err(CallError::AlreadyInCall);
            }
            let epoch = state.next_epoch();
            let mut session = CallSession::new_incoming(
                rejoinable.call_id.clone(),
                rejoinable.peer_id.clone(),
                epoch,
            );
            if rejoinable.is_caller {
                session.role = super::types::CallRole::Caller;
            }
            session.peer_username = rejoinable.peer_username.clone();
            session.relay_expires_at = rejoinable.relay_expires_at;
            session.rejoin_remaining_secs = rejoinable.rejoin_remaining_secs;
            if let Some(engine_state) = &engine_state {
                session.is_muted = engine_state.is_muted;
                session.is_deafened = engine_state.is_deafened;
            }
            state.direct = Some(session);
            state.transition_direct(CallTransition::Restored, self.config())?
        };
        info!(target: "Call/Direct", "Restored rejoinable call {}", snapshot.call_id);
        self.notify(CallNotification::CallUpdated(snapshot.clone()));
        Ok(Some(snapshot))
    }

    pub(crate) async fn leave_direct(&self, auto_rejoin: bool) -> Result<()> {
        let snapshot = {
            let mut state = self.lock().await;
            let session = state.direct.as_mut().ok_or(CallError::NoSuchCall)?;
            if session.status() != CallStatus::Active {
                return Err(CallError::NoSuchCall);
            }
            session.auto_rejoin = auto_rejoin;
            state.transition_direct(CallTransition::Left { can_rejoin: true }, self.config())?
        };
        let call_id = snapshot.call_id.clone();
        info!(target: "Call/Direct", "Left call {call_id} (auto rejoin: {auto_rejoin})");
        self.notify(CallNotification::CallUpdated(snapshot));

        if let Err(e) = self.inner.engine.leave_call().await {
            warn!(target: "Call/Direct", "Engine leave failed for {call_id}: {e}");
        }
        if let Err(e) = self.inner.api.leave_call(&call_id).await {
            warn!(target: "Call/Direct", "Failed to sync leave for {call_id}: {e}");
        }
        Ok(())
    }

    pub(crate) async fn rejoin_direct(&self) -> Result<CallSession> {
        let (call_id, epoch) = {
            let state = self.lock().await;
            let session = state.direct.as_ref().ok_or(CallError::NoSuchCall)?;
            if session.status() != CallStatus::Left {
                return Err(CallError::RejoinUnavailable(RejoinBlock::NotLeft));
            }
            if !session.can_rejoin {
                return Err(CallError::RejoinUnavailable(RejoinBlock::WindowElapsed));
            }
            (session.call_id.clone(), session.epoch)
        };

        let relay = match self.fetch_rejoin_relay(&call_id).await {
            Ok(relay) => relay,
            Err(e) => {
                warn!(target: "Call/Direct", "Rejoin of {call_id} failed: {e}");
                self.notify_error(Some(&call_id), &e);
                return Err(e);
            }
        };

        {
            let mut state = self.lock().await;
            if state.direct_matching(&call_id, epoch).is_none() {
                return Err(CallError::Stale);
            }
        }
        if let Err(e) = self.inner.engine.start_media(&call_id, &relay).await {
            warn!(target: "Call/Direct", "Media restart failed for {call_id}: {e}");
            self.notify_error(Some(&call_id), &e);
            return Err(e);
        }

        let (snapshot, reshare, user_id) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let session = state.direct_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            session.relay_expires_at = Some(relay.expires_at);
            let reshare = std::mem::take(&mut session.was_screen_sharing);
            let snapshot = state.transition_direct(CallTransition::Rejoined, self.config())?;
            (snapshot, reshare, user_id)
        };
        info!(target: "Call/Direct", "Rejoined call {call_id}");

        if reshare {
            self.reshare_screen(&call_id, epoch, &user_id).await;
        }
        let snapshot = self.call_snapshot().await.unwrap_or(snapshot);
        self.notify(CallNotification::CallUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    async fn fetch_rejoin_relay(&self, call_id: &str) -> Result<RelayCredentials> {
        self.inner.engine.prepare_rejoin(call_id).await?;
        self.inner.api.rejoin_call(call_id).await
    }

    async fn reshare_screen(&self, call_id: &str, epoch: u64, user_id: &str) {
        if let Err(e) = self.inner.engine.start_screen_share().await {
            warn!(target: "Call/Direct", "Could not resume screen share: {e}");
            return;
        }
        {
            let mut state = self.lock().await;
            match state.direct_matching(call_id, epoch) {
                Some(session) => session.is_screen_sharing = true,
                None => return,
            }
        }
        self.inner.sink.send(WsOutgoingMessage::ScreenShareStart(ScreenShareEvent {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        }));
    }

    async fn set_screen_share(&self, sharing: bool) -> Result<()> {
        let (call_id, epoch) = self.active_direct().await?;
        let result = if sharing {
            self.inner.engine.start_screen_share().await
        } else {
            self.inner.engine.stop_screen_share().await
        };
        if let Err(e) = result {
            self.notify_error(Some(&call_id), &e);
            return Err(e);
        }

        let (snapshot, user_id) = {
            let mut state = self.lock().await;
            let user_id = state.user_id.clone();
            let session = state.direct_matching(&call_id, epoch).ok_or(CallError::Stale)?;
            session.is_screen_sharing = sharing;
            (session.clone(), user_id)
        };
        let event = ScreenShareEvent { call_id, user_id };
        self.inner.sink.send(if sharing {
            WsOutgoingMessage::ScreenShareStart(event)
        } else {
            WsOutgoingMessage::ScreenShareStop(event)
        });
        self.notify(CallNotification::CallUpdated(snapshot));
        Ok(())
    }

    async fn active_direct(&self) -> Result<(String, u64)> {
        let state = self.lock().await;
        match state.direct.as_ref() {
            Some(session) if session.status() == CallStatus::Active => {
                Ok((session.call_id.clone(), session.epoch))
            }
            _ => Err(CallError::NoSuchCall),
        }
    }

    pub(crate) async fn terminate_direct(&self, call_id: &str, reason: EndReason, notify_remote: bool) {
        let (ended, before, promoted) = {
            let mut state = self.lock().await;
            let Some(session) = state.direct.as_ref() else {
                return;
            };
            if session.call_id != call_id || session.status().is_terminal() {
                return;
            }
            let before = session.status();
            let ended = match state.transition_direct(CallTransition::Ended { reason }, self.config()) {
                Ok(ended) => ended,
                Err(e) => {
                    warn!(target: "Call/Direct", "Cannot end {call_id}: {e}");
                    return;
                }
            };
            state.direct = None;
            let promoted = state.surface_next_offer(self.config());
            (ended, before, promoted)
        };
        info!(target: "Call/Direct", "Call {call_id} ended: {reason:?}");
        self.notify(CallNotification::CallEnded {
            call_id: call_id.to_string(),
            reason,
        });
        self.announce_offer(promoted);

        if notify_remote {
            let result = match (ended.is_caller(), before) {
                (true, CallStatus::Initiating | CallStatus::Connecting) => {
                    self.inner.api.cancel_call(call_id).await
                }
                (false, CallStatus::Ringing) => {
                    self.inner.api.reject_call(call_id, reason.as_wire()).await
                }
                _ => self.inner.api.end_call(call_id, reason.as_wire()).await,
            };
            if let Err(e) = result {
                warn!(target: "Call/Direct", "Failed to report end of {call_id}: {e}");
            }
        }
        if before == CallStatus::Active {
            if let Err(e) = self.inner.engine.stop_media().await {
                debug!(target: "Call/Direct", "Engine stop_media: {e}");
            }
        }
        if let Err(e) = self.inner.engine.end_call().await {
            debug!(target: "Call/Direct", "Engine end_call: {e}");
        }
    }

    /// Frees the local slot held by an active or left call without ending it
    /// on the server, so the call stays rejoinable there.
    async fn step_out_direct(&self, call_id: &str) {
        let before = {
            let mut state = self.lock().await;
            let Some(before) = state
                .direct
                .as_ref()
                .filter(|s| s.call_id == call_id && !s.status().is_terminal())
                .map(CallSession::status)
            else {
                return;
            };
            let ended = CallTransition::Ended {
                reason: EndReason::Replaced,
            };
            if let Err(e) = state.transition_direct(ended, self.config()) {
                warn!(target: "Call/Direct", "Cannot step out of {call_id}: {e}");
                return;
            }
            state.direct = None;
            before
        };
        self.notify(CallNotification::CallEnded {
            call_id: call_id.to_string(),
            reason: EndReason::Replaced,
        });

        if before == CallStatus::Active {
            if let Err(e) = self.inner.engine.leave_call().await {
                warn!(target: "Call/Direct", "Engine leave failed for {call_id}: {e}");
            }
            if let Err(e) = self.inner.api.leave_call(call_id).await {
                warn!(target: "Call/Direct", "Failed to sync leave for {call_id}: {e}");
            }
        }
    }

    async fn finish_offer(&self, call_id: &str, reason: EndReason, notify_remote: bool) {
        info!(target: "Call/Admission", "Offer {call_id} resolved: {reason:?}");
        self.notify(CallNotification::CallEnded {
            call_id: call_id.to_string(),
            reason,
        });
        if notify_remote {
            if let Err(e) = self.inner.api.reject_call(call_id, reason.as_wire()).await {
                warn!(target: "Call/Admission", "Failed to decline {call_id}: {e}");
            }
        }
    }

    fn announce_offer(&self, offer: Option<IncomingCallOffer>) {
        if let Some(offer) = offer {
            info!(target: "Call/Admission", "Surfacing call {} from {}", offer.call_id, offer.caller_id);
            self.notify(CallNotification::IncomingCall(offer));
            self.notify(CallNotification::BringToForeground);
        }
    }

    pub(crate) async fn on_call_offer(&self, offer: IncomingCallOffer) {
        let call_id = offer.call_id.clone();
        let admission = {
            let mut state = self.lock().await;
            if offer.callee_id != state.user_id {
                debug!(target: "Call/Admission", "Offer {call_id} is addressed to someone else");
                return;
            }
            if state.direct.as_ref().is_some_and(|s| s.call_id == call_id) {
                debug!(target: "Call/Admission", "Offer {call_id} is already our call");
                return;
            }
            let admission = state.admission.admit(offer.clone());
            if admission == Admission::Surface {
                let seq = state.admission.seq();
                state
                    .admission_timers
                    .arm(TimerKind::IncomingRing, self.config().ring_timeout, seq);
            }
            admission
        };

        match admission {
            Admission::Surface => self.announce_offer(Some(offer)),
            Admission::Queued => debug!(target: "Call/Admission", "Queued offer {call_id}"),
            Admission::Duplicate => debug!(target: "Call/Admission", "Duplicate offer {call_id}"),
            Admission::Overflow => {
                info!(target: "Call/Admission", "Queue full, declining {call_id} as busy");
                if let Err(e) = self
                    .inner
                    .api
                    .reject_call(&call_id, EndReason::Busy.as_wire())
                    .await
                {
                    warn!(target: "Call/Admission", "Busy decline for {call_id} failed: {e}");
                }
            }
        }
    }

    pub(crate) async fn on_incoming_ring_timeout(&self, seq: u64) {
        let (offer, promoted) = {
            let mut state = self.lock().await;
            if state.admission.seq() != seq {
                return;
            }
            let Some(offer) = state.admission.take_current() else {
                return;
            };
            let promoted = state.surface_next_offer(self.config());
            (offer, promoted)
        };
        self.finish_offer(&offer.call_id, EndReason::NoAnswer, true)
            .await;
        self.announce_offer(promoted);
    }

    /// `call_cancel` / `call_missed`: the offer may still be waiting in
    /// admission, or may already be our session.
    pub(crate) async fn on_remote_withdraw(&self, call_id: &str, reason: EndReason) {
        let withdrawn = {
            let mut state = self.lock().await;
            match state.admission.withdraw(call_id) {
                Some(was_current) => {
                    let promoted = if was_current {
                        state.admission_timers.clear(TimerKind::IncomingRing);
                        state.surface_next_offer(self.config())
                    } else {
                        None
                    };
                    Some(promoted)
                }
                None => None,
            }
        };

        match withdrawn {
            Some(promoted) => {
                self.finish_offer(call_id, reason, false).await;
                self.announce_offer(promoted);
            }
            None => self.terminate_direct(call_id, reason, false).await,
        }
    }

    pub(crate) async fn on_remote_end(&self, call_id: &str, reason: EndReason) {
        self.terminate_direct(call_id, reason, false).await;
    }

    pub(crate) async fn on_direct_timeout(&self, epoch: u64, reason: EndReason) {
        let call_id = {
            let state = self.lock().await;
            let Some(session) = state.direct.as_ref().filter(|s| s.epoch == epoch) else {
                return;
            };
            let due = match reason {
                EndReason::NoAnswer => session.status() == CallStatus::Initiating,
                EndReason::KeyExchangeTimeout => session.status() == CallStatus::Connecting,
                EndReason::PeerLeftTimeout => {
                    session.status() == CallStatus::Active && session.peer_left
                }
                EndReason::RejoinExpired => session.status() == CallStatus::Left,
                _ => false,
            };
            if !due {
                return;
            }
            session.call_id.clone()
        };
        warn!(target: "Call/Direct", "Call {call_id} timed out: {reason:?}");
        self.terminate_direct(&call_id, reason, true).await;
    }

    pub(crate) async fn on_call_answer(&self, answer: CallAnswerEvent) {
        let call_id = answer.call_id.clone();
        let prepared = {
            let mut state = self.lock().await;
            let Some(session) = state.direct.as_ref() else {
                return;
            };
            if session.call_id != call_id
                || !session.is_caller()
                || session.status() != CallStatus::Initiating
            {
                debug!(target: "Call/Direct", "Ignoring answer for {call_id}");
                return;
            }
            let epoch = session.epoch;
            match session.peer_identity_key.clone() {
                Some(identity) => state
                    .transition_direct(CallTransition::AnswerReceived, self.config())
                    .map(|snapshot| (epoch, identity, snapshot))
                    .ok(),
                None => None,
            }
        };
        let Some((epoch, identity, snapshot)) = prepared else {
            let error = CallError::MissingPeerIdentityKey(call_id.clone());
            error!(target: "Call/Direct", "{error}");
            self.notify_error(Some(&call_id), &error);
            self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                .await;
            return;
        };
        self.notify(CallNotification::CallUpdated(snapshot));

        let material = match self
            .inner
            .engine
            .complete_key_exchange_caller(&answer, &identity)
            .await
        {
            Ok(material) => material,
            Err(e) => {
                error!(target: "Call/Direct", "Key exchange failed for {call_id}: {e}");
                self.notify_error(Some(&call_id), &e);
                self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                    .await;
                return;
            }
        };
        if !self.direct_still(&call_id, epoch, CallStatus::Connecting).await {
            return;
        }

        let request = KeyCompleteRequest {
            kem_ciphertext: material.kem_ciphertext,
        };
        let response = match self.inner.api.complete_key_exchange(&call_id, &request).await {
            Ok(response) => response,
            Err(e) => {
                error!(target: "Call/Direct", "Key-complete rejected for {call_id}: {e}");
                self.notify_error(Some(&call_id), &e);
                self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                    .await;
                return;
            }
        };

        let relay = {
            let mut state = self.lock().await;
            let Some(session) = state.direct_matching(&call_id, epoch) else {
                return;
            };
            session.key_exchange_done = true;
            let buffered = session.pending_media_ready.take();
            response.relay.or(buffered)
        };
        debug!(target: "Call/Direct", "Key exchange complete for {call_id} (caller)");
        if let Some(relay) = relay {
            self.apply_media(&call_id, epoch, relay).await;
        }
    }

    pub(crate) async fn on_key_complete(&self, event: KeyCompleteEvent) {
        let call_id = event.call_id.clone();
        let epoch = {
            let state = self.lock().await;
            match state.direct.as_ref() {
                Some(session)
                    if session.call_id == call_id
                        && !session.is_caller()
                        && session.status() == CallStatus::Connecting
                        && !session.key_exchange_done =>
                {
                    session.epoch
                }
                _ => {
                    debug!(target: "Call/Direct", "Ignoring key-complete for {call_id}");
                    return;
                }
            }
        };

        if let Err(e) = self.inner.engine.complete_key_exchange_callee(&event).await {
            error!(target: "Call/Direct", "Key exchange failed for {call_id}: {e}");
            self.notify_error(Some(&call_id), &e);
            self.terminate_direct(&call_id, EndReason::KeyExchangeFailed, true)
                .await;
            return;
        }

        let buffered = {
            let mut state = self.lock().await;
            let Some(session) = state.direct_matching(&call_id, epoch) else {
                return;
            };
            session.key_exchange_done = true;
            session.pending_media_ready.take()
        };
        debug!(target: "Call/Direct", "Key exchange complete for {call_id} (callee)");
        if let Some(relay) = buffered {
            self.apply_media(&call_id, epoch, relay).await;
        }
    }

    /// Relay credentials arrived. Before key exchange finishes they are held
    /// back; a later duplicate replaces the held one.
    pub(crate) async fn on_media_ready(&self, event: MediaReadyEvent) {
        let call_id = event.call_id.clone();
        let epoch = {
            let mut state = self.lock().await;
            let Some(session) = state.direct.as_mut().filter(|s| s.call_id == call_id) else {
                debug!(target: "Call/Direct", "Media ready for unknown call {call_id}");
                return;
            };
            if session.media_applied || session.status() != CallStatus::Connecting {
                debug!(target: "Call/Direct", "Media already applied for {call_id}");
                return;
            }
            if !session.key_exchange_done {
                if session.pending_media_ready.is_some() {
                    debug!(target: "Call/Direct", "Replacing buffered relay for {call_id}");
                }
                session.pending_media_ready = Some(event.relay);
                return;
            }
            session.epoch
        };
        self.apply_media(&call_id, epoch, event.relay).await;
    }

    async fn apply_media(&self, call_id: &str, epoch: u64, relay: RelayCredentials) {
        {
            let mut state = self.lock().await;
            let Some(session) = state.direct_matching(call_id, epoch) else {
                return;
            };
            if session.media_applied || session.status() != CallStatus::Connecting {
                return;
            }
            session.media_applied = true;
            session.relay_expires_at = Some(relay.expires_at);
        }

        if let Err(e) = self.inner.engine.start_media(call_id, &relay).await {
            error!(target: "Call/Direct", "Media start failed for {call_id}: {e}");
            self.notify_error(Some(call_id), &e);
            self.terminate_direct(call_id, EndReason::MediaFailed, true)
                .await;
            return;
        }

        let snapshot = {
            let mut state = self.lock().await;
            if state.direct_matching(call_id, epoch).is_none() {
                return;
            }
            match state.transition_direct(CallTransition::MediaStarted, self.config()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(target: "Call/Direct", "{e}");
                    return;
                }
            }
        };
        info!(target: "Call/Direct", "Call {call_id} is active");
        self.notify(CallNotification::CallUpdated(snapshot));
    }

    pub(crate) async fn on_peer_left(&self, call_id: &str) {
        let snapshot = {
            let mut state = self.lock().await;
            let grace = self.config().peer_left_grace;
            let Some(session) = state.direct.as_mut().filter(|s| s.call_id == call_id) else {
                return;
            };
            session.peer_left = true;
            let epoch = session.epoch;
            let active = session.status() == CallStatus::Active;
            let snapshot = session.clone();
            if active {
                state
                    .direct_timers
                    .arm(TimerKind::PeerLeftGrace, grace, epoch);
            }
            snapshot
        };
        info!(target: "Call/Direct", "Peer left call {call_id}");
        self.notify(CallNotification::CallUpdated(snapshot));
    }

    pub(crate) async fn on_peer_rejoined(&self, call_id: &str) {
        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.direct.as_mut().filter(|s| s.call_id == call_id) else {
                return;
            };
            session.peer_left = false;
            let snapshot = session.clone();
            state.direct_timers.clear(TimerKind::PeerLeftGrace);
            snapshot
        };
        info!(target: "Call/Direct", "Peer rejoined call {call_id}");
        self.notify(CallNotification::CallUpdated(snapshot));
    }

    pub(crate) async fn on_screen_share(&self, event: ScreenShareEvent, sharing: bool) {
        let direct = {
            let mut state = self.lock().await;
            match state.direct.as_mut().filter(|s| s.call_id == event.call_id) {
                Some(session) => {
                    session.peer_screen_sharing = sharing;
                    Some(session.clone())
                }
                None => None,
            }
        };
        match direct {
            Some(snapshot) => self.notify(CallNotification::CallUpdated(snapshot)),
            None => self.on_group_screen_share(event, sharing).await,
        }
    }

    pub(crate) async fn on_peer_mute(&self, event: MuteUpdateEvent) {
        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.direct.as_mut().filter(|s| s.call_id == event.call_id) else {
                return;
            };
            session.peer_muted = event.is_muted;
            session.clone()
        };
        self.notify(CallNotification::CallUpdated(snapshot));
    }

    async fn direct_still(&self, call_id: &str, epoch: u64, status: CallStatus) -> bool {
        let mut state = self.lock().await;
        let current = state
            .direct_matching(call_id, epoch)
            .is_some_and(|session| session.status() == status);
        if !current {
            debug!(target: "Call/Direct", "Call {call_id} moved on while awaiting, dropping continuation");
        }
        current
    }
}
