use chrono::Utc;
use log::{debug, info, warn};

use crate::call::{CallStatus, EndReason};
use crate::client::api::{expires_within, ParticipantStatus};
use crate::error::{CallError, RejoinBlock};
use crate::group_call::GroupCallStatus;
use crate::manager::{CallManager, CallNotification};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    NetworkOnline,
    NetworkOffline,
    Visible,
    Hidden,
}

impl CallManager {
    pub(crate) async fn on_environment(&self, event: EnvironmentEvent) {
        debug!(target: "Call/Liveness", "Environment: {event:?}");
        match event {
            EnvironmentEvent::NetworkOffline => self.on_network_lost().await,
            EnvironmentEvent::NetworkOnline => self.recover().await,
            EnvironmentEvent::Visible => {
                self.check_direct_health().await;
                self.refresh_group_token().await;
            }
            EnvironmentEvent::Hidden => {}
        }
    }

    async fn on_network_lost(&self) {
        let (direct_active, group_active) = {
            let state = self.lock().await;
            (
                state
                    .direct
                    .as_ref()
                    .is_some_and(|s| s.status() == CallStatus::Active),
                state
                    .group
                    .as_ref()
                    .is_some_and(|s| s.status() == GroupCallStatus::Active),
            )
        };
        if direct_active {
            info!(target: "Call/Liveness", "Network lost, leaving 1:1 call until it returns");
            if let Err(e) = self.leave_direct(true).await {
                debug!(target: "Call/Liveness", "Leave on network loss: {e}");
            }
        }
        if group_active {
            info!(target: "Call/Liveness", "Network lost, leaving group call until it returns");
            if let Err(e) = self.leave_group(true).await {
                debug!(target: "Call/Liveness", "Group leave on network loss: {e}");
            }
        }
    }

    pub(crate) async fn recover(&self) {
        self.recover_direct().await;
        self.recover_group().await;
    }

    async fn recover_direct(&self) {
        let (call_id, epoch) = {
            let state = self.lock().await;
            match state.direct.as_ref() {
                Some(s) if s.status() == CallStatus::Left && s.auto_rejoin => {
                    (s.call_id.clone(), s.epoch())
                }
                _ => return,
            }
        };

        let rejoinable = match self.inner.api.get_rejoinable_call().await {
            Ok(rejoinable) => rejoinable,
            Err(e) => {
                warn!(target: "Call/Liveness", "Could not check rejoin eligibility for {call_id}: {e}");
                return;
            }
        };

        let eligible = {
            let mut state = self.lock().await;
            let Some(session) = state
                .direct
                .as_mut()
                .filter(|s| s.matches(&call_id, epoch))
            else {
                return;
            };
            match rejoinable.filter(|r| r.call_id == call_id) {
                Some(r) if r.can_rejoin => {
                    session.can_rejoin = true;
                    session.rejoin_remaining_secs = r.rejoin_remaining_secs;
                    if r.relay_expires_at.is_some() {
                        session.relay_expires_at = r.relay_expires_at;
                    }
                    true
                }
                _ => {
                    session.can_rejoin = false;
                    false
                }
            }
        };

        if !eligible {
            info!(target: "Call/Liveness", "Call {call_id} is no longer rejoinable");
            self.notify_error(
                Some(&call_id),
                &CallError::RejoinUnavailable(RejoinBlock::NotEligible),
            );
            self.terminate_direct(&call_id, EndReason::RejoinExpired, false)
                .await;
            return;
        }

        info!(target: "Call/Liveness", "Rejoining {call_id} after reconnect");
        if let Err(e) = self.rejoin_direct().await {
            warn!(target: "Call/Liveness", "Automatic rejoin of {call_id} failed: {e}");
        }
    }

    async fn recover_group(&self) {
        let (call_id, epoch, user_id) = {
            let state = self.lock().await;
            match state.group.as_ref() {
                Some(s) if s.status() == GroupCallStatus::Left => {
                    (s.call_id.clone(), s.epoch(), state.user_id.clone())
                }
                _ => return,
            }
        };

        let info = match self.inner.api.get_group_call(&call_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "Call/Liveness", "Could not refresh group call {call_id}: {e}");
                return;
            }
        };
        if info.status.is_terminal() || !info.has_active_besides(&user_id) {
            info!(target: "Call/Liveness", "Group call {call_id} is over, tearing down");
            self.teardown_group(&call_id, "ended").await;
            return;
        }

        let auto_rejoin = {
            let mut state = self.lock().await;
            let Some(session) = state.group_matching(&call_id, epoch) else {
                return;
            };
            session.participants.reconcile(&info.participants);
            session.participants.set_self_status(ParticipantStatus::Left);
            session.auto_rejoin
        };
        if auto_rejoin {
            info!(target: "Call/Liveness", "Rejoining group call {call_id} after reconnect");
            if let Err(e) = self.rejoin_group().await {
                warn!(target: "Call/Liveness", "Automatic group rejoin of {call_id} failed: {e}");
            }
        } else if let Some(snapshot) = self.group_snapshot().await {
            self.notify(CallNotification::GroupCallUpdated(snapshot));
        }
    }

    pub(crate) async fn check_direct_health(&self) {
        let (call_id, epoch) = {
            let state = self.lock().await;
            match state.direct.as_ref() {
                Some(s) if matches!(s.status(), CallStatus::Active | CallStatus::Left) => {
                    (s.call_id.clone(), s.epoch())
                }
                _ => return,
            }
        };

        let status = match self.inner.api.get_call(&call_id).await {
            Ok(status) => status,
            Err(e) => {
                debug!(target: "Call/Liveness", "Health check for {call_id} failed: {e}");
                return;
            }
        };
        if status.status.is_terminal() {
            info!(target: "Call/Liveness", "Server reports {call_id} as {:?}", status.status);
            self.terminate_direct(&call_id, EndReason::ServerEnded, false)
                .await;
            return;
        }

        let rotate = {
            let mut state = self.lock().await;
            let margin = self.config().token_refresh_margin;
            let Some(session) = state
                .direct
                .as_mut()
                .filter(|s| s.matches(&call_id, epoch))
            else {
                return;
            };
            if status.relay_expires_at.is_some() {
                session.relay_expires_at = status.relay_expires_at;
            }
            if session.status() == CallStatus::Left {
                session.can_rejoin = status.can_rejoin;
                session.rejoin_remaining_secs = status.rejoin_remaining_secs;
            }
            session.status() == CallStatus::Active
                && session
                    .relay_expires_at
                    .is_some_and(|expires| expires_within(expires, Utc::now(), margin))
        };
        if !rotate {
            return;
        }

        info!(target: "Call/Liveness", "Relay token for {call_id} expiring, rotating");
        if let Err(e) = self.leave_direct(true).await {
            warn!(target: "Call/Liveness", "Rotation leave failed for {call_id}: {e}");
            return;
        }
        if let Err(e) = self.rejoin_direct().await {
            warn!(target: "Call/Liveness", "Rotation rejoin failed for {call_id}: {e}");
        }
    }

    pub(crate) async fn refresh_group_token(&self) {
        let (call_id, epoch) = {
            let state = self.lock().await;
            let threshold = self.config().group_token_refresh_threshold;
            let Some(session) = state
                .group
                .as_ref()
                .filter(|s| s.status() == GroupCallStatus::Active)
            else {
                return;
            };
            let due = session
                .relay_expires_at
                .is_some_and(|expires| expires_within(expires, Utc::now(), threshold));
            if !due {
                return;
            }
            (session.call_id.clone(), session.epoch())
        };

        let relay = match self.inner.api.refresh_group_token(&call_id).await {
            Ok(relay) => relay,
            Err(e) => {
                warn!(target: "Call/Liveness", "Group token refresh for {call_id} failed: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.engine.update_relay_token(&relay).await {
            warn!(target: "Call/Liveness", "Engine rejected new relay token for {call_id}: {e}");
            return;
        }

        let mut state = self.lock().await;
        if let Some(session) = state.group_matching(&call_id, epoch) {
            session.relay_expires_at = Some(relay.expires_at);
            debug!(target: "Call/Liveness", "Rotated relay token for {call_id}");
        }
    }

    pub(crate) async fn poll_speaking(&self) {
        let (call_id, epoch) = {
            let state = self.lock().await;
            match state.group.as_ref() {
                Some(s) if s.status() == GroupCallStatus::Active => (s.call_id.clone(), s.epoch()),
                _ => return,
            }
        };

        let levels = match self.inner.engine.speaking_levels().await {
            Ok(levels) => levels,
            Err(e) => {
                debug!(target: "Call/Liveness", "Speaking poll failed: {e}");
                return;
            }
        };

        let snapshot = {
            let mut state = self.lock().await;
            let Some(session) = state.group_matching(&call_id, epoch) else {
                return;
            };
            if !session.participants.update_speaking(&levels) {
                return;
            }
            session.clone()
        };
        self.notify(CallNotification::GroupCallUpdated(snapshot));
    }
}
