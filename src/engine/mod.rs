mod types;

use async_trait::async_trait;

use crate::client::api::RelayCredentials;
use crate::client::messages::{CallAnswerEvent, IncomingCallOffer, KeyCompleteEvent};
use crate::error::Result;

pub use types::{
    AnswerMaterial, CallStats, EngineCallState, GroupAnnouncement, JoinMaterial,
    KeyCompleteMaterial, OfferMaterial, SenderKeyBundle, SenderKeySeed, SpeakingLevel,
};

#[async_trait]
pub trait NativeCallEngine: Send + Sync {
    async fn create_offer(&self, call_id: &str, callee_id: &str) -> Result<OfferMaterial>;

    async fn accept_offer(&self, offer: &IncomingCallOffer) -> Result<AnswerMaterial>;

    async fn complete_key_exchange_caller(
        &self,
        answer: &CallAnswerEvent,
        callee_identity_key: &[u8],
    ) -> Result<KeyCompleteMaterial>;

    async fn complete_key_exchange_callee(&self, key_complete: &KeyCompleteEvent) -> Result<()>;

    async fn start_media(&self, call_id: &str, relay: &RelayCredentials) -> Result<()>;

    async fn stop_media(&self) -> Result<()>;

    async fn set_muted(&self, muted: bool) -> Result<()>;

    async fn set_deafened(&self, deafened: bool) -> Result<()>;

    async fn start_screen_share(&self) -> Result<()>;

    async fn stop_screen_share(&self) -> Result<()>;

    async fn call_state(&self) -> Result<EngineCallState>;

    async fn call_stats(&self) -> Result<CallStats>;

    async fn clear_state(&self) -> Result<()>;

    async fn leave_call(&self) -> Result<()>;

    async fn end_call(&self) -> Result<()>;

    async fn prepare_rejoin(&self, call_id: &str) -> Result<()>;

    async fn create_group_announcement(&self, conversation_id: &str)
        -> Result<GroupAnnouncement>;

    async fn accept_group_announcement(
        &self,
        call_id: &str,
        announcement: &GroupAnnouncement,
    ) -> Result<JoinMaterial>;

    async fn start_group_media(
        &self,
        call_id: &str,
        relay: &RelayCredentials,
        participants: &[SenderKeySeed],
    ) -> Result<()>;

    async fn stop_group_media(&self) -> Result<()>;

    async fn create_sender_key(
        &self,
        call_id: &str,
        recipient: &SenderKeySeed,
    ) -> Result<SenderKeyBundle>;

    async fn handle_sender_key(
        &self,
        call_id: &str,
        from_user_id: &str,
        bundle: &SenderKeyBundle,
    ) -> Result<()>;

    async fn remove_participant(&self, user_id: &str) -> Result<()>;

    async fn update_relay_token(&self, relay: &RelayCredentials) -> Result<()>;

    async fn speaking_levels(&self) -> Result<Vec<SpeakingLevel>>;
}
