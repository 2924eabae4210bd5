use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

#[cfg(feature = "client")]
use reqwest::{Client, Response};
#[cfg(feature = "client")]
use serde::de::DeserializeOwned;

use crate::engine::{GroupAnnouncement, SenderKeyBundle};
use crate::error::Result;
#[cfg(feature = "client")]
use crate::error::CallError;

#[derive(Clone, PartialEq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct RelayCredentials {
    #[zeroize(skip)]
    pub relay_endpoint: String,
    pub relay_token: String,
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

/// True once `expires_at` is at most `window` away. Windows too large to
/// represent count as always due.
pub fn expires_within(expires_at: DateTime<Utc>, now: DateTime<Utc>, window: std::time::Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => expires_at.signed_duration_since(now) <= window,
        Err(_) => true,
    }
}

impl std::fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("relay_endpoint", &self.relay_endpoint)
            .field("relay_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerCallStatus {
    Pending,
    Ringing,
    Connecting,
    Active,
    Left,
    Ended,
    Missed,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl ServerCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerCallStatus::Ended | ServerCallStatus::Missed | ServerCallStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Connecting,
    Left,
}

#[derive(Debug, Serialize)]
pub struct InitiateCallRequest {
    pub call_id: String,
    pub callee_id: String,
    pub ephemeral_kem_public: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiateCallResponse {
    pub call_id: String,
    pub status: ServerCallStatus,
}

#[derive(Debug, Serialize)]
pub struct AnswerCallRequest {
    pub ephemeral_kem_public: Vec<u8>,
    pub kem_ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct ReasonRequest<'a> {
    pub reason: &'a str,
}

#[derive(Debug, Serialize)]
pub struct KeyCompleteRequest {
    pub kem_ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyExchangeResponse {
    #[serde(default)]
    pub relay: Option<RelayCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallStatusResponse {
    pub call_id: String,
    pub status: ServerCallStatus,
    #[serde(default)]
    pub can_rejoin: bool,
    #[serde(default)]
    pub rejoin_remaining_secs: Option<u64>,
    #[serde(default)]
    pub relay_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejoinableCall {
    pub call_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub peer_username: Option<String>,
    pub is_caller: bool,
    pub can_rejoin: bool,
    #[serde(default)]
    pub rejoin_remaining_secs: Option<u64>,
    #[serde(default)]
    pub relay_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateGroupCallRequest<'a> {
    pub conversation_id: &'a str,
    pub announcement: &'a GroupAnnouncement,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupCallCreated {
    pub call_id: String,
    pub relay: RelayCredentials,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub status: ParticipantStatus,
    #[serde(default)]
    pub identity_public: Vec<u8>,
    #[serde(default)]
    pub ephemeral_public: Vec<u8>,
    #[serde(default)]
    pub is_muted: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupCallInfo {
    pub call_id: String,
    pub conversation_id: String,
    pub initiator_id: String,
    pub status: ServerCallStatus,
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
    #[serde(default)]
    pub announcement: Option<GroupAnnouncement>,
}

impl GroupCallInfo {
    pub fn has_active_besides(&self, user_id: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.status == ParticipantStatus::Active && p.user_id != user_id)
    }
}

#[derive(Debug, Serialize)]
pub struct JoinGroupCallRequest<'a> {
    pub identity_public: &'a [u8],
    pub ephemeral_public: &'a [u8],
    pub signature: &'a [u8],
    pub sender_keys: &'a [SenderKeyBundle],
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupCallJoined {
    pub relay: RelayCredentials,
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Serialize)]
pub struct MuteRequest {
    pub is_muted: bool,
}

#[derive(Debug, Serialize)]
pub struct SendSenderKeyRequest<'a> {
    pub to_user_id: &'a str,
    pub bundle: &'a SenderKeyBundle,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub error: String,
}

#[async_trait]
pub trait SignalingApi: Send + Sync {
    async fn initiate_call(&self, request: &InitiateCallRequest) -> Result<InitiateCallResponse>;
    async fn answer_call(&self, call_id: &str, request: &AnswerCallRequest) -> Result<()>;
    async fn reject_call(&self, call_id: &str, reason: &str) -> Result<()>;
    async fn cancel_call(&self, call_id: &str) -> Result<()>;
    async fn end_call(&self, call_id: &str, reason: &str) -> Result<()>;
    async fn leave_call(&self, call_id: &str) -> Result<()>;
    async fn rejoin_call(&self, call_id: &str) -> Result<RelayCredentials>;
    async fn complete_key_exchange(
        &self,
        call_id: &str,
        request: &KeyCompleteRequest,
    ) -> Result<KeyExchangeResponse>;
    async fn get_call(&self, call_id: &str) -> Result<CallStatusResponse>;
    async fn get_rejoinable_call(&self) -> Result<Option<RejoinableCall>>;

    async fn create_group_call(
        &self,
        request: &CreateGroupCallRequest<'_>,
    ) -> Result<GroupCallCreated>;
    async fn get_group_call(&self, call_id: &str) -> Result<GroupCallInfo>;
    async fn join_group_call(
        &self,
        call_id: &str,
        request: &JoinGroupCallRequest<'_>,
    ) -> Result<GroupCallJoined>;
    async fn leave_group_call(&self, call_id: &str) -> Result<()>;
    async fn decline_group_call(&self, call_id: &str) -> Result<()>;
    async fn rejoin_group_call(&self, call_id: &str) -> Result<GroupCallJoined>;
    async fn refresh_group_token(&self, call_id: &str) -> Result<RelayCredentials>;
    async fn end_group_call(&self, call_id: &str) -> Result<()>;
    async fn update_group_mute(&self, call_id: &str, muted: bool) -> Result<()>;
    async fn send_sender_key(
        &self,
        call_id: &str,
        request: &SendSenderKeyRequest<'_>,
    ) -> Result<()>;
    async fn get_active_group_call(&self, conversation_id: &str) -> Result<Option<GroupCallInfo>>;
}

#[cfg(feature = "client")]
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[cfg(feature = "client")]
impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    pub fn set_auth_token(&mut self, token: String) {
        self.auth_token = Some(token);
    }

    pub fn clear_auth_token(&mut self) {
        self.auth_token = None;
    }

    fn token(&self) -> Result<&str> {
        self.auth_token
            .as_deref()
            .ok_or_else(|| CallError::Http("missing auth token".to_string()))
    }

    async fn error_from(response: Response) -> CallError {
        let status = response.status();
        let error: ApiError = response.json().await.unwrap_or(ApiError {
            error: format!("HTTP error: {}", status),
        });
        CallError::Api {
            status: status.as_u16(),
            message: error.error,
        }
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| CallError::Deserialization(e.to_string()))
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn handle_empty(&self, response: Response) -> Result<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn get(&self, path: &str) -> Result<Response> {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| CallError::Http(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<Response> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(self.token()?);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| CallError::Http(e.to_string()))
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let response = self.post::<()>(path, None).await?;
        self.handle_empty(response).await
    }
}

#[cfg(feature = "client")]
#[async_trait]
impl SignalingApi for ApiClient {
    async fn initiate_call(&self, request: &InitiateCallRequest) -> Result<InitiateCallResponse> {
        let response = self.post("/api/calls", Some(request)).await?;
        self.handle_response(response).await
    }

    async fn answer_call(&self, call_id: &str, request: &AnswerCallRequest) -> Result<()> {
        let response = self
            .post(&format!("/api/calls/{}/answer", call_id), Some(request))
            .await?;
        self.handle_empty(response).await
    }

    async fn reject_call(&self, call_id: &str, reason: &str) -> Result<()> {
        let response = self
            .post(
                &format!("/api/calls/{}/reject", call_id),
                Some(&ReasonRequest { reason }),
            )
            .await?;
        self.handle_empty(response).await
    }

    async fn cancel_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(&format!("/api/calls/{}/cancel", call_id))
            .await
    }

    async fn end_call(&self, call_id: &str, reason: &str) -> Result<()> {
        let response = self
            .post(
                &format!("/api/calls/{}/end", call_id),
                Some(&ReasonRequest { reason }),
            )
            .await?;
        self.handle_empty(response).await
    }

    async fn leave_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(&format!("/api/calls/{}/leave", call_id))
            .await
    }

    async fn rejoin_call(&self, call_id: &str) -> Result<RelayCredentials> {
        let response = self
            .post::<()>(&format!("/api/calls/{}/rejoin", call_id), None)
            .await?;
        self.handle_response(response).await
    }

    async fn complete_key_exchange(
        &self,
        call_id: &str,
        request: &KeyCompleteRequest,
    ) -> Result<KeyExchangeResponse> {
        let response = self
            .post(&format!("/api/calls/{}/key-complete", call_id), Some(request))
            .await?;
        self.handle_response(response).await
    }

    async fn get_call(&self, call_id: &str) -> Result<CallStatusResponse> {
        let response = self.get(&format!("/api/calls/{}", call_id)).await?;
        self.handle_response(response).await
    }

    async fn get_rejoinable_call(&self) -> Result<Option<RejoinableCall>> {
        let response = self.get("/api/calls/rejoinable").await?;
        self.handle_response(response).await
    }

    async fn create_group_call(
        &self,
        request: &CreateGroupCallRequest<'_>,
    ) -> Result<GroupCallCreated> {
        let response = self.post("/api/group-calls", Some(request)).await?;
        self.handle_response(response).await
    }

    async fn get_group_call(&self, call_id: &str) -> Result<GroupCallInfo> {
        let response = self.get(&format!("/api/group-calls/{}", call_id)).await?;
        self.handle_response(response).await
    }

    async fn join_group_call(
        &self,
        call_id: &str,
        request: &JoinGroupCallRequest<'_>,
    ) -> Result<GroupCallJoined> {
        let response = self
            .post(&format!("/api/group-calls/{}/join", call_id), Some(request))
            .await?;
        self.handle_response(response).await
    }

    async fn leave_group_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(&format!("/api/group-calls/{}/leave", call_id))
            .await
    }

    async fn decline_group_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(&format!("/api/group-calls/{}/decline", call_id))
            .await
    }

    async fn rejoin_group_call(&self, call_id: &str) -> Result<GroupCallJoined> {
        let response = self
            .post::<()>(&format!("/api/group-calls/{}/rejoin", call_id), None)
            .await?;
        self.handle_response(response).await
    }

    async fn refresh_group_token(&self, call_id: &str) -> Result<RelayCredentials> {
        let response = self
            .post::<()>(&format!("/api/group-calls/{}/refresh-token", call_id), None)
            .await?;
        self.handle_response(response).await
    }

    async fn end_group_call(&self, call_id: &str) -> Result<()> {
        self.post_empty(&format!("/api/group-calls/{}/end", call_id))
            .await
    }

    async fn update_group_mute(&self, call_id: &str, muted: bool) -> Result<()> {
        let response = self
            .post(
                &format!("/api/group-calls/{}/mute", call_id),
                Some(&MuteRequest { is_muted: muted }),
            )
            .await?;
        self.handle_empty(response).await
    }

    async fn send_sender_key(
        &self,
        call_id: &str,
        request: &SendSenderKeyRequest<'_>,
    ) -> Result<()> {
        let response = self
            .post(&format!("/api/group-calls/{}/sender-key", call_id), Some(request))
            .await?;
        self.handle_empty(response).await
    }

    async fn get_active_group_call(&self, conversation_id: &str) -> Result<Option<GroupCallInfo>> {
        let response = self
            .get(&format!("/api/conversations/{}/group-call", conversation_id))
            .await?;
        self.handle_response(response).await
    }
}
