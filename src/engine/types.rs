use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferMaterial {
    pub ephemeral_kem_public: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerMaterial {
    pub ephemeral_kem_public: Vec<u8>,
    pub kem_ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCompleteMaterial {
    pub kem_ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupAnnouncement(pub Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMaterial {
    pub identity_public: Vec<u8>,
    pub ephemeral_public: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderKeyBundle {
    pub to_user_id: String,
    pub kem_ciphertext: Vec<u8>,
    pub encrypted_sender_key: Vec<u8>,
    pub key_id: u32,
    pub signature: Vec<u8>,
    pub sender_identity_public: Vec<u8>,
    pub sender_ephemeral_public: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderKeySeed {
    pub user_id: String,
    pub identity_public: Vec<u8>,
    pub ephemeral_public: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub round_trip_ms: u32,
    pub packet_loss: f32,
    pub jitter_ms: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakingLevel {
    pub user_id: String,
    pub is_speaking: bool,
    pub audio_level: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCallState {
    pub call_id: Option<String>,
    pub in_media_session: bool,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_screen_sharing: bool,
}
