use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Idle,
    Initiating,
    Ringing,
    Connecting,
    Active,
    Left,
    Ended,
}

impl CallStatus {
    pub fn is_pre_connect(&self) -> bool {
        matches!(
            self,
            CallStatus::Initiating | CallStatus::Ringing | CallStatus::Connecting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    NoAnswer,
    Declined,
    Busy,
    KeyExchangeTimeout,
    KeyExchangeFailed,
    MediaFailed,
    PeerLeftTimeout,
    RejoinExpired,
    RemoteEnded,
    RemoteRejected,
    RemoteCancelled,
    Missed,
    ServerEnded,
    Replaced,
}

impl EndReason {
    pub fn as_wire(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::NoAnswer => "no_answer",
            EndReason::Declined => "declined",
            EndReason::Busy => "busy",
            EndReason::KeyExchangeTimeout => "key_exchange_timeout",
            EndReason::KeyExchangeFailed => "key_exchange_failed",
            EndReason::MediaFailed => "media_failed",
            EndReason::PeerLeftTimeout => "peer_left_timeout",
            EndReason::RejoinExpired => "rejoin_expired",
            EndReason::RemoteEnded => "ended",
            EndReason::RemoteRejected => "rejected",
            EndReason::RemoteCancelled => "cancelled",
            EndReason::Missed => "missed",
            EndReason::ServerEnded => "ended",
            EndReason::Replaced => "replaced",
        }
    }
}
