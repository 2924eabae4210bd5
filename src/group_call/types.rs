use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCallStatus {
    Ringing,
    Connecting,
    Active,
    Left,
    Ended,
}

impl GroupCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupCallStatus::Ended)
    }

    pub fn is_joined(&self) -> bool {
        matches!(
            self,
            GroupCallStatus::Connecting | GroupCallStatus::Active | GroupCallStatus::Left
        )
    }
}

#[derive(Debug, Clone)]
pub enum GroupCallTransition {
    JoinRequested,
    MediaStarted,
    Left,
    Rejoined,
    Ended { reason: String },
}
