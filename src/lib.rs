pub mod call;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod group_call;
pub mod liveness;
pub mod manager;
pub mod timers;

#[cfg(test)]
mod testing;

pub use call::{CallRole, CallSession, CallStatus, EndReason, IncomingSnapshot};
pub use client::{
    IncomingCallOffer, LinkError, LinkEvent, LinkState, RelayCredentials, SignalingApi,
    Subscription, WsIncomingMessage, WsOutgoingMessage,
};
pub use config::{CallConfig, TransportConfig};
pub use engine::NativeCallEngine;
pub use error::{CallError, RejoinBlock, Result};
pub use group_call::{GroupCallSession, GroupCallStatus, Participant};
pub use liveness::EnvironmentEvent;
pub use manager::{CallManager, CallNotification, MessageSink};

#[cfg(feature = "client")]
pub use client::{ApiClient, TransportLink};
