pub mod api;
pub mod backoff;
pub mod messages;
pub mod subscription;

#[cfg(feature = "client")]
pub mod websocket;

#[cfg(feature = "client")]
pub use api::ApiClient;
pub use api::{RelayCredentials, SignalingApi};
pub use backoff::Backoff;
pub use messages::{IncomingCallOffer, WsIncomingMessage, WsOutgoingMessage};
pub use subscription::{LinkError, LinkEvent, LinkState, Subscribers, Subscription};

#[cfg(feature = "client")]
pub use websocket::TransportLink;
