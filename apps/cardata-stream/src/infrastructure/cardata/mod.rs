//! CarData Streaming Adapter
//!
//! MQTT connection to the CarData streaming broker.
//!
//! # Components
//!
//! - `auth`: credentials and CONNACK refusal classification
//! - `connection`: connection lifecycle state machine
//! - `messages`: publish payload decoding
//! - `reconnect`: exponential backoff
//! - `transport`: broker connector and live link seam
//! - `stream`: the session owner driving everything above

pub mod auth;
pub mod connection;
pub mod messages;
pub mod reconnect;
pub mod stream;
pub mod transport;

pub use auth::{AuthError, Credentials};
pub use connection::{ConnectionTracker, FollowUp, Transition};
pub use messages::{DecodeError, StreamMessage};
pub use reconnect::{BackoffConfig, ReconnectError, ReconnectPolicy};
pub use stream::{
    CredentialUpdate, ErrorCallback, MessageCallback, StatusCallback, StreamError, StreamManager,
    StreamManagerConfig,
};
pub use transport::{Connector, Handshake, Link, LinkEvent, MqttConnector, SessionParams};
