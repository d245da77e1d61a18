//! Stream Connection States
//!
//! The externally visible lifecycle of the telemetry stream connection.
//! The transitions themselves are driven by the MQTT adapter.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current state of a managed stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connect attempt in flight.
    #[default]
    Connecting,
    /// Broker acknowledged the connection.
    Connected,
    /// Connection lost for a non-auth reason.
    Disconnected,
    /// Broker rejected the credentials.
    Unauthorized,
    /// Connect attempt failed (transport error or non-auth refusal).
    ConnectionFailed,
    /// First successful connect after an unauthorized period.
    Recovered,
}

impl ConnectionState {
    /// Wire/log name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Unauthorized => "unauthorized",
            Self::ConnectionFailed => "connection_failed",
            Self::Recovered => "recovered",
        }
    }

    /// Whether the stream is live in this state.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Recovered)
    }

    /// Numeric code for the connection state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Connecting => 0.0,
            Self::Connected => 1.0,
            Self::Disconnected => 2.0,
            Self::Unauthorized => 3.0,
            Self::ConnectionFailed => 4.0,
            Self::Recovered => 5.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot notices for the external credential flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamNotice {
    /// Credentials were rejected. Fired once per failure episode.
    Unauthorized,
    /// A connect succeeded after an unauthorized episode.
    Recovered,
}

impl StreamNotice {
    /// Reason string handed to the error callback.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Recovered => "recovered",
        }
    }
}
