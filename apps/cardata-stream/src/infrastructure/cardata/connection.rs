//! Connection State Machine
//!
//! Pure bookkeeping for the stream connection lifecycle. The stream manager
//! feeds transport events in and acts on the returned [`Transition`]:
//! report the state, raise the one-shot notice, then reconnect, stop, or do
//! nothing.
//!
//! ```text
//! connecting --CONNACK ok--------> connected | recovered
//! connecting --auth refusal------> unauthorized      (stop, notice once)
//! connecting --other refusal-----> connection_failed (reconnect)
//! connected  --link lost---------> disconnected      (reconnect)
//! ```
//!
//! The unauthorized notice is latched: repeated auth refusals stay silent
//! until a successful connect clears the latch and reports `recovered`.

use rumqttc::ConnectReturnCode;

use super::auth::{Refusal, classify, describe};
use crate::domain::connection::{ConnectionState, StreamNotice};

/// What the manager does after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Nothing.
    None,
    /// Schedule a reconnect with backoff.
    Reconnect,
    /// Tear the connection down and wait for new credentials.
    Stop,
}

/// Result of feeding one event into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// New state.
    pub state: ConnectionState,
    /// Reason for the status callback.
    pub reason: Option<String>,
    /// One-shot notice for the error callback.
    pub notice: Option<StreamNotice>,
    /// Required follow-up.
    pub follow_up: FollowUp,
}

impl Transition {
    fn new(state: ConnectionState, reason: Option<String>, follow_up: FollowUp) -> Self {
        Self {
            state,
            reason,
            notice: None,
            follow_up,
        }
    }
}

/// Connection lifecycle with the unauthorized latch.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    state: ConnectionState,
    unauthorized_latched: bool,
}

impl ConnectionTracker {
    /// Create a tracker in the `connecting` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether an unauthorized episode is unresolved.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        self.unauthorized_latched
    }

    /// A connect attempt starts.
    pub fn on_connecting(&mut self) -> Transition {
        self.state = ConnectionState::Connecting;
        Transition::new(self.state, None, FollowUp::None)
    }

    /// The broker answered the CONNECT.
    pub fn on_connack(&mut self, code: ConnectReturnCode) -> Transition {
        match classify(code) {
            None => self.on_connected(),
            Some(Refusal::Auth) => self.on_auth_failure(describe(code)),
            Some(Refusal::Transient) => {
                self.state = ConnectionState::ConnectionFailed;
                Transition::new(
                    self.state,
                    Some(describe(code).to_string()),
                    FollowUp::Reconnect,
                )
            }
        }
    }

    /// The connect attempt failed below MQTT (DNS, TCP, TLS, timeout).
    pub fn on_connect_failed(&mut self, reason: impl Into<String>) -> Transition {
        self.state = ConnectionState::ConnectionFailed;
        Transition::new(self.state, Some(reason.into()), FollowUp::Reconnect)
    }

    /// An established connection dropped.
    pub fn on_disconnected(&mut self, reason: impl Into<String>) -> Transition {
        self.state = ConnectionState::Disconnected;
        Transition::new(self.state, Some(reason.into()), FollowUp::Reconnect)
    }

    /// The connection was torn down on request.
    pub fn on_stopped(&mut self) -> Transition {
        self.state = ConnectionState::Disconnected;
        Transition::new(self.state, Some("stopped".to_string()), FollowUp::None)
    }

    fn on_connected(&mut self) -> Transition {
        if self.unauthorized_latched {
            self.unauthorized_latched = false;
            self.state = ConnectionState::Recovered;
            return Transition {
                notice: Some(StreamNotice::Recovered),
                ..Transition::new(self.state, None, FollowUp::None)
            };
        }
        self.state = ConnectionState::Connected;
        Transition::new(self.state, None, FollowUp::None)
    }

    fn on_auth_failure(&mut self, reason: &str) -> Transition {
        self.state = ConnectionState::Unauthorized;
        let notice = if self.unauthorized_latched {
            None
        } else {
            self.unauthorized_latched = true;
            Some(StreamNotice::Unauthorized)
        };
        Transition {
            notice,
            ..Transition::new(self.state, Some(reason.to_string()), FollowUp::Stop)
        }
    }
}
