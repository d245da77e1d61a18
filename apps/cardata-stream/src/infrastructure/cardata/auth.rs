//! CarData Stream Authentication
//!
//! The streaming broker authenticates with plain MQTT credentials:
//! username is the account GCID, password is the current ID token. The
//! token expires and is rotated by an external authorization flow, which
//! hands fresh values to the stream manager.
//!
//! # Refusal Codes
//!
//! - `BadUserNamePassword` / `NotAuthorized`: credentials rejected. The
//!   connection stays down until new credentials arrive.
//! - anything else: transient, retried with backoff.

use rumqttc::ConnectReturnCode;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Credential construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// GCID missing or empty.
    #[error("GCID cannot be empty")]
    EmptyGcid,

    /// ID token missing or empty.
    #[error("ID token cannot be empty")]
    EmptyIdToken,
}

// =============================================================================
// Refusal Classification
// =============================================================================

/// How a broker refusal is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Credentials rejected; needs a credential refresh.
    Auth,
    /// Anything else; retry with backoff.
    Transient,
}

/// Classify a CONNACK return code. `Success` is not a refusal and is
/// reported as `None`.
#[must_use]
pub const fn classify(code: ConnectReturnCode) -> Option<Refusal> {
    match code {
        ConnectReturnCode::Success => None,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Some(Refusal::Auth)
        }
        ConnectReturnCode::RefusedProtocolVersion
        | ConnectReturnCode::BadClientId
        | ConnectReturnCode::ServiceUnavailable => Some(Refusal::Transient),
    }
}

/// Human-readable text for a CONNACK return code.
#[must_use]
pub const fn describe(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "connection accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
        ConnectReturnCode::BadClientId => "client identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad username or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Stream credentials.
///
/// `Debug` and `Display` never print the ID token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    gcid: String,
    id_token: String,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either value is empty.
    pub fn new(gcid: impl Into<String>, id_token: impl Into<String>) -> Result<Self, AuthError> {
        let gcid = gcid.into();
        let id_token = id_token.into();

        if gcid.trim().is_empty() {
            return Err(AuthError::EmptyGcid);
        }
        if id_token.trim().is_empty() {
            return Err(AuthError::EmptyIdToken);
        }

        Ok(Self { gcid, id_token })
    }

    /// Account identifier (MQTT username).
    #[must_use]
    pub fn gcid(&self) -> &str {
        &self.gcid
    }

    /// ID token (MQTT password).
    #[must_use]
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    /// MQTT client identifier for this account.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!("cardata-{}", self.gcid)
    }

    /// Wildcard topic covering every vehicle of this account.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}/+/#", self.gcid)
    }

    /// Apply a partial update. Absent or empty values keep the current one.
    ///
    /// Returns `None` when nothing changed.
    #[must_use]
    pub fn merged(&self, gcid: Option<&str>, id_token: Option<&str>) -> Option<Self> {
        let gcid = gcid.filter(|g| !g.trim().is_empty()).unwrap_or(&self.gcid);
        let id_token = id_token
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.id_token);

        if gcid == self.gcid && id_token == self.id_token {
            return None;
        }
        Some(Self {
            gcid: gcid.to_string(),
            id_token: id_token.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("gcid", &self.gcid)
            .field("id_token", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(gcid={})", self.gcid)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn rejects_empty_values() {
        assert_eq!(Credentials::new("", "token"), Err(AuthError::EmptyGcid));
        assert_eq!(Credentials::new("gcid", "  "), Err(AuthError::EmptyIdToken));
    }

    #[test]
    fn derives_client_id_and_topic() {
        let creds = Credentials::new("abc-123", "token").unwrap();
        assert_eq!(creds.client_id(), "cardata-abc-123");
        assert_eq!(creds.topic(), "abc-123/+/#");
    }

    #[test]
    fn debug_and_display_hide_token() {
        let creds = Credentials::new("abc-123", "eyJhbGciOi.secret").unwrap();
        let debug = format!("{creds:?}");
        let display = creds.to_string();

        assert!(debug.contains("abc-123"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("eyJhbGciOi"));
        assert!(!display.contains("eyJhbGciOi"));
    }

    #[test]
    fn merge_unchanged_is_none() {
        let creds = Credentials::new("gcid", "token").unwrap();
        assert!(creds.merged(None, None).is_none());
        assert!(creds.merged(Some("gcid"), Some("token")).is_none());
        assert!(creds.merged(Some(""), Some("")).is_none());
    }

    #[test]
    fn merge_accepts_single_field() {
        let creds = Credentials::new("gcid", "token").unwrap();

        let rotated = creds.merged(None, Some("token-2")).unwrap();
        assert_eq!(rotated.gcid(), "gcid");
        assert_eq!(rotated.id_token(), "token-2");

        let moved = creds.merged(Some("gcid-2"), None).unwrap();
        assert_eq!(moved.gcid(), "gcid-2");
        assert_eq!(moved.id_token(), "token");
    }

    #[test_case(ConnectReturnCode::Success, None ; "success")]
    #[test_case(ConnectReturnCode::BadUserNamePassword, Some(Refusal::Auth) ; "bad credentials")]
    #[test_case(ConnectReturnCode::NotAuthorized, Some(Refusal::Auth) ; "not authorized")]
    #[test_case(ConnectReturnCode::ServiceUnavailable, Some(Refusal::Transient) ; "unavailable")]
    #[test_case(ConnectReturnCode::BadClientId, Some(Refusal::Transient) ; "client id")]
    #[test_case(ConnectReturnCode::RefusedProtocolVersion, Some(Refusal::Transient) ; "protocol")]
    fn return_code_classification(code: ConnectReturnCode, expected: Option<Refusal>) {
        assert_eq!(classify(code), expected);
    }

    #[test]
    fn return_codes_have_text() {
        assert_eq!(describe(ConnectReturnCode::NotAuthorized), "not authorized");
    }
}
