use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The authentication provider's view of the current login.
///
/// Owned entirely by the provider; the gate only reads it. Created on
/// successful login, destroyed on logout, silently refreshed before
/// expiry by the provider.
#[derive(Debug, Clone)]
pub struct Session {
    /// Provider-scoped user identifier.
    pub user_id: String,
    pub email: Option<String>,
    /// Bearer credential presented to the verification endpoint.
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

/// Auth-state notification from the provider subscription.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// Fired once when the provider finishes reading its persisted
    /// session. Redundant with startup resolution — always a no-op.
    InitialSession(Option<Session>),
    SignedIn(Session),
    SignedOut,
    TokenRefreshed(Session),
}

/// Profile fields returned alongside the canonical pass id by the
/// verification endpoint. All optional: the backend owns this record,
/// the gate only snapshots what it was given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CustomerProfile {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "linkedProviderId")]
    pub linked_provider_id: Option<String>,
    #[serde(default)]
    pub credit: Option<i64>,
    #[serde(default)]
    pub disabled: Option<bool>,
}
