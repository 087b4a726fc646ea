use std::fmt;

/// Stage at which a legacy identity migration failed.
///
/// The migration runs server-side in stages (profile copy, then ledger
/// re-key). Partial completion is invisible from the client unless the
/// server names the failing stage, so the stage is part of the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Profile,
    Ledger,
    Unknown,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Profile => "profile",
            Self::Ledger => "ledger",
            Self::Unknown => "unknown",
        })
    }
}

/// Gate errors.
///
/// Identity resolution itself never returns these — `resolve()` degrades
/// to the best identity already known. Only callback handling, sign-in
/// initiation, and legacy migration are fallible.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A redirect callback carried a provider-reported error.
    /// `message` is user-facing copy, already mapped from the error code.
    #[error("{message}")]
    Callback { message: String },

    /// Authorization code exchange with the provider failed.
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),

    /// An authentication provider call failed (sign-in initiation etc.).
    #[error("auth provider error: {0}")]
    Provider(String),

    /// The operation requires an established session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Legacy migration was requested but the current token is not legacy.
    #[error("current identity is not a legacy token")]
    NoLegacyIdentity,

    /// Legacy identity migration failed, possibly mid-way.
    #[error("legacy migration failed at {stage} stage: {detail}")]
    Migration { stage: MigrationStage, detail: String },

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
