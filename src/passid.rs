use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use derive_more::{Display, From, Into};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Prefix of locally minted anonymous tokens.
const ANON_PREFIX: &str = "anon_";

/// Prefix of tokens minted under the deprecated naming scheme.
/// Detected only so they can be migrated; never minted.
const LEGACY_PREFIX: &str = "user-";

/// Opaque identity token ("pass id").
///
/// The sole durable handle tying a visitor to their profile and activity
/// history. Two informal shapes exist: anonymous-generated (locally
/// minted, time-sortable, random-suffixed) and backend-issued canonical
/// (accepted verbatim, whatever its shape).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct PassId(pub String);

impl PassId {
    /// Mint a fresh anonymous token: millisecond timestamp (fixed-width
    /// hex, so tokens sort by mint time) plus 128 bits of randomness.
    #[must_use]
    pub fn mint() -> Self {
        let millis = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        let suffix: [u8; 16] = rand::rng().random();
        Self(format!(
            "{ANON_PREFIX}{millis:012x}_{}",
            URL_SAFE_NO_PAD.encode(suffix)
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for locally minted anonymous tokens.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANON_PREFIX)
    }

    /// True for tokens minted under the deprecated scheme.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.0.starts_with(LEGACY_PREFIX)
    }
}

impl From<&str> for PassId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
