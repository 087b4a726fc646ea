//! Backend verification adapter.
//!
//! One logical call: present the session's bearer credential (plus the
//! locally stored token as a linking hint) and get back the canonical
//! pass id. Every failure mode — transport error, timeout, non-2xx,
//! malformed JSON — narrows to [`VerifyOutcome::Unavailable`]: identity
//! verification must never block the rest of the app.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::config::GateConfig;
use crate::error::{Error, MigrationStage};
use crate::passid::PassId;
use crate::types::CustomerProfile;

/// Header carrying the locally stored token as a linking hint.
const PASS_ID_HINT_HEADER: &str = "x-pass-id";

/// Typed narrowing of the verification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The backend decided the token to use, possibly re-keyed from the
    /// hint, along with a profile snapshot.
    Canonical {
        pass_id: PassId,
        profile: CustomerProfile,
    },
    /// The backend explicitly says the caller is not logged in (the
    /// session expired between reading it and the call landing). The
    /// previous local token must be kept.
    NotAuthenticated,
    /// Network failure, timeout, non-2xx, or malformed body. Soft
    /// failure: keep the previous local token.
    Unavailable,
}

/// Seam over the verification endpoint, mockable in tests.
pub trait IdentityVerifier: Send + Sync {
    /// Verify the bearer credential, hinting the stored token for
    /// linking. Infallible by design — failures are an outcome variant.
    fn verify(
        &self,
        bearer: &str,
        hint: Option<&PassId>,
    ) -> impl Future<Output = VerifyOutcome> + Send;

    /// Trigger the server-side legacy identity migration.
    fn migrate_legacy(
        &self,
        bearer: &str,
        legacy: &PassId,
    ) -> impl Future<Output = Result<PassId, Error>> + Send;
}

/// Wire shape of the verification response.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, rename = "passId")]
    pass_id: Option<String>,
    #[serde(default, rename = "loggedIn")]
    logged_in: bool,
    #[serde(flatten)]
    profile: CustomerProfile,
}

impl VerifyResponse {
    fn into_outcome(self) -> VerifyOutcome {
        if !self.ok {
            return VerifyOutcome::Unavailable;
        }
        if !self.logged_in {
            return VerifyOutcome::NotAuthenticated;
        }
        match self.pass_id {
            Some(pass_id) => VerifyOutcome::Canonical {
                pass_id: PassId(pass_id),
                profile: self.profile,
            },
            // ok+loggedIn without a token is malformed; treat like
            // unreachable.
            None => VerifyOutcome::Unavailable,
        }
    }
}

/// Wire shape of the migration response.
#[derive(Debug, Deserialize)]
struct MigrateResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default, rename = "passId")]
    pass_id: Option<String>,
    #[serde(default, rename = "failedStage")]
    failed_stage: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

fn parse_stage(stage: Option<&str>) -> MigrationStage {
    match stage {
        Some("profile") => MigrationStage::Profile,
        Some("ledger") => MigrationStage::Ledger,
        _ => MigrationStage::Unknown,
    }
}

/// `reqwest` implementation of [`IdentityVerifier`].
pub struct HttpVerifier {
    http: reqwest::Client,
    verify_url: Url,
    migrate_url: Url,
    timeout: Duration,
}

impl HttpVerifier {
    #[must_use]
    pub fn new(config: &GateConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            verify_url: config.verify_url.clone(),
            migrate_url: config.migrate_url.clone(),
            timeout: config.verify_timeout,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }
}

impl IdentityVerifier for HttpVerifier {
    async fn verify(&self, bearer: &str, hint: Option<&PassId>) -> VerifyOutcome {
        let mut request = self
            .http
            .get(self.verify_url.clone())
            .bearer_auth(bearer)
            .timeout(self.timeout);
        if let Some(hint) = hint {
            request = request.header(PASS_ID_HINT_HEADER, hint.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "verification call failed");
                return VerifyOutcome::Unavailable;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "verification returned non-success");
            return VerifyOutcome::Unavailable;
        }

        match response.json::<VerifyResponse>().await {
            Ok(body) => body.into_outcome(),
            Err(e) => {
                tracing::debug!(error = %e, "verification body malformed");
                VerifyOutcome::Unavailable
            }
        }
    }

    async fn migrate_legacy(&self, bearer: &str, legacy: &PassId) -> Result<PassId, Error> {
        let response = self
            .http
            .post(self.migrate_url.clone())
            .bearer_auth(bearer)
            .json(&serde_json::json!({ "legacyPassId": legacy }))
            .send()
            .await
            .map_err(|e| Error::Migration {
                stage: MigrationStage::Unknown,
                detail: e.to_string(),
            })?;

        let status = response.status();
        let body: MigrateResponse = response.json().await.map_err(|e| Error::Migration {
            stage: MigrationStage::Unknown,
            detail: format!("malformed migration response: {e}"),
        })?;

        if !status.is_success() || !body.ok {
            return Err(Error::Migration {
                stage: parse_stage(body.failed_stage.as_deref()),
                detail: body
                    .detail
                    .unwrap_or_else(|| format!("migration rejected (status {status})")),
            });
        }

        match body.pass_id {
            Some(pass_id) => {
                tracing::info!(%pass_id, legacy = %legacy, "legacy identity migrated");
                Ok(PassId(pass_id))
            }
            None => Err(Error::Migration {
                stage: MigrationStage::Unknown,
                detail: "migration response missing passId".into(),
            }),
        }
    }
}
