use std::future::Future;

use url::Url;

use crate::storage::BoxError;
use crate::types::Session;

/// Consumer-provided authentication provider.
///
/// Wraps the hosted provider's session API. The gate never manages
/// sessions itself: it reads the current one, exchanges redirect
/// callback credentials, and initiates sign-in flows on request.
///
/// # Example
///
/// ```rust,ignore
/// impl AuthProvider for HostedAuth {
///     async fn current_session(&self) -> Option<Session> {
///         self.client.session().await.map(Into::into)
///     }
///
///     async fn exchange_code(&self, code: &str) -> Result<Session, BoxError> {
///         Ok(self.client.exchange_code_for_session(code).await?.into())
///     }
///     // ...
/// }
/// ```
pub trait AuthProvider: Send + Sync {
    /// The provider's current session, if any.
    fn current_session(&self) -> impl Future<Output = Option<Session>> + Send;

    /// Exchange a redirect-callback authorization code for a session.
    fn exchange_code(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Session, BoxError>> + Send;

    /// Restore a session from tokens embedded directly in a callback
    /// fragment (older implicit-grant flows).
    fn adopt_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> impl Future<Output = Result<Session, BoxError>> + Send;

    /// Send a one-time sign-in link to `email`.
    fn sign_in_with_email_link(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Begin an OAuth flow with the named third-party provider.
    /// Returns the URL to navigate to.
    fn sign_in_with_oauth(
        &self,
        provider: &str,
    ) -> impl Future<Output = Result<Url, BoxError>> + Send;

    /// Destroy the current session.
    fn sign_out(&self) -> impl Future<Output = Result<(), BoxError>> + Send;
}
