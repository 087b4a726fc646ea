//! The identity reconciliation state machine.
//!
//! [`IdentityGate`] is the single writer of the current pass id. On every
//! lifecycle trigger (startup, auth-state change, explicit refresh) it
//! reads local storage, inspects the provider session, optionally calls
//! the backend verification endpoint, and commits exactly one resolved
//! identity — to storage and to subscribers.
//!
//! Triggers win in arrival order, not completion order: every trigger
//! takes a fresh generation number, and a resolve whose generation has
//! been superseded while awaiting the backend discards its result.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use url::Url;

use crate::callback::{self, CallbackParams};
use crate::error::Error;
use crate::passid::PassId;
use crate::provider::AuthProvider;
use crate::storage::TokenStore;
use crate::types::{AuthEvent, CustomerProfile, Session};
use crate::verify::{IdentityVerifier, VerifyOutcome};

/// States the gate passes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// Startup; no session read yet.
    Initializing,
    /// A redirect callback is being consumed; no verification is issued
    /// until it completes.
    HandlingCallback,
    /// No session; the identity is a stored or freshly minted local
    /// token.
    ResolvedUnauthenticated,
    /// Session present; the identity is backend-confirmed, or
    /// provisionally the last known local value if the backend was
    /// unreachable.
    ResolvedAuthenticated,
    /// A redirect callback carried an error. Cleared by
    /// [`IdentityGate::retry_after_error`].
    CallbackError { message: String },
}

/// Result of consuming a redirect callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The URL carried no callback parameters.
    NoCallback,
    /// A code or implicit tokens were exchanged for a session.
    SessionEstablished,
    /// The callback carried an error; `message` is user-facing copy.
    Error { message: String },
}

struct GateInner {
    state: GateState,
    current: Option<PassId>,
    profile: Option<CustomerProfile>,
    /// Bearer of the last successful verification; unchanged bearer +
    /// unchanged token means a repeat resolve can skip the network.
    last_bearer: Option<String>,
    /// Set once a storage call fails; the gate then runs memory-only
    /// for the rest of the session.
    store_broken: bool,
}

/// The identity reconciler. Generic over the provider, the token store,
/// and the verifier, so every collaborator can be swapped in tests.
pub struct IdentityGate<P, S, V> {
    provider: P,
    store: S,
    verifier: V,
    inner: Mutex<GateInner>,
    generation: AtomicU64,
    published: watch::Sender<Option<PassId>>,
}

impl<P, S, V> IdentityGate<P, S, V>
where
    P: AuthProvider,
    S: TokenStore,
    V: IdentityVerifier,
{
    #[must_use]
    pub fn new(provider: P, store: S, verifier: V) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            provider,
            store,
            verifier,
            inner: Mutex::new(GateInner {
                state: GateState::Initializing,
                current: None,
                profile: None,
                last_bearer: None,
                store_broken: false,
            }),
            generation: AtomicU64::new(0),
            published,
        }
    }

    /// Initial-load entry point: consume any redirect callback in the
    /// URL, then resolve. Returns the resolved token and the URL with
    /// callback parameters stripped.
    pub async fn start(&self, current_url: &Url) -> (PassId, Url) {
        let (_, cleaned) = self.handle_redirect_callback(current_url).await;
        let token = self.resolve().await;
        (token, cleaned)
    }

    /// Resolve the current identity. Never fails: backend or storage
    /// trouble degrades to the best identity already known.
    pub async fn resolve(&self) -> PassId {
        let generation = self.next_generation();

        let stored = self.load_stored();
        let session = self.provider.current_session().await;

        let (handling_callback, cached, last_bearer) = {
            let inner = self.lock();
            (
                matches!(inner.state, GateState::HandlingCallback),
                inner.current.clone(),
                inner.last_bearer.clone(),
            )
        };

        let mut profile_update = None;
        let mut verified_bearer = None;
        let resolved = match &session {
            Some(sess) if !handling_callback => {
                let unchanged = last_bearer.as_deref() == Some(sess.access_token.as_str())
                    && cached.is_some()
                    && cached == stored;
                if unchanged {
                    // Same session, same token: nothing to re-verify.
                    verified_bearer = last_bearer;
                    cached.unwrap_or_else(PassId::mint)
                } else {
                    match self.verifier.verify(&sess.access_token, stored.as_ref()).await {
                        VerifyOutcome::Canonical { pass_id, profile } => {
                            tracing::info!(%pass_id, "identity canonicalized by backend");
                            profile_update = Some(profile);
                            verified_bearer = Some(sess.access_token.clone());
                            pass_id
                        }
                        VerifyOutcome::NotAuthenticated => {
                            // Session expired between reading it and the
                            // call landing; keep what we had.
                            tracing::debug!("backend reports not logged in; keeping local token");
                            stored.unwrap_or_else(PassId::mint)
                        }
                        VerifyOutcome::Unavailable => {
                            tracing::debug!("verification unavailable; keeping local token");
                            stored.unwrap_or_else(PassId::mint)
                        }
                    }
                }
            }
            // No session, or a callback is mid-flight: local only.
            _ => stored.unwrap_or_else(PassId::mint),
        };

        if self.superseded(generation) {
            tracing::debug!("resolve superseded by a newer trigger; discarding result");
            return self.published.borrow().clone().unwrap_or(resolved);
        }

        self.commit(
            resolved.clone(),
            session.is_some(),
            verified_bearer,
            profile_update,
        );
        resolved
    }

    /// Consume redirect callback parameters from `url`.
    ///
    /// An authorization code (or implicit tokens) is exchanged for a
    /// session before anything else; an error is mapped to user-facing
    /// copy and parks the gate in [`GateState::CallbackError`]. Either
    /// way the recognized parameters are stripped from the returned URL,
    /// so a second invocation on it is a no-op.
    pub async fn handle_redirect_callback(&self, url: &Url) -> (CallbackOutcome, Url) {
        let params = CallbackParams::from_url(url);
        if params.is_empty() {
            return (CallbackOutcome::NoCallback, url.clone());
        }

        self.lock().state = GateState::HandlingCallback;

        let outcome = if let Some(message) = params.error_message() {
            tracing::warn!(
                error = params.error.as_deref().unwrap_or_default(),
                error_code = params.error_code.as_deref().unwrap_or_default(),
                "redirect callback carried an error"
            );
            CallbackOutcome::Error { message }
        } else if let Some(code) = params.code.as_deref() {
            match self.provider.exchange_code(code).await {
                Ok(session) => {
                    tracing::info!(user_id = %session.user_id, "authorization code exchanged");
                    CallbackOutcome::SessionEstablished
                }
                Err(e) => {
                    tracing::error!(error = %e, "authorization code exchange failed");
                    CallbackOutcome::Error {
                        message: "Sign-in could not be completed. Please try again.".to_owned(),
                    }
                }
            }
        } else if let Some(access) = params.access_token.as_deref() {
            match self
                .provider
                .adopt_tokens(access, params.refresh_token.as_deref())
                .await
            {
                Ok(session) => {
                    tracing::info!(user_id = %session.user_id, "implicit tokens adopted");
                    CallbackOutcome::SessionEstablished
                }
                Err(e) => {
                    tracing::error!(error = %e, "implicit token adoption failed");
                    CallbackOutcome::Error {
                        message: "Sign-in could not be completed. Please try again.".to_owned(),
                    }
                }
            }
        } else {
            // Stray recognized parameters with nothing to act on; just
            // scrub them.
            CallbackOutcome::NoCallback
        };

        let cleaned = callback::scrub_url(url);

        {
            let mut inner = self.lock();
            inner.state = match &outcome {
                CallbackOutcome::Error { message } => GateState::CallbackError {
                    message: message.clone(),
                },
                // Provisional; the follow-up resolve() settles the state.
                _ => GateState::ResolvedUnauthenticated,
            };
        }

        (outcome, cleaned)
    }

    /// Feed a provider auth notification into the gate.
    ///
    /// The initial-session event is redundant with startup resolution
    /// and is ignored outright.
    pub async fn on_auth_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::InitialSession(_) => {
                tracing::debug!("ignoring initial-session event");
            }
            AuthEvent::SignedOut => {
                self.reset_to_anonymous();
            }
            AuthEvent::SignedIn(_) | AuthEvent::TokenRefreshed(_) => {
                self.resolve().await;
            }
        }
    }

    /// User-triggered retry out of [`GateState::CallbackError`].
    pub async fn retry_after_error(&self) -> PassId {
        {
            let mut inner = self.lock();
            if matches!(inner.state, GateState::CallbackError { .. }) {
                inner.state = GateState::ResolvedUnauthenticated;
            }
        }
        self.resolve().await
    }

    /// Send a one-time sign-in link to `email`.
    pub async fn sign_in_with_email_link(&self, email: &str) -> Result<(), Error> {
        self.provider
            .sign_in_with_email_link(email)
            .await
            .map_err(|e| Error::Provider(e.to_string()))
    }

    /// Begin an OAuth flow; returns the URL to navigate to.
    pub async fn sign_in_with_oauth(&self, provider: &str) -> Result<Url, Error> {
        self.provider
            .sign_in_with_oauth(provider)
            .await
            .map_err(|e| Error::Provider(e.to_string()))
    }

    /// Destroy the session and reset to an anonymous identity.
    pub async fn sign_out(&self) -> Result<(), Error> {
        self.provider
            .sign_out()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;
        self.reset_to_anonymous();
        Ok(())
    }

    /// Administrative: migrate a legacy-scheme token to a canonical one.
    ///
    /// The migration itself runs server-side (profile copy, ledger
    /// re-key, soft-delete of the legacy record). Partial failure comes
    /// back as [`Error::Migration`] naming the failing stage.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthenticated`] without a session,
    /// [`Error::NoLegacyIdentity`] if the current token is not legacy,
    /// [`Error::Migration`] if the server-side migration fails.
    pub async fn link_legacy_identity(&self) -> Result<PassId, Error> {
        let session: Session = self
            .provider
            .current_session()
            .await
            .ok_or(Error::NotAuthenticated)?;

        let current = {
            let inner = self.lock();
            inner.current.clone()
        }
        .or_else(|| self.load_stored());
        let legacy = current.filter(PassId::is_legacy).ok_or(Error::NoLegacyIdentity)?;

        let migrated = self
            .verifier
            .migrate_legacy(&session.access_token, &legacy)
            .await?;

        self.next_generation();
        self.commit(migrated.clone(), true, Some(session.access_token), None);
        Ok(migrated)
    }

    /// Read-only view of the published identity. All non-gate code
    /// observes the token through this; only the gate writes it.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<PassId>> {
        self.published.subscribe()
    }

    /// The currently published token, if any resolve has completed.
    #[must_use]
    pub fn current(&self) -> Option<PassId> {
        self.published.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        self.lock().state.clone()
    }

    /// Profile snapshot from the last canonical verification.
    #[must_use]
    pub fn profile(&self) -> Option<CustomerProfile> {
        self.lock().profile.clone()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner.lock().expect("gate state lock poisoned")
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Read the stored token, degrading to the in-memory value when the
    /// store is (or becomes) unavailable.
    fn load_stored(&self) -> Option<PassId> {
        let mut inner = self.lock();
        if inner.store_broken {
            return inner.current.clone();
        }
        match self.store.load() {
            Ok(stored) => stored.or_else(|| inner.current.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "token store read failed; continuing memory-only");
                inner.store_broken = true;
                inner.current.clone()
            }
        }
    }

    /// Sign-out path: drop any non-anonymous identity and settle on a
    /// stored-or-minted anonymous token. No awaits, so it commits at its
    /// own generation immediately and supersedes any in-flight resolve.
    fn reset_to_anonymous(&self) {
        self.next_generation();
        let stored = self.load_stored();
        let token = stored
            .filter(PassId::is_anonymous)
            .unwrap_or_else(PassId::mint);
        {
            let mut inner = self.lock();
            inner.last_bearer = None;
            inner.profile = None;
        }
        tracing::info!(%token, "signed out; identity reset to anonymous");
        self.commit(token, false, None, None);
    }

    /// Persist and publish one resolved identity. Skips the storage
    /// write and the publish when the value is unchanged.
    fn commit(
        &self,
        token: PassId,
        authenticated: bool,
        bearer: Option<String>,
        profile: Option<CustomerProfile>,
    ) {
        {
            let mut inner = self.lock();
            let already_stored = inner.current.as_ref() == Some(&token);
            if !inner.store_broken && !already_stored {
                if let Err(e) = self.store.save(&token) {
                    tracing::warn!(error = %e, "token store write failed; continuing memory-only");
                    inner.store_broken = true;
                }
            }
            inner.current = Some(token.clone());
            inner.last_bearer = bearer;
            if let Some(profile) = profile {
                inner.profile = Some(profile);
            }
            // Callback handling owns the state until it finishes, and a
            // surfaced callback error is only cleared by user action.
            if !matches!(
                inner.state,
                GateState::HandlingCallback | GateState::CallbackError { .. }
            ) {
                inner.state = if authenticated {
                    GateState::ResolvedAuthenticated
                } else {
                    GateState::ResolvedUnauthenticated
                };
            }
        }
        self.published.send_if_modified(|current| {
            if current.as_ref() == Some(&token) {
                false
            } else {
                *current = Some(token);
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use time::OffsetDateTime;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::MigrationStage;
    use crate::storage::{BoxError, MemoryTokenStore};

    fn session(token: &str) -> Session {
        Session {
            user_id: "user-id-1".into(),
            email: Some("a@b.test".into()),
            access_token: token.into(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        }
    }

    #[derive(Default)]
    struct MockProvider {
        session: Arc<StdMutex<Option<Session>>>,
        exchange_fails: bool,
        exchanges: AtomicUsize,
    }

    impl MockProvider {
        fn authenticated(token: &str) -> (Self, Arc<StdMutex<Option<Session>>>) {
            let slot = Arc::new(StdMutex::new(Some(session(token))));
            (
                Self {
                    session: slot.clone(),
                    ..Self::default()
                },
                slot,
            )
        }

        fn anonymous() -> (Self, Arc<StdMutex<Option<Session>>>) {
            let slot = Arc::new(StdMutex::new(None));
            (
                Self {
                    session: slot.clone(),
                    ..Self::default()
                },
                slot,
            )
        }
    }

    impl AuthProvider for MockProvider {
        async fn current_session(&self) -> Option<Session> {
            self.session.lock().unwrap().clone()
        }

        async fn exchange_code(&self, _code: &str) -> Result<Session, BoxError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.exchange_fails {
                return Err("exchange rejected".into());
            }
            let sess = session("bearer-from-code");
            *self.session.lock().unwrap() = Some(sess.clone());
            Ok(sess)
        }

        async fn adopt_tokens(
            &self,
            access_token: &str,
            _refresh_token: Option<&str>,
        ) -> Result<Session, BoxError> {
            let sess = session(access_token);
            *self.session.lock().unwrap() = Some(sess.clone());
            Ok(sess)
        }

        async fn sign_in_with_email_link(&self, _email: &str) -> Result<(), BoxError> {
            Ok(())
        }

        async fn sign_in_with_oauth(&self, _provider: &str) -> Result<Url, BoxError> {
            Ok("https://provider.test/authorize".parse().unwrap())
        }

        async fn sign_out(&self) -> Result<(), BoxError> {
            *self.session.lock().unwrap() = None;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct MockVerifier {
        outcome: Arc<StdMutex<VerifyOutcome>>,
        calls: Arc<AtomicUsize>,
        /// When set, `verify` parks until notified (slow backend).
        hold: Option<Arc<Notify>>,
        migrate_result: Arc<StdMutex<Result<PassId, (MigrationStage, String)>>>,
    }

    impl MockVerifier {
        fn returning(outcome: VerifyOutcome) -> Self {
            Self {
                outcome: Arc::new(StdMutex::new(outcome)),
                calls: Arc::new(AtomicUsize::new(0)),
                hold: None,
                migrate_result: Arc::new(StdMutex::new(Ok(PassId::from("cust_migrated")))),
            }
        }

        fn canonical(pass_id: &str) -> Self {
            Self::returning(VerifyOutcome::Canonical {
                pass_id: PassId::from(pass_id),
                profile: CustomerProfile::default(),
            })
        }

        fn held(self, hold: Arc<Notify>) -> Self {
            Self {
                hold: Some(hold),
                ..self
            }
        }
    }

    impl IdentityVerifier for MockVerifier {
        async fn verify(&self, _bearer: &str, _hint: Option<&PassId>) -> VerifyOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            self.outcome.lock().unwrap().clone()
        }

        async fn migrate_legacy(&self, _bearer: &str, _legacy: &PassId) -> Result<PassId, Error> {
            self.migrate_result
                .lock()
                .unwrap()
                .clone()
                .map_err(|(stage, detail)| Error::Migration { stage, detail })
        }
    }

    #[derive(Default)]
    struct BrokenStore;

    impl TokenStore for BrokenStore {
        fn load(&self) -> Result<Option<PassId>, BoxError> {
            Err("storage disabled".into())
        }

        fn save(&self, _id: &PassId) -> Result<(), BoxError> {
            Err("storage disabled".into())
        }
    }

    #[tokio::test]
    async fn no_session_mints_and_persists_a_stable_token() {
        let (provider, _) = MockProvider::anonymous();
        let verifier = MockVerifier::canonical("cust_unused");
        let calls = verifier.calls.clone();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), verifier);

        let first = gate.resolve().await;
        assert!(first.is_anonymous());
        assert_eq!(gate.state(), GateState::ResolvedUnauthenticated);

        // Re-read from storage, not re-minted.
        let second = gate.resolve().await;
        assert_eq!(first, second);
        // The unauthenticated path never calls the backend.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stored_token_survives_restart() {
        let store = MemoryTokenStore::with_token(PassId::from("anon_000001_seed"));
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, store, MockVerifier::canonical("x"));

        assert_eq!(gate.resolve().await, PassId::from("anon_000001_seed"));
    }

    #[tokio::test]
    async fn authenticated_resolve_is_idempotent_without_extra_network_calls() {
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::canonical("cust_77a0");
        let calls = verifier.calls.clone();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), verifier);

        let first = gate.resolve().await;
        let second = gate.resolve().await;

        assert_eq!(first, PassId::from("cust_77a0"));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second resolve must not re-verify");
        assert_eq!(gate.state(), GateState::ResolvedAuthenticated);
    }

    #[tokio::test]
    async fn canonical_token_overrides_local_anonymous_token() {
        let store = Arc::new(MemoryTokenStore::new());
        let (provider, session_slot) = MockProvider::anonymous();
        let verifier = MockVerifier::canonical("cust_77a0");
        let gate = IdentityGate::new(provider, store.clone(), verifier);

        let local = gate.resolve().await;
        assert!(local.is_anonymous());
        assert_eq!(store.load().unwrap(), Some(local));

        *session_slot.lock().unwrap() = Some(session("bearer-1"));
        let canonical = gate.resolve().await;

        assert_eq!(canonical, PassId::from("cust_77a0"));
        assert_eq!(gate.current(), Some(canonical.clone()));
        // The canonical value is what got persisted.
        assert_eq!(store.load().unwrap(), Some(canonical));
    }

    #[tokio::test]
    async fn verification_failure_preserves_prior_token() {
        let store = MemoryTokenStore::with_token(PassId::from("anon_000001_prior"));
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::returning(VerifyOutcome::Unavailable);
        let gate = IdentityGate::new(provider, store, verifier);

        let token = gate.resolve().await;
        assert_eq!(token, PassId::from("anon_000001_prior"));
        // Session exists, so the state is provisionally authenticated.
        assert_eq!(gate.state(), GateState::ResolvedAuthenticated);
    }

    #[tokio::test]
    async fn backend_not_authenticated_keeps_local_token() {
        let store = MemoryTokenStore::with_token(PassId::from("anon_000001_prior"));
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::returning(VerifyOutcome::NotAuthenticated);
        let gate = IdentityGate::new(provider, store, verifier);

        assert_eq!(gate.resolve().await, PassId::from("anon_000001_prior"));
    }

    #[tokio::test]
    async fn verification_retried_after_unavailable() {
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::returning(VerifyOutcome::Unavailable);
        let outcome = verifier.outcome.clone();
        let calls = verifier.calls.clone();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), verifier);

        gate.resolve().await;
        *outcome.lock().unwrap() = VerifyOutcome::Canonical {
            pass_id: PassId::from("cust_77a0"),
            profile: CustomerProfile::default(),
        };
        // A degraded resolve leaves no verification cache behind, so the
        // next trigger goes back to the network.
        let token = gate.resolve().await;
        assert_eq!(token, PassId::from("cust_77a0"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broken_storage_degrades_to_memory_only() {
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, BrokenStore, MockVerifier::canonical("x"));

        let first = gate.resolve().await;
        let second = gate.resolve().await;
        // Token cannot survive a restart, but it is stable within the
        // session and nothing surfaces to the caller.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn callback_code_is_consumed_exactly_once() {
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("cust_77a0"));

        let url: Url = "https://app.test/?code=abc123&tab=usage".parse().unwrap();
        let (outcome, cleaned) = gate.handle_redirect_callback(&url).await;

        assert_eq!(outcome, CallbackOutcome::SessionEstablished);
        assert!(!cleaned.as_str().contains("code"));
        assert!(cleaned.as_str().contains("tab=usage"));

        // The scrubbed URL no longer triggers anything.
        let (again, unchanged) = gate.handle_redirect_callback(&cleaned).await;
        assert_eq!(again, CallbackOutcome::NoCallback);
        assert_eq!(unchanged, cleaned);
    }

    #[tokio::test]
    async fn start_exchanges_then_verifies_the_fresh_session() {
        let (provider, _) = MockProvider::anonymous();
        let verifier = MockVerifier::canonical("cust_77a0");
        let calls = verifier.calls.clone();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), verifier);

        let url: Url = "https://app.test/?code=abc123".parse().unwrap();
        let (token, cleaned) = gate.start(&url).await;

        assert_eq!(token, PassId::from("cust_77a0"));
        assert_eq!(cleaned.as_str(), "https://app.test/");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state(), GateState::ResolvedAuthenticated);
    }

    #[tokio::test]
    async fn implicit_tokens_in_fragment_establish_a_session() {
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("cust_77a0"));

        let url: Url = "https://app.test/#access_token=tok&refresh_token=ref"
            .parse()
            .unwrap();
        let (outcome, cleaned) = gate.handle_redirect_callback(&url).await;

        assert_eq!(outcome, CallbackOutcome::SessionEstablished);
        assert_eq!(cleaned.fragment(), None);
    }

    #[tokio::test]
    async fn callback_error_surfaces_mapped_copy_and_retry_clears_it() {
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("x"));

        let url: Url = "https://app.test/?error_code=flow_state_not_found"
            .parse()
            .unwrap();
        let (outcome, cleaned) = gate.handle_redirect_callback(&url).await;

        match &outcome {
            CallbackOutcome::Error { message } => assert!(message.contains("expired")),
            other => panic!("expected error outcome, got {other:?}"),
        }
        assert!(matches!(gate.state(), GateState::CallbackError { .. }));
        assert_eq!(cleaned.query(), None);

        // Resolution still works while the error is showing, and does
        // not clear it.
        let token = gate.resolve().await;
        assert!(token.is_anonymous());
        assert!(matches!(gate.state(), GateState::CallbackError { .. }));

        let retried = gate.retry_after_error().await;
        assert_eq!(retried, token);
        assert_eq!(gate.state(), GateState::ResolvedUnauthenticated);
    }

    #[tokio::test]
    async fn failed_exchange_parks_in_callback_error() {
        let (provider, _) = MockProvider::anonymous();
        let provider = MockProvider {
            exchange_fails: true,
            ..provider
        };
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("x"));

        let url: Url = "https://app.test/?code=abc123".parse().unwrap();
        let (outcome, cleaned) = gate.handle_redirect_callback(&url).await;

        assert!(matches!(outcome, CallbackOutcome::Error { .. }));
        assert!(matches!(gate.state(), GateState::CallbackError { .. }));
        assert_eq!(cleaned.query(), None);
    }

    #[tokio::test]
    async fn initial_session_event_is_a_no_op() {
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::canonical("cust_77a0");
        let calls = verifier.calls.clone();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), verifier);

        let token = gate.resolve().await;
        gate.on_auth_event(AuthEvent::InitialSession(Some(session("bearer-1"))))
            .await;

        assert_eq!(gate.current(), Some(token));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sign_out_resets_to_a_fresh_anonymous_token() {
        let (provider, session_slot) = MockProvider::authenticated("bearer-1");
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("cust_77a0"));

        let canonical = gate.resolve().await;
        assert!(!canonical.is_anonymous());

        *session_slot.lock().unwrap() = None;
        gate.on_auth_event(AuthEvent::SignedOut).await;

        let current = gate.current().unwrap();
        assert!(current.is_anonymous());
        assert_ne!(current, canonical);
        assert_eq!(gate.state(), GateState::ResolvedUnauthenticated);
        assert!(gate.profile().is_none());
    }

    #[tokio::test]
    async fn superseded_verification_is_discarded() {
        let (provider, session_slot) = MockProvider::authenticated("bearer-1");
        let hold = Arc::new(Notify::new());
        let verifier = MockVerifier::canonical("cust_stale").held(hold.clone());
        let calls = verifier.calls.clone();
        let gate = Arc::new(IdentityGate::new(
            provider,
            MemoryTokenStore::new(),
            verifier,
        ));

        let slow = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.resolve().await })
        };
        // Let the slow resolve reach the backend call.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Sign-out arrives while the verification is still in flight.
        *session_slot.lock().unwrap() = None;
        gate.on_auth_event(AuthEvent::SignedOut).await;
        let after_sign_out = gate.current().unwrap();
        assert!(after_sign_out.is_anonymous());

        // The stale canonical response lands and must be discarded.
        hold.notify_one();
        let slow_result = slow.await.unwrap();

        assert_eq!(gate.current(), Some(after_sign_out.clone()));
        assert_eq!(slow_result, after_sign_out);
        assert_ne!(gate.current(), Some(PassId::from("cust_stale")));
    }

    #[tokio::test]
    async fn publish_skips_redundant_updates() {
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, MemoryTokenStore::new(), MockVerifier::canonical("x"));

        let mut rx = gate.subscribe();
        let first = gate.resolve().await;
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        let second = gate.resolve().await;
        assert_eq!(first, second);
        assert!(!rx.has_changed().unwrap(), "unchanged token must not republish");
    }

    #[tokio::test]
    async fn link_legacy_identity_swaps_in_the_canonical_token() {
        let store = MemoryTokenStore::with_token(PassId::from("user-8d2f1"));
        let (provider, _) = MockProvider::authenticated("bearer-1");
        // Keep the legacy token in place during resolve.
        let verifier = MockVerifier::returning(VerifyOutcome::Unavailable);
        let gate = IdentityGate::new(provider, store, verifier);

        let before = gate.resolve().await;
        assert!(before.is_legacy());

        let migrated = gate.link_legacy_identity().await.unwrap();
        assert_eq!(migrated, PassId::from("cust_migrated"));
        assert_eq!(gate.current(), Some(migrated.clone()));
        // Persisted too.
        assert_eq!(gate.resolve().await, migrated);
    }

    #[tokio::test]
    async fn link_legacy_identity_requires_a_session() {
        let store = MemoryTokenStore::with_token(PassId::from("user-8d2f1"));
        let (provider, _) = MockProvider::anonymous();
        let gate = IdentityGate::new(provider, store, MockVerifier::canonical("x"));

        assert!(matches!(
            gate.link_legacy_identity().await,
            Err(Error::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn link_legacy_identity_rejects_non_legacy_tokens() {
        let store = MemoryTokenStore::with_token(PassId::from("cust_77a0"));
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::returning(VerifyOutcome::Unavailable);
        let gate = IdentityGate::new(provider, store, verifier);

        assert!(matches!(
            gate.link_legacy_identity().await,
            Err(Error::NoLegacyIdentity)
        ));
    }

    #[tokio::test]
    async fn migration_failure_names_the_failing_stage() {
        let store = MemoryTokenStore::with_token(PassId::from("user-8d2f1"));
        let (provider, _) = MockProvider::authenticated("bearer-1");
        let verifier = MockVerifier::returning(VerifyOutcome::Unavailable);
        *verifier.migrate_result.lock().unwrap() =
            Err((MigrationStage::Ledger, "re-key aborted".into()));
        let gate = IdentityGate::new(provider, store, verifier);

        let err = gate.link_legacy_identity().await.unwrap_err();
        match err {
            Error::Migration { stage, detail } => {
                assert_eq!(stage, MigrationStage::Ledger);
                assert_eq!(detail, "re-key aborted");
            }
            other => panic!("expected migration error, got {other}"),
        }
        // Identity untouched on failure.
        assert_eq!(gate.current(), None);
    }
}
