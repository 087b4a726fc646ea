//! Redirect callback parsing and URL scrubbing.
//!
//! After a redirect-based login the provider appends either an
//! authorization code, an error, or (older flows) the tokens themselves
//! to the return URL — sometimes in the query string, sometimes in the
//! fragment. The same fragment syntax is also used for client-side route
//! paths, so the fragment is only treated as parameters when it actually
//! looks like a `key=value` string.

use url::Url;
use url::form_urlencoded;

/// Parameters stripped from the URL once the callback has been consumed.
const RECOGNIZED: &[&str] = &[
    "code",
    "state",
    "error",
    "error_code",
    "error_description",
    "access_token",
    "refresh_token",
    "token_type",
    "expires_in",
    "provider_token",
];

/// Callback parameters found in a return URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl CallbackParams {
    /// Read callback parameters out of both the query string and, when
    /// eligible, the fragment.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            params.set(&key, &value);
        }
        if let Some(frag) = url.fragment() {
            if fragment_is_params(frag) {
                for (key, value) in form_urlencoded::parse(frag.as_bytes()) {
                    params.set(&key, &value);
                }
            }
        }
        params
    }

    fn set(&mut self, key: &str, value: &str) {
        let slot = match key {
            "code" => &mut self.code,
            "error" => &mut self.error,
            "error_code" => &mut self.error_code,
            "error_description" => &mut self.error_description,
            "access_token" => &mut self.access_token,
            "refresh_token" => &mut self.refresh_token,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value.to_owned());
        }
    }

    /// No callback is in flight: nothing to exchange, nothing to report.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
            && !self.has_error()
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }

    /// User-facing copy for a provider-reported callback error.
    ///
    /// Known codes map to specific copy; anything else falls back to the
    /// provider's description, then to a generic message.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if !self.has_error() {
            return None;
        }
        let code = self
            .error_code
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or_default();
        Some(match code {
            "flow_state_not_found" | "flow_state_expired" | "otp_expired" => {
                "Your sign-in link has expired. Please request a new one and try again."
                    .to_owned()
            }
            "access_denied" => "Sign-in was cancelled. You can try again at any time.".to_owned(),
            _ => self
                .error_description
                .clone()
                .unwrap_or_else(|| "Sign-in failed. Please try again.".to_owned()),
        })
    }
}

/// A fragment is parsed as parameters only if it looks like a
/// `key=value` string, never if it looks like a route path.
fn fragment_is_params(frag: &str) -> bool {
    !frag.is_empty() && !frag.starts_with('/') && frag.contains('=')
}

/// Strip every recognized callback parameter from the query and the
/// fragment, preserving everything else. Running this on an already
/// scrubbed URL is a no-op.
#[must_use]
pub fn scrub_url(url: &Url) -> Url {
    let mut cleaned = url.clone();

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !RECOGNIZED.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if retained.is_empty() {
        cleaned.set_query(None);
    } else if retained.len() != url.query_pairs().count() {
        cleaned.query_pairs_mut().clear().extend_pairs(retained);
    }

    if let Some(frag) = url.fragment() {
        if fragment_is_params(frag) {
            let retained: Vec<(String, String)> = form_urlencoded::parse(frag.as_bytes())
                .filter(|(key, _)| !RECOGNIZED.contains(&key.as_ref()))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if retained.is_empty() {
                cleaned.set_fragment(None);
            } else {
                let rebuilt = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(retained)
                    .finish();
                cleaned.set_fragment(Some(&rebuilt));
            }
        }
    }

    cleaned
}
