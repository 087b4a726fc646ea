use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STORAGE_KEY: &str = "passgate.pass_id";

/// Gate configuration.
///
/// The required field (the backend base URL) is a constructor parameter —
/// no runtime "missing field" errors. Endpoints derive from the base URL
/// and can be overridden individually with `with_*` methods.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GateConfig {
    pub(crate) verify_url: Url,
    pub(crate) migrate_url: Url,
    pub(crate) verify_timeout: Duration,
    pub(crate) storage_key: String,
}

impl GateConfig {
    /// Create a configuration against a backend base URL.
    ///
    /// `verify_url` becomes `<base>/me` and `migrate_url`
    /// `<base>/identity/migrate`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot be a base
    /// (e.g. `data:` URLs).
    pub fn new(base_url: Url) -> Result<Self, Error> {
        let join = |path: &str| {
            base_url
                .join(path)
                .map_err(|e| Error::Config(format!("base URL: {e}")))
        };
        Ok(Self {
            verify_url: join("me")?,
            migrate_url: join("identity/migrate")?,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            storage_key: DEFAULT_STORAGE_KEY.into(),
        })
    }

    /// Create a configuration from environment variables.
    ///
    /// # Required env vars
    /// - `PASSGATE_API_URL`: backend base URL
    ///
    /// # Optional env vars
    /// - `PASSGATE_VERIFY_URL`: override the verification endpoint
    /// - `PASSGATE_MIGRATE_URL`: override the migration endpoint
    /// - `PASSGATE_VERIFY_TIMEOUT_SECS`: verification call timeout
    /// - `PASSGATE_STORAGE_KEY`: local storage key name
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or values
    /// fail to parse.
    pub fn from_env() -> Result<Self, Error> {
        let base: Url = std::env::var("PASSGATE_API_URL")
            .map_err(|_| Error::Config("PASSGATE_API_URL is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("PASSGATE_API_URL: {e}")))?;

        let mut config = Self::new(base)?;

        if let Ok(url_str) = std::env::var("PASSGATE_VERIFY_URL") {
            config.verify_url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("PASSGATE_VERIFY_URL: {e}")))?;
        }
        if let Ok(url_str) = std::env::var("PASSGATE_MIGRATE_URL") {
            config.migrate_url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("PASSGATE_MIGRATE_URL: {e}")))?;
        }
        if let Ok(secs) = std::env::var("PASSGATE_VERIFY_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("PASSGATE_VERIFY_TIMEOUT_SECS: {e}")))?;
            config.verify_timeout = Duration::from_secs(secs);
        }
        if let Ok(key) = std::env::var("PASSGATE_STORAGE_KEY") {
            config.storage_key = key;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_verify_url(mut self, url: Url) -> Self {
        self.verify_url = url;
        self
    }

    #[must_use]
    pub fn with_migrate_url(mut self, url: Url) -> Self {
        self.migrate_url = url;
        self
    }

    /// Bound on the verification call. Resolution is explicitly
    /// non-blocking for the rest of the app, so this stays small.
    #[must_use]
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    #[must_use]
    pub fn migrate_url(&self) -> &Url {
        &self.migrate_url
    }

    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        self.verify_timeout
    }

    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }
}
