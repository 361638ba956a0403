use secrecy::SecretString;
use serde::Deserialize;

/// Sentry error tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SentryConfig {
    /// DSN failed runs are reported to.
    pub dsn: SecretString,
}
