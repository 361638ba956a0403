use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::shared::ValidationError;

/// What a connection to the target store is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Staging loads, merges and ledger updates.
    Store,
    /// Applying the ledger migrations.
    Migrations,
}

/// Postgres session parameters sent on connect. Timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub application_name: &'static str,
    pub statement_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub idle_in_transaction_timeout_ms: u32,
}

impl SessionOptions {
    pub fn for_role(role: SessionRole) -> Self {
        match role {
            // Merges of large files run for minutes, lock waits must surface as conflicts.
            SessionRole::Store => Self {
                application_name: "etl_ingest_store",
                statement_timeout_ms: 300_000,
                lock_timeout_ms: 30_000,
                idle_in_transaction_timeout_ms: 60_000,
            },
            SessionRole::Migrations => Self {
                application_name: "etl_ingest_migrations",
                statement_timeout_ms: 120_000,
                lock_timeout_ms: 10_000,
                idle_in_transaction_timeout_ms: 60_000,
            },
        }
    }

    /// Parameters in the form expected by [`PgConnectOptions::options`].
    pub fn parameters(&self) -> [(&'static str, String); 7] {
        [
            ("datestyle", "ISO".to_string()),
            ("client_encoding", "UTF8".to_string()),
            ("timezone", "UTC".to_string()),
            ("statement_timeout", self.statement_timeout_ms.to_string()),
            ("lock_timeout", self.lock_timeout_ms.to_string()),
            (
                "idle_in_transaction_session_timeout",
                self.idle_in_transaction_timeout_ms.to_string(),
            ),
            ("application_name", self.application_name.to_string()),
        ]
    }
}

/// Connection settings of the target store.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("store.connection.host", &self.host),
            ("store.connection.name", &self.name),
            ("store.connection.username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(field.to_string()));
            }
        }

        if self.tls.enabled && self.tls.trusted_root_certs.trim().is_empty() {
            return Err(ValidationError::invalid(
                "store.connection.tls.trusted_root_certs",
                "must be provided when tls is enabled",
            ));
        }

        Ok(())
    }

    /// Driver options for the configured database, carrying the session parameters of `role`.
    ///
    /// With TLS enabled the server certificate is verified against the configured roots,
    /// otherwise TLS is only preferred.
    pub fn connect_options(&self, role: SessionRole) -> PgConnectOptions {
        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username)
            .options(SessionOptions::for_role(role).parameters());

        options = if self.tls.enabled {
            options
                .ssl_mode(PgSslMode::VerifyFull)
                .ssl_root_cert_from_pem(self.tls.trusted_root_certs.as_bytes().to_vec())
        } else {
            options.ssl_mode(PgSslMode::Prefer)
        };

        match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM bundle of the roots trusted for the store's certificate.
    #[serde(default)]
    pub trusted_root_certs: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "analytics".to_string(),
            username: "ingest".to_string(),
            password: None,
            tls: TlsConfig::default(),
        }
    }

    #[test]
    fn store_sessions_are_named_and_bounded() {
        let parameters = SessionOptions::for_role(SessionRole::Store).parameters();

        assert!(parameters.contains(&("application_name", "etl_ingest_store".to_string())));
        assert!(parameters.contains(&("lock_timeout", "30000".to_string())));
    }

    #[test]
    fn migrations_use_their_own_application_name() {
        let options = SessionOptions::for_role(SessionRole::Migrations);

        assert_eq!(options.application_name, "etl_ingest_migrations");
        assert!(options.statement_timeout_ms < SessionOptions::for_role(SessionRole::Store).statement_timeout_ms);
    }

    #[test]
    fn tls_without_certificates_is_rejected() {
        let mut config = config();
        config.tls.enabled = true;

        assert!(config.validate().is_err());

        config.tls.trusted_root_certs = "-----BEGIN CERTIFICATE-----".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn blank_username_is_rejected() {
        let mut config = config();
        config.username = " ".to_string();

        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyField(field)) if field == "store.connection.username"
        ));
    }
}
