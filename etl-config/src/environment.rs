use std::fmt;
use std::io::Error;

/// Name of the environment variable selecting the runtime environment.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

const DEV_ENV_NAME: &str = "dev";

const PROD_ENV_NAME: &str = "prod";

/// Runtime environment of the ingestion service.
///
/// Selects which `configuration/{environment}.yaml` overlay is applied on top of the
/// base configuration and is reported to Sentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    /// Reads the environment from `APP_ENVIRONMENT`, defaulting to [`Environment::Dev`].
    pub fn load() -> Result<Environment, Error> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(value) => value.try_into(),
            Err(_) => Ok(Environment::Dev),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => DEV_ENV_NAME,
            Environment::Prod => PROD_ENV_NAME,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Environment {
    type Error = Error;

    /// Parses `dev` or `prod`, ignoring case.
    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            DEV_ENV_NAME => Ok(Environment::Dev),
            PROD_ENV_NAME => Ok(Environment::Prod),
            other => Err(Error::other(format!(
                "`{other}` is not a supported environment, expected `{DEV_ENV_NAME}` or `{PROD_ENV_NAME}`",
            ))),
        }
    }
}
