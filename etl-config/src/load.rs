use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Extensions probed, in order, for every configuration file stem.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Stem of the configuration file that is always loaded first.
const BASE_FILE_STEM: &str = "base";

const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys, e.g. `APP_MERGE__MAX_ATTEMPTS`.
const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures loaded through [`load_config`].
pub trait Config {
    /// Keys whose environment variable values are split on commas into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors raised while assembling the layered configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate the base configuration in `{directory}`; attempted: {attempted}")]
    BaseFileMissing { directory: PathBuf, attempted: String },

    #[error("failed to load configuration file `{path}`: {source}")]
    FileLoad {
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads configuration from `./configuration` for the environment named by `APP_ENVIRONMENT`.
///
/// See [`load_config_from`] for the layering rules.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load()?;

    load_config_from(&base_path.join(CONFIGURATION_DIR), environment)
}

/// Loads configuration layered from files in `directory` and the process environment.
///
/// Layers, later ones overriding earlier ones:
/// 1. `base.(yaml|yml|json)`, which must exist.
/// 2. `{environment}.(yaml|yml|json)`, applied when present.
/// 3. `APP_`-prefixed environment variables, with `__` separating nested keys and commas
///    separating list elements for the keys listed in [`Config::LIST_PARSE_KEYS`].
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = find_configuration_file(directory, BASE_FILE_STEM).ok_or_else(|| {
        LoadConfigError::BaseFileMissing {
            directory: directory.to_path_buf(),
            attempted: attempted_paths(directory, BASE_FILE_STEM),
        }
    })?;

    let mut builder =
        rust_cli_config::Config::builder().add_source(rust_cli_config::File::from(base_file.clone()));
    check_source(&builder, &base_file)?;

    if let Some(environment_file) = find_configuration_file(directory, environment.as_str()) {
        builder = builder.add_source(rust_cli_config::File::from(environment_file.clone()));
        check_source(&builder, &environment_file)?;
    }

    let settings = builder
        .add_source(environment_source::<T>())
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn environment_source<T: Config>() -> rust_cli_config::Environment {
    let mut source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        source = source.try_parsing(true).list_separator(LIST_SEPARATOR);
        for key in T::LIST_PARSE_KEYS {
            source = source.with_list_parse_key(key);
        }
    }

    source
}

fn find_configuration_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
}

fn attempted_paths(directory: &Path, stem: &str) -> String {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| format!("`{}`", directory.join(format!("{stem}.{extension}")).display()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the configuration accumulated so far so that a broken file is reported by path.
fn check_source(builder: &ConfigBuilder<DefaultState>, path: &Path) -> Result<(), LoadConfigError> {
    builder
        .clone()
        .build()
        .map(|_| ())
        .map_err(|source| LoadConfigError::FileLoad {
            path: path.to_path_buf(),
            source,
        })
}
