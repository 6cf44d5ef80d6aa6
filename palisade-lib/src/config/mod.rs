use thiserror::Error;

use std::path::Path;
use tokio::fs;

mod model;
mod v1;
pub mod validate;

pub use model::*;

pub const DEFAULT_PATH: &str = "/etc/palisade/config.toml";
pub const ENV_VAR: &str = "PALISADE_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(u8),
    #[error(transparent)]
    Invalid(#[from] crate::Error),
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<v1::Config>(content)?;
            for key in v1::wrong_keys(&table) {
                tracing::warn!(%key, "ignoring unsupported key in configuration file");
            }
            let config: Config = res.into();
            validate::validate(&config)?;
            Ok(config)
        }
        _ => Err(Error::VersionMismatch(version as u8)),
    }
}
