//! Settings for the store connection and the election machinery.
//!
//! Sources are merged in this order, later ones winning:
//! 1. Default values (hardcoded)
//! 2. A TOML file, given explicitly or through `ELECTOR_CONFIG_PATH`
//! 3. Environment variables prefixed with `ELECTOR__`
//!    (e.g. `ELECTOR__ELECTION__SESSION_TTL_IN_SECS=10`)

mod election;
mod store;
pub use election::*;
pub use store::*;


//---
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Environment variable naming an optional settings file
pub const CONFIG_PATH_ENV: &str = "ELECTOR_CONFIG_PATH";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Store connection parameters
    #[serde(default)]
    pub store: StoreConfig,
    /// Campaign, observe and session parameters
    #[serde(default)]
    pub election: ElectionConfig,
}

impl Settings {
    /// Loads and validates settings.
    ///
    /// # Arguments
    /// * `path` - Optional settings file; takes precedence over
    ///   `ELECTOR_CONFIG_PATH`
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        let path = path.map(String::from).or_else(|| env::var(CONFIG_PATH_ENV).ok());
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("ELECTOR")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.endpoints"),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.election.validate()?;
        Ok(())
    }
}
