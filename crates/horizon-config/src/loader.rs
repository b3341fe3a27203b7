//! Configuration loader with layered sources.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use horizon_core::HorizonError;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Loaded {
    app: AppConfig,
    raw: Config,
}

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    state: Arc<RwLock<Loaded>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `HORIZON__` prefix (`__` separates nested keys)
    pub fn new(config_dir: impl Into<String>) -> Result<Self, HorizonError> {
        let config_dir = config_dir.into();
        let loaded = Self::load_config(&config_dir)?;

        Ok(Self {
            state: Arc::new(RwLock::new(loaded)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, HorizonError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.state.read().await.app.clone()
    }

    /// Reads a configuration section owned by another crate.
    ///
    /// A missing section is an error; use [`Self::section_or_default`] when
    /// defaults are acceptable.
    pub async fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T, HorizonError> {
        let state = self.state.read().await;
        state.raw.get::<T>(key).map_err(config_error_to_horizon_error)
    }

    /// Reads a configuration section, falling back to `T::default()` when
    /// the key is absent.
    pub async fn section_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, HorizonError> {
        let state = self.state.read().await;
        match state.raw.get::<T>(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => {
                debug!(key, "Configuration section absent, using defaults");
                Ok(T::default())
            }
            Err(e) => Err(config_error_to_horizon_error(e)),
        }
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> Result<(), HorizonError> {
        let loaded = Self::load_config(&self.config_dir)?;
        let mut state = self.state.write().await;
        *state = loaded;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str) -> Result<Loaded, HorizonError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var("HORIZON_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HORIZON")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build().map_err(config_error_to_horizon_error)?;
        let app: AppConfig = raw.clone().try_deserialize().map_err(config_error_to_horizon_error)?;

        Self::validate_config(&app)?;

        Ok(Loaded { app, raw })
    }

    fn validate_config(config: &AppConfig) -> Result<(), HorizonError> {
        if config.database.url.is_empty() {
            return Err(HorizonError::Configuration("Database URL is required".to_string()));
        }

        if config.database.max_connections == 0 {
            return Err(HorizonError::Configuration(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        if config.database.min_connections > config.database.max_connections {
            warn!(
                min = config.database.min_connections,
                max = config.database.max_connections,
                "database.min_connections exceeds max_connections"
            );
        }

        Ok(())
    }
}

fn config_error_to_horizon_error(err: ConfigError) -> HorizonError {
    HorizonError::Configuration(err.to_string())
}
