//! Configuration for givingctl

use giving_sync::EngineConfig;
use serde::{Deserialize, Serialize};

/// Operator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GivingConfig {
    /// Reconciliation engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GivingConfig {
    /// Load configuration from defaults, an optional file and `GIVING_*`
    /// environment variables, in that order.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&GivingConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // GIVING_ENGINE__DONATION_COLLECT_COUNT_LIMIT=25
        builder = builder.add_source(
            config::Environment::with_prefix("GIVING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
