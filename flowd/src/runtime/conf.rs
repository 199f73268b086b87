use std::{
    error::Error,
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::{
    cli::Cli,
    conf::conf_serde::{duration, level},
};

/// Settings of the Firefly backend. Fixed for the lifetime of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FireflyConf {
    /// UDP port fireflies are sent to.
    /// - Default: 10514
    #[serde(default = "defaults::destination_port")]
    pub destination_port: u16,

    /// Prefix every firefly with an RFC 5424 syslog header.
    /// - Default: true
    #[serde(default = "defaults::enabled")]
    pub prepend_syslog: bool,

    /// Enrich fireflies with the route/interface used to reach the flow destination.
    /// - Default: true
    #[serde(default = "defaults::enabled")]
    pub add_netlink_context: bool,

    /// Send fireflies here instead of to the destination address of each flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_address: Option<IpAddr>,
}

impl Default for FireflyConf {
    fn default() -> Self {
        Self {
            destination_port: defaults::destination_port(),
            prepend_syslog: defaults::enabled(),
            add_netlink_context: defaults::enabled(),
            collector_address: None,
        }
    }
}

/// Where flow identifiers are read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceConf {
    /// File or named pipe to read flow lines from. Stdin when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Application configuration.
///
/// Layered as: defaults < configuration file < `FLOWD_` environment
/// variables < CLI arguments. Nested keys use `__` in environment variables,
/// e.g. `FLOWD_FIREFLY__DESTINATION_PORT=20000`.
#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Path of the configuration file this configuration was loaded from.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(with = "level")]
    pub log_level: Level,

    /// Capacity of the channel between the flow source and the backends.
    /// - Default: 1024
    #[serde(default = "defaults::flow_channel_capacity")]
    pub flow_channel_capacity: usize,

    /// Maximum time to wait for backends to stop after a shutdown signal.
    /// - Default: 5s
    #[serde(default = "defaults::shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub source: SourceConf,

    #[serde(default)]
    pub firefly: FireflyConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            config_path: None,
            log_level: Level::INFO,
            flow_channel_capacity: defaults::flow_channel_capacity(),
            shutdown_timeout: defaults::shutdown_timeout(),
            source: SourceConf::default(),
            firefly: FireflyConf::default(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn destination_port() -> u16 {
        10514
    }

    pub fn enabled() -> bool {
        true
    }

    pub fn flow_channel_capacity() -> usize {
        1024
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Conf {
    /// Builds the configuration from defaults, the optional configuration
    /// file, `FLOWD_` environment variables and finally the CLI arguments.
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - the configured file does not exist.
    /// * `ConfigError::InvalidConfigPath` - the path is not a regular file.
    /// * `ConfigError::InvalidExtension` - the file is not YAML.
    /// * `ConfigError::Extraction` - the merged values do not form a valid `Conf`.
    /// * `ConfigError::InvalidValue` - a value is out of range.
    pub fn new(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(
            Env::prefixed("FLOWD_")
                .ignore(&["CONFIG_PATH"])
                .split("__"),
        );

        if let Some(level) = cli.log_level {
            figment = figment.merge(Serialized::default("log_level", level.as_str()));
        }
        if let Some(path) = &cli.source {
            figment = figment.merge(Serialized::default("source.path", path));
        }
        if let Some(port) = cli.destination_port {
            figment = figment.merge(Serialized::default("firefly.destination_port", port));
        }
        if let Some(collector) = cli.collector {
            figment = figment.merge(Serialized::default("firefly.collector_address", collector));
        }

        let mut conf: Conf = figment.extract()?;
        conf.validate()?;

        conf.config_path = config_path_to_store;
        Ok(conf)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "flow_channel_capacity",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Validates that the given path points to an existing YAML file.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfigError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        } else {
            return Err(ConfigError::NoConfigFile);
        }
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The specified configuration file does not exist.
    NoConfigFile,
    /// The path exists but is not a file (e.g., it's a directory).
    InvalidConfigPath(String),
    /// The file has an unsupported extension.
    InvalidExtension(String),
    /// Failed to extract configuration data.
    Extraction(Box<figment::Error>),
    /// A value was parsed but is out of range.
    InvalidValue {
        key: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigFile => write!(f, "no config file provided"),
            ConfigError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfigError::InvalidExtension(ext) => {
                write!(f, "invalid file extension '.{ext}', expected 'yaml' or 'yml'")
            }
            ConfigError::Extraction(e) => write!(f, "configuration error: {e}"),
            ConfigError::InvalidValue { key, reason } => write!(f, "invalid '{key}': {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Extraction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extraction(Box::from(e))
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }
    }

    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}
