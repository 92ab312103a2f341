//! Streaming configuration, loaded from RON files.

use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::error;
use serde::{Deserialize, Serialize};

/// Error related to loading or writing a `StreamingConfig`.
#[derive(Debug)]
pub enum ConfigError {
    /// Forward to the `std::io::Error` error.
    File(io::Error),
    /// Errors related to serde's parsing of configuration files.
    Parser(String),
    /// Occurs if a value is ill-formed during serialization.
    Serializer(String),
    /// Related to the path of the file.
    Extension(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::File(ref err) => write!(f, "{}", err),
            ConfigError::Parser(ref msg) => write!(f, "{}", msg),
            ConfigError::Serializer(ref msg) => write!(f, "{}", msg),
            ConfigError::Extension(ref path) => {
                let found = match path.extension() {
                    Some(extension) => format!("{:?}", extension),
                    None => "a directory.".to_string(),
                };

                write!(
                    f,
                    "{}: Invalid path extension, expected \"ron\", got {}.",
                    path.display(),
                    found,
                )
            }
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError {
        ConfigError::File(e)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ConfigError::File(ref err) => Some(err),
            _ => None,
        }
    }
}

/// Tuning knobs of the `ResourceManager` and its worker pools.
///
/// Every field is optional in the RON file; missing fields take their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of data load task slots allocated up front.
    pub initial_data_load_tasks: usize,
    /// Number of content update task slots allocated up front.
    pub initial_update_content_tasks: usize,
    /// How many queue entries get their priority re-evaluated per frame.
    pub priority_update_batch: usize,
    /// Reloaded resources acquired within this window are queued again right away.
    pub reload_grace_period: Duration,
    /// Time budget per frame for freeing unused resources. `None` disables it.
    pub auto_free_unused_timeout: Option<Duration>,
    /// Resources acquired more recently than this are not freed by the per frame sweep.
    pub auto_free_unused_threshold: Duration,
    /// Threads in the file access pool.
    pub file_access_threads: usize,
    /// Threads in the general worker pool. `None` lets rayon decide.
    pub worker_threads: Option<usize>,
    /// Directory the default file loader reads from.
    pub resource_root: PathBuf,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            initial_data_load_tasks: 4,
            initial_update_content_tasks: 16,
            priority_update_batch: 50,
            reload_grace_period: Duration::from_secs(30),
            auto_free_unused_timeout: None,
            auto_free_unused_threshold: Duration::from_secs(30),
            file_access_threads: 1,
            worker_threads: None,
            resource_root: PathBuf::from("resources"),
        }
    }
}

impl StreamingConfig {
    /// Loads the configuration from a file.
    /// Falls back to the defaults if the file fails in any way.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        Self::load_no_fallback(path.as_ref()).unwrap_or_else(|e| {
            error!(
                "Failed to load streaming config file '{}': {}",
                path.as_ref().display(),
                e
            );

            Self::default()
        })
    }

    /// Loads the configuration from a file.
    pub fn load_no_fallback<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if path.extension().and_then(|e| e.to_str()) != Some("ron") {
            return Err(ConfigError::Extension(path.to_path_buf()));
        }

        let content = std::fs::read(path)?;
        Self::load_bytes(&content)
    }

    /// Loads the configuration from raw RON bytes.
    pub fn load_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let parse_error = |e: ron::de::Error| ConfigError::Parser(e.to_string());

        let mut de = ron::de::Deserializer::from_bytes(bytes).map_err(parse_error)?;
        let val = Self::deserialize(&mut de).map_err(parse_error)?;
        de.end().map_err(parse_error)?;

        Ok(val)
    }

    /// Writes the configuration to a file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        use ron::ser::to_string_pretty;

        let s = to_string_pretty(self, Default::default())
            .map_err(|e| ConfigError::Serializer(e.to_string()))?;
        std::fs::write(path, s.as_bytes())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConfigError, StreamingConfig};

    #[test]
    fn missing_fields_take_defaults() {
        let config = StreamingConfig::load_bytes(b"(priority_update_batch: 8)")
            .expect("Failed to parse config");

        assert_eq!(8, config.priority_update_batch);
        assert_eq!(4, config.initial_data_load_tasks);
        assert_eq!(Duration::from_secs(30), config.reload_grace_period);
    }

    #[test]
    fn rejects_non_ron_extension() {
        match StreamingConfig::load_no_fallback("streaming.toml") {
            Err(ConfigError::Extension(path)) => assert_eq!("streaming.toml", path.to_str().unwrap()),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("streaming.ron");

        let mut config = StreamingConfig::default();
        config.auto_free_unused_timeout = Some(Duration::from_millis(2));
        config.worker_threads = Some(3);
        config.write(&path).expect("Failed to write config");

        assert_eq!(config, StreamingConfig::load(&path));
    }
}
