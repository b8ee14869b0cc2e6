use renova_sync_core::{ConflictStrategy, SyncOptions, DEFAULT_CONFLICT_WINDOW};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Collections synchronized when the config file does not list any.
pub const DEFAULT_COLLECTIONS: [&str; 4] = [
    "crm_clientes",
    "crm_produtos_pdv",
    "crm_vendas_pdv",
    "crm_caixa",
];

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

fn default_realtime() -> bool {
    true
}

/// Remote store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Server URL (e.g., "http://localhost:8080" or "https://sync.example.com")
    pub server_url: Option<String>,
    /// API key for authentication
    pub api_key: Option<String>,
    /// Subscribe to realtime changes while online (default: true)
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            realtime: default_realtime(),
        }
    }
}

impl RemoteConfig {
    /// Returns true if the remote is configured (has both server_url and api_key)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding collection files and the sync queue
    pub data_dir: ConfigValue<PathBuf>,
    /// Conflict resolution strategy
    pub conflict_strategy: ConfigValue<ConflictStrategy>,
    /// Collections pulled and subscribed on sync
    pub collections: ConfigValue<Vec<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Remote store configuration
    pub remote: RemoteConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    conflict_strategy: Option<ConflictStrategy>,
    collections: Option<Vec<String>>,
    remote: Option<RemoteConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut conflict_strategy =
            ConfigValue::new(ConflictStrategy::default(), ConfigSource::Default);
        let mut collections = ConfigValue::new(
            DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            ConfigSource::Default,
        );
        let mut config_file = None;
        let mut remote = RemoteConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(strategy) = file_config.conflict_strategy {
                conflict_strategy = ConfigValue::new(strategy, ConfigSource::File);
            }
            if let Some(names) = file_config.collections {
                collections = ConfigValue::new(names, ConfigSource::File);
            }
            if let Some(remote_config) = file_config.remote {
                remote = remote_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(dir) = std::env::var("RENOVA_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }
        if let Ok(strategy) = std::env::var("RENOVA_CONFLICT_STRATEGY") {
            let parsed = strategy
                .parse()
                .map_err(|e| ConfigError::InvalidValue("RENOVA_CONFLICT_STRATEGY", format!("{}", e)))?;
            conflict_strategy = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        // Remote env var overrides
        if let Ok(url) = std::env::var("RENOVA_SERVER_URL") {
            remote.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("RENOVA_API_KEY") {
            remote.api_key = Some(key);
        }

        for name in &collections.value {
            renova_sync_core::store::validate_collection(name)
                .map_err(|e| ConfigError::InvalidValue("collections", e.to_string()))?;
        }

        Ok(Self {
            data_dir,
            conflict_strategy,
            collections,
            config_file,
            remote,
        })
    }

    /// Engine options derived from this configuration.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            strategy: self.conflict_strategy.value,
            conflict_window: DEFAULT_CONFLICT_WINDOW,
            collections: self.collections.value.clone(),
            realtime: self.remote.realtime,
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.value.join("queue.db")
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/renova/
    /// - macOS: ~/Library/Application Support/renova/
    /// - Windows: %APPDATA%/renova/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("renova")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/renova/
    /// - macOS: ~/Library/Application Support/renova/
    /// - Windows: %APPDATA%/renova/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("renova")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(key, e) => {
                write!(f, "Invalid value for {}: {}", key, e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config.data_dir.value.to_string_lossy().contains("renova"));
        assert_eq!(config.data_dir.source, ConfigSource::Default);
        assert_eq!(config.conflict_strategy.value, ConflictStrategy::LastWriteWins);
        assert_eq!(config.collections.value.len(), 4);
        assert!(!config.remote.is_configured());
        assert!(config.remote.realtime);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "data_dir: /custom/renova").unwrap();
        writeln!(file, "conflict_strategy: merge").unwrap();
        writeln!(file, "collections: [clientes, produtos]").unwrap();
        writeln!(file, "remote:").unwrap();
        writeln!(file, "  server_url: http://localhost:8080").unwrap();
        writeln!(file, "  api_key: secret").unwrap();
        writeln!(file, "  realtime: false").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(config.data_dir.value, PathBuf::from("/custom/renova"));
        assert_eq!(config.data_dir.source, ConfigSource::File);
        assert_eq!(config.conflict_strategy.value, ConflictStrategy::Merge);
        assert_eq!(config.conflict_strategy.source, ConfigSource::File);
        assert_eq!(config.collections.value, vec!["clientes", "produtos"]);
        assert!(config.remote.is_configured());
        assert!(!config.remote.realtime);
        assert_eq!(config.config_file, Some(config_path));

        let options = config.sync_options();
        assert_eq!(options.strategy, ConflictStrategy::Merge);
        assert!(!options.realtime);
        assert_eq!(config.queue_path(), PathBuf::from("/custom/renova/queue.db"));
    }

    #[test]
    fn test_relative_data_dir_resolves_against_config_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: data\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.data_dir.value, temp_dir.path().join("data"));
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "conflict_strategy: merge").unwrap();

        // Set env var
        std::env::set_var("RENOVA_CONFLICT_STRATEGY", "remote-wins");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.conflict_strategy.value, ConflictStrategy::RemoteWins);
        assert_eq!(config.conflict_strategy.source, ConfigSource::Environment);

        // Clean up
        std::env::remove_var("RENOVA_CONFLICT_STRATEGY");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_unknown_strategy_in_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "conflict_strategy: newest\n").unwrap();

        assert!(Config::load(Some(config_path)).is_err());
    }

    #[test]
    fn test_invalid_collection_name() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "collections: [\"../etc\"]\n").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("collections"));
    }
}
