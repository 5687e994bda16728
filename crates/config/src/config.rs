//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Daemon-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Port the control endpoint binds to on 127.0.0.1
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding queue snapshots and the daemon lock (platform temp dir if None)
    pub state_dir: Option<PathBuf>,
    /// Scratch directory for transcoded output awaiting placement (derived from state_dir if None)
    pub temp_dir: Option<PathBuf>,
}

fn default_port() -> u16 {
    9393
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            state_dir: None,
            temp_dir: None,
        }
    }
}

/// Worker and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Concurrent transcode workers (0 = auto-derive from CPU count)
    #[serde(default)]
    pub convert_workers: u32,
    /// Attempts per job before a transient write failure becomes fatal
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    /// Consecutive transient failures before processing auto-pauses
    #[serde(default = "default_pause_after_transient_failures")]
    pub pause_after_transient_failures: u32,
}

fn default_max_write_retries() -> u32 {
    3
}

fn default_pause_after_transient_failures() -> u32 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            convert_workers: 0,
            max_write_retries: default_max_write_retries(),
            pause_after_transient_failures: default_pause_after_transient_failures(),
        }
    }
}

/// A named transcode profile handed to the external encoder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    /// Profile identifier referenced by enqueue requests
    pub name: String,
    /// Target container/extension, e.g. "mp3"
    pub format: String,
    /// Extra encoder arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProfileConfig {
    /// Built-in fallback profile used when no profiles are configured:
    /// mp3 via lame at V0 quality.
    pub fn builtin_mp3_v0() -> Self {
        Self {
            name: "mp3-v0".to_string(),
            format: "mp3".to_string(),
            args: vec!["-q:a".to_string(), "0".to_string()],
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default, rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PORTAGE_PORT -> daemon.port
    /// - PORTAGE_STATE_DIR -> daemon.state_dir
    /// - PORTAGE_CONVERT_WORKERS -> workers.convert_workers
    /// - PORTAGE_MAX_WRITE_RETRIES -> workers.max_write_retries
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PORTAGE_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.daemon.port = port;
            }
        }

        if let Ok(val) = env::var("PORTAGE_STATE_DIR") {
            if !val.is_empty() {
                self.daemon.state_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("PORTAGE_CONVERT_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.convert_workers = workers;
            }
        }

        if let Ok(val) = env::var("PORTAGE_MAX_WRITE_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.workers.max_write_retries = retries;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolved state directory (defaults to `<tempdir>/portage`)
    pub fn state_dir(&self) -> PathBuf {
        self.daemon
            .state_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("portage"))
    }

    /// Resolved scratch directory for transcode output (defaults to `<state_dir>/convert_temp`)
    pub fn temp_dir(&self) -> PathBuf {
        self.daemon
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("convert_temp"))
    }

    /// Transcode profiles, falling back to the built-in mp3 profile when none
    /// are configured.
    pub fn effective_profiles(&self) -> Vec<ProfileConfig> {
        if self.profiles.is_empty() {
            vec![ProfileConfig::builtin_mp3_v0()]
        } else {
            self.profiles.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("PORTAGE_PORT");
        env::remove_var("PORTAGE_STATE_DIR");
        env::remove_var("PORTAGE_CONVERT_WORKERS");
        env::remove_var("PORTAGE_MAX_WRITE_RETRIES");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..u16::MAX,
            workers in 0u32..64,
            retries in 0u32..16,
            pause_after in 1u32..32,
        ) {
            let toml_str = format!(
                r#"
[daemon]
port = {}

[workers]
convert_workers = {}
max_write_retries = {}
pause_after_transient_failures = {}

[[profile]]
name = "ogg-q6"
format = "ogg"
args = ["-q:a", "6"]
"#,
                port, workers, retries, pause_after
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.daemon.port, port);
            prop_assert_eq!(config.workers.convert_workers, workers);
            prop_assert_eq!(config.workers.max_write_retries, retries);
            prop_assert_eq!(config.workers.pause_after_transient_failures, pause_after);
            prop_assert_eq!(config.profiles.len(), 1);
            prop_assert_eq!(&config.profiles[0].name, "ogg-q6");
            prop_assert_eq!(&config.profiles[0].format, "ogg");
        }

        #[test]
        fn prop_env_overrides_port(
            initial_port in 1u16..u16::MAX,
            override_port in 1u16..u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[daemon]
port = {}
"#,
                initial_port
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PORTAGE_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.daemon.port, override_port);
        }

        #[test]
        fn prop_env_overrides_convert_workers(
            initial_workers in 0u32..32,
            override_workers in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[workers]
convert_workers = {}
"#,
                initial_workers
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PORTAGE_CONVERT_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.workers.convert_workers, override_workers);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.daemon.port, 9393);
        assert_eq!(config.daemon.state_dir, None);
        assert_eq!(config.workers.convert_workers, 0);
        assert_eq!(config.workers.max_write_retries, 3);
        assert_eq!(config.workers.pause_after_transient_failures, 5);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[daemon]
state_dir = "/var/lib/portage"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.daemon.state_dir, Some(PathBuf::from("/var/lib/portage")));
        assert_eq!(config.daemon.port, 9393); // default
        assert_eq!(config.workers.max_write_retries, 3); // default
    }

    #[test]
    fn test_env_overrides_state_dir() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("PORTAGE_STATE_DIR", "/srv/portage-state");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.daemon.state_dir, Some(PathBuf::from("/srv/portage-state")));
        assert_eq!(config.state_dir(), PathBuf::from("/srv/portage-state"));
    }

    #[test]
    fn test_state_dir_defaults_to_temp() {
        let config = Config::default();
        assert!(config.state_dir().ends_with("portage"));
        assert!(config.temp_dir().ends_with("convert_temp"));
    }

    #[test]
    fn test_effective_profiles_falls_back_to_builtin() {
        let config = Config::default();
        let profiles = config.effective_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "mp3-v0");
        assert_eq!(profiles[0].format, "mp3");
        assert_eq!(profiles[0].args, vec!["-q:a", "0"]);
    }

    #[test]
    fn test_effective_profiles_uses_configured() {
        let toml_str = r#"
[[profile]]
name = "ogg-q6"
format = "ogg"
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        let profiles = config.effective_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "ogg-q6");
        assert!(profiles[0].args.is_empty());
    }
}
