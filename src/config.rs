//! # Configuration Management
//!
//! Both halves of the program (the client orchestrator and the background
//! service) read the same configuration, layered from several sources:
//! - Default values (built into the code)
//! - A `config.json` / `config.toml` / `config.yaml` file in the working directory,
//!   or an explicit file passed with `--config`
//! - Environment variables (with the `WHISPER_RELAY_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`WHISPER_RELAY_LANGUAGE`, `WHISPER_RELAY_SERVER__PORT`, etc.)
//! 2. Configuration file
//! 3. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in environment variables because
//! several field names already contain a single one (`include_timestamps`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::output::OutputKind;

/// Main application configuration.
///
/// The flat top-level keys (`language`, `model`, `output_format`, ...) mirror the
/// layout of the `config.json` files users already have.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default locale code passed to the engine ("uk", "en", ...)
    pub language: String,

    /// Named model size: tiny, base, small, medium, large, large-v3
    pub model: String,

    /// Compute device preference: auto, cpu, cuda, metal
    pub device: String,

    /// Exports an allocator hint to the spawned service process
    pub expandable_segments: bool,

    /// Asks for relaxed certificate checks during model downloads
    pub unverified_ssl_context: bool,

    /// How transcripts are rendered unless a call overrides it
    pub output_format: OutputFormatConfig,

    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Output rendering defaults.
///
/// ## Example (`config.json`):
/// ```json
/// { "output_format": { "type": "srt", "include_timestamps": true, "include_confidence": false } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFormatConfig {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub include_timestamps: bool,
    pub include_confidence: bool,
}

/// Settings of the background transcription service.
///
/// ## Fields:
/// - `host` / `port`: well-known local address shared by client and service
/// - `idle_timeout_secs`: inactivity after which the service exits on its own
/// - `watchdog_interval_secs`: how often the idle watchdog wakes up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
}

/// Settings of the client orchestrator.
///
/// `poll_attempts * poll_interval_ms` bounds how long a freshly spawned service
/// gets to load its model before the invocation gives up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub health_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            language: "uk".to_string(),
            model: "medium".to_string(),
            device: "auto".to_string(),
            expandable_segments: true,
            unverified_ssl_context: false,
            output_format: OutputFormatConfig {
                kind: OutputKind::Text,
                include_timestamps: false,
                include_confidence: false,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only, the service has no authentication
                port: 8000,
                idle_timeout_secs: 600,
                watchdog_interval_secs: 30,
            },
            client: ClientConfig {
                health_timeout_ms: 1000,
                poll_interval_ms: 1000,
                poll_attempts: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with the explicit file, or `config.*` in the working directory if it exists
    /// 3. Override with environment variables prefixed with `WHISPER_RELAY_`
    ///
    /// An explicit `path` that does not exist is an error; the implicit
    /// `config.*` lookup is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_source = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("WHISPER_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Idle timeout and watchdog interval are positive
    /// - The client polls at least once after spawning a service
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.server.watchdog_interval_secs == 0 {
            return Err(anyhow::anyhow!("Watchdog interval must be greater than 0"));
        }

        if self.client.poll_attempts == 0 {
            return Err(anyhow::anyhow!("Poll attempts must be greater than 0"));
        }

        if self.language.trim().is_empty() {
            return Err(anyhow::anyhow!("Language cannot be empty"));
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Base URL the client uses to reach the service.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

impl ClientConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on how long one invocation waits for a spawned service.
    pub fn startup_window(&self) -> Duration {
        self.poll_interval() * self.poll_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    /// A `.json` config file that is deleted when dropped.
    fn json_config(contents: &str) -> NamedTempFile {
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.idle_timeout_secs, 600);
        assert_eq!(config.client.poll_attempts, 10);
        assert_eq!(config.output_format.kind, OutputKind::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.poll_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let file = json_config(
            r#"{"model": "tiny", "output_format": {"type": "srt", "include_timestamps": true}}"#,
        );

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.model, "tiny");
        assert_eq!(config.output_format.kind, OutputKind::Srt);
        assert!(config.output_format.include_timestamps);
        // Keys missing from the file fall back to the built-in defaults
        assert!(!config.output_format.include_confidence);
        assert_eq!(config.language, "uk");
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_unknown_output_type_falls_back_to_text() {
        let file = json_config(r#"{"output_format": {"type": "docx"}}"#);
        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.output_format.kind, OutputKind::Text);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(AppConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_startup_window() {
        let config = AppConfig::default();
        assert_eq!(config.client.startup_window(), Duration::from_secs(10));
        assert_eq!(config.server.base_url(), "http://127.0.0.1:8000");
    }
}
