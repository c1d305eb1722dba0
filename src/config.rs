//! Configuration management for chaser-engine

use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// How the event bus runs the handlers registered for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerMode {
    /// All handlers of an event run concurrently
    #[default]
    Parallel,
    /// Handlers run one after another in registration order
    Sequential,
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote browser endpoint (`ws://…/devtools/browser/…` or `http://host:port`).
    /// When unset a local browser is launched.
    pub cdp_endpoint: Option<String>,

    /// Chrome executable path
    pub chrome_path: Option<String>,

    /// Chrome data directory
    pub chrome_data_dir: Option<String>,

    /// Run launched browsers headless
    pub headless: bool,

    /// Extra command line arguments for launched browsers
    pub chrome_args: Vec<String>,

    /// First port of the local debugging port range
    pub port_range_start: u16,

    /// Last port of the local debugging port range (inclusive)
    pub port_range_end: u16,

    /// Default timeout for operations in milliseconds
    pub default_timeout: u64,

    /// Timeout for explicit navigations in milliseconds
    pub navigation_timeout: u64,

    /// Timeout for one DOM snapshot in milliseconds
    pub snapshot_timeout: u64,

    /// Permitted navigation destinations; empty means everything is allowed
    pub allowed_domains: Vec<String>,

    /// Always-rejected navigation destinations
    pub prohibited_domains: Vec<String>,

    /// Directory downloads are written to
    pub downloads_path: Option<String>,

    /// Storage-state JSON file replayed on session start
    pub storage_state_path: Option<String>,

    /// Write the storage state back on shutdown
    pub save_storage_state: bool,

    /// Maximum number of nested iframe documents merged into a snapshot
    pub max_iframe_depth: usize,

    /// Attach to out-of-process iframes and merge their documents
    pub cross_origin_iframes: bool,

    /// Network log entries retained per target
    pub network_log_capacity: usize,

    /// Resource kinds the network observer ignores
    pub ignored_resource_types: Vec<String>,

    /// Retries for commands that hit a detached session
    pub session_retry_attempts: u32,

    /// Base delay of the stale-session backoff in milliseconds
    pub session_retry_base_ms: u64,

    /// Click attempts after the first one
    pub click_retries: u32,

    /// Base delay between click attempts in milliseconds
    pub click_retry_delay_ms: u64,

    /// Delay growth between click attempts
    pub click_backoff: Backoff,

    /// How long a click waits for a navigation, in milliseconds
    pub navigation_race_timeout_ms: u64,

    /// How long a click waits for a download to start, in milliseconds
    pub download_start_timeout_ms: u64,

    /// How long a started download may take to finish, in milliseconds
    pub download_timeout_ms: u64,

    /// Move the pointer along curved paths and pace keystrokes
    pub humanize_input: bool,

    /// Fixed delay between keystrokes; random 50-150ms when unset
    pub typing_delay_ms: Option<u64>,

    /// Try to dismiss cookie/consent overlays before clicking
    pub dismiss_popups: bool,

    /// Viewport width applied to new pages
    pub viewport_width: u32,

    /// Viewport height applied to new pages
    pub viewport_height: u32,

    /// Focus tabs opened by the focused tab
    pub follow_new_tabs: bool,

    /// Event bus handler scheduling
    pub bus_handler_mode: HandlerMode,

    /// Per-handler timeout on the event bus in milliseconds
    pub bus_handler_timeout: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cdp_endpoint: None,
            chrome_path: None,
            chrome_data_dir: None,
            headless: true,
            chrome_args: vec![],
            port_range_start: 9300,
            port_range_end: 9899,
            default_timeout: 30000,
            navigation_timeout: 30000,
            snapshot_timeout: 15000,
            allowed_domains: vec![],
            prohibited_domains: vec![],
            downloads_path: None,
            storage_state_path: None,
            save_storage_state: false,
            max_iframe_depth: 3,
            cross_origin_iframes: true,
            network_log_capacity: 500,
            ignored_resource_types: vec![
                "Image".to_string(),
                "Font".to_string(),
                "Stylesheet".to_string(),
                "Media".to_string(),
            ],
            session_retry_attempts: 3,
            session_retry_base_ms: 100,
            click_retries: 2,
            click_retry_delay_ms: 500,
            click_backoff: Backoff::Linear,
            navigation_race_timeout_ms: 3000,
            download_start_timeout_ms: 1500,
            download_timeout_ms: 60000,
            humanize_input: false,
            typing_delay_ms: None,
            dismiss_popups: true,
            viewport_width: 1280,
            viewport_height: 1100,
            follow_new_tabs: true,
            bus_handler_mode: HandlerMode::Parallel,
            bus_handler_timeout: 30000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `CHASER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from an optional file overlaid with `CHASER_*` environment variables
    ///
    /// List settings accept comma separated values, e.g.
    /// `CHASER_ALLOWED_DOMAINS=example.com,*.example.org`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let env = config::Environment::with_prefix("CHASER")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("allowed_domains")
            .with_list_parse_key("prohibited_domains")
            .with_list_parse_key("ignored_resource_types")
            .with_list_parse_key("chrome_args");

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::configuration(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(Error::configuration(format!(
                "Invalid port range {}-{}",
                self.port_range_start, self.port_range_end
            )));
        }

        if self.network_log_capacity == 0 {
            return Err(Error::configuration("network_log_capacity must be positive"));
        }

        if self.default_timeout == 0 || self.snapshot_timeout == 0 || self.navigation_timeout == 0 {
            return Err(Error::configuration("timeouts must be positive"));
        }

        if self.download_start_timeout_ms > self.download_timeout_ms {
            return Err(Error::configuration(
                "download_start_timeout_ms exceeds download_timeout_ms",
            ));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iframe_depth, 3);
        assert!(config.ignored_resource_types.contains(&"Image".to_string()));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
allowed_domains = ["example.com", "*.example.org"]
max_iframe_depth = 1
bus_handler_mode = "sequential"
click_backoff = "exponential"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.allowed_domains.len(), 2);
        assert_eq!(config.max_iframe_depth, 1);
        assert_eq!(config.bus_handler_mode, HandlerMode::Sequential);
        assert_eq!(config.click_backoff, Backoff::Exponential);
        // untouched keys keep their defaults
        assert_eq!(config.network_log_capacity, 500);
    }

    #[test]
    fn test_invalid_port_range() {
        let config = Config {
            port_range_start: 9500,
            port_range_end: 9400,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
