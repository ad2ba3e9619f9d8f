//! Configuration file management for certpeek.
//!
//! Settings come from three places, later ones winning:
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (`certpeek.toml`, or the one given with `--config`)
//! 3. Command-line arguments (highest priority)
//!
//! The file can also extend the reference data: extra CT logs, inline or
//! from a separate file written by `--refresh-logs`, and extra certificate
//! policy labels.
//!
//! # Example Configuration File
//!
//! ```toml
//! proxy = "http://proxy.internal:3128"
//! first_only = false
//! output = "text"
//! timeout_secs = 10
//! known_logs_file = "known_logs.toml"
//!
//! [known_logs]
//! "bmV3IGxvZyBrZXkgaGFzaA==" = "Internal CT log"
//!
//! [known_cert_types]
//! "2.23.140.1.31" = "Onion service certificate"
//! ```

use crate::registry::{KnownLogRegistry, KnownPolicyRegistry, Registries};
use crate::report::OutputFormat;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "certpeek.toml";

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// HTTP proxy to tunnel through
    pub proxy: Option<String>,
    /// SNI name to send instead of the destination
    pub servername: Option<String>,
    /// Send no SNI at all
    pub no_servername: Option<bool>,
    /// Only process the leaf certificate
    pub first_only: Option<bool>,
    /// Output format: text or json
    pub output: Option<OutputFormat>,
    /// Append PEM encodings to the text report
    pub print_pem: Option<bool>,
    /// Append OpenSSL text dumps to the text report
    pub print_text: Option<bool>,
    /// Network timeout in seconds
    pub timeout_secs: Option<u64>,
    /// TOML map of extra CT logs (log id -> name)
    pub known_logs_file: Option<PathBuf>,
    /// Extra CT logs (log id -> name)
    pub known_logs: Option<BTreeMap<String, String>>,
    /// Extra certificate type labels (policy OID -> label)
    pub known_cert_types: Option<BTreeMap<String, String>>,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use certpeek::config::Config;
    /// let config = Config::from_file("certpeek.toml")?;
    /// # Ok::<(), certpeek::config::ConfigError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Loads the explicit file if given, else `certpeek.toml` when present.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                debug!("using configuration from {}", DEFAULT_CONFIG_FILE);
                Self::from_file(DEFAULT_CONFIG_FILE)
            }
            None => Ok(Config::default()),
        }
    }

    /// Built-in defaults.
    ///
    /// # Default Values
    ///
    /// - `no_servername`, `first_only`, `print_pem`, `print_text`: false
    /// - `output`: text
    /// - everything else unset
    pub fn defaults() -> Self {
        Config {
            no_servername: Some(false),
            first_only: Some(false),
            output: Some(OutputFormat::Text),
            print_pem: Some(false),
            print_text: Some(false),
            ..Config::default()
        }
    }

    /// Merges this configuration with another, prioritizing the other's values.
    ///
    /// Reference data tables are combined rather than replaced, with the
    /// other's entries winning on conflicts.
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.servername.is_some() {
            self.servername = other.servername;
        }
        if other.no_servername.is_some() {
            self.no_servername = other.no_servername;
        }
        if other.first_only.is_some() {
            self.first_only = other.first_only;
        }
        if other.output.is_some() {
            self.output = other.output;
        }
        if other.print_pem.is_some() {
            self.print_pem = other.print_pem;
        }
        if other.print_text.is_some() {
            self.print_text = other.print_text;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.known_logs_file.is_some() {
            self.known_logs_file = other.known_logs_file;
        }
        self.known_logs = merge_tables(self.known_logs, other.known_logs);
        self.known_cert_types = merge_tables(self.known_cert_types, other.known_cert_types);
        self
    }

    /// Checks combinations that cannot be expressed per field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servername.is_some() && self.no_servername == Some(true) {
            return Err(ConfigError::Validation(
                "servername and no_servername are mutually exclusive".to_string(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Builds the reference data registries: builtin tables, then the logs
    /// file, then inline tables.
    pub fn registries(&self) -> Result<Registries, ConfigError> {
        let mut logs = KnownLogRegistry::builtin();
        if let Some(path) = &self.known_logs_file {
            let content = fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
            let table: BTreeMap<String, String> = toml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
            debug!("loaded {} CT logs from {}", table.len(), path.display());
            logs = logs.with_logs(table);
        }
        if let Some(extra) = &self.known_logs {
            logs = logs.with_logs(extra.clone());
        }

        let mut policies = KnownPolicyRegistry::builtin();
        if let Some(extra) = &self.known_cert_types {
            policies = policies.with_types(extra.clone());
        }
        Ok(Registries { logs, policies })
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        let example = Config {
            proxy: Some("http://proxy.internal:3128".to_string()),
            servername: None,
            no_servername: Some(false),
            first_only: Some(false),
            output: Some(OutputFormat::Text),
            print_pem: Some(false),
            print_text: Some(false),
            timeout_secs: Some(10),
            known_logs_file: Some(PathBuf::from("known_logs.toml")),
            known_logs: Some(BTreeMap::from([(
                "bmV3IGxvZyBrZXkgaGFzaA==".to_string(),
                "Internal CT log".to_string(),
            )])),
            known_cert_types: Some(BTreeMap::from([(
                "2.23.140.1.31".to_string(),
                "Onion service certificate".to_string(),
            )])),
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

fn merge_tables(
    base: Option<BTreeMap<String, String>>,
    other: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (base, other) {
        (Some(mut base), Some(other)) => {
            base.extend(other);
            Some(base)
        }
        (base, None) => base,
        (None, other) => other,
    }
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("IO Error: {0}")]
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    #[error("Parse Error: {0}")]
    Parse(String),
    /// Validation error (conflicting or out of range values)
    #[error("Validation Error: {0}")]
    Validation(String),
}
