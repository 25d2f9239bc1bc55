//! Engine configuration loaded with figment.
//!
//! Sources are layered in precedence order, later ones overriding earlier:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. An optional TOML, YAML or JSON file, chosen by extension
//! 3. Environment variables prefixed with `TEXTGEN_`; nested keys are
//!    separated with `__` (`TEXTGEN_DEFAULT_PARAMETERS__MAX_NEW_TOKENS=32`)

use crate::generation::SessionConfig;
use crate::prompt::PromptConvention;
use crate::stopper::HaltPolicy;
use crate::types::GenerationParameters;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use textgen_common::config::ValidatedConfig;
use textgen_common::error::{ErrorCategory, TextgenError};
use textgen_common::Pretty;
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of environment variables read by [`ConfigProvider`].
pub const ENV_PREFIX: &str = "TEXTGEN_";

/// Separator for nested keys in environment variable names.
pub const ENV_NESTING: &str = "__";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// File extension is not one of toml, yaml, yml or json
    #[error("Unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Configuration parsing failed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl TextgenError for ConfigError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::User
    }

    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::FileNotFound(_) => "CONFIG_FILE_NOT_FOUND",
            ConfigError::UnsupportedFormat(_) => "CONFIG_UNSUPPORTED_FORMAT",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::Invalid(_) => "CONFIG_INVALID",
        }
    }

    fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            ConfigError::UnsupportedFormat(_) => {
                vec!["Use a .toml, .yaml, .yml or .json file".to_string()]
            }
            ConfigError::Parse(_) => vec![format!(
                "Check the file and any {}* environment variables for typos",
                ENV_PREFIX
            )],
            _ => Vec::new(),
        }
    }
}

/// Settings of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Characters of earlier turns kept as context.
    pub context_budget_chars: usize,
    /// Tokens kept free for output when truncating the prompt.
    pub reserved_output_tokens: usize,
    pub strict_accelerator_errors: bool,
    /// Stream partial text to callers instead of only the final result.
    pub stream_output: bool,
    pub channel_capacity: usize,
    pub cancel_grace_ms: u64,
    /// Directory receiving the generation output log. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    pub hard_stop_phrases: Vec<String>,
    /// See [`HaltPolicy`] for when `any` suits a convention better.
    pub halt_policy: HaltPolicy,
    /// Used by [`crate::ChatAgent`] calls that pass no parameters.
    pub default_parameters: GenerationParameters,
    /// Model name to prompt convention, matched case-insensitively.
    pub prompt_conventions: HashMap<String, PromptConvention>,
    /// Log device memory around model swaps.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_budget_chars: 4096,
            reserved_output_tokens: 256,
            strict_accelerator_errors: false,
            stream_output: true,
            channel_capacity: 64,
            cancel_grace_ms: 2000,
            save_dir: None,
            hard_stop_phrases: Vec::new(),
            halt_policy: HaltPolicy::All,
            default_parameters: GenerationParameters::default(),
            prompt_conventions: HashMap::new(),
            debug: false,
        }
    }
}

impl EngineConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Settings for [`crate::generation::GenerationSession`].
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reserved_output_tokens: self.reserved_output_tokens,
            strict_accelerator_errors: self.strict_accelerator_errors,
            hard_stop_phrases: self.hard_stop_phrases.clone(),
            halt_policy: self.halt_policy,
            channel_capacity: self.channel_capacity,
            cancel_grace: self.cancel_grace(),
        }
    }
}

impl ValidatedConfig for EngineConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.hard_stop_phrases.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid(
                "hard_stop_phrases must not contain empty phrases".to_string(),
            ));
        }
        self.default_parameters
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("default_parameters: {}", e)))
    }

    fn merge_with_defaults(self, defaults: Self) -> Self {
        let unset = Self::default();
        Self {
            context_budget_chars: prefer_set(
                self.context_budget_chars,
                &unset.context_budget_chars,
                defaults.context_budget_chars,
            ),
            reserved_output_tokens: prefer_set(
                self.reserved_output_tokens,
                &unset.reserved_output_tokens,
                defaults.reserved_output_tokens,
            ),
            strict_accelerator_errors: prefer_set(
                self.strict_accelerator_errors,
                &unset.strict_accelerator_errors,
                defaults.strict_accelerator_errors,
            ),
            stream_output: prefer_set(
                self.stream_output,
                &unset.stream_output,
                defaults.stream_output,
            ),
            channel_capacity: prefer_set(
                self.channel_capacity,
                &unset.channel_capacity,
                defaults.channel_capacity,
            ),
            cancel_grace_ms: prefer_set(
                self.cancel_grace_ms,
                &unset.cancel_grace_ms,
                defaults.cancel_grace_ms,
            ),
            save_dir: self.save_dir.or(defaults.save_dir),
            hard_stop_phrases: prefer_set(
                self.hard_stop_phrases,
                &unset.hard_stop_phrases,
                defaults.hard_stop_phrases,
            ),
            halt_policy: prefer_set(self.halt_policy, &unset.halt_policy, defaults.halt_policy),
            default_parameters: prefer_set(
                self.default_parameters,
                &unset.default_parameters,
                defaults.default_parameters,
            ),
            prompt_conventions: prefer_set(
                self.prompt_conventions,
                &unset.prompt_conventions,
                defaults.prompt_conventions,
            ),
            debug: prefer_set(self.debug, &unset.debug, defaults.debug),
        }
    }

    fn description() -> &'static str {
        "Text generation engine: context budget, stop handling, streaming and model defaults"
    }
}

/// `value` unless it still equals the built-in default.
fn prefer_set<T: PartialEq>(value: T, unset: &T, fallback: T) -> T {
    if value == *unset {
        fallback
    } else {
        value
    }
}

/// Builds an [`EngineConfig`] from defaults, an optional file and the
/// environment.
///
/// Nothing is cached; every call reads the sources again.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigProvider;

impl ConfigProvider {
    pub fn new() -> Self {
        Self
    }

    /// Load and validate the configuration.
    pub fn load(&self, path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
        let figment = self.build_figment(path)?;
        let config = figment
            .extract::<EngineConfig>()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        debug!("Engine configuration: {}", Pretty(&config));
        info!(
            file = ?path,
            context_budget_chars = config.context_budget_chars,
            stream_output = config.stream_output,
            "Loaded engine configuration"
        );
        Ok(config)
    }

    fn build_figment(&self, path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));

        if let Some(path) = path {
            figment = figment.merge(Self::load_file(path)?);
        }

        debug!(prefix = ENV_PREFIX, "Merging environment variables");
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_NESTING)))
    }

    fn load_file(path: &Path) -> Result<Figment, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        debug!(path = %path.display(), "Loading configuration file");
        match extension.as_deref() {
            Some("toml") => Ok(Figment::from(Toml::file(path))),
            Some("yaml") | Some("yml") => Ok(Figment::from(Yaml::file(path))),
            Some("json") => Ok(Figment::from(Json::file(path))),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use textgen_common::DefaultConfig;
    use std::fs;
    use tempfile::TempDir;

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with(ENV_PREFIX) {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::validated_default().unwrap();
        assert_eq!(config.context_budget_chars, 4096);
        assert_eq!(config.halt_policy, HaltPolicy::All);
        assert!(config.stream_output);
    }

    #[test]
    fn test_session_config_conversion() {
        let config = EngineConfig {
            reserved_output_tokens: 100,
            cancel_grace_ms: 500,
            hard_stop_phrases: vec!["STOP".to_string()],
            ..Default::default()
        };
        let session = config.session_config();
        assert_eq!(session.reserved_output_tokens, 100);
        assert_eq!(session.cancel_grace, Duration::from_millis(500));
        assert_eq!(session.hard_stop_phrases, vec!["STOP".to_string()]);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = EngineConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut config = EngineConfig::default();
        config.default_parameters.top_p = 2.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_parameters"));
    }

    #[test]
    fn test_merge_with_defaults_prefers_set_values() {
        let config = EngineConfig {
            context_budget_chars: 100,
            ..Default::default()
        };
        let defaults = EngineConfig {
            context_budget_chars: 200,
            reserved_output_tokens: 64,
            ..Default::default()
        };
        let merged = config.merge_with_defaults(defaults);
        assert_eq!(merged.context_budget_chars, 100);
        assert_eq!(merged.reserved_output_tokens, 64);
    }

    #[test]
    #[serial]
    fn test_load_without_file() {
        clear_env();
        let config = ConfigProvider::new().load(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_toml_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("textgen.toml");
        fs::write(
            &path,
            r#"
context_budget_chars = 1024
stream_output = false
hard_stop_phrases = ["<human>:"]

[default_parameters]
max_new_tokens = 32

[prompt_conventions]
"Alpaca-7B" = "instruct"
"#,
        )
        .unwrap();

        let config = ConfigProvider::new().load(Some(&path)).unwrap();
        assert_eq!(config.context_budget_chars, 1024);
        assert!(!config.stream_output);
        assert_eq!(config.default_parameters.max_new_tokens, 32);
        assert_eq!(config.default_parameters.top_k, 40);
        assert_eq!(
            config.prompt_conventions.get("Alpaca-7B"),
            Some(&PromptConvention::Instruct)
        );
        assert_eq!(config.hard_stop_phrases, vec!["<human>:".to_string()]);
    }

    #[test]
    #[serial]
    fn test_load_yaml_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("textgen.yaml");
        fs::write(&path, "reserved_output_tokens: 128\nhalt_policy: any\n").unwrap();

        let config = ConfigProvider::new().load(Some(&path)).unwrap();
        assert_eq!(config.reserved_output_tokens, 128);
        assert_eq!(config.halt_policy, HaltPolicy::Any);
    }

    #[test]
    #[serial]
    fn test_load_json_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("textgen.json");
        fs::write(&path, r#"{"save_dir": "/tmp/textgen-out", "debug": true}"#).unwrap();

        let config = ConfigProvider::new().load(Some(&path)).unwrap();
        assert_eq!(config.save_dir, Some(PathBuf::from("/tmp/textgen-out")));
        assert!(config.debug);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("textgen.toml");
        fs::write(&path, "context_budget_chars = 1024\n").unwrap();

        std::env::set_var("TEXTGEN_CONTEXT_BUDGET_CHARS", "2048");
        std::env::set_var("TEXTGEN_DEFAULT_PARAMETERS__MAX_NEW_TOKENS", "16");
        let result = ConfigProvider::new().load(Some(&path));
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.context_budget_chars, 2048);
        assert_eq!(config.default_parameters.max_new_tokens, 16);
    }

    #[test]
    #[serial]
    fn test_invalid_value_is_parse_error() {
        clear_env();
        std::env::set_var("TEXTGEN_CHANNEL_CAPACITY", "lots");
        let result = ConfigProvider::new().load(None);
        clear_env();

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    #[serial]
    fn test_invalid_config_is_rejected_after_extraction() {
        clear_env();
        std::env::set_var("TEXTGEN_CHANNEL_CAPACITY", "0");
        let result = ConfigProvider::new().load(None);
        clear_env();

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigProvider::new().load(Some(Path::new("/nonexistent/textgen.toml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("textgen.ini");
        fs::write(&path, "x=1").unwrap();

        let err = ConfigProvider::new().load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
        assert!(err.is_user_error());
    }
}
