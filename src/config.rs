use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::Timeouts;
use crate::intake::IntakeSelectors;
use crate::registry::{FormDefaults, RegistrySelectors};
use crate::types::Credentials;
use crate::workflow::{RetryPolicy, RunMode};

pub const DEFAULT_CONFIG_FILE: &str = "imei-relay.toml";
pub const ENV_PREFIX: &str = "IMEI_RELAY";

static HTTP_URL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^https?://[^\s/]+").ok());

/// A configured secret. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} must be an http(s) URL, got '{value}'")]
    InvalidUrl { field: &'static str, value: String },

    #[error("{field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Main configuration structure for imei-relay
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub intake: IntakeConfig,
    pub registry: RegistryConfig,
    pub browser: BrowserSettings,
    pub workflow: WorkflowConfig,
    pub reference: ReferenceConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Used when a request leaves its country blank
    pub default_country: Option<String>,
    pub selectors: IntakeSelectors,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub login_url: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Pre-known one-time token; prompted for when absent
    pub second_factor_token: Option<Secret>,
    pub max_token_attempts: u32,
    pub max_logins: u32,
    pub form: FormDefaults,
    pub selectors: RegistrySelectors,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            login_url: String::new(),
            username: None,
            password: None,
            second_factor_token: None,
            max_token_attempts: 3,
            max_logins: 2,
            form: FormDefaults::default(),
            selectors: RegistrySelectors::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub no_sandbox: bool,
    pub navigation_timeout_ms: u64,
    pub element_timeout_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            no_sandbox: false,
            navigation_timeout_ms: 30_000,
            element_timeout_ms: 12_000,
        }
    }
}

impl BrowserSettings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            navigation: Duration::from_millis(self.navigation_timeout_ms),
            element: Duration::from_millis(self.element_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// JSON journal for resuming interrupted runs
    pub state_file: Option<PathBuf>,
    /// Where to write the normalized batch as CSV
    pub export_path: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: true,
            state_file: None,
            export_path: None,
        }
    }
}

impl WorkflowConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub path: PathBuf,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/reference.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. imei-relay.toml in the working directory
    /// 3. The file given with --config
    /// 4. Environment variables (IMEI_RELAY__SECTION__KEY)
    /// 5. Plain credential variables for anything still unset
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults()?;

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
        }
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Self::environment());

        let mut config: RelayConfig = builder.build()?.try_deserialize()?;
        config.apply_credential_fallbacks(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder().add_source(Config::try_from(&RelayConfig::default())?))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// INTAKE_USER, INTAKE_PASS, REGISTRY_USER, REGISTRY_PASS, REGISTRY_TOKEN
    pub fn apply_credential_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.intake.username.is_none() {
            self.intake.username = lookup("INTAKE_USER");
        }
        if self.intake.password.is_none() {
            self.intake.password = lookup("INTAKE_PASS").map(Secret);
        }
        if self.registry.username.is_none() {
            self.registry.username = lookup("REGISTRY_USER");
        }
        if self.registry.password.is_none() {
            self.registry.password = lookup("REGISTRY_PASS").map(Secret);
        }
        if self.registry.second_factor_token.is_none() {
            self.registry.second_factor_token = lookup("REGISTRY_TOKEN").map(Secret);
        }
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// An extract-only run never needs the registry settings
    pub fn validate(&self, mode: RunMode) -> Result<(), ConfigError> {
        check_url("intake.base_url", &self.intake.base_url)?;
        self.intake_credentials()?;

        if mode == RunMode::Full {
            check_url("registry.login_url", &self.registry.login_url)?;
            self.registry_credentials()?;
            if self.registry.max_token_attempts == 0 {
                return Err(out_of_range("registry.max_token_attempts", "must be at least 1"));
            }
            if self.registry.max_logins == 0 {
                return Err(out_of_range("registry.max_logins", "must be at least 1"));
            }
        }

        let workflow = &self.workflow;
        if workflow.max_attempts == 0 {
            return Err(out_of_range("workflow.max_attempts", "must be at least 1"));
        }
        if workflow.base_delay_ms > workflow.max_delay_ms {
            return Err(out_of_range(
                "workflow.base_delay_ms",
                format!("{} exceeds max_delay_ms {}", workflow.base_delay_ms, workflow.max_delay_ms),
            ));
        }
        if self.browser.navigation_timeout_ms == 0 || self.browser.element_timeout_ms == 0 {
            return Err(out_of_range("browser", "timeouts must be positive"));
        }
        Ok(())
    }

    pub fn intake_credentials(&self) -> Result<Credentials, ConfigError> {
        credentials(
            self.intake.username.as_deref(),
            self.intake.password.as_ref(),
            "intake.username",
            "intake.password",
        )
    }

    pub fn registry_credentials(&self) -> Result<Credentials, ConfigError> {
        credentials(
            self.registry.username.as_deref(),
            self.registry.password.as_ref(),
            "registry.username",
            "registry.password",
        )
    }
}

fn credentials(
    username: Option<&str>,
    password: Option<&Secret>,
    user_field: &'static str,
    password_field: &'static str,
) -> Result<Credentials, ConfigError> {
    let username = username
        .filter(|u| !u.trim().is_empty())
        .ok_or(ConfigError::Missing { field: user_field })?;
    let password = password
        .filter(|p| !p.expose().is_empty())
        .ok_or(ConfigError::Missing { field: password_field })?;
    Ok(Credentials::new(username, password.expose()))
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing { field });
    }
    if !HTTP_URL.as_ref().is_some_and(|re| re.is_match(value)) {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        reason: reason.into(),
    }
}
