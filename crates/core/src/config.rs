use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mailer: MailerConfig,
    pub esign: EsignConfig,
    pub routing: RoutingConfig,
    pub notifications: NotificationsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MailerConfig {
    pub api_url: Option<String>,
    pub token: Option<SecretString>,
    pub sender: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EsignConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

/// Well-known departments the post-approval rules route into, plus the
/// level-3 approver assigned when equipment is out of stock.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub hr_department: String,
    pub hr_cost_center: Option<String>,
    pub payroll_department: String,
    pub logistics_department: String,
    pub stock_approver_id: String,
}

#[derive(Clone, Debug)]
pub struct NotificationsConfig {
    pub base_url: Option<String>,
    pub environment: String,
}

impl NotificationsConfig {
    /// Deep links are skipped outside local development when no base URL is
    /// configured.
    pub fn resolved_base_url(&self) -> Option<String> {
        if let Some(base_url) = &self.base_url {
            return Some(base_url.clone());
        }
        if matches!(self.environment.as_str(), "local" | "development") {
            return Some("http://localhost:3000".to_string());
        }
        None
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub mailer_api_url: Option<String>,
    pub mailer_token: Option<String>,
    pub esign_base_url: Option<String>,
    pub esign_api_key: Option<String>,
    pub esign_webhook_secret: Option<String>,
    pub notifications_base_url: Option<String>,
    pub environment: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tramita.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            mailer: MailerConfig {
                api_url: None,
                token: None,
                sender: "nao-responda@tramita.local".to_string(),
                timeout_secs: 15,
            },
            esign: EsignConfig {
                base_url: None,
                api_key: None,
                webhook_secret: None,
                timeout_secs: 30,
            },
            routing: RoutingConfig {
                hr_department: "dep-rh".to_string(),
                hr_cost_center: None,
                payroll_department: "dep-folha-pagamento".to_string(),
                logistics_department: "dep-logistica".to_string(),
                stock_approver_id: "u-suprimentos".to_string(),
            },
            notifications: NotificationsConfig {
                base_url: None,
                environment: "development".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                health_check_port: 8081,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    mailer: Option<MailerPatch>,
    esign: Option<EsignPatch>,
    routing: Option<RoutingPatch>,
    notifications: Option<NotificationsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MailerPatch {
    api_url: Option<String>,
    token: Option<String>,
    sender: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EsignPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    webhook_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    hr_department: Option<String>,
    hr_cost_center: Option<String>,
    payroll_department: Option<String>,
    logistics_department: Option<String>,
    stock_approver_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsPatch {
    base_url: Option<String>,
    environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tramita.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(mailer) = patch.mailer {
            if let Some(api_url) = mailer.api_url {
                self.mailer.api_url = Some(api_url);
            }
            if let Some(token) = mailer.token {
                self.mailer.token = Some(secret_value(token));
            }
            if let Some(sender) = mailer.sender {
                self.mailer.sender = sender;
            }
            if let Some(timeout_secs) = mailer.timeout_secs {
                self.mailer.timeout_secs = timeout_secs;
            }
        }

        if let Some(esign) = patch.esign {
            if let Some(base_url) = esign.base_url {
                self.esign.base_url = Some(base_url);
            }
            if let Some(api_key) = esign.api_key {
                self.esign.api_key = Some(secret_value(api_key));
            }
            if let Some(webhook_secret) = esign.webhook_secret {
                self.esign.webhook_secret = Some(secret_value(webhook_secret));
            }
            if let Some(timeout_secs) = esign.timeout_secs {
                self.esign.timeout_secs = timeout_secs;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(hr_department) = routing.hr_department {
                self.routing.hr_department = hr_department;
            }
            if let Some(hr_cost_center) = routing.hr_cost_center {
                self.routing.hr_cost_center = Some(hr_cost_center);
            }
            if let Some(payroll_department) = routing.payroll_department {
                self.routing.payroll_department = payroll_department;
            }
            if let Some(logistics_department) = routing.logistics_department {
                self.routing.logistics_department = logistics_department;
            }
            if let Some(stock_approver_id) = routing.stock_approver_id {
                self.routing.stock_approver_id = stock_approver_id;
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(base_url) = notifications.base_url {
                self.notifications.base_url = Some(base_url);
            }
            if let Some(environment) = notifications.environment {
                self.notifications.environment = environment;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TRAMITA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TRAMITA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TRAMITA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TRAMITA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TRAMITA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRAMITA_MAILER_API_URL") {
            self.mailer.api_url = Some(value);
        }
        if let Some(value) = read_env("TRAMITA_MAILER_TOKEN") {
            self.mailer.token = Some(secret_value(value));
        }
        if let Some(value) = read_env("TRAMITA_MAILER_SENDER") {
            self.mailer.sender = value;
        }

        if let Some(value) = read_env("TRAMITA_ESIGN_BASE_URL") {
            self.esign.base_url = Some(value);
        }
        if let Some(value) = read_env("TRAMITA_ESIGN_API_KEY") {
            self.esign.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TRAMITA_ESIGN_WEBHOOK_SECRET") {
            self.esign.webhook_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("TRAMITA_NOTIFICATIONS_BASE_URL") {
            self.notifications.base_url = Some(value);
        }
        if let Some(value) = read_env("TRAMITA_ENVIRONMENT") {
            self.notifications.environment = value;
        }

        if let Some(value) = read_env("TRAMITA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TRAMITA_SERVER_PORT") {
            self.server.port = parse_u16("TRAMITA_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TRAMITA_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("TRAMITA_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level =
            read_env("TRAMITA_LOGGING_LEVEL").or_else(|| read_env("TRAMITA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TRAMITA_LOGGING_FORMAT").or_else(|| read_env("TRAMITA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(api_url) = overrides.mailer_api_url {
            self.mailer.api_url = Some(api_url);
        }
        if let Some(token) = overrides.mailer_token {
            self.mailer.token = Some(secret_value(token));
        }
        if let Some(base_url) = overrides.esign_base_url {
            self.esign.base_url = Some(base_url);
        }
        if let Some(api_key) = overrides.esign_api_key {
            self.esign.api_key = Some(secret_value(api_key));
        }
        if let Some(webhook_secret) = overrides.esign_webhook_secret {
            self.esign.webhook_secret = Some(secret_value(webhook_secret));
        }
        if let Some(base_url) = overrides.notifications_base_url {
            self.notifications.base_url = Some(base_url);
        }
        if let Some(environment) = overrides.environment {
            self.notifications.environment = environment;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.mailer.api_url.is_some() && self.mailer.sender.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mailer.sender is required when mailer.api_url is set".to_string(),
            ));
        }
        if self.esign.base_url.is_some() && self.esign.api_key.is_none() {
            return Err(ConfigError::Validation(
                "esign.api_key is required when esign.base_url is set".to_string(),
            ));
        }
        if self.routing.hr_department.trim().is_empty()
            || self.routing.payroll_department.trim().is_empty()
            || self.routing.logistics_department.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "routing departments must not be empty".to_string(),
            ));
        }
        if self.notifications.environment.trim().is_empty() {
            return Err(ConfigError::Validation(
                "notifications.environment must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("tramita.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let interpolated = interpolate_env(&raw)?;
    toml::from_str(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Expands `${VAR}` references against the process environment so config
/// files can point at secrets without embedding them.
fn interpolate_env(raw: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ConfigError::UnterminatedInterpolation);
        };
        let var = &after[..end];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);

    Ok(output)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn config_file_patch_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[routing]\nhr_department = \"dep-pessoas\"\n\n[logging]\nformat = \"json\"\n"
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.routing.hr_department, "dep-pessoas");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("/definitely/not/here.toml".into()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        });

        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                notifications_base_url: Some("https://rh.example.com".to_string()),
                environment: Some("production".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(
            config.notifications.resolved_base_url().as_deref(),
            Some("https://rh.example.com")
        );
    }

    #[test]
    fn base_url_falls_back_to_localhost_only_in_development() {
        let mut config = AppConfig::default();
        config.notifications.environment = "development".to_string();
        assert_eq!(
            config.notifications.resolved_base_url().as_deref(),
            Some("http://localhost:3000")
        );

        config.notifications.environment = "production".to_string();
        assert_eq!(config.notifications.resolved_base_url(), None);
    }

    #[test]
    fn esign_base_url_without_api_key_fails_validation() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                esign_base_url: Some("https://sign.example.com".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn unterminated_interpolation_is_rejected() {
        let result = super::interpolate_env("token = \"${MISSING");
        assert!(matches!(result, Err(ConfigError::UnterminatedInterpolation)));
    }
}
