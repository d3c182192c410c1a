use super::ConfigError;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use url::Url;
use url::form_urlencoded::byte_serialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            debug: false,
            bind_address: default_bind_address(),
            port: default_port(),
            api_prefix: default_api_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_database_port")]
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        if self.connection_string().starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    /// Explicit `url` wins; otherwise the PostgreSQL URL is assembled from the
    /// individual fields with user and password form-encoded.
    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            return url.clone();
        }

        match (&self.host, &self.name, &self.user) {
            (Some(host), Some(name), Some(user)) => {
                let user: String = byte_serialize(user.as_bytes()).collect();
                let password: String =
                    byte_serialize(self.password.as_deref().unwrap_or_default().as_bytes())
                        .collect();
                format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    user, password, host, self.port, name
                )
            }
            _ => String::new(),
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }

    /// Returns the URL of the server's `postgres` maintenance database and the
    /// name of the configured database.
    pub fn maintenance_target(&self) -> Option<(String, String)> {
        if self.db_type() != DbType::Postgres {
            return None;
        }

        let mut url = Url::parse(&self.connection_string()).ok()?;
        let database = url.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return None;
        }
        url.set_path("/postgres");
        Some((url.to_string(), database))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub secret_key: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_access_token_expire_minutes")]
    pub access_token_expire_minutes: i64,
    #[serde(default = "default_refresh_token_expire_days")]
    pub refresh_token_expire_days: i64,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    #[serde(default, deserialize_with = "deserialize_origins")]
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OriginList {
    Joined(String),
    Listed(Vec<String>),
}

fn deserialize_origins<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OriginList::deserialize(deserializer)? {
        OriginList::Joined(raw) => split_origins(&raw),
        OriginList::Listed(origins) => origins,
    })
}

/// Accepts either a JSON array or a comma-separated list.
pub(crate) fn split_origins(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        if let Ok(origins) = serde_json::from_str::<Vec<String>>(raw) {
            return origins;
        }
    }

    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SHIFTWISE_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Some(value) = lookup("SHIFTWISE_DATABASE_PASSWORD") {
            self.database.password = Some(value);
        }
        if let Some(value) = lookup("SHIFTWISE_SECRET_KEY") {
            self.security.secret_key = value;
        }
        if let Some(value) = lookup("SHIFTWISE_CORS_ORIGINS") {
            self.cors.origins = split_origins(&value);
        }
        if let Some(value) = lookup("SHIFTWISE_DEBUG") {
            self.app.debug = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(port) = lookup("SHIFTWISE_PORT").and_then(|v| v.parse().ok()) {
            self.app.port = port;
        }
        if let Some(value) = lookup("SHIFTWISE_LOG_LEVEL") {
            self.logging.level = value;
        }
    }
}

fn default_app_name() -> String {
    "ShiftWise".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_database_port() -> u16 {
    5432
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_token_expire_minutes() -> i64 {
    30
}

fn default_refresh_token_expire_days() -> i64 {
    7
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
