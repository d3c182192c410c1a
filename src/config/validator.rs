use thiserror::Error;
use url::Url;

use super::{Config, CorsConfig, DbType};

const SUPPORTED_ALGORITHMS: [&str; 3] = ["HS256", "HS384", "HS512"];
const SUPPORTED_DB_SCHEMES: [&str; 3] = ["postgres", "postgresql", "sqlite"];
const SUPPORTED_LOG_FORMATS: [&str; 2] = ["pretty", "json"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

/// Reduces a configured origin to the `scheme://host[:port]` form browsers
/// send in the `Origin` header.
fn normalize_origin(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| invalid(format!("cors origin '{raw}' is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid(format!(
            "cors origin '{raw}' must be an http or https URL"
        )));
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid(format!(
            "cors origin '{raw}' must not carry a path, query or fragment"
        )));
    }
    Ok(url.origin().ascii_serialization())
}

impl CorsConfig {
    pub fn allowed_origins(&self) -> Result<Vec<String>, ConfigError> {
        self.origins.iter().map(|o| normalize_origin(o)).collect()
    }
}

fn check_database_url(url: &str) -> Result<(), ConfigError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some(scheme) if SUPPORTED_DB_SCHEMES.contains(&scheme) => {}
        _ => {
            return Err(invalid(format!(
                "database url must use one of the schemes {}",
                SUPPORTED_DB_SCHEMES.join(", ")
            )));
        }
    }
    // SQLite urls carry a file path, not a network location.
    if scheme != Some("sqlite") {
        Url::parse(url).map_err(|e| invalid(format!("database url is malformed: {e}")))?;
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.port == 0 {
            return Err(invalid("app.port must be between 1 and 65535"));
        }

        if !self.app.api_prefix.starts_with('/') || self.app.api_prefix.ends_with('/') {
            return Err(invalid(
                "app.api_prefix must start with '/' and must not end with '/'",
            ));
        }

        let database_url = self.database.connection_string();
        if database_url.is_empty() {
            return Err(invalid(
                "database.url or database.host/name/user must be provided",
            ));
        }
        check_database_url(&database_url)?;

        if self.database.db_type() == DbType::Postgres {
            if let (Some(min), Some(max)) =
                (self.database.min_connections, self.database.max_connections)
            {
                if min > max {
                    return Err(invalid(
                        "database.min_connections cannot exceed database.max_connections",
                    ));
                }
            }
        }

        if self.security.secret_key.trim().is_empty() {
            return Err(invalid("security.secret_key cannot be empty"));
        }

        if !SUPPORTED_ALGORITHMS.contains(&self.security.algorithm.as_str()) {
            return Err(invalid(format!(
                "security.algorithm must be one of {}",
                SUPPORTED_ALGORITHMS.join(", ")
            )));
        }

        if self.security.access_token_expire_minutes <= 0 {
            return Err(invalid(
                "security.access_token_expire_minutes must be positive",
            ));
        }

        if self.security.refresh_token_expire_days <= 0 {
            return Err(invalid("security.refresh_token_expire_days must be positive"));
        }

        if !(4..=31).contains(&self.security.bcrypt_cost) {
            return Err(invalid("security.bcrypt_cost must be between 4 and 31"));
        }

        self.cors.allowed_origins()?;

        if !SUPPORTED_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(invalid("logging.format must be 'pretty' or 'json'"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::ConfigError;
    use crate::config::Config;

    const BASE: &str = r#"
database:
  url: "sqlite:///tmp/shiftwise-test.db"
security:
  secret_key: "test-secret"
"#;

    fn base() -> Config {
        Config::parse(BASE).expect("base config parses")
    }

    #[test]
    fn base_config_is_valid() {
        base().validate().expect("base config is valid");
    }

    #[test]
    fn rejects_empty_secret() {
        let mut config = base();
        config.security.secret_key = "   ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("secret_key")
        ));
    }

    #[test]
    fn rejects_asymmetric_algorithm() {
        let mut config = base();
        config.security.algorithm = "RS256".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_database() {
        let mut config = base();
        config.database.url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_trailing_slash_prefix() {
        let mut config = base();
        config.app.api_prefix = "/api/v1/".to_string();
        assert!(config.validate().is_err());
    }

    #[test_case("mysql://root@localhost/shiftwise" ; "unsupported scheme")]
    #[test_case("shiftwise.db" ; "missing scheme")]
    #[test_case("postgresql://user@[::1/shiftwise" ; "malformed host")]
    fn rejects_bad_database_url(url: &str) {
        let mut config = base();
        config.database.url = Some(url.to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("database url")
        ));
    }

    #[test_case("postgres://app:secret@db:5432/shiftwise" ; "postgres")]
    #[test_case("postgresql://db.internal/shiftwise" ; "postgresql")]
    #[test_case("sqlite://shiftwise.db" ; "relative sqlite")]
    fn accepts_supported_database_urls(url: &str) {
        let mut config = base();
        config.database.url = Some(url.to_string());
        config.validate().expect("supported database url");
    }

    #[test_case("localhost:3000" ; "no scheme")]
    #[test_case("ftp://files.acme.test" ; "wrong scheme")]
    #[test_case("https://app.acme.test/login" ; "with path")]
    #[test_case("not a url" ; "garbage")]
    fn rejects_bad_cors_origin(origin: &str) {
        let mut config = base();
        config.cors.origins = vec!["http://localhost:3000".to_string(), origin.to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("cors origin")
        ));
    }

    #[test]
    fn cors_origins_are_normalized() {
        let mut config = base();
        config.cors.origins = vec![
            "http://localhost:3000/".to_string(),
            "https://App.Acme.test:443".to_string(),
        ];
        assert_eq!(
            config.cors.allowed_origins().expect("valid origins"),
            vec!["http://localhost:3000", "https://app.acme.test"]
        );
    }

    #[test]
    fn rejects_out_of_range_bcrypt_cost() {
        let mut config = base();
        config.security.bcrypt_cost = 2;
        assert!(config.validate().is_err());
    }
}
