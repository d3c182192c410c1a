pub use self::parser::{
    Config, CorsConfig, DatabaseConfig, DbType, LoggingConfig, SecurityConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
