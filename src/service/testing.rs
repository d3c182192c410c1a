//! Sqlite fixtures shared by service and web tests.

use tempfile::NamedTempFile;

use crate::config::DatabaseConfig;
use crate::db::{DatabaseManager, NewUser, User};

pub(crate) fn sqlite_config(file: &NamedTempFile) -> DatabaseConfig {
    DatabaseConfig {
        url: Some(format!("sqlite://{}", file.path().display())),
        host: None,
        port: 5432,
        name: None,
        user: None,
        password: None,
        max_connections: None,
        min_connections: None,
    }
}

pub(crate) async fn sqlite_manager(file: &NamedTempFile) -> DatabaseManager {
    let manager = DatabaseManager::new(&sqlite_config(file))
        .await
        .expect("sqlite manager");
    manager.migrate().await.expect("migrate");
    manager
}

/// Active, roleless user in tenant `acme` with a placeholder hash.
pub(crate) async fn plain_user(manager: &DatabaseManager, email: &str, username: &str) -> User {
    manager
        .user_store()
        .create_user(
            &NewUser {
                email: email.to_string(),
                username: username.to_string(),
                first_name: None,
                last_name: None,
                hashed_password: "not-a-hash".to_string(),
                tenant_id: "acme".to_string(),
                is_active: true,
                is_verified: false,
                is_superuser: false,
            },
            &[],
        )
        .await
        .expect("create user")
}
