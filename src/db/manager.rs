use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, RoleStore, UserStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{PostgresRoleStore, PostgresUserStore};
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};
#[cfg(any(feature = "postgres", feature = "sqlite"))]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::{Connection, QueryableByName};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{SqliteRoleStore, SqliteUserStore, establish_connection};

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    user_store: Arc<dyn UserStore>,
    role_store: Arc<dyn RoleStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

/// Result of [`DatabaseManager::create_database`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseCreation {
    Created,
    Recreated,
    AlreadyExists,
}

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email VARCHAR(255) NOT NULL UNIQUE,
        username VARCHAR(100) NOT NULL UNIQUE,
        first_name VARCHAR(100),
        last_name VARCHAR(100),
        hashed_password VARCHAR(255) NOT NULL,
        tenant_id VARCHAR(100) NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_verified BOOLEAN NOT NULL DEFAULT FALSE,
        is_superuser BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(50) NOT NULL UNIQUE,
        description TEXT,
        permissions TEXT NOT NULL DEFAULT '{}',
        is_system_role BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_roles (
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_id BIGINT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        PRIMARY KEY (user_id, role_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_tenant_id ON users(tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_roles_role_id ON user_roles(role_id)",
];

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL UNIQUE,
        first_name TEXT,
        last_name TEXT,
        hashed_password TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        is_verified BOOLEAN NOT NULL DEFAULT 0,
        is_superuser BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        permissions TEXT NOT NULL DEFAULT '{}',
        is_system_role BOOLEAN NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_roles (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        PRIMARY KEY (user_id, role_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_users_tenant_id ON users(tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_roles_role_id ON user_roles(role_id)",
];

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let user_store = Arc::new(PostgresUserStore::new(pool.clone()));
                let role_store = Arc::new(PostgresRoleStore::new(pool.clone()));

                Ok(Self {
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    user_store,
                    role_store,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite url has no file path".to_string())
                })?;
                let path_arc = Arc::new(path.clone());

                let user_store = Arc::new(SqliteUserStore::new(path_arc.clone()));
                let role_store = Arc::new(SqliteRoleStore::new(path_arc));

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    user_store,
                    role_store,
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self
                    .postgres_pool
                    .clone()
                    .ok_or_else(|| DatabaseError::Migration("pool not initialized".to_string()))?;
                Self::run_statements(move || {
                    pool.get()
                        .map_err(|e| DatabaseError::Connection(e.to_string()))
                        .and_then(|mut conn| apply_schema(&mut *conn, POSTGRES_SCHEMA))
                })
                .await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self
                    .sqlite_path
                    .clone()
                    .ok_or_else(|| DatabaseError::Migration("path not initialized".to_string()))?;
                Self::run_statements(move || {
                    let mut conn = establish_connection(&path)?;
                    apply_schema(&mut conn, SQLITE_SCHEMA)
                })
                .await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    async fn run_statements<F>(operation: F) -> Result<(), DatabaseError>
    where
        F: FnOnce() -> Result<(), DatabaseError> + Send + 'static,
    {
        tokio::task::spawn_blocking(operation)
            .await
            .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    /// Creates the configured PostgreSQL database through the server's
    /// `postgres` maintenance database. With `recreate`, open sessions are
    /// terminated and the database is dropped first.
    #[cfg(feature = "postgres")]
    pub async fn create_database(
        config: &ConfigDatabaseConfig,
        recreate: bool,
    ) -> Result<DatabaseCreation, DatabaseError> {
        let (server_url, database) = config.maintenance_target().ok_or_else(|| {
            DatabaseError::Connection(
                "create-database needs a PostgreSQL url with a database name".to_string(),
            )
        })?;

        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&server_url)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            let quoted = quote_identifier(&database);

            let exists = !diesel::sql_query("SELECT datname FROM pg_database WHERE datname = $1")
                .bind::<diesel::sql_types::Text, _>(database.clone())
                .load::<DatabaseName>(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .is_empty();

            if exists && !recreate {
                return Ok(DatabaseCreation::AlreadyExists);
            }

            if exists {
                diesel::sql_query(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = $1 AND pid <> pg_backend_pid()",
                )
                .bind::<diesel::sql_types::Text, _>(database.clone())
                .execute(&mut conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

                diesel::sql_query(format!("DROP DATABASE IF EXISTS {quoted}"))
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
            }

            diesel::sql_query(format!(
                "CREATE DATABASE {quoted} WITH ENCODING 'UTF8' TEMPLATE template0"
            ))
            .execute(&mut conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

            Ok(if exists {
                DatabaseCreation::Recreated
            } else {
                DatabaseCreation::Created
            })
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn create_database(
        _config: &ConfigDatabaseConfig,
        _recreate: bool,
    ) -> Result<DatabaseCreation, DatabaseError> {
        Err(DatabaseError::Connection(
            "PostgreSQL feature not enabled".to_string(),
        ))
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn role_store(&self) -> Arc<dyn RoleStore> {
        self.role_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}

#[cfg(feature = "postgres")]
#[derive(QueryableByName)]
struct DatabaseName {
    #[diesel(sql_type = diesel::sql_types::Text)]
    #[allow(dead_code)]
    datname: String,
}

#[cfg(feature = "postgres")]
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
fn apply_schema<C>(conn: &mut C, statements: &[&str]) -> Result<(), DatabaseError>
where
    C: diesel::Connection,
    diesel::query_builder::SqlQuery: diesel::query_dsl::methods::ExecuteDsl<C>,
{
    for statement in statements {
        diesel::sql_query(*statement)
            .execute(conn)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    }
    Ok(())
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::NamedTempFile;

    use super::{DatabaseManager, DbType};
    use crate::config::DatabaseConfig;
    use crate::db::{NewRole, NewUser, RoleChanges, RoleFilter, UserChanges, UserFilter};

    fn sqlite_config(path: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: Some(format!("sqlite://{path}")),
            host: None,
            port: 5432,
            name: None,
            user: None,
            password: None,
            max_connections: None,
            min_connections: None,
        }
    }

    fn new_user(email: &str, username: &str, tenant: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            username: username.to_string(),
            first_name: Some("Test".to_string()),
            last_name: None,
            hashed_password: "hash".to_string(),
            tenant_id: tenant.to_string(),
            is_active: true,
            is_verified: false,
            is_superuser: false,
        }
    }

    fn new_role(name: &str) -> NewRole {
        NewRole {
            name: name.to_string(),
            description: Some(format!("{name} role")),
            permissions: BTreeMap::from([("vms".to_string(), vec!["read".to_string()])]),
            is_system_role: false,
            is_active: true,
        }
    }

    async fn manager(file: &NamedTempFile) -> DatabaseManager {
        let config = sqlite_config(&file.path().to_string_lossy());
        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        manager.migrate().await.expect("second migrate");
        assert_eq!(manager.db_type(), DbType::Sqlite);
    }

    #[tokio::test]
    async fn sqlite_user_and_role_roundtrip() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        let roles = manager.role_store();
        let users = manager.user_store();

        let operator = roles.create_role(&new_role("operator")).await.expect("create role");
        assert_eq!(operator.permissions["vms"], vec!["read"]);

        let user = users
            .create_user(&new_user("ops@acme.test", "ops", "acme"), &[operator.id, operator.id])
            .await
            .expect("create user");
        assert_eq!(user.roles.len(), 1);
        assert_eq!(user.roles[0].name, "operator");

        let fetched = users
            .get_user_by_email("OPS@acme.test")
            .await
            .expect("query user")
            .expect("user exists");
        assert_eq!(fetched.id, user.id);
        assert_eq!(roles.count_role_users(operator.id).await.expect("count"), 1);

        let changes = UserChanges {
            first_name: Some(None),
            is_active: Some(false),
            ..Default::default()
        };
        let updated = users
            .update_user(user.id, &changes, Some(&[]))
            .await
            .expect("update user")
            .expect("user exists");
        assert!(!updated.is_active);
        assert!(updated.first_name.is_none());
        assert!(updated.roles.is_empty());

        assert!(users.delete_user(user.id).await.expect("delete user"));
        assert!(users.get_user(user.id).await.expect("query").is_none());
        assert!(!users.delete_user(user.id).await.expect("delete again"));
    }

    #[tokio::test]
    async fn user_filters_and_search() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        let users = manager.user_store();

        users
            .create_user(&new_user("alice@acme.test", "alice", "acme"), &[])
            .await
            .expect("alice");
        users
            .create_user(&new_user("bob@acme.test", "bob", "acme"), &[])
            .await
            .expect("bob");
        users
            .create_user(&new_user("carol@globex.test", "carol", "globex"), &[])
            .await
            .expect("carol");

        let acme = UserFilter {
            tenant_id: Some("acme".to_string()),
            ..Default::default()
        };
        assert_eq!(users.count_users(&acme).await.expect("count"), 2);

        let page = users.list_users(&acme, 1, 10).await.expect("list");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].username, "bob");

        let search = UserFilter {
            search: Some("GLOBEX".to_string()),
            ..Default::default()
        };
        let found = users.list_users(&search, 0, 10).await.expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "carol");
    }

    #[tokio::test]
    async fn role_links_are_idempotent_and_removed_with_role() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        let roles = manager.role_store();
        let users = manager.user_store();

        let role = roles.create_role(&new_role("auditor")).await.expect("role");
        let user = users
            .create_user(&new_user("dan@acme.test", "dan", "acme"), &[])
            .await
            .expect("user");

        users.add_user_role(user.id, role.id).await.expect("add");
        users.add_user_role(user.id, role.id).await.expect("add twice");
        assert_eq!(roles.count_role_users(role.id).await.expect("count"), 1);

        let renamed = roles
            .update_role(
                role.id,
                &RoleChanges {
                    description: Some(None),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("role exists");
        assert!(renamed.description.is_none());

        assert!(roles.delete_role(role.id).await.expect("delete role"));
        let user = users.get_user(user.id).await.expect("query").expect("user");
        assert!(user.roles.is_empty());

        let filter = RoleFilter::default();
        assert_eq!(roles.count_roles(&filter).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn keys_beyond_i32_are_plain_misses() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        let users = manager.user_store();
        let roles = manager.role_store();
        let far = 3_000_000_000_i64;

        assert!(users.get_user(far).await.expect("query user").is_none());
        assert!(roles.get_role(far).await.expect("query role").is_none());
        assert!(!users.delete_user(far).await.expect("delete user"));
        assert!(
            users
                .update_user(far, &UserChanges::default(), None)
                .await
                .expect("update user")
                .is_none()
        );
        assert_eq!(roles.count_role_users(far).await.expect("count"), 0);
        assert!(roles.get_roles_by_ids(&[far]).await.expect("by ids").is_empty());
    }

    #[tokio::test]
    async fn search_treats_wildcards_literally() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = manager(&file).await;
        let users = manager.user_store();

        users
            .create_user(&new_user("a_b@acme.test", "a_b", "acme"), &[])
            .await
            .expect("a_b");
        users
            .create_user(&new_user("axb@acme.test", "axb", "acme"), &[])
            .await
            .expect("axb");
        let mut emile = new_user("emile@acme.test", "emile", "acme");
        emile.first_name = Some("Émile".to_string());
        users.create_user(&emile, &[]).await.expect("emile");

        let search = |term: &str| UserFilter {
            search: Some(term.to_string()),
            ..Default::default()
        };
        let found = users.list_users(&search("a_b"), 0, 10).await.expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "a_b");

        assert_eq!(users.count_users(&search("%")).await.expect("count"), 0);

        let found = users.list_users(&search("Émile"), 0, 10).await.expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "emile");
    }
}
