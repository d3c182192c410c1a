pub use self::error::DatabaseError;
pub use self::manager::{DatabaseCreation, DatabaseManager};
pub use self::models::{
    NewRole, NewUser, Permissions, Role, RoleChanges, RoleFilter, User, UserChanges, UserFilter,
};
pub use self::stores::{RoleStore, UserStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlite")]
pub mod schema_sqlite;
