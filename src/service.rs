pub use self::roles::{CreateRole, RoleService, RoleUpdate};
pub use self::users::{CreateUser, SuperuserOutcome, UserService, UserUpdate};

pub mod roles;
#[cfg(all(test, feature = "sqlite"))]
pub(crate) mod testing;
pub mod users;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::security::SecurityError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Business rule violation; the message is safe to show to clients.
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::Invalid(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }
}
