use async_trait::async_trait;

use super::DatabaseError;
use super::models::{
    NewRole, NewUser, Role, RoleChanges, RoleFilter, User, UserChanges, UserFilter,
};

/// Users are always returned with their roles loaded.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError>;
    async fn list_users(
        &self,
        filter: &UserFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<User>, DatabaseError>;
    async fn count_users(&self, filter: &UserFilter) -> Result<i64, DatabaseError>;
    /// Inserts the user and its role links in one transaction.
    async fn create_user(&self, user: &NewUser, role_ids: &[i64]) -> Result<User, DatabaseError>;
    /// `role_ids` replaces the whole role set when given.
    async fn update_user(
        &self,
        id: i64,
        changes: &UserChanges,
        role_ids: Option<&[i64]>,
    ) -> Result<Option<User>, DatabaseError>;
    async fn delete_user(&self, id: i64) -> Result<bool, DatabaseError>;
    async fn add_user_role(&self, user_id: i64, role_id: i64) -> Result<(), DatabaseError>;
    async fn remove_user_role(&self, user_id: i64, role_id: i64) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, id: i64) -> Result<Option<Role>, DatabaseError>;
    async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>, DatabaseError>;
    async fn get_roles_by_ids(&self, ids: &[i64]) -> Result<Vec<Role>, DatabaseError>;
    async fn list_roles(
        &self,
        filter: &RoleFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Role>, DatabaseError>;
    async fn count_roles(&self, filter: &RoleFilter) -> Result<i64, DatabaseError>;
    async fn count_system_roles(&self) -> Result<i64, DatabaseError>;
    async fn create_role(&self, role: &NewRole) -> Result<Role, DatabaseError>;
    async fn update_role(
        &self,
        id: i64,
        changes: &RoleChanges,
    ) -> Result<Option<Role>, DatabaseError>;
    async fn delete_role(&self, id: i64) -> Result<bool, DatabaseError>;
    async fn count_role_users(&self, role_id: i64) -> Result<i64, DatabaseError>;
}
