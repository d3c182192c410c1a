use std::sync::Arc;

use tracing::{info, warn};

use super::ServiceError;
use crate::db::{NewUser, RoleStore, User, UserChanges, UserFilter, UserStore};
use crate::rbac;
use crate::security::{hash_password, validate_password_strength, verify_password};

/// Validated input for a new account. The password is still plain text.
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: String,
    pub tenant_id: String,
    pub is_active: bool,
    pub role_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub role_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone)]
pub enum SuperuserOutcome {
    Created(User),
    /// A superuser was already present; nothing was written.
    Existing(User),
}

#[derive(Clone)]
pub struct UserService {
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    bcrypt_cost: u32,
}

impl UserService {
    pub fn new(users: Arc<dyn UserStore>, roles: Arc<dyn RoleStore>, bcrypt_cost: u32) -> Self {
        Self {
            users,
            roles,
            bcrypt_cost,
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, ServiceError> {
        Ok(self.users.get_user(id).await?)
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(self.users.get_user_by_email(email).await?)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, ServiceError> {
        Ok(self.users.get_user_by_username(username).await?)
    }

    pub async fn list(
        &self,
        filter: &UserFilter,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<User>, ServiceError> {
        Ok(self.users.list_users(filter, skip, limit).await?)
    }

    pub async fn count(&self, filter: &UserFilter) -> Result<i64, ServiceError> {
        Ok(self.users.count_users(filter).await?)
    }

    async fn ensure_roles_exist(&self, role_ids: &[i64]) -> Result<(), ServiceError> {
        if role_ids.is_empty() {
            return Ok(());
        }

        let found = self.roles.get_roles_by_ids(role_ids).await?;
        let mut missing: Vec<i64> = role_ids
            .iter()
            .copied()
            .filter(|id| !found.iter().any(|role| role.id == *id))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if missing.is_empty() {
            Ok(())
        } else {
            let ids = missing
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            Err(ServiceError::invalid(format!("Roles not found: [{ids}]")))
        }
    }

    pub async fn create(&self, input: CreateUser) -> Result<User, ServiceError> {
        if self.users.get_user_by_email(&input.email).await?.is_some() {
            return Err(ServiceError::invalid(format!(
                "Email '{}' is already in use",
                input.email
            )));
        }
        if self.users.get_user_by_username(&input.username).await?.is_some() {
            return Err(ServiceError::invalid(format!(
                "Username '{}' is already in use",
                input.username
            )));
        }
        self.ensure_roles_exist(&input.role_ids).await?;

        let new_user = NewUser {
            email: input.email.to_lowercase(),
            username: input.username.to_lowercase(),
            first_name: input.first_name,
            last_name: input.last_name,
            hashed_password: hash_password(&input.password, self.bcrypt_cost)?,
            tenant_id: input.tenant_id.to_lowercase(),
            is_active: input.is_active,
            is_verified: false,
            is_superuser: false,
        };

        let user = self.users.create_user(&new_user, &input.role_ids).await?;
        info!(user_id = user.id, tenant = %user.tenant_id, "user created");
        Ok(user)
    }

    pub async fn update(&self, id: i64, input: UserUpdate) -> Result<Option<User>, ServiceError> {
        let Some(current) = self.users.get_user(id).await? else {
            return Ok(None);
        };

        if let Some(ref email) = input.email {
            if *email != current.email && self.users.get_user_by_email(email).await?.is_some() {
                return Err(ServiceError::invalid(format!(
                    "Email '{email}' is already in use"
                )));
            }
        }
        if let Some(ref username) = input.username {
            if *username != current.username
                && self.users.get_user_by_username(username).await?.is_some()
            {
                return Err(ServiceError::invalid(format!(
                    "Username '{username}' is already in use"
                )));
            }
        }
        if let Some(ref role_ids) = input.role_ids {
            self.ensure_roles_exist(role_ids).await?;
        }

        let hashed_password = match input.password {
            Some(ref password) => Some(hash_password(password, self.bcrypt_cost)?),
            None => None,
        };

        let changes = UserChanges {
            email: input.email.map(|e| e.to_lowercase()),
            username: input.username.map(|u| u.to_lowercase()),
            first_name: input.first_name,
            last_name: input.last_name,
            hashed_password,
            is_active: input.is_active,
        };

        Ok(self
            .users
            .update_user(id, &changes, input.role_ids.as_deref())
            .await?)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, ServiceError> {
        let deleted = self.users.delete_user(id).await?;
        if deleted {
            info!(user_id = id, "user deleted");
        }
        Ok(deleted)
    }

    /// Matching user regardless of `is_active`; callers decide what an
    /// inactive account means.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, ServiceError> {
        let Some(user) = self.users.get_user_by_email(&email.to_lowercase()).await? else {
            return Ok(None);
        };
        if verify_password(password, &user.hashed_password) {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    pub async fn change_password(
        &self,
        user: &User,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        if !verify_password(current_password, &user.hashed_password) {
            return Err(ServiceError::invalid("Current password is incorrect"));
        }
        if current_password == new_password {
            return Err(ServiceError::invalid(
                "New password must be different from the current one",
            ));
        }
        validate_password_strength(new_password).map_err(ServiceError::Invalid)?;

        let changes = UserChanges {
            hashed_password: Some(hash_password(new_password, self.bcrypt_cost)?),
            ..Default::default()
        };
        self.users
            .update_user(user.id, &changes, None)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;
        info!(user_id = user.id, "password changed");
        Ok(())
    }

    /// Idempotent link between a user and a role.
    pub async fn add_role(&self, user_id: i64, role_id: i64) -> Result<User, ServiceError> {
        if self.users.get_user(user_id).await?.is_none() {
            return Err(ServiceError::not_found("User not found"));
        }
        if self.roles.get_role(role_id).await?.is_none() {
            return Err(ServiceError::not_found("Role not found"));
        }

        self.users.add_user_role(user_id, role_id).await?;
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))
    }

    /// Removing a role the user does not hold, or one that does not exist,
    /// leaves the user unchanged.
    pub async fn remove_role(&self, user_id: i64, role_id: i64) -> Result<User, ServiceError> {
        let user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))?;
        if !user.roles.iter().any(|role| role.id == role_id) {
            return Ok(user);
        }

        self.users.remove_user_role(user_id, role_id).await?;
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User not found"))
    }

    /// Creates the first superuser with the `super_admin` role unless one
    /// already exists. System roles must have been created beforehand.
    pub async fn ensure_superuser(&self, input: CreateUser) -> Result<SuperuserOutcome, ServiceError> {
        let filter = UserFilter {
            is_superuser: Some(true),
            ..Default::default()
        };
        if let Some(existing) = self.users.list_users(&filter, 0, 1).await?.pop() {
            warn!(email = %existing.email, "a superuser already exists");
            return Ok(SuperuserOutcome::Existing(existing));
        }

        validate_password_strength(&input.password).map_err(ServiceError::Invalid)?;

        let super_admin = self
            .roles
            .get_role_by_name(rbac::SUPER_ADMIN)
            .await?
            .ok_or_else(|| {
                ServiceError::not_found("Role 'super_admin' not found; create system roles first")
            })?;

        if self.users.get_user_by_email(&input.email).await?.is_some() {
            return Err(ServiceError::invalid(format!(
                "Email '{}' is already in use",
                input.email
            )));
        }
        if self.users.get_user_by_username(&input.username).await?.is_some() {
            return Err(ServiceError::invalid(format!(
                "Username '{}' is already in use",
                input.username
            )));
        }

        let new_user = NewUser {
            email: input.email.to_lowercase(),
            username: input.username.to_lowercase(),
            first_name: input.first_name,
            last_name: input.last_name,
            hashed_password: hash_password(&input.password, self.bcrypt_cost)?,
            tenant_id: input.tenant_id.to_lowercase(),
            is_active: true,
            is_verified: true,
            is_superuser: true,
        };
        let user = self.users.create_user(&new_user, &[super_admin.id]).await?;
        info!(user_id = user.id, email = %user.email, "superuser created");
        Ok(SuperuserOutcome::Created(user))
    }
}
