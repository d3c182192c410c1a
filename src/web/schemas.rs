//! Request and response bodies of the HTTP API.

use std::collections::BTreeMap;

use salvo::oapi::ToSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::db::{Permissions, Role, User};

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`).
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RootInfo {
    pub name: String,
    pub version: String,
    pub status: String,
    pub docs: String,
    pub description: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub app: String,
    pub version: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
    pub success: bool,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoleRead {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Permissions,
    pub is_system_role: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Role> for RoleRead {
    fn from(role: &Role) -> Self {
        Self {
            id: role.id,
            name: role.name.clone(),
            description: role.description.clone(),
            permissions: role.permissions.clone(),
            is_system_role: role.is_system_role,
            is_active: role.is_active,
            created_at: role.created_at.to_rfc3339(),
            updated_at: role.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RoleWithUsers {
    #[serde(flatten)]
    pub role: RoleRead,
    pub user_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserRead {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub tenant_id: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub is_superuser: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&User> for UserRead {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name(),
            tenant_id: user.tenant_id.clone(),
            is_active: user.is_active,
            is_verified: user.is_verified,
            is_superuser: user.is_superuser,
            created_at: user.created_at.to_rfc3339(),
            updated_at: user.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserWithRoles {
    #[serde(flatten)]
    pub user: UserRead,
    pub roles: Vec<RoleRead>,
}

impl From<&User> for UserWithRoles {
    fn from(user: &User) -> Self {
        Self {
            user: user.into(),
            roles: user.roles.iter().map(RoleRead::from).collect(),
        }
    }
}

/// Profile of the caller with the union of its active roles' permissions.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserWithPermissions {
    #[serde(flatten)]
    pub user: UserWithRoles,
    pub permissions: Permissions,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserList {
    pub items: Vec<UserRead>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub pages: i64,
}

impl UserList {
    pub fn new(items: Vec<UserRead>, total: i64, skip: i64, limit: i64) -> Self {
        Self {
            items,
            total,
            page: skip / limit + 1,
            page_size: limit,
            pages: (total + limit - 1) / limit,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub tenant_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub password: String,
    #[serde(default)]
    pub role_ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[salvo(schema(value_type = Option<String>))]
    pub first_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    #[salvo(schema(value_type = Option<String>))]
    pub last_name: Option<Option<String>>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub role_ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TenantUserCount {
    pub tenant_id: String,
    pub total_users: i64,
    pub active_users: i64,
    pub inactive_users: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[salvo(schema(value_type = Option<String>))]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RoleCount {
    pub total: i64,
    pub system_roles: i64,
    pub custom_roles: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RoleUserCount {
    pub role_id: i64,
    pub role_name: String,
    pub user_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionCatalog {
    pub resources: Vec<String>,
    pub actions: Vec<String>,
    pub description: BTreeMap<String, String>,
}
