use std::sync::Arc;

use tracing::info;

use super::ServiceError;
use crate::db::{NewRole, Permissions, Role, RoleChanges, RoleFilter, RoleStore};
use crate::rbac;

/// Validated input for a custom role.
#[derive(Debug, Clone)]
pub struct CreateRole {
    pub name: String,
    pub description: Option<String>,
    pub permissions: Permissions,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub permissions: Option<Permissions>,
    pub is_active: Option<bool>,
}

#[derive(Clone)]
pub struct RoleService {
    roles: Arc<dyn RoleStore>,
}

impl RoleService {
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    pub async fn get(&self, id: i64) -> Result<Option<Role>, ServiceError> {
        Ok(self.roles.get_role(id).await?)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Role>, ServiceError> {
        Ok(self.roles.get_role_by_name(name).await?)
    }

    pub async fn list(
        &self,
        filter: &RoleFilter,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Role>, ServiceError> {
        Ok(self.roles.list_roles(filter, skip, limit).await?)
    }

    pub async fn count(&self, filter: &RoleFilter) -> Result<i64, ServiceError> {
        Ok(self.roles.count_roles(filter).await?)
    }

    pub async fn count_system(&self) -> Result<i64, ServiceError> {
        Ok(self.roles.count_system_roles().await?)
    }

    pub async fn user_count(&self, id: i64) -> Result<i64, ServiceError> {
        Ok(self.roles.count_role_users(id).await?)
    }

    pub async fn create(&self, input: CreateRole) -> Result<Role, ServiceError> {
        if self.roles.get_role_by_name(&input.name).await?.is_some() {
            return Err(ServiceError::invalid(format!(
                "A role named '{}' already exists",
                input.name
            )));
        }

        let role = self
            .roles
            .create_role(&NewRole {
                name: input.name,
                description: input.description,
                permissions: input.permissions,
                is_system_role: false,
                is_active: input.is_active,
            })
            .await?;
        info!(role_id = role.id, name = %role.name, "role created");
        Ok(role)
    }

    pub async fn update(&self, id: i64, input: RoleUpdate) -> Result<Role, ServiceError> {
        let current = self
            .roles
            .get_role(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role not found"))?;

        if current.is_system_role {
            return Err(ServiceError::invalid("System roles cannot be modified"));
        }

        if let Some(ref name) = input.name {
            if *name != current.name && self.roles.get_role_by_name(name).await?.is_some() {
                return Err(ServiceError::invalid(format!(
                    "A role named '{name}' already exists"
                )));
            }
        }

        let changes = RoleChanges {
            name: input.name,
            description: input.description,
            permissions: input.permissions,
            is_active: input.is_active,
        };
        self.roles
            .update_role(id, &changes)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role not found"))
    }

    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let role = self
            .roles
            .get_role(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Role not found"))?;

        if role.is_system_role {
            return Err(ServiceError::invalid("System roles cannot be deleted"));
        }

        let assigned = self.roles.count_role_users(id).await?;
        if assigned > 0 {
            return Err(ServiceError::invalid(format!(
                "Role '{}' is assigned to {assigned} user(s) and cannot be deleted",
                role.name
            )));
        }

        self.roles.delete_role(id).await?;
        info!(role_id = id, name = %role.name, "role deleted");
        Ok(())
    }

    /// Creates any missing predefined role and returns all four.
    pub async fn create_system_roles(&self) -> Result<Vec<Role>, ServiceError> {
        let mut roles = Vec::with_capacity(rbac::SYSTEM_ROLES.len());
        for name in rbac::SYSTEM_ROLES {
            if let Some(existing) = self.roles.get_role_by_name(name).await? {
                roles.push(existing);
                continue;
            }

            let permissions = rbac::system_role_permissions(name).unwrap_or_default();
            let role = self
                .roles
                .create_role(&NewRole {
                    name: name.to_string(),
                    description: Some(rbac::system_role_description(name)),
                    permissions,
                    is_system_role: true,
                    is_active: true,
                })
                .await?;
            info!(name, "system role created");
            roles.push(role);
        }
        Ok(roles)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::NamedTempFile;

    use super::{CreateRole, RoleService, RoleUpdate};
    use crate::service::ServiceError;
    use crate::service::testing::sqlite_manager;

    fn custom(name: &str) -> CreateRole {
        CreateRole {
            name: name.to_string(),
            description: None,
            permissions: BTreeMap::from([("reports".to_string(), vec!["read".to_string()])]),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn system_roles_are_created_once() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let service = RoleService::new(manager.role_store());

        let first = service.create_system_roles().await.expect("create");
        let second = service.create_system_roles().await.expect("create again");
        assert_eq!(first.len(), 4);
        assert_eq!(
            first.iter().map(|r| r.id).collect::<Vec<_>>(),
            second.iter().map(|r| r.id).collect::<Vec<_>>()
        );
        assert_eq!(service.count_system().await.expect("count"), 4);
        assert_eq!(
            first[0].description.as_deref(),
            Some("System role: Super Admin")
        );
    }

    #[tokio::test]
    async fn system_roles_are_immutable() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let service = RoleService::new(manager.role_store());
        let roles = service.create_system_roles().await.expect("create");

        let update = service
            .update(roles[1].id, RoleUpdate::default())
            .await
            .expect_err("system role update");
        assert!(matches!(update, ServiceError::Invalid(_)));

        let delete = service.delete(roles[1].id).await.expect_err("system role delete");
        assert!(matches!(delete, ServiceError::Invalid(_)));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let service = RoleService::new(manager.role_store());

        let analyst = service.create(custom("analyst")).await.expect("create");
        service.create(custom("auditor")).await.expect("create second");
        assert!(matches!(
            service.create(custom("analyst")).await,
            Err(ServiceError::Invalid(_))
        ));

        let rename = RoleUpdate {
            name: Some("auditor".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            service.update(analyst.id, rename).await,
            Err(ServiceError::Invalid(_))
        ));

        let same_name = RoleUpdate {
            name: Some("analyst".to_string()),
            is_active: Some(false),
            ..Default::default()
        };
        let updated = service.update(analyst.id, same_name).await.expect("update");
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn assigned_roles_cannot_be_deleted() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let service = RoleService::new(manager.role_store());
        let role = service.create(custom("analyst")).await.expect("create");

        let user = crate::service::testing::plain_user(&manager, "eve@acme.test", "eve").await;
        manager
            .user_store()
            .add_user_role(user.id, role.id)
            .await
            .expect("assign");

        let err = service.delete(role.id).await.expect_err("in use");
        assert!(err.to_string().contains("1 user"));

        manager
            .user_store()
            .remove_user_role(user.id, role.id)
            .await
            .expect("unassign");
        service.delete(role.id).await.expect("delete");
        assert!(matches!(
            service.delete(role.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
