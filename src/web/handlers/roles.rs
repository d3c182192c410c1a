use salvo::oapi::extract::{JsonBody, PathParam, QueryParam};
use salvo::prelude::*;

use crate::db::RoleFilter;
use crate::rbac;
use crate::service::{CreateRole, RoleUpdate};
use crate::validation;
use crate::web::schemas::{
    CreateRoleRequest, MessageResponse, PermissionCatalog, RoleCount, RoleRead, RoleUserCount,
    RoleWithUsers, UpdateRoleRequest,
};
use crate::web::{ApiError, app_state};

#[endpoint(tags("roles"))]
pub async fn create_role(
    body: JsonBody<CreateRoleRequest>,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<Json<RoleRead>, ApiError> {
    let state = app_state(depot)?;
    let body = body.into_inner();
    validation::permissions(&body.permissions)?;

    let role = state
        .roles
        .create(CreateRole {
            name: validation::role_name(&body.name)?,
            description: validation::role_description(body.description)?,
            permissions: body.permissions,
            is_active: body.is_active,
        })
        .await?;
    res.status_code(StatusCode::CREATED);
    Ok(Json(RoleRead::from(&role)))
}

#[endpoint(tags("roles"))]
pub async fn list_roles(
    skip: QueryParam<i64, false>,
    limit: QueryParam<i64, false>,
    is_active: QueryParam<bool, false>,
    search: QueryParam<String, false>,
    depot: &mut Depot,
) -> Result<Json<Vec<RoleRead>>, ApiError> {
    let state = app_state(depot)?;
    let (skip, limit) = validation::pagination(skip.into_inner(), limit.into_inner())?;
    let filter = RoleFilter {
        is_active: is_active.into_inner(),
        search: search.into_inner(),
    };

    let roles = state.roles.list(&filter, skip, limit).await?;
    Ok(Json(roles.iter().map(RoleRead::from).collect()))
}

#[endpoint(tags("roles"))]
pub async fn count_roles(depot: &mut Depot) -> Result<Json<RoleCount>, ApiError> {
    let state = app_state(depot)?;
    let total = state.roles.count(&RoleFilter::default()).await?;
    let system_roles = state.roles.count_system().await?;
    Ok(Json(RoleCount {
        total,
        system_roles,
        custom_roles: total - system_roles,
    }))
}

#[endpoint(tags("roles"))]
pub async fn get_role(
    id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<RoleWithUsers>, ApiError> {
    let state = app_state(depot)?;
    let id = id.into_inner();
    let role = state
        .roles
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;
    let user_count = state.roles.user_count(id).await?;

    Ok(Json(RoleWithUsers {
        role: RoleRead::from(&role),
        user_count,
    }))
}

#[endpoint(tags("roles"))]
pub async fn update_role(
    id: PathParam<i64>,
    body: JsonBody<UpdateRoleRequest>,
    depot: &mut Depot,
) -> Result<Json<RoleRead>, ApiError> {
    let state = app_state(depot)?;
    let body = body.into_inner();
    if let Some(ref permissions) = body.permissions {
        validation::permissions(permissions)?;
    }

    let update = RoleUpdate {
        name: body.name.as_deref().map(validation::role_name).transpose()?,
        description: body
            .description
            .map(validation::role_description)
            .transpose()?,
        permissions: body.permissions,
        is_active: body.is_active,
    };
    let role = state.roles.update(id.into_inner(), update).await?;
    Ok(Json(RoleRead::from(&role)))
}

/// Refused for system roles and for roles still assigned to users.
#[endpoint(tags("roles"))]
pub async fn delete_role(
    id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<MessageResponse>, ApiError> {
    let state = app_state(depot)?;
    let id = id.into_inner();
    let role = state
        .roles
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;

    state.roles.delete(id).await?;
    Ok(Json(MessageResponse::ok(format!(
        "Role '{}' deleted successfully",
        role.name
    ))))
}

#[endpoint(tags("roles"))]
pub async fn count_role_users(
    id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<RoleUserCount>, ApiError> {
    let state = app_state(depot)?;
    let id = id.into_inner();
    let role = state
        .roles
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;

    Ok(Json(RoleUserCount {
        role_id: role.id,
        role_name: role.name,
        user_count: state.roles.user_count(id).await?,
    }))
}

#[endpoint(tags("roles"))]
pub async fn get_role_by_name(
    name: PathParam<String>,
    depot: &mut Depot,
) -> Result<Json<RoleRead>, ApiError> {
    let state = app_state(depot)?;
    let name = name.into_inner();
    let role = state
        .roles
        .get_by_name(&name.to_lowercase())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Role '{name}' not found")))?;
    Ok(Json(RoleRead::from(&role)))
}

#[endpoint(tags("roles"))]
pub async fn init_system_roles(depot: &mut Depot) -> Result<Json<MessageResponse>, ApiError> {
    let state = app_state(depot)?;
    let roles = state.roles.create_system_roles().await?;
    Ok(Json(MessageResponse::ok(format!(
        "{} system roles initialized successfully",
        roles.len()
    ))))
}

#[endpoint(tags("roles"))]
pub async fn permission_catalog() -> Json<PermissionCatalog> {
    Json(PermissionCatalog {
        resources: rbac::RESOURCES
            .iter()
            .map(|(resource, _)| resource.to_string())
            .collect(),
        actions: rbac::ACTIONS.iter().map(|action| action.to_string()).collect(),
        description: rbac::RESOURCES
            .iter()
            .map(|(resource, description)| (resource.to_string(), description.to_string()))
            .collect(),
    })
}
