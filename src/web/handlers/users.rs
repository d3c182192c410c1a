use salvo::oapi::extract::{JsonBody, PathParam, QueryParam};
use salvo::prelude::*;

use crate::db::{User, UserFilter};
use crate::service::{CreateUser, UserUpdate};
use crate::validation;
use crate::web::middleware::auth::{current_user, ensure_tenant};
use crate::web::schemas::{
    CreateUserRequest, MessageResponse, TenantUserCount, UpdateUserRequest, UserList, UserRead,
    UserWithRoles,
};
use crate::web::{ApiError, AppState, app_state};

const FOREIGN_USER: &str = "Access to this user is not allowed";

async fn load_user(state: &AppState, id: i64) -> Result<User, ApiError> {
    state
        .users
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

#[endpoint(tags("users"))]
pub async fn create_user(
    body: JsonBody<CreateUserRequest>,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<Json<UserWithRoles>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;
    let body = body.into_inner();

    let input = CreateUser {
        email: validation::email(&body.email)?,
        username: validation::username(&body.username)?,
        first_name: validation::person_name("first_name", body.first_name)?,
        last_name: validation::person_name("last_name", body.last_name)?,
        password: validation::password(&body.password)?,
        tenant_id: validation::tenant_id(&body.tenant_id)?,
        is_active: body.is_active,
        role_ids: body.role_ids,
    };

    if !actor.is_superuser && input.tenant_id != actor.tenant_id {
        return Err(ApiError::forbidden(
            "You can only create users in your own tenant",
        ));
    }

    let user = state.users.create(input).await?;
    res.status_code(StatusCode::CREATED);
    Ok(Json(UserWithRoles::from(&user)))
}

/// Paginated listing; non-superusers only ever see their own tenant.
#[endpoint(tags("users"))]
pub async fn list_users(
    skip: QueryParam<i64, false>,
    limit: QueryParam<i64, false>,
    search: QueryParam<String, false>,
    is_active: QueryParam<bool, false>,
    is_superuser: QueryParam<bool, false>,
    tenant_id: QueryParam<String, false>,
    depot: &mut Depot,
) -> Result<Json<UserList>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;
    let (skip, limit) = validation::pagination(skip.into_inner(), limit.into_inner())?;

    let tenant_id = if actor.is_superuser {
        tenant_id.into_inner()
    } else {
        Some(actor.tenant_id.clone())
    };
    let filter = UserFilter {
        tenant_id,
        is_active: is_active.into_inner(),
        is_superuser: is_superuser.into_inner(),
        search: search.into_inner(),
    };

    let users = state.users.list(&filter, skip, limit).await?;
    let total = state.users.count(&filter).await?;
    Ok(Json(UserList::new(
        users.iter().map(UserRead::from).collect(),
        total,
        skip,
        limit,
    )))
}

#[endpoint(tags("users"))]
pub async fn get_user(
    id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<UserWithRoles>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;

    let user = load_user(&state, id.into_inner()).await?;
    ensure_tenant(actor, &user.tenant_id, FOREIGN_USER)?;
    Ok(Json(UserWithRoles::from(&user)))
}

/// Users may always edit themselves; otherwise the target must share the
/// caller's tenant unless the caller is a superuser.
#[endpoint(tags("users"))]
pub async fn update_user(
    id: PathParam<i64>,
    body: JsonBody<UpdateUserRequest>,
    depot: &mut Depot,
) -> Result<Json<UserWithRoles>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;
    let id = id.into_inner();
    let body = body.into_inner();

    let user = load_user(&state, id).await?;
    if user.id != actor.id {
        ensure_tenant(actor, &user.tenant_id, FOREIGN_USER)?;
    }

    let update = UserUpdate {
        email: body.email.as_deref().map(validation::email).transpose()?,
        username: body.username.as_deref().map(validation::username).transpose()?,
        first_name: body
            .first_name
            .map(|name| validation::person_name("first_name", name))
            .transpose()?,
        last_name: body
            .last_name
            .map(|name| validation::person_name("last_name", name))
            .transpose()?,
        password: body.password.as_deref().map(validation::password).transpose()?,
        is_active: body.is_active,
        role_ids: body.role_ids,
    };

    let updated = state
        .users
        .update(id, update)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(UserWithRoles::from(&updated)))
}

#[endpoint(tags("users"))]
pub async fn delete_user(
    id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<MessageResponse>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;
    let id = id.into_inner();

    if id == actor.id {
        return Err(ApiError::bad_request("Cannot delete your own account"));
    }
    let user = load_user(&state, id).await?;
    ensure_tenant(actor, &user.tenant_id, FOREIGN_USER)?;

    state.users.delete(id).await?;
    Ok(Json(MessageResponse::ok(format!(
        "User {} deleted successfully",
        user.email
    ))))
}

#[endpoint(tags("users"))]
pub async fn add_user_role(
    id: PathParam<i64>,
    role_id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<UserWithRoles>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;

    let user = load_user(&state, id.into_inner()).await?;
    ensure_tenant(actor, &user.tenant_id, FOREIGN_USER)?;

    let updated = state.users.add_role(user.id, role_id.into_inner()).await?;
    Ok(Json(UserWithRoles::from(&updated)))
}

#[endpoint(tags("users"))]
pub async fn remove_user_role(
    id: PathParam<i64>,
    role_id: PathParam<i64>,
    depot: &mut Depot,
) -> Result<Json<UserWithRoles>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;

    let user = load_user(&state, id.into_inner()).await?;
    ensure_tenant(actor, &user.tenant_id, FOREIGN_USER)?;

    let updated = state
        .users
        .remove_role(user.id, role_id.into_inner())
        .await?;
    Ok(Json(UserWithRoles::from(&updated)))
}

#[endpoint(tags("users"))]
pub async fn count_tenant_users(
    tenant_id: PathParam<String>,
    depot: &mut Depot,
) -> Result<Json<TenantUserCount>, ApiError> {
    let state = app_state(depot)?;
    let actor = current_user(depot)?;
    let tenant_id = tenant_id.into_inner();
    ensure_tenant(actor, &tenant_id, "Access to this tenant is not allowed")?;

    let count = |is_active| {
        let filter = UserFilter {
            tenant_id: Some(tenant_id.clone()),
            is_active,
            ..Default::default()
        };
        let users = state.users.clone();
        async move { users.count(&filter).await }
    };

    Ok(Json(TenantUserCount {
        total_users: count(None).await?,
        active_users: count(Some(true)).await?,
        inactive_users: count(Some(false)).await?,
        tenant_id,
    }))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use salvo::prelude::*;
    use salvo::test::{ResponseExt, TestClient};
    use serde_json::{Value, json};

    use crate::web::testing::{BASE, PASSWORD, TestApp};

    fn url(path: &str) -> String {
        format!("{BASE}/api/v1/users{path}")
    }

    fn new_user(email: &str, username: &str, tenant: &str) -> Value {
        json!({
            "email": email,
            "username": username,
            "password": PASSWORD,
            "tenant_id": tenant,
        })
    }

    #[tokio::test]
    async fn admin_creates_users_in_own_tenant_only() {
        let app = TestApp::new().await;
        let admin = app
            .user_with_role("boss@acme.test", "boss", "acme", "admin")
            .await;
        let token = app.token_for(&admin);

        let mut res = TestClient::post(url(""))
            .bearer_auth(&token)
            .json(&new_user("New.Hire@Acme.test", "NewHire", "acme"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::CREATED));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["email"], "new.hire@acme.test");
        assert_eq!(body["username"], "newhire");
        assert_eq!(body["is_verified"], false);
        assert!(body.get("hashed_password").is_none());

        let mut res = TestClient::post(url(""))
            .bearer_auth(&token)
            .json(&new_user("x@globex.test", "globexer", "globex"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["detail"], "You can only create users in your own tenant");

        let res = TestClient::post(url(""))
            .bearer_auth(&token)
            .json(&new_user("New.Hire@Acme.test", "another", "acme"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn weak_passwords_are_unprocessable() {
        let app = TestApp::new().await;
        let root = app.login("root@acme.test").await;
        let mut body = new_user("weak@acme.test", "weakling", "acme");
        body["password"] = json!("password");

        let mut res = TestClient::post(url(""))
            .bearer_auth(&root)
            .json(&body)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::UNPROCESSABLE_ENTITY));
        let body: Value = res.take_json().await.expect("json");
        assert!(body["detail"].as_str().expect("detail").starts_with("password:"));
    }

    #[tokio::test]
    async fn viewer_lacks_user_permissions() {
        let app = TestApp::new().await;
        let viewer = app
            .user_with_role("view@acme.test", "viewer1", "acme", "viewer")
            .await;

        let mut res = TestClient::get(url(""))
            .bearer_auth(app.token_for(&viewer))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["detail"], "Missing permission: users:read");
    }

    #[tokio::test]
    async fn listing_is_scoped_to_the_callers_tenant() {
        let app = TestApp::new().await;
        let admin = app
            .user_with_role("boss@acme.test", "boss", "acme", "admin")
            .await;
        app.user_with_role("ann@acme.test", "ann", "acme", "user")
            .await;
        app.user_with_role("gus@globex.test", "gus", "globex", "user")
            .await;

        let mut res = TestClient::get(url("?tenant_id=globex&limit=1"))
            .bearer_auth(app.token_for(&admin))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["total"], 2);
        assert_eq!(body["pages"], 2);
        assert_eq!(body["page_size"], 1);
        assert_eq!(body["items"][0]["tenant_id"], "acme");

        let root = app.login("root@acme.test").await;
        let mut res = TestClient::get(url("?tenant_id=globex"))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["username"], "gus");

        let res = TestClient::get(url("?limit=0"))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[tokio::test]
    async fn cross_tenant_access_is_forbidden() {
        let app = TestApp::new().await;
        let admin = app
            .user_with_role("boss@acme.test", "boss", "acme", "admin")
            .await;
        let foreign = app
            .user_with_role("gus@globex.test", "gus", "globex", "user")
            .await;
        let token = app.token_for(&admin);

        let res = TestClient::get(url(&format!("/{}", foreign.id)))
            .bearer_auth(&token)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));

        let res = TestClient::put(url(&format!("/{}", foreign.id)))
            .bearer_auth(&token)
            .json(&json!({ "first_name": "Gus" }))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));

        let res = TestClient::get(url("/4242"))
            .bearer_auth(&token)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));

        let res = TestClient::get(url("/tenant/globex/count"))
            .bearer_auth(&token)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn update_clears_names_and_replaces_roles() {
        let app = TestApp::new().await;
        let root = app.login("root@acme.test").await;
        let ann = app
            .user_with_role("ann@acme.test", "ann", "acme", "user")
            .await;
        let viewer = app
            .state
            .roles
            .get_by_name("viewer")
            .await
            .expect("query")
            .expect("viewer");

        let mut res = TestClient::put(url(&format!("/{}", ann.id)))
            .bearer_auth(&root)
            .json(&json!({ "first_name": "Ann", "last_name": null, "role_ids": [viewer.id] }))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["full_name"], "Ann");
        assert_eq!(body["roles"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["roles"][0]["name"], "viewer");
    }

    #[tokio::test]
    async fn delete_refuses_self_and_removes_others() {
        let app = TestApp::new().await;
        let admin = app
            .user_with_role("boss@acme.test", "boss", "acme", "admin")
            .await;
        let root_user = app
            .state
            .users
            .get_by_email("root@acme.test")
            .await
            .expect("query")
            .expect("root");
        let root = app.token_for(&root_user);

        let mut res = TestClient::delete(url(&format!("/{}", root_user.id)))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["detail"], "Cannot delete your own account");

        let mut res = TestClient::delete(url(&format!("/{}", admin.id)))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["message"], "User boss@acme.test deleted successfully");

        let res = TestClient::delete(url(&format!("/{}", admin.id)))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn roles_are_added_and_removed() {
        let app = TestApp::new().await;
        let root = app.login("root@acme.test").await;
        let ann = app
            .user_with_role("ann@acme.test", "ann", "acme", "user")
            .await;
        let viewer = app
            .state
            .roles
            .get_by_name("viewer")
            .await
            .expect("query")
            .expect("viewer");

        let path = url(&format!("/{}/roles/{}", ann.id, viewer.id));
        let mut res = TestClient::post(&path)
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["roles"].as_array().map(Vec::len), Some(2));

        let mut res = TestClient::delete(&path)
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["roles"].as_array().map(Vec::len), Some(1));

        let res = TestClient::post(url(&format!("/{}/roles/4242", ann.id)))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn tenant_counts_split_active_and_inactive() {
        let app = TestApp::new().await;
        let root = app.login("root@acme.test").await;
        app.user_with_role("ann@acme.test", "ann", "acme", "user")
            .await;
        let bob = app
            .user_with_role("bob@acme.test", "bob", "acme", "user")
            .await;
        TestClient::put(url(&format!("/{}", bob.id)))
            .bearer_auth(&root)
            .json(&json!({ "is_active": false }))
            .send(&app.service)
            .await;

        let mut res = TestClient::get(url("/tenant/acme/count"))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["tenant_id"], "acme");
        assert_eq!(body["total_users"], 2);
        assert_eq!(body["active_users"], 1);
        assert_eq!(body["inactive_users"], 1);
    }

    #[tokio::test]
    async fn ids_beyond_i32_are_not_found() {
        let app = TestApp::new().await;
        let root = app.login("root@acme.test").await;

        for res in [
            TestClient::get(url("/3000000000"))
                .bearer_auth(&root)
                .send(&app.service)
                .await,
            TestClient::delete(url("/3000000000"))
                .bearer_auth(&root)
                .send(&app.service)
                .await,
            TestClient::post(url("/3000000000/roles/1"))
                .bearer_auth(&root)
                .send(&app.service)
                .await,
        ] {
            assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
        }

        let mut res = TestClient::get(url("/3000000000"))
            .bearer_auth(&root)
            .send(&app.service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["detail"], "User not found");
    }
}
