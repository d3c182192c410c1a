use salvo::oapi::extract::JsonBody;
use salvo::prelude::*;
use tracing::{info, warn};

use crate::db::User;
use crate::security::{TokenType, verify_token_type};
use crate::validation;
use crate::web::metrics::Metrics;
use crate::web::middleware::auth::current_user;
use crate::web::schemas::{
    ChangePasswordRequest, LoginRequest, MessageResponse, RefreshRequest, TokenResponse,
    UserWithPermissions, UserWithRoles,
};
use crate::web::{ApiError, AppState, app_state};

fn issue_tokens(state: &AppState, user: &User) -> Result<TokenResponse, ApiError> {
    let access_token = state
        .tokens
        .create_access_token(user.id)
        .map_err(|e| ApiError::internal("SecurityError", e.to_string()))?;
    let refresh_token = state
        .tokens
        .create_refresh_token(user.id)
        .map_err(|e| ApiError::internal("SecurityError", e.to_string()))?;

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.access_token_ttl_seconds(),
    })
}

/// Exchanges email and password for an access/refresh token pair.
#[endpoint(tags("auth"))]
pub async fn login(
    body: JsonBody<LoginRequest>,
    depot: &mut Depot,
) -> Result<Json<TokenResponse>, ApiError> {
    let state = app_state(depot)?;
    let body = body.into_inner();
    let email = validation::email(&body.email)?;

    let Some(user) = state.users.authenticate(&email, &body.password).await? else {
        warn!(%email, "login failed: bad credentials");
        Metrics::login_failed();
        return Err(ApiError::unauthorized("Incorrect email or password"));
    };

    if !user.is_active {
        warn!(user_id = user.id, "login refused: inactive account");
        Metrics::login_failed();
        return Err(ApiError::forbidden(
            "Inactive account. Contact your administrator.",
        ));
    }

    let tokens = issue_tokens(&state, &user)?;
    Metrics::login_succeeded();
    info!(user_id = user.id, tenant = %user.tenant_id, "login succeeded");
    Ok(Json(tokens))
}

/// Issues a fresh token pair from a valid refresh token.
#[endpoint(tags("auth"))]
pub async fn refresh(
    body: JsonBody<RefreshRequest>,
    depot: &mut Depot,
) -> Result<Json<TokenResponse>, ApiError> {
    let state = app_state(depot)?;
    let claims = state
        .tokens
        .decode(&body.into_inner().refresh_token)
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired refresh token"))?;

    if !verify_token_type(&claims, TokenType::Refresh) {
        return Err(ApiError::unauthorized("Invalid token type"));
    }
    let user_id = claims
        .user_id()
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

    let user = state
        .users
        .get(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    if !user.is_active {
        return Err(ApiError::forbidden("Inactive account"));
    }

    let tokens = issue_tokens(&state, &user)?;
    Metrics::token_refreshed();
    Ok(Json(tokens))
}

#[endpoint(tags("auth"))]
pub async fn me(depot: &mut Depot) -> Result<Json<UserWithPermissions>, ApiError> {
    let user = current_user(depot)?;
    Ok(Json(UserWithPermissions {
        user: UserWithRoles::from(user),
        permissions: user.all_permissions(),
    }))
}

#[endpoint(tags("auth"))]
pub async fn change_password(
    body: JsonBody<ChangePasswordRequest>,
    depot: &mut Depot,
) -> Result<Json<MessageResponse>, ApiError> {
    let state = app_state(depot)?;
    let user = current_user(depot)?.clone();
    let body = body.into_inner();

    state
        .users
        .change_password(&user, &body.current_password, &body.new_password)
        .await?;
    Ok(Json(MessageResponse::ok("Password changed successfully")))
}

/// Tokens are stateless; the client discards them.
#[endpoint(tags("auth"))]
pub async fn logout(depot: &mut Depot) -> Result<Json<MessageResponse>, ApiError> {
    let user = current_user(depot)?;
    info!(user_id = user.id, "logout");
    Ok(Json(MessageResponse::ok(
        "Logged out successfully. Delete your tokens on the client side.",
    )))
}

#[endpoint(tags("auth"))]
pub async fn verify(depot: &mut Depot) -> Result<Json<MessageResponse>, ApiError> {
    current_user(depot)?;
    Ok(Json(MessageResponse::ok("Token is valid")))
}
