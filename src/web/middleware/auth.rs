use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;
use tracing::debug;

use crate::db::User;
use crate::security::{TokenType, verify_token_type};
use crate::web::metrics::Metrics;
use crate::web::{ApiError, AppState, app_state};

fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

async fn resolve_user(state: &AppState, token: Option<&str>) -> Result<User, ApiError> {
    let claims = token
        .and_then(|token| state.tokens.decode(token))
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    if !verify_token_type(&claims, TokenType::Access) {
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
        return Err(ApiError::forbidden("Inactive user account"));
    }

    Ok(user)
}

/// Resolves the bearer access token into the current [`User`] and stores it
/// in the depot. Stops the chain on failure.
#[handler]
pub async fn authenticate(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    let state = match app_state(depot) {
        Ok(state) => state,
        Err(err) => {
            err.render(depot, res);
            ctrl.skip_rest();
            return;
        }
    };

    let token = bearer_token(req).map(str::to_owned);
    match resolve_user(&state, token.as_deref()).await {
        Ok(user) => {
            depot.inject(user);
        }
        Err(err) => {
            debug!(status = err.status.as_u16(), detail = %err.detail, "authentication rejected");
            Metrics::auth_rejected();
            err.render(depot, res);
            ctrl.skip_rest();
        }
    }
}

/// User stored by [`authenticate`].
pub fn current_user(depot: &Depot) -> Result<&User, ApiError> {
    depot
        .obtain::<User>()
        .map_err(|_| ApiError::unauthorized("Invalid or expired token"))
}

/// Hoop allowing only users holding `resource:action`.
pub struct RequirePermission {
    resource: &'static str,
    action: &'static str,
}

impl RequirePermission {
    pub fn new(resource: &'static str, action: &'static str) -> Self {
        Self { resource, action }
    }
}

#[handler]
impl RequirePermission {
    async fn handle(&self, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
        let rejection = match current_user(depot) {
            Ok(user) if user.has_permission(self.resource, self.action) => return,
            Ok(_) => ApiError::forbidden(format!(
                "Missing permission: {}:{}",
                self.resource, self.action
            )),
            Err(err) => err,
        };
        rejection.render(depot, res);
        ctrl.skip_rest();
    }
}

#[handler]
pub async fn require_superuser(depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    let rejection = match current_user(depot) {
        Ok(user) if user.is_superuser => return,
        Ok(_) => ApiError::forbidden("Insufficient permissions: superuser required"),
        Err(err) => err,
    };
    rejection.render(depot, res);
    ctrl.skip_rest();
}

/// Superusers reach every tenant; others only their own.
pub fn ensure_tenant(user: &User, tenant_id: &str, detail: &str) -> Result<(), ApiError> {
    if user.can_access_tenant(tenant_id) {
        Ok(())
    } else {
        Err(ApiError::forbidden(detail))
    }
}

#[cfg(test)]
mod tests {
    use salvo::test::TestClient;

    use super::bearer_token;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let req = TestClient::get("http://127.0.0.1/")
            .add_header("authorization", "bearer abc.def", true)
            .build();
        assert_eq!(bearer_token(&req), Some("abc.def"));

        let req = TestClient::get("http://127.0.0.1/")
            .add_header("authorization", "Basic dXNlcg==", true)
            .build();
        assert_eq!(bearer_token(&req), None);

        let req = TestClient::get("http://127.0.0.1/").build();
        assert_eq!(bearer_token(&req), None);
    }
}
