use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use salvo::cors::{AllowOrigin, Cors};
use salvo::http::header::{AUTHORIZATION, CONTENT_TYPE};
use salvo::http::{HeaderValue, Method};
use salvo::oapi::security::{Http, HttpAuthScheme, SecurityScheme};
use salvo::oapi::swagger_ui::SwaggerUi;
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tracing::{error, info};

use crate::config::{Config, CorsConfig};
use crate::db::DatabaseManager;
use crate::security::{SecurityError, TokenIssuer};
use crate::service::{RoleService, UserService};

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod schemas;

pub use self::error::ApiError;

use self::handlers::{auth, health, metrics as metrics_handler, roles, users};
use self::metrics::Metrics;
use self::middleware::auth::{RequirePermission, authenticate, require_superuser};

/// Shared by every request through the depot.
pub struct AppState {
    pub config: Arc<Config>,
    pub users: UserService,
    pub roles: RoleService,
    pub tokens: TokenIssuer,
}

impl AppState {
    pub fn new(config: Arc<Config>, db_manager: &DatabaseManager) -> Result<Self, SecurityError> {
        let tokens = TokenIssuer::new(&config.security)?;
        Ok(Self {
            users: UserService::new(
                db_manager.user_store(),
                db_manager.role_store(),
                config.security.bcrypt_cost,
            ),
            roles: RoleService::new(db_manager.role_store()),
            tokens,
            config,
        })
    }
}

pub fn app_state(depot: &Depot) -> Result<Arc<AppState>, ApiError> {
    depot
        .obtain::<Arc<AppState>>()
        .cloned()
        .map_err(|_| ApiError::internal("StateError", "application state is not available"))
}

struct InjectState(Arc<AppState>);

#[handler]
impl InjectState {
    async fn handle(&self, depot: &mut Depot) {
        depot.inject(self.0.clone());
    }
}

#[handler]
async fn log_request(req: &mut Request, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    ctrl.call_next(req, depot, res).await;

    let status = res.status_code.unwrap_or(StatusCode::OK);
    info!(
        %method,
        %path,
        status = status.as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
}

fn guarded(resource: &'static str, action: &'static str) -> Router {
    Router::new().hoop(RequirePermission::new(resource, action))
}

fn api_router() -> Router {
    let auth_routes = Router::with_path("auth")
        .push(Router::with_path("login").post(auth::login))
        .push(Router::with_path("refresh").post(auth::refresh))
        .push(
            Router::new()
                .hoop(authenticate)
                .push(Router::with_path("me").get(auth::me))
                .push(Router::with_path("change-password").post(auth::change_password))
                .push(Router::with_path("logout").post(auth::logout))
                .push(Router::with_path("verify").get(auth::verify)),
        );

    let user_routes = Router::with_path("users")
        .hoop(authenticate)
        .push(guarded("users", "create").post(users::create_user))
        .push(guarded("users", "read").get(users::list_users))
        .push(
            Router::with_path("tenant/{tenant_id}/count")
                .push(guarded("users", "read").get(users::count_tenant_users)),
        )
        .push(
            Router::with_path("{id:num}")
                .push(guarded("users", "read").get(users::get_user))
                .push(guarded("users", "update").put(users::update_user))
                .push(guarded("users", "delete").delete(users::delete_user))
                .push(
                    Router::with_path("roles/{role_id:num}").push(
                        guarded("users", "update")
                            .post(users::add_user_role)
                            .delete(users::remove_user_role),
                    ),
                ),
        );

    let role_routes = Router::with_path("roles")
        .hoop(authenticate)
        .push(guarded("roles", "create").post(roles::create_role))
        .push(guarded("roles", "read").get(roles::list_roles))
        .push(Router::with_path("count").push(guarded("roles", "read").get(roles::count_roles)))
        .push(
            Router::with_path("init-system-roles")
                .hoop(require_superuser)
                .post(roles::init_system_roles),
        )
        .push(
            Router::with_path("permissions/resources")
                .push(guarded("roles", "read").get(roles::permission_catalog)),
        )
        .push(
            Router::with_path("name/{name}")
                .push(guarded("roles", "read").get(roles::get_role_by_name)),
        )
        .push(
            Router::with_path("{id:num}")
                .push(guarded("roles", "read").get(roles::get_role))
                .push(guarded("roles", "update").put(roles::update_role))
                .push(guarded("roles", "delete").delete(roles::delete_role))
                .push(
                    Router::with_path("users/count")
                        .push(guarded("roles", "read").get(roles::count_role_users)),
                ),
        );

    Router::new()
        .push(auth_routes)
        .push(user_routes)
        .push(role_routes)
}

pub fn create_router(config: &Config) -> Router {
    let router = Router::new()
        .get(health::root)
        .push(Router::with_path("health").get(health::health_check))
        .push(Router::with_path("metrics").get(metrics_handler::metrics))
        .push(
            Router::with_path(config.app.api_prefix.trim_start_matches('/')).push(api_router()),
        );

    let doc = OpenApi::new(config.app.name.clone(), env!("CARGO_PKG_VERSION"))
        .add_security_scheme(
            "bearer",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer).bearer_format("JWT")),
        )
        .merge_router(&router);

    router
        .push(doc.into_router("/openapi.json"))
        .push(SwaggerUi::new("/openapi.json").into_router("/docs"))
}

/// `None` when no origin is configured. Origins are checked when the config
/// is loaded; one that still fails here disables CORS loudly.
fn cors_handler(config: &CorsConfig) -> Option<Cors> {
    let origins = match config.allowed_origins() {
        Ok(origins) => origins,
        Err(e) => {
            error!(error = %e, "CORS disabled");
            return None;
        }
    };
    if origins.is_empty() {
        return None;
    }
    let origins = origins
        .iter()
        .map(|origin| HeaderValue::from_str(origin))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| error!(error = %e, "CORS disabled: origin is not a header value"))
        .ok()?;

    Some(
        Cors::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
            .allow_methods(vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(vec![AUTHORIZATION, CONTENT_TYPE]),
    )
}

pub fn create_service(state: Arc<AppState>) -> Service {
    let mut service = Service::new(create_router(&state.config));
    if let Some(cors) = cors_handler(&state.config.cors) {
        service = service.hoop(cors.into_handler());
    }
    service.hoop(log_request).hoop(InjectState(state))
}

#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn start(&self) -> Result<()> {
        let config = &self.state.config;
        let bind_addr = format!("{}:{}", config.app.bind_address, config.app.port);
        info!(
            app = %config.app.name,
            version = env!("CARGO_PKG_VERSION"),
            debug = config.app.debug,
            "starting web server on {}",
            bind_addr
        );
        info!("API documentation available at http://{}/docs", bind_addr);

        Metrics::mark_started();
        let acceptor = TcpListener::new(bind_addr).bind().await;
        let server = Server::new(acceptor);
        tokio::spawn(shutdown_on_ctrl_c(server.handle()));
        server.serve(create_service(self.state.clone())).await;

        info!(app = %config.app.name, "web server stopped");
        Ok(())
    }
}

async fn shutdown_on_ctrl_c(handle: ServerHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
        handle.stop_graceful(None);
    }
}


#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use diesel::RunQueryDsl;
    use salvo::prelude::*;
    use salvo::test::{ResponseExt, TestClient};
    use serde_json::{Value, json};

    use super::cors_handler;
    use super::testing::{BASE, PASSWORD, TestApp};
    use crate::config::CorsConfig;
    use crate::db::sqlite::establish_connection;

    const ORIGIN: &str = "http://localhost:3000";

    fn allow_origin(res: &Response) -> Option<String> {
        res.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
    }

    /// Leaves `users` readable but breaks role loading.
    fn drop_role_links(app: &TestApp) {
        let mut conn = establish_connection(&app.database_path()).expect("connection");
        diesel::sql_query("DROP TABLE user_roles")
            .execute(&mut conn)
            .expect("drop table");
    }

    async fn login_status(app: &TestApp) -> (Option<StatusCode>, Value) {
        let mut res = TestClient::post(format!("{BASE}/api/v1/auth/login"))
            .json(&json!({ "email": "root@acme.test", "password": PASSWORD }))
            .send(&app.service)
            .await;
        let body = res.take_json().await.expect("json");
        (res.status_code, body)
    }

    #[tokio::test]
    async fn root_and_health_are_public() {
        let app = TestApp::new().await;

        let mut res = TestClient::get(format!("{BASE}/")).send(&app.service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["status"], "running");
        assert_eq!(body["docs"], "/docs");

        let mut res = TestClient::get(format!("{BASE}/health"))
            .send(&app.service)
            .await;
        let body: Value = res.take_json().await.expect("json");
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["app"], "ShiftWise");
    }

    #[tokio::test]
    async fn metrics_are_plain_text() {
        let app = TestApp::new().await;
        let mut res = TestClient::get(format!("{BASE}/metrics"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(
            res.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/plain; version=0.0.4; charset=utf-8")
        );
        let body = res.take_string().await.expect("text");
        assert!(body.contains("shiftwise_logins_succeeded_total"));
    }

    #[tokio::test]
    async fn openapi_document_lists_api_paths() {
        let app = TestApp::new().await;
        let mut res = TestClient::get(format!("{BASE}/openapi.json"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body: Value = res.take_json().await.expect("json");
        assert!(body["paths"].get("/api/v1/auth/login").is_some());
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let app = TestApp::new().await;
        let res = TestClient::get(format!("{BASE}/api/v1/nowhere"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn docs_serve_swagger_ui() {
        let app = TestApp::new().await;
        let mut res = TestClient::get(format!("{BASE}/docs/"))
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let body = res.take_string().await.expect("html");
        assert!(body.contains("swagger-ui"));
        assert!(body.contains("/openapi.json"));
    }

    #[tokio::test]
    async fn cors_allows_configured_origins() {
        let app = TestApp::configured(|config| {
            config.cors.origins = vec![format!("{ORIGIN}/")];
        })
        .await;

        let res = TestClient::options(format!("{BASE}/api/v1/auth/login"))
            .add_header("origin", ORIGIN, true)
            .add_header("access-control-request-method", "POST", true)
            .add_header("access-control-request-headers", "content-type", true)
            .send(&app.service)
            .await;
        assert_eq!(allow_origin(&res).as_deref(), Some(ORIGIN));

        let res = TestClient::get(format!("{BASE}/health"))
            .add_header("origin", ORIGIN, true)
            .send(&app.service)
            .await;
        assert_eq!(allow_origin(&res).as_deref(), Some(ORIGIN));

        let res = TestClient::get(format!("{BASE}/health"))
            .add_header("origin", "http://evil.test", true)
            .send(&app.service)
            .await;
        assert_eq!(allow_origin(&res), None);
    }

    #[tokio::test]
    async fn no_cors_without_origins() {
        let app = TestApp::new().await;
        let res = TestClient::get(format!("{BASE}/health"))
            .add_header("origin", ORIGIN, true)
            .send(&app.service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(allow_origin(&res), None);
    }

    #[test]
    fn cors_handler_needs_valid_origins() {
        assert!(cors_handler(&CorsConfig::default()).is_none());
        let bad = CorsConfig {
            origins: vec!["not a url".to_string()],
        };
        assert!(cors_handler(&bad).is_none());
        let good = CorsConfig {
            origins: vec![ORIGIN.to_string()],
        };
        assert!(cors_handler(&good).is_some());
    }

    #[tokio::test]
    async fn internal_errors_are_generic_outside_debug() {
        let app = TestApp::new().await;
        drop_role_links(&app);

        let (status, body) = login_status(&app).await;
        assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(body["detail"], "Internal server error");
        assert!(body.get("type").is_none());
    }

    #[tokio::test]
    async fn internal_errors_are_detailed_in_debug() {
        let app = TestApp::configured(|config| config.app.debug = true).await;
        drop_role_links(&app);

        let (status, body) = login_status(&app).await;
        assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(body["type"], "DatabaseError");
        let detail = body["detail"].as_str().expect("detail");
        assert!(detail.contains("user_roles"), "unexpected detail {detail}");
    }
}
