use std::sync::Arc;

use salvo::http::header::{HeaderValue, WWW_AUTHENTICATE};
use salvo::oapi::{self, Components, EndpointOutRegister, Operation};
use salvo::prelude::*;
use serde_json::json;
use tracing::error;

use super::AppState;
use crate::service::ServiceError;
use crate::validation::ValidationError;

/// Error answered to HTTP clients as `{"detail": "..."}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    /// Kind and message of an unexpected failure, shown only in debug mode.
    internal: Option<(&'static str, String)>,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            internal: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    pub fn internal(kind: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        error!(kind, %message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Internal server error".to_string(),
            internal: Some((kind, message)),
        }
    }

    /// Writes the error into `res`; used by hoops that stop the chain.
    pub fn render(self, depot: &Depot, res: &mut Response) {
        let debug = depot
            .obtain::<Arc<AppState>>()
            .map(|state| state.config.app.debug)
            .unwrap_or(false);

        res.status_code(self.status);
        if self.status == StatusCode::UNAUTHORIZED {
            res.headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        let body = match self.internal {
            Some((kind, message)) if debug => json!({ "detail": message, "type": kind }),
            _ => json!({ "detail": self.detail }),
        };
        res.render(Json(body));
    }
}

#[async_trait]
impl Writer for ApiError {
    async fn write(self, _req: &mut Request, depot: &mut Depot, res: &mut Response) {
        self.render(depot, res);
    }
}

impl EndpointOutRegister for ApiError {
    fn register(_components: &mut Components, operation: &mut Operation) {
        for (code, description) in [
            ("400", "Business rule violation"),
            ("401", "Missing, invalid or expired token"),
            ("403", "Insufficient permissions or foreign tenant"),
            ("404", "Resource not found"),
            ("422", "Invalid request field"),
        ] {
            operation
                .responses
                .insert(code, oapi::Response::new(description));
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Invalid(message) => ApiError::bad_request(message),
            ServiceError::NotFound(message) => ApiError::not_found(message),
            ServiceError::Database(err) => ApiError::internal("DatabaseError", err.to_string()),
            ServiceError::Security(err) => ApiError::internal("SecurityError", err.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::unprocessable(err.to_string())
    }
}
