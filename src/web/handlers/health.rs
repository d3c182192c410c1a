use salvo::prelude::*;

use crate::web::schemas::{HealthStatus, RootInfo};
use crate::web::{ApiError, app_state};

#[endpoint(tags("health"))]
pub async fn root(depot: &mut Depot) -> Result<Json<RootInfo>, ApiError> {
    let state = app_state(depot)?;
    Ok(Json(RootInfo {
        name: state.config.app.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
        docs: "/docs".to_string(),
        description: "Identity, roles and tenant access for VM migrations to OpenShift"
            .to_string(),
    }))
}

#[endpoint(tags("health"))]
pub async fn health_check(depot: &mut Depot) -> Result<Json<HealthStatus>, ApiError> {
    let state = app_state(depot)?;
    Ok(Json(HealthStatus {
        status: "healthy".to_string(),
        app: state.config.app.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
