use salvo::http::header::{CONTENT_TYPE, HeaderValue};
use salvo::prelude::*;
use tracing::error;

use crate::web::metrics::format_prometheus;

/// Prometheus text exposition of the process counters.
#[handler]
pub async fn metrics(res: &mut Response) {
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    // `render` would replace the exposition content type.
    if let Err(e) = res.write_body(format_prometheus()) {
        error!(error = %e, "failed to write metrics body");
        res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
    }
}
