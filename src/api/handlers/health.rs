use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Liveness probe. No authentication, no body.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 204, description = "Service is up")),
    tag = "gardi"
)]
pub async fn health() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_is_no_content() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
