use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Infra(#[from] fleet_infra::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use fleet_infra::Error as Infra;

        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Infra(Infra::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Infra(Infra::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
            ApiError::Infra(Infra::AllocationExhausted { .. }) => StatusCode::CONFLICT,
            ApiError::Infra(Infra::Pve(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Infra(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
