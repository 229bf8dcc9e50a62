use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use rozet_core::ApiError;
use rozet_store::StoreError;

/// Wrapper so store and API errors flow through axum handlers with `?`.
#[derive(Debug)]
pub struct HttpError(pub ApiError);

impl From<ApiError> for HttpError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for HttpError {
    fn from(e: StoreError) -> Self {
        Self(store_to_api(e))
    }
}

/// Store failures mapped onto the API taxonomy. Corruption and plumbing
/// failures collapse to Internal with the detail kept out of the response.
pub fn store_to_api(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(msg) => ApiError::NotFound(msg),
        StoreError::Gone(msg) => ApiError::Gone(msg),
        StoreError::Conflict(msg) => ApiError::Conflict(msg),
        StoreError::InvalidId(msg) => ApiError::Validation(msg),
        StoreError::QuotaExceeded(msg) => ApiError::QuotaExceeded(msg),
        StoreError::InvalidTransition { from, to } => {
            ApiError::Conflict(format!("operation cannot move from {from} to {to}"))
        }
        other => {
            tracing::error!(error = %other, "store failure");
            ApiError::Internal("internal storage failure".into())
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "details": serde_json::Value::Null,
            }
        });
        (status, Json(body)).into_response()
    }
}
