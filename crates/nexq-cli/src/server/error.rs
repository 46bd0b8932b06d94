//! Error-to-response mapping for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use nexq_core::Error;

/// Every error body is `{"error": "<message>"}` with the mapped status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Error::CannotCancel { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidPayload(_) | Error::UnsupportedReport(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexq_core::domain::TaskStatus;

    #[test]
    fn error_kinds_map_to_status_codes() {
        let not_found: ApiError = Error::TaskNotFound("x".into()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let cannot_cancel: ApiError = Error::CannotCancel {
            id: "x".into(),
            status: TaskStatus::Completed,
        }
        .into();
        assert_eq!(cannot_cancel.status, StatusCode::BAD_REQUEST);

        let internal: ApiError = Error::Cache("down".into()).into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_carries_the_message() {
        let err = ApiError::bad_request("cannot cancel task");
        assert_eq!(err.message, "cannot cancel task");
    }
}
