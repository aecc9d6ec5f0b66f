//! Response envelope and error mapping shared by every route.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::Error;

/// Successful responses are wrapped as `{"data": ...}`.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

pub fn respond<T: Serialize>(data: T) -> Json<DataResponse<T>> {
    Json(DataResponse { data })
}

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err.root() {
            Error::ModemNotFound(_) | Error::NoSupportedSecureElement => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            tracing::warn!(status = self.status.as_u16(), error = %self.message, "request failed");
        }
        let body = serde_json::json!({ "code": self.status.as_u16(), "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_root_cause() {
        let cases = [
            (Error::ModemNotFound("1".into()), StatusCode::NOT_FOUND),
            (Error::NoSupportedSecureElement.on_device("1"), StatusCode::NOT_FOUND),
            (Error::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (Error::DeadlineExceeded.on_device("1"), StatusCode::GATEWAY_TIMEOUT),
            (Error::Transport("gone".into()), StatusCode::BAD_GATEWAY),
            (Error::EngineUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Channel("busy".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let message = err.to_string();
            let api = ApiError::from(err);
            assert_eq!(api.status(), expected, "{message}");
            assert_eq!(api.message, message);
        }
    }
}
