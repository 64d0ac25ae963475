//! HTTP error mapping.
//!
//! Every handler returns `Result<_, ApiError>`. Request problems map to 400, unknown names to
//! 404 and everything else to 500; the body is always `{"error": ..., "detail": ...}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use libris_core::LibraryError;

use crate::dto::ErrorRes;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorRes,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorRes {
                error: "Internal server error".into(),
                detail: Some(message),
            },
        }
    }
}

impl From<LibraryError> for ApiError {
    fn from(err: LibraryError) -> Self {
        let status = match &err {
            LibraryError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
            return Self::internal(err.to_string());
        }

        tracing::debug!("request rejected ({}): {}", status, err);
        let detail = err.detail();
        Self {
            status,
            body: ErrorRes {
                error: err.to_string(),
                detail,
            },
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!("blocking task failed: {}", err);
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libris_core::SizeLimit;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (LibraryError::InvalidPath("..".into()), StatusCode::BAD_REQUEST),
            (LibraryError::NotFound("a.txt".into()), StatusCode::NOT_FOUND),
            (LibraryError::InvalidJson("eof".into()), StatusCode::BAD_REQUEST),
            (
                LibraryError::PayloadTooLarge {
                    limit: 1,
                    scope: SizeLimit::Request,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                LibraryError::Io(std::io::Error::other("disk on fire")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_rejection_detail_lists_allow_list() {
        let err = ApiError::from(LibraryError::ExtensionRejected {
            extension: ".exe".into(),
            allowed: vec![".pdf".into(), ".txt".into()],
        });

        assert_eq!(err.body.error, "file type not allowed: .exe");
        assert_eq!(err.body.detail.as_deref(), Some("Allowed extensions: .pdf, .txt"));
    }
}
