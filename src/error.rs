use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// API-visible errors. Every variant maps to a stable `errorCode` string
/// that clients key on; messages are user-safe.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authorization required")]
    AuthRequired,
    #[error("invalid or expired token")]
    AuthInvalid,
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request body too large")]
    RequestTooLarge,
    #[error("no workspace root configured")]
    WorkspaceRequired,
    #[error("path resolves outside the workspace root")]
    PathOutsideWorkspace,
    #[error("invalid repository URL: {0}")]
    InvalidRepoUrl(String),
    #[error("capability not granted: {0}")]
    CapabilityNotGranted(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn validation<E: std::fmt::Display>(err: E) -> Self {
        Self::Validation(err.to_string())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::OriginNotAllowed(_) => "origin_not_allowed",
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::RequestTooLarge => "request_too_large",
            ApiError::WorkspaceRequired => "workspace_required",
            ApiError::PathOutsideWorkspace => "path_outside_workspace",
            ApiError::InvalidRepoUrl(_) => "invalid_repo_url",
            ApiError::CapabilityNotGranted(_) => "capability_not_granted",
            ApiError::JobNotFound(_) => "job_not_found",
            ApiError::RepoNotFound(_) => "repo_not_found",
            ApiError::PathNotFound(_) => "path_not_found",
            // Destination conflicts and schema-level validation have no
            // dedicated code in the taxonomy.
            ApiError::Conflict(_) | ApiError::Validation(_) | ApiError::Internal(_) => {
                "internal_error"
            }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::WorkspaceRequired
            | ApiError::PathOutsideWorkspace
            | ApiError::CapabilityNotGranted(_)
            | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidRepoUrl(_) | ApiError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::JobNotFound(_) | ApiError::RepoNotFound(_) | ApiError::PathNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error_code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error_code: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::RequestTooLarge
        } else {
            ApiError::Validation(rejection.body_text())
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        ApiError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::ApiError;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn codes_and_statuses_are_stable() {
        let cases = [
            (ApiError::AuthRequired, StatusCode::UNAUTHORIZED, "auth_required"),
            (ApiError::AuthInvalid, StatusCode::UNAUTHORIZED, "auth_invalid"),
            (
                ApiError::OriginNotAllowed("x".into()),
                StatusCode::FORBIDDEN,
                "origin_not_allowed",
            ),
            (
                ApiError::RateLimited("x".into()),
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
            ),
            (
                ApiError::RequestTooLarge,
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_too_large",
            ),
            (
                ApiError::WorkspaceRequired,
                StatusCode::CONFLICT,
                "workspace_required",
            ),
            (
                ApiError::PathOutsideWorkspace,
                StatusCode::CONFLICT,
                "path_outside_workspace",
            ),
            (
                ApiError::InvalidRepoUrl("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_repo_url",
            ),
            (
                ApiError::CapabilityNotGranted("x".into()),
                StatusCode::CONFLICT,
                "capability_not_granted",
            ),
            (
                ApiError::JobNotFound("x".into()),
                StatusCode::NOT_FOUND,
                "job_not_found",
            ),
            (
                ApiError::RepoNotFound("x".into()),
                StatusCode::NOT_FOUND,
                "repo_not_found",
            ),
            (
                ApiError::PathNotFound("x".into()),
                StatusCode::NOT_FOUND,
                "path_not_found",
            ),
            (
                ApiError::Conflict("x".into()),
                StatusCode::CONFLICT,
                "internal_error",
            ),
            (
                ApiError::Validation("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "internal_error",
            ),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.error_code(), code);
            let response = err.into_response();
            assert_eq!(response.status(), status);
        }
    }
}
