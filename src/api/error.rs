//! HTTP error mapping
//!
//! Every crate error funnels into `ApiError`, which renders the
//! OpenAI-compatible body `{"error": {"message", "type", "code"}}`.
//! Context overflow keeps its distinct `context_length_exceeded` code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// A rendered API error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Build an error with explicit parts.
    #[must_use]
    pub fn new(
        status: StatusCode,
        kind: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            kind,
            code,
            message: message.into(),
        }
    }

    /// 400 invalid request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
            message,
        )
    }

    /// 401 unauthenticated.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "unauthenticated",
            message,
        )
    }

    /// 403 forbidden.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "permission_error",
            "forbidden",
            message,
        )
    }

    /// 404 not found.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "resource_not_found",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.code,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<jamai_llm::Error> for ApiError {
    fn from(e: jamai_llm::Error) -> Self {
        use jamai_llm::Error as E;
        match &e {
            E::BadInput(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                e.to_string(),
            ),
            E::ResourceNotFound(_) => Self::not_found(e.to_string()),
            E::ContextOverflow(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "context_length_exceeded",
                e.to_string(),
            ),
            E::ProviderAuth(_) | E::ProviderRateLimit(_) | E::ProviderUnavailable(_)
            | E::InvalidResponse(_) | E::Network(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                "provider_error",
                "provider_error",
                e.to_string(),
            ),
            E::NoAvailableDeployment(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "provider_error",
                "no_available_deployment",
                e.to_string(),
            ),
            E::Unexpected(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "unexpected",
                e.to_string(),
            ),
        }
    }
}

impl From<jamai_billing::Error> for ApiError {
    fn from(e: jamai_billing::Error) -> Self {
        use jamai_billing::Error as E;
        match &e {
            E::InsufficientCredits(_) => Self::new(
                StatusCode::FORBIDDEN,
                "permission_error",
                "insufficient_credits",
                e.to_string(),
            ),
            E::OrgNotFound(_) | E::ProjectNotFound(_) => Self::not_found(e.to_string()),
            E::BadInput(_) => Self::bad_request(e.to_string()),
        }
    }
}

impl From<jamai_table::Error> for ApiError {
    fn from(e: jamai_table::Error) -> Self {
        use jamai_table::Error as E;
        match e {
            E::BadInput(message) => Self::bad_request(message),
            E::ResourceNotFound(message) => Self::not_found(message),
            E::ResourceExists(message) => Self::new(
                StatusCode::CONFLICT,
                "invalid_request_error",
                "resource_exists",
                message,
            ),
            E::Llm(inner) => inner.into(),
            E::Billing(inner) => inner.into(),
            E::Database(message) | E::Unexpected(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "unexpected",
                message,
            ),
        }
    }
}

/// Handler result alias
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Table-surface error wrapper: same status/code mapping as [`ApiError`],
/// rendered as the table error body `{"object": "error", "error",
/// "message"}` instead of the OpenAI-compatible serving shape.
#[derive(Debug)]
pub struct TableApiError(pub ApiError);

impl IntoResponse for TableApiError {
    fn into_response(self) -> Response {
        let inner = self.0;
        if inner.status.is_server_error() {
            error!(code = inner.code, message = %inner.message, "request failed");
        }
        let body = json!({
            "object": "error",
            "error": inner.code,
            "message": inner.message,
        });
        (inner.status, Json(body)).into_response()
    }
}

impl From<ApiError> for TableApiError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<jamai_table::Error> for TableApiError {
    fn from(e: jamai_table::Error) -> Self {
        Self(e.into())
    }
}

impl From<jamai_billing::Error> for TableApiError {
    fn from(e: jamai_billing::Error) -> Self {
        Self(e.into())
    }
}

impl From<jamai_llm::Error> for TableApiError {
    fn from(e: jamai_llm::Error) -> Self {
        Self(e.into())
    }
}

/// Table handler result alias
pub type TableApiResult<T> = std::result::Result<T, TableApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overflow_keeps_distinct_code() {
        let e: ApiError = jamai_llm::Error::ContextOverflow("8 > 5".to_string()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "context_length_exceeded");
        assert_eq!(e.kind, "invalid_request_error");
    }

    #[test]
    fn test_insufficient_credits_is_403() {
        let e: ApiError =
            jamai_billing::Error::InsufficientCredits("gpt".to_string()).into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.code, "insufficient_credits");
    }

    #[test]
    fn test_table_errors_map_to_http() {
        let e: ApiError = jamai_table::Error::ResourceExists("t".to_string()).into();
        assert_eq!(e.status, StatusCode::CONFLICT);

        let e: ApiError = jamai_table::Error::ResourceNotFound("r".to_string()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);

        let e: ApiError =
            jamai_table::Error::Llm(jamai_llm::Error::NoAvailableDeployment("m".to_string()))
                .into();
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_table_error_body_shape() {
        let e: TableApiError = jamai_table::Error::ResourceExists("t1".to_string()).into();
        assert_eq!(e.0.status, StatusCode::CONFLICT);
        assert_eq!(e.0.code, "resource_exists");

        let response = e.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        // The serving shape keeps its distinct mapping alongside.
        let serving: ApiError = jamai_llm::Error::ContextOverflow("x".to_string()).into();
        assert_eq!(serving.code, "context_length_exceeded");
    }
}
