use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use timeline_protocol::TimelineError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized".to_owned(),
            message: message.into(),
        }
    }
}

fn status_for(error: &TimelineError) -> StatusCode {
    match error {
        TimelineError::ScopeViolation { .. } | TimelineError::UnregisteredKey(_) => {
            StatusCode::FORBIDDEN
        }
        TimelineError::UnsafePayload(_)
        | TimelineError::InvalidRouting(_)
        | TimelineError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TimelineError::MissingRoute { .. }
        | TimelineError::BackendRefused { .. }
        | TimelineError::Storage(_)
        | TimelineError::PartialAppend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TimelineError::Protocol { code, .. } => match *code {
            "unauthorized" | "invalid_token" | "missing_context" => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        },
    }
}

impl From<TimelineError> for ApiError {
    fn from(error: TimelineError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            tracing::error!(%error, "request failed");
        } else {
            tracing::debug!(%error, "request rejected");
        }
        Self {
            status,
            code: error.code().to_owned(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "code": self.code, "message": self.message } })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_errors_map_to_statuses() {
        let cases = [
            (TimelineError::scope("tenant_id", "t_a", "t_b"), StatusCode::FORBIDDEN),
            (
                TimelineError::UnsafePayload("data uri".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                TimelineError::MissingRoute {
                    resource_kind: "timeline".into(),
                    tenant_id: "t_a".into(),
                    env: "saas".into(),
                    project_id: "p1".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                TimelineError::PartialAppend {
                    event_id: "e1".into(),
                    stored: "t_a:p1:th1".into(),
                    missing: "unified_timeline".into(),
                    reason: "disk full".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                TimelineError::protocol("missing_context", "tenant_id is required"),
                StatusCode::UNAUTHORIZED,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn body_carries_structured_error() -> anyhow::Result<()> {
        let response = ApiError::from(TimelineError::scope("project_id", "p1", "p2")).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["error"]["code"], "scope_violation");
        assert!(value["error"]["message"].is_string());
        Ok(())
    }
}
