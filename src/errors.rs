use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Why the control plane answered 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReason {
    /// The tenant admin has not consented to the application.
    AdminConsentRequired,
    /// The caller lacks an RBAC role on the scope or capacity.
    InsufficientRole,
    Forbidden,
}

impl PermissionReason {
    /// Classify a 403 body. ARM and the identity platform put the
    /// interesting bits in `error.code` / `error.message`, so a plain
    /// substring scan over the lowercased body is enough.
    pub fn classify(body: &str) -> Self {
        let body = body.to_ascii_lowercase();
        if body.contains("aadsts65001")
            || body.contains("consent_required")
            || body.contains("admin consent")
            || body.contains("has not consented")
        {
            PermissionReason::AdminConsentRequired
        } else if body.contains("authorizationfailed")
            || body.contains("does not have authorization")
            || body.contains("linkedauthorizationfailed")
            || body.contains("role assignment")
        {
            PermissionReason::InsufficientRole
        } else {
            PermissionReason::Forbidden
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            PermissionReason::AdminConsentRequired => {
                "administrator consent is required for this application in your tenant"
            }
            PermissionReason::InsufficientRole => {
                "your account lacks the role assignment needed for this capacity (Contributor or higher)"
            }
            PermissionReason::Forbidden => "access to this resource is forbidden",
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization failed after token renewal; sign in again")]
    Authorization,

    #[error("permission denied: {}", .0.message())]
    PermissionDenied(PermissionReason),

    #[error("capacity provider not available in this subscription")]
    ScopeUnavailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("credential validation failed: {0}")]
    Validation(String),

    #[error("control plane returned {status}: {reason}")]
    Api { status: u16, reason: String },

    #[error("another operation is already in progress")]
    Busy,

    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("no capacity selected")]
    NotSelected,

    #[error("operation cancelled by user")]
    ConfirmationDeclined,

    #[error("credential store error: {0}")]
    Store(String),
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        ControllerError::Transport(e.to_string())
    }
}

impl ControllerError {
    /// Errors whose remedy is signing in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            ControllerError::Authentication(_)
                | ControllerError::Authorization
                | ControllerError::Validation(_)
        )
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match &self {
            ControllerError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "authentication_failed",
            ),
            ControllerError::Authorization => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "authorization_failed",
            ),
            ControllerError::PermissionDenied(reason) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                match reason {
                    PermissionReason::AdminConsentRequired => "admin_consent_required",
                    PermissionReason::InsufficientRole => "insufficient_role",
                    PermissionReason::Forbidden => "forbidden",
                },
            ),
            ControllerError::ScopeUnavailable => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "scope_unavailable",
            ),
            ControllerError::Transport(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "transport_failed",
            ),
            ControllerError::Validation(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "credential_invalid",
            ),
            ControllerError::Api { .. } => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "control_plane_error",
            ),
            ControllerError::Busy => (StatusCode::CONFLICT, "conflict_error", "busy"),
            ControllerError::Rejected(_) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "operation_rejected",
            ),
            ControllerError::NotSelected => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "not_selected",
            ),
            ControllerError::ConfirmationDeclined => (
                StatusCode::PRECONDITION_REQUIRED,
                "invalid_request_error",
                "confirmation_required",
            ),
            ControllerError::Store(e) => {
                tracing::error!("credential store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_admin_consent() {
        let body = r#"{"error":"invalid_grant","error_description":"AADSTS65001: The user or administrator has not consented to use the application"}"#;
        assert_eq!(
            PermissionReason::classify(body),
            PermissionReason::AdminConsentRequired
        );
    }

    #[test]
    fn test_classify_rbac() {
        let body = r#"{"error":{"code":"AuthorizationFailed","message":"The client 'x' does not have authorization to perform action 'Microsoft.Fabric/capacities/suspend/action'"}}"#;
        assert_eq!(
            PermissionReason::classify(body),
            PermissionReason::InsufficientRole
        );
    }

    #[test]
    fn test_classify_generic() {
        assert_eq!(PermissionReason::classify(""), PermissionReason::Forbidden);
        assert_eq!(
            PermissionReason::classify(r#"{"error":{"code":"Forbidden"}}"#),
            PermissionReason::Forbidden
        );
    }

    #[test]
    fn test_distinct_messages() {
        let a = ControllerError::PermissionDenied(PermissionReason::AdminConsentRequired).to_string();
        let b = ControllerError::PermissionDenied(PermissionReason::InsufficientRole).to_string();
        let c = ControllerError::PermissionDenied(PermissionReason::Forbidden).to_string();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_requires_reauth() {
        assert!(ControllerError::Authorization.requires_reauth());
        assert!(ControllerError::Validation("bad".into()).requires_reauth());
        assert!(!ControllerError::Busy.requires_reauth());
    }
}
