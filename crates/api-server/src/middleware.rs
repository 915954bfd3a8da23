//! Authentication middleware for operator routes.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use auth::Claims;

use crate::error::ErrorResponse;
use crate::state::AppState;

/// Extract and validate the operator JWT from the Authorization header.
/// On success, injects `Claims` into request extensions; the subject becomes
/// the audited actor.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request.headers().get(AUTHORIZATION) {
        Some(header) => match header.to_str() {
            Ok(s) => s,
            Err(_) => {
                return unauthorized_response("Invalid authorization header encoding");
            }
        },
        None => {
            return unauthorized_response("Missing authorization header");
        }
    };

    let token = match auth_header.strip_prefix("Bearer ") {
        Some(t) => t,
        None => {
            return unauthorized_response(
                "Invalid authorization format, expected 'Bearer <token>'",
            );
        }
    };

    let claims = match state.jwt_auth.validate_token(token) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Token validation failed");
            return unauthorized_response("Invalid or expired token");
        }
    };

    tracing::debug!(operator = %claims.sub, role = %claims.role, "Authenticated request");

    request.extensions_mut().insert(claims);

    next.run(request).await
}

/// Requires the operator role (Operator or Admin).
/// Must be applied AFTER `require_auth` middleware.
pub async fn require_operator(request: Request<Body>, next: Next) -> Response {
    let claims = match request.extensions().get::<Claims>() {
        Some(c) => c,
        None => {
            return unauthorized_response("Not authenticated");
        }
    };

    if !claims.role.can_operate() {
        return forbidden_response("Operator or Admin role required");
    }

    next.run(request).await
}

/// Requires the admin role.
/// Must be applied AFTER `require_auth` middleware.
pub async fn require_admin(request: Request<Body>, next: Next) -> Response {
    let claims = match request.extensions().get::<Claims>() {
        Some(c) => c,
        None => {
            return unauthorized_response("Not authenticated");
        }
    };

    if !claims.role.is_admin() {
        tracing::warn!(operator = %claims.sub, role = %claims.role, "Admin command refused");
        return forbidden_response("Admin role required");
    }

    next.run(request).await
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorResponse::new("UNAUTHORIZED", message);
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn forbidden_response(message: &str) -> Response {
    let body = ErrorResponse::new("FORBIDDEN", message);
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::{JwtAuth, JwtConfig, OperatorRole};

    fn create_test_jwt_auth() -> JwtAuth {
        JwtAuth::new(JwtConfig {
            secret: "test-secret-key-that-is-at-least-32-bytes".to_string(),
            expiry_hours: 1,
            issuer: "signal-gate".to_string(),
        })
    }

    #[test]
    fn test_unauthorized_response() {
        let response = unauthorized_response("Test message");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response("Test message");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_operator_token_round_trip() {
        let auth = create_test_jwt_auth();
        let token = tokio_test::assert_ok!(auth.create_token("ops-1", OperatorRole::Operator));

        let claims = tokio_test::assert_ok!(auth.validate_token(&token));
        tokio_test::assert_err!(auth.validate_token("not-a-jwt"));
        assert_eq!(claims.sub, "ops-1");
        assert!(claims.role.can_operate());
        assert!(!claims.role.is_admin());
    }
}
