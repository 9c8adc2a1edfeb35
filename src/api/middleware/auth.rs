//! Authentication middleware
//!
//! A single shared token guards every /api route. The token arrives either
//! as `Authorization: Bearer <token>` or as a `?token=` query parameter —
//! the browser `EventSource` API cannot set headers, so the SSE endpoint
//! relies on the query form.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::api::AppState;
use crate::error::AppError;

/// Require the configured token on every request; a missing password
/// setting disables authentication entirely.
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(password) = &state.settings.auth.password else {
        return Ok(next.run(request).await);
    };

    let header_token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = header_token.or_else(|| query_token(request.uri().query()));

    match token {
        Some(token) if constant_time_compare(&token, password) => Ok(next.run(request).await),
        _ => Err(AppError::Unauthorized(
            "missing or invalid token".to_string(),
        )),
    }
}

fn query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(!constant_time_compare("secret", "secre7"));
        assert!(!constant_time_compare("secret", "secrets"));
        assert!(!constant_time_compare("", "secret"));
    }

    #[test]
    fn test_query_token_extraction() {
        assert_eq!(
            query_token(Some("token=abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(
            query_token(Some("foo=bar&token=abc123")),
            Some("abc123".to_string())
        );
        // Percent-encoded values are decoded
        assert_eq!(
            query_token(Some("token=a%20b")),
            Some("a b".to_string())
        );
        assert_eq!(query_token(Some("foo=bar")), None);
        assert_eq!(query_token(None), None);
    }
}
