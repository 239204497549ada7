use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use crate::{error::ApiError, state::AppState};

/// Authenticated caller identity, inserted as a request extension for
/// protected routes.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub origin: String,
}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthRequired)?;

    let token = value.strip_prefix("Bearer ").ok_or(ApiError::AuthInvalid)?;
    if token.is_empty() {
        return Err(ApiError::AuthInvalid);
    }

    Ok(token.to_string())
}

/// Verify the presented bearer against the caller origin's token record.
/// Verification failures are indistinguishable from a missing record.
pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let origin = crate::admission::request_origin(&request)
        .ok_or_else(|| ApiError::OriginNotAllowed("missing Origin header".to_string()))?;
    let token = bearer_token(request.headers())?;

    // scrypt is deliberately slow; keep it off the request executor.
    let tokens = state.tokens.clone();
    let check_origin = origin.clone();
    let valid = tokio::task::spawn_blocking(move || tokens.verify(&check_origin, &token))
        .await
        .map_err(ApiError::internal)?;
    if !valid {
        return Err(ApiError::AuthInvalid);
    }

    request.extensions_mut().insert(AuthContext { origin });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use crate::error::ApiError;
    use axum::http::{HeaderMap, HeaderValue, header};

    #[test]
    fn parses_a_bearer_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).expect("token"), "abc123");
    }

    #[test]
    fn missing_header_is_auth_required() {
        let headers = HeaderMap::new();
        assert!(matches!(bearer_token(&headers), Err(ApiError::AuthRequired)));
    }

    #[test]
    fn non_bearer_scheme_is_auth_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(bearer_token(&headers), Err(ApiError::AuthInvalid)));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(matches!(bearer_token(&headers), Err(ApiError::AuthInvalid)));
    }
}
