use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Client-facing bearer check. With no key configured every caller is let in.
#[derive(Clone, Debug, Default)]
pub struct AuthState {
    api_key: Option<String>,
}

impl AuthState {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> AppResult<()> {
        let Some(expected) = self.api_key.as_deref() else {
            return Ok(());
        };
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(AppError::unauthorized)?;
        if token == expected {
            Ok(())
        } else {
            Err(AppError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn disabled_auth_accepts_anything() {
        let auth = AuthState::new(None);
        assert!(!auth.enabled());
        assert!(auth.authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn bearer_token_must_match() {
        let auth = AuthState::new(Some("sk-test".to_string()));
        assert!(auth.authenticate(&headers("Bearer sk-test")).is_ok());
        let err = auth.authenticate(&headers("Bearer nope")).expect_err("rejected");
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
        assert!(auth.authenticate(&headers("sk-test")).is_err());
        assert!(auth.authenticate(&HeaderMap::new()).is_err());
    }
}
