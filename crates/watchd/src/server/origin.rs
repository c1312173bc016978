//! Origin check for WebSocket upgrades.

use axum::http::header::{HOST, ORIGIN};
use axum::http::HeaderMap;
use thiserror::Error;

/// Decides which browser origins may open a connection.
///
/// With no allowed origins configured, only same-origin requests pass: the
/// `Origin` host must equal the `Host` header. Requests without an `Origin`
/// header (non-browser clients) always pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|origin| origin.into().trim_end_matches('/').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Checks the request headers against the policy.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), OriginError> {
        let Some(origin) = headers.get(ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| OriginError::InvalidHeader)?
            .trim_end_matches('/')
            .to_ascii_lowercase();

        if self.allowed.is_empty() {
            let host = headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_ascii_lowercase);
            return match (origin_authority(&origin), host) {
                (Some(authority), Some(host)) if authority == host => Ok(()),
                _ => Err(OriginError::Rejected(origin)),
            };
        }

        if self
            .allowed
            .iter()
            .any(|allowed| allowed == "*" || *allowed == origin)
        {
            Ok(())
        } else {
            Err(OriginError::Rejected(origin))
        }
    }
}

/// `scheme://authority[/...]` → `authority`
fn origin_authority(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    let authority = rest.split('/').next()?;
    (!authority.is_empty()).then_some(authority)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("Origin not allowed: {0}")]
    Rejected(String),

    #[error("Origin header is not valid ASCII")]
    InvalidHeader,
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    fn headers(origin: Option<&str>, host: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            headers.insert(ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        if let Some(host) = host {
            headers.insert(HOST, HeaderValue::from_str(host).unwrap());
        }
        headers
    }

    #[test]
    fn test_missing_origin_allowed() {
        let policy = OriginPolicy::default();
        assert!(policy.check(&headers(None, Some("localhost:8080"))).is_ok());
    }

    #[test]
    fn test_same_origin() {
        let policy = OriginPolicy::default();
        assert!(policy
            .check(&headers(Some("http://LOCALHOST:8080"), Some("localhost:8080")))
            .is_ok());
        assert_eq!(
            policy.check(&headers(Some("http://evil.test"), Some("localhost:8080"))),
            Err(OriginError::Rejected("http://evil.test".to_string()))
        );
        assert!(policy.check(&headers(Some("null"), Some("localhost"))).is_err());
    }

    #[test]
    fn test_allow_list() {
        let policy = OriginPolicy::new(["https://app.example.com/"]);
        assert!(policy
            .check(&headers(Some("https://app.example.com"), Some("api.example.com")))
            .is_ok());
        assert!(policy
            .check(&headers(Some("https://other.example.com"), None))
            .is_err());
    }

    #[test]
    fn test_wildcard() {
        let policy = OriginPolicy::new(["*"]);
        assert!(policy.check(&headers(Some("https://any.test"), None)).is_ok());
    }

    #[test]
    fn test_origin_authority() {
        assert_eq!(origin_authority("https://a.test:1/x"), Some("a.test:1"));
        assert_eq!(origin_authority("null"), None);
    }
}
