//! Credential check for the mutating and read endpoints.
//!
//! Token issuance and verification live outside this service; handlers only
//! see the `Authenticator` seam. The bundled implementation compares a static
//! bearer token, which is enough for a single trusted caller.

use axum::http::{header, HeaderMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Unauthorized: Missing token")]
    MissingToken,
    #[error("Unauthorized: Invalid token")]
    InvalidToken,
    #[error("Unauthorized: Authentication is not configured")]
    NotConfigured,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Clone)]
pub struct StaticTokenAuthenticator {
    token: Option<String>,
    subject: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            subject: "api-token".to_string(),
        }
    }

    /// Rejects every request.
    pub fn disabled() -> Self {
        Self {
            token: None,
            subject: String::new(),
        }
    }

    pub fn from_env() -> Self {
        match std::env::var("CRS_API_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Self::new(token.trim()),
            _ => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let expected = self.token.as_deref().ok_or(AuthError::NotConfigured)?;
        let presented = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        if presented.len() != expected.len()
            || presented
                .bytes()
                .zip(expected.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                != 0
        {
            return Err(AuthError::InvalidToken);
        }
        Ok(Principal {
            subject: self.subject.clone(),
        })
    }
}
