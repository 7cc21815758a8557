use serde::{Deserialize, Serialize};

use super::crypto;
use super::pkce::PkceChallenge;

/// OAuth 2.0 grant used to obtain a token.
///
/// Browser-based grants carry the secret needed to validate their callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantType {
    /// Authorization code grant with its CSRF `state`.
    AuthorizationCode { state: String },
    /// Authorization code grant hardened with PKCE.
    Pkce { challenge: PkceChallenge },
    /// Device authorization grant (RFC 8628).
    DeviceCode,
    ClientCredentials,
    RefreshToken,
}

impl GrantType {
    /// Authorization code grant with a fresh CSRF state.
    pub fn authorization_code() -> Self {
        Self::AuthorizationCode {
            state: crypto::random_string(32),
        }
    }

    /// PKCE grant with a fresh challenge.
    pub fn pkce() -> Self {
        Self::Pkce {
            challenge: PkceChallenge::new(),
        }
    }

    /// The `state` value a callback must echo, for browser-based grants.
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::AuthorizationCode { state } => Some(state),
            Self::Pkce { challenge } => Some(&challenge.state),
            Self::DeviceCode | Self::ClientCredentials | Self::RefreshToken => None,
        }
    }

    /// The PKCE verifier to send with the token exchange, if any.
    pub fn code_verifier(&self) -> Option<&str> {
        match self {
            Self::Pkce { challenge } => Some(&challenge.code_verifier),
            _ => None,
        }
    }

    /// Whether this grant completes through a browser redirect.
    pub fn requires_browser(&self) -> bool {
        matches!(self, Self::AuthorizationCode { .. } | Self::Pkce { .. })
    }

    /// Short name used in logs and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::Pkce { .. } => "pkce",
            Self::DeviceCode => "device_code",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_states_are_not_reused() {
        let a = GrantType::authorization_code();
        let b = GrantType::authorization_code();
        assert_ne!(a.state(), b.state());

        let p = GrantType::pkce();
        let q = GrantType::pkce();
        assert_ne!(p.state(), q.state());
    }

    #[test]
    fn test_state_and_verifier_accessors() {
        let code = GrantType::AuthorizationCode {
            state: "STATE1".to_string(),
        };
        assert_eq!(code.state(), Some("STATE1"));
        assert!(code.code_verifier().is_none());

        let pkce = GrantType::pkce();
        assert!(pkce.code_verifier().is_some());
        assert!(pkce.requires_browser());

        assert!(GrantType::DeviceCode.state().is_none());
        assert!(!GrantType::ClientCredentials.requires_browser());
    }

    #[test]
    fn test_grant_names() {
        assert_eq!(GrantType::DeviceCode.name(), "device_code");
        assert_eq!(GrantType::pkce().name(), "pkce");
    }
}
