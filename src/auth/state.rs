use super::grant::GrantType;
use super::oauth::{Credential, DeviceCode};
use super::provider::Provider;
use crate::error::Error;

/// The engine's published authorization state.
///
/// Exactly one value exists per engine; observers always see a complete
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    /// No authorization in progress and none restored.
    #[default]
    Empty,
    /// Waiting for the browser collaborator to deliver a redirect callback.
    Authorizing(Provider, GrantType),
    /// Exchanging a code (or client credentials) for a token.
    RequestingAccessToken(Provider),
    RequestingDeviceCode(Provider),
    /// Device code issued; polling until the user completes authorization.
    ReceivedDeviceCode(Provider, DeviceCode),
    Authorized(Provider, Credential),
    /// The last operation for this provider failed.
    Error(Provider, Error),
}

impl State {
    /// The provider this state refers to, if any.
    pub fn provider(&self) -> Option<&Provider> {
        match self {
            Self::Empty => None,
            Self::Authorizing(p, _)
            | Self::RequestingAccessToken(p)
            | Self::RequestingDeviceCode(p)
            | Self::ReceivedDeviceCode(p, _)
            | Self::Authorized(p, _)
            | Self::Error(p, _) => Some(p),
        }
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized(..))
    }

    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Self::Authorized(_, credential) => Some(credential),
            _ => None,
        }
    }

    /// Short label for logs and the CLI.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Authorizing(..) => "authorizing",
            Self::RequestingAccessToken(_) => "requesting_access_token",
            Self::RequestingDeviceCode(_) => "requesting_device_code",
            Self::ReceivedDeviceCode(..) => "received_device_code",
            Self::Authorized(..) => "authorized",
            Self::Error(..) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::Token;
    use chrono::Utc;

    fn provider() -> Provider {
        Provider::new("p", "https://a.example", "https://t.example", "c")
    }

    #[test]
    fn test_default_is_empty() {
        assert_eq!(State::default(), State::Empty);
        assert!(State::Empty.provider().is_none());
    }

    #[test]
    fn test_provider_accessor() {
        let state = State::RequestingDeviceCode(provider());
        assert_eq!(state.provider().map(|p| p.id.as_str()), Some("p"));
        assert!(!state.is_authorized());
    }

    #[test]
    fn test_credential_accessor() {
        let cred = Credential::new("p", Utc::now(), Token::bearer("t"));
        let state = State::Authorized(provider(), cred.clone());
        assert!(state.is_authorized());
        assert_eq!(state.credential(), Some(&cred));
        assert_eq!(state.label(), "authorized");
    }
}
