//! oauthkit - a provider-agnostic OAuth 2.0 client engine.
//!
//! Drives the authorization code, PKCE, device code, client credentials and
//! refresh grants against any configured [`Provider`], persists the
//! resulting credentials, refreshes them on expiry and attaches them to
//! matching outbound requests.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod injector;
pub mod scheduler;

pub use auth::{Credential, DeviceCode, GrantType, Provider, State, Token};
pub use engine::{AuthorizationRequest, BiometricGate, OAuth, Options};
pub use error::{Error, ErrorKind, Result};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use injector::{AuthorizedClient, CredentialInjector};
