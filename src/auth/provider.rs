//! Authorization server configuration.
//!
//! Providers are loaded once (from a JSON descriptor or built in code) and
//! never mutated. Two providers are the same provider when their ids match.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// One authorization server and the client identity registered with it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Provider {
    /// Unique identifier, also the credential storage key.
    pub id: String,
    #[serde(rename = "authorizationURL", alias = "authorization_url")]
    pub authorization_url: String,
    #[serde(rename = "accessTokenURL", alias = "access_token_url")]
    pub access_token_url: String,
    /// Device authorization endpoint (RFC 8628), if the server supports it.
    #[serde(
        rename = "deviceCodeURL",
        alias = "device_code_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_code_url: Option<String>,
    #[serde(rename = "clientID", alias = "client_id")]
    pub client_id: String,
    #[serde(
        rename = "clientSecret",
        alias = "client_secret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<String>,
    #[serde(
        rename = "redirectURI",
        alias = "redirect_uri",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub redirect_uri: Option<String>,
    /// Requested scopes, sent space-joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
    /// Regular expression selecting outbound URLs that receive this
    /// provider's credential.
    #[serde(
        rename = "authorizationPattern",
        alias = "authorization_pattern",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub authorization_pattern: Option<String>,
    /// Send token endpoint parameters as a form body instead of a query string.
    #[serde(rename = "encodeBodyAsForm", alias = "encode_body_as_form", default)]
    pub encode_body_as_form: bool,
    #[serde(
        rename = "customUserAgent",
        alias = "custom_user_agent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_user_agent: Option<String>,
    /// Trace requests and responses for this provider.
    #[serde(default)]
    pub debug: bool,
}

impl Provider {
    /// Create a provider with the required endpoints and client id.
    pub fn new(
        id: impl Into<String>,
        authorization_url: impl Into<String>,
        access_token_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            authorization_url: authorization_url.into(),
            access_token_url: access_token_url.into(),
            device_code_url: None,
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            scope: None,
            authorization_pattern: None,
            encode_body_as_form: false,
            custom_user_agent: None,
            debug: false,
        }
    }

    pub fn with_device_code_url(mut self, url: impl Into<String>) -> Self {
        self.device_code_url = Some(url.into());
        self
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(scope.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_authorization_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.authorization_pattern = Some(pattern.into());
        self
    }

    pub fn with_form_body(mut self, encode_body_as_form: bool) -> Self {
        self.encode_body_as_form = encode_body_as_form;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.custom_user_agent = Some(user_agent.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Scopes joined with spaces, or `None` when no scope is configured.
    pub fn scope_string(&self) -> Option<String> {
        self.scope
            .as_ref()
            .filter(|scopes| !scopes.is_empty())
            .map(|scopes| scopes.join(" "))
    }

    /// Parse a JSON descriptor holding an array of providers.
    pub fn from_json(json: &str) -> Result<Vec<Self>> {
        serde_json::from_str(json).context("Failed to parse provider descriptor")
    }

    /// Load a JSON provider descriptor from disk.
    pub fn load_descriptor(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read provider descriptor: {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid provider descriptor: {}", path.display()))
    }
}

impl PartialEq for Provider {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Provider {}

impl Hash for Provider {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("authorization_url", &self.authorization_url)
            .field("access_token_url", &self.access_token_url)
            .field("device_code_url", &self.device_code_url)
            .field("client_id", &self.client_id)
            .field("client_secret_set", &self.client_secret.is_some())
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("authorization_pattern", &self.authorization_pattern)
            .field("encode_body_as_form", &self.encode_body_as_form)
            .finish()
    }
}
