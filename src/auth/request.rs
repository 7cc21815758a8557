//! Request construction for every grant and endpoint.
//!
//! All functions here are pure: they read the provider and grant and return
//! an [`HttpRequest`] without touching the network.

use reqwest::Method;
use url::Url;

use super::grant::GrantType;
use super::oauth::{DeviceCode, Token, DEVICE_CODE_GRANT};
use super::provider::Provider;
use crate::error::{Error, Result};
use crate::http::HttpRequest;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

fn parse_url(raw: &str, field: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::MalformedUrl(format!("{} '{}': {}", field, raw, e)))
}

/// Headers shared by every request to a provider.
fn base_request(provider: &Provider, method: Method, url: Url) -> HttpRequest {
    let mut request = HttpRequest::new(method, url).with_header("Accept", "application/json");
    if let Some(ref agent) = provider.custom_user_agent {
        request = request.with_header("User-Agent", agent.as_str());
    }
    request
}

/// POST to `url`, placing parameters in a form body or the query string
/// depending on what the provider accepts.
fn post(provider: &Provider, url: Url, params: &[(&str, &str)]) -> HttpRequest {
    let mut request = base_request(provider, Method::POST, url);
    if provider.encode_body_as_form {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        request.body = Some(body);
        request.with_header("Content-Type", FORM_CONTENT_TYPE)
    } else {
        request.url.query_pairs_mut().extend_pairs(params);
        request
    }
}

/// Authorization endpoint URL for the authorization code and PKCE grants.
pub fn build_authorization_request(provider: &Provider, grant: &GrantType) -> Result<HttpRequest> {
    let (state, challenge) = match grant {
        GrantType::AuthorizationCode { state } => (state.as_str(), None),
        GrantType::Pkce { challenge } => (challenge.state.as_str(), Some(challenge)),
        other => {
            return Err(Error::MalformedUrl(format!(
                "grant '{}' has no authorization endpoint request",
                other.name()
            )))
        }
    };

    let mut url = parse_url(&provider.authorization_url, "authorizationURL")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &provider.client_id);
        if let Some(ref redirect_uri) = provider.redirect_uri {
            query.append_pair("redirect_uri", redirect_uri);
        }
        query.append_pair("response_type", "code");
        query.append_pair("state", state);
        if let Some(challenge) = challenge {
            query.append_pair("code_challenge", &challenge.code_challenge);
            query.append_pair("code_challenge_method", &challenge.code_challenge_method);
        }
        if let Some(scope) = provider.scope_string() {
            query.append_pair("scope", &scope);
        }
    }

    Ok(base_request(provider, Method::GET, url))
}

/// Exchange an authorization code for a token.
pub fn build_token_request(
    provider: &Provider,
    code: &str,
    pkce_verifier: Option<&str>,
) -> Result<HttpRequest> {
    let url = parse_url(&provider.access_token_url, "accessTokenURL")?;

    let mut params = vec![("client_id", provider.client_id.as_str())];
    if let Some(secret) = provider.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }
    params.push(("code", code));
    if let Some(redirect_uri) = provider.redirect_uri.as_deref() {
        params.push(("redirect_uri", redirect_uri));
    }
    params.push(("grant_type", "authorization_code"));
    if let Some(verifier) = pkce_verifier {
        params.push(("code_verifier", verifier));
    }

    Ok(post(provider, url, &params))
}

/// Refresh `token`. Fails when it carries no refresh token.
pub fn build_refresh_request(provider: &Provider, token: &Token) -> Result<HttpRequest> {
    let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
        Error::MalformedUrl(format!("no refresh token for provider '{}'", provider.id))
    })?;
    let url = parse_url(&provider.access_token_url, "accessTokenURL")?;

    let params = [
        ("client_id", provider.client_id.as_str()),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    Ok(post(provider, url, &params))
}

/// Start the device authorization grant. Fails without a device code URL.
pub fn build_device_authorization_request(provider: &Provider) -> Result<HttpRequest> {
    let raw = provider.device_code_url.as_deref().ok_or_else(|| {
        Error::MalformedUrl(format!("provider '{}' has no deviceCodeURL", provider.id))
    })?;
    let url = parse_url(raw, "deviceCodeURL")?;

    let scope = provider.scope_string();
    let mut params = vec![("client_id", provider.client_id.as_str())];
    if let Some(secret) = provider.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }
    if let Some(scope) = scope.as_deref() {
        params.push(("scope", scope));
    }

    Ok(post(provider, url, &params))
}

/// Poll the token endpoint with a device code.
pub fn build_device_poll_request(provider: &Provider, device_code: &DeviceCode) -> Result<HttpRequest> {
    let url = parse_url(&provider.access_token_url, "accessTokenURL")?;

    let params = [
        ("client_id", provider.client_id.as_str()),
        ("grant_type", DEVICE_CODE_GRANT),
        ("device_code", device_code.device_code.as_str()),
    ];

    Ok(post(provider, url, &params))
}

/// Client credentials grant.
pub fn build_client_credentials_request(provider: &Provider) -> Result<HttpRequest> {
    let url = parse_url(&provider.access_token_url, "accessTokenURL")?;

    let scope = provider.scope_string();
    let mut params = vec![("client_id", provider.client_id.as_str())];
    if let Some(secret) = provider.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }
    params.push(("grant_type", "client_credentials"));
    if let Some(scope) = scope.as_deref() {
        params.push(("scope", scope));
    }

    Ok(post(provider, url, &params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce::PkceChallenge;
    use chrono::Utc;

    fn github() -> Provider {
        Provider::new(
            "GH",
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            "CID",
        )
        .with_redirect_uri("app://cb")
    }

    fn param(request: &HttpRequest, key: &str) -> Option<String> {
        request.params().get(key).cloned()
    }

    #[test]
    fn test_authorization_code_url() {
        let grant = GrantType::AuthorizationCode {
            state: "STATE1".to_string(),
        };
        let request = build_authorization_request(&github(), &grant).unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.host_str(), Some("github.com"));
        assert_eq!(request.url.path(), "/login/oauth/authorize");

        let query = request.query();
        assert_eq!(query.get("client_id").map(String::as_str), Some("CID"));
        assert_eq!(query.get("redirect_uri").map(String::as_str), Some("app://cb"));
        assert_eq!(query.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(query.get("state").map(String::as_str), Some("STATE1"));
        assert!(!query.contains_key("code_challenge"));
        assert!(!query.contains_key("scope"));
    }

    #[test]
    fn test_pkce_url_carries_challenge() {
        let challenge = PkceChallenge::new();
        let grant = GrantType::Pkce {
            challenge: challenge.clone(),
        };
        let provider = github().with_scope(["repo", "read:user"]);
        let request = build_authorization_request(&provider, &grant).unwrap();

        let query = request.query();
        assert_eq!(query.get("code_challenge"), Some(&challenge.code_challenge));
        assert_eq!(
            query.get("code_challenge_method").map(String::as_str),
            Some("S256")
        );
        assert_eq!(query.get("state"), Some(&challenge.state));
        assert_eq!(query.get("scope").map(String::as_str), Some("repo read:user"));
    }

    #[test]
    fn test_authorization_request_rejects_other_grants() {
        let err = build_authorization_request(&github(), &GrantType::DeviceCode).unwrap_err();
        assert!(matches!(err, Error::MalformedUrl(_)));
    }

    #[test]
    fn test_authorization_request_malformed_url() {
        let mut provider = github();
        provider.authorization_url = "not a url".to_string();
        let err = build_authorization_request(&provider, &GrantType::authorization_code())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedUrl(_)));
    }

    #[test]
    fn test_token_request_in_query_by_default() {
        let provider = github().with_client_secret("SECRET");
        let request = build_token_request(&provider, "CODE", None).unwrap();

        assert_eq!(request.method, Method::POST);
        assert!(request.body.is_none());
        let query = request.query();
        assert_eq!(query.get("client_id").map(String::as_str), Some("CID"));
        assert_eq!(query.get("client_secret").map(String::as_str), Some("SECRET"));
        assert_eq!(query.get("code").map(String::as_str), Some("CODE"));
        assert_eq!(query.get("redirect_uri").map(String::as_str), Some("app://cb"));
        assert_eq!(
            query.get("grant_type").map(String::as_str),
            Some("authorization_code")
        );
        assert!(!query.contains_key("code_verifier"));
    }

    #[test]
    fn test_token_request_as_form_body() {
        let provider = github().with_form_body(true);
        let request = build_token_request(&provider, "CODE", Some("VERIFIER")).unwrap();

        assert!(request.query().is_empty());
        assert_eq!(
            request.header("Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
        let form = request.form();
        assert_eq!(form.get("code").map(String::as_str), Some("CODE"));
        assert_eq!(form.get("code_verifier").map(String::as_str), Some("VERIFIER"));
        assert!(!form.contains_key("client_secret"));
    }

    #[test]
    fn test_refresh_request() {
        let mut token = Token::bearer("access");
        assert!(build_refresh_request(&github(), &token).is_err());

        token.refresh_token = Some("REFRESH".to_string());
        let request = build_refresh_request(&github(), &token).unwrap();
        assert_eq!(param(&request, "grant_type").as_deref(), Some("refresh_token"));
        assert_eq!(param(&request, "refresh_token").as_deref(), Some("REFRESH"));
        assert_eq!(param(&request, "client_id").as_deref(), Some("CID"));
    }

    #[test]
    fn test_device_authorization_request() {
        assert!(build_device_authorization_request(&github()).is_err());

        let provider = github()
            .with_device_code_url("https://github.com/login/device/code")
            .with_scope(["read:user"]);
        let request = build_device_authorization_request(&provider).unwrap();
        assert_eq!(request.url.path(), "/login/device/code");
        assert_eq!(param(&request, "client_id").as_deref(), Some("CID"));
        assert_eq!(param(&request, "scope").as_deref(), Some("read:user"));
        assert!(param(&request, "client_secret").is_none());
    }

    #[test]
    fn test_device_poll_request() {
        let code = DeviceCode {
            device_code: "DEV".to_string(),
            user_code: "ABCD-1234".to_string(),
            verification_uri: "https://github.com/login/device".to_string(),
            verification_uri_complete: None,
            expires_in: Some(900),
            interval: 5,
            issued_at: Utc::now(),
        };
        let request = build_device_poll_request(&github(), &code).unwrap();
        assert_eq!(request.url.path(), "/login/oauth/access_token");
        assert_eq!(
            param(&request, "grant_type").as_deref(),
            Some("urn:ietf:params:oauth:grant-type:device_code")
        );
        assert_eq!(param(&request, "device_code").as_deref(), Some("DEV"));
    }

    #[test]
    fn test_client_credentials_request() {
        let provider = github().with_client_secret("SECRET").with_scope(["a", "b"]);
        let request = build_client_credentials_request(&provider).unwrap();
        assert_eq!(
            param(&request, "grant_type").as_deref(),
            Some("client_credentials")
        );
        assert_eq!(param(&request, "client_secret").as_deref(), Some("SECRET"));
        assert_eq!(param(&request, "scope").as_deref(), Some("a b"));
    }

    #[test]
    fn test_custom_user_agent_header() {
        let provider = github().with_user_agent("oauthkit/1.0");
        let request = build_token_request(&provider, "c", None).unwrap();
        assert_eq!(request.header("User-Agent"), Some("oauthkit/1.0"));
        assert_eq!(request.header("Accept"), Some("application/json"));
    }
}
