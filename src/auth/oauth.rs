//! OAuth 2.0 wire records and the credential built from them.
//!
//! Covers token responses (RFC 6749 §5.1), error responses (§5.2), and the
//! device authorization grant (RFC 8628).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::HttpResponse;

/// Grant type string for device code polling.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Extra seconds added to the poll interval on `slow_down` (RFC 8628 §3.5).
pub const SLOW_DOWN_INCREMENT: u64 = 5;

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds. Absent means the token does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// OpenID Connect ID token, carried opaquely.
    #[serde(rename = "id_token", default, skip_serializing_if = "Option::is_none")]
    pub open_id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// Create a bearer token with no refresh token or expiry.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
            scope: None,
            token_type: default_token_type(),
            open_id_token: None,
        }
    }

    /// Value for the `Authorization` header: `{type} {access_token}`.
    ///
    /// Servers are inconsistent about the casing of `bearer`; it is always
    /// rendered as `Bearer`.
    pub fn authorization_header(&self) -> String {
        let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{} {}", scheme, self.access_token)
    }

    /// Decode a token endpoint response.
    ///
    /// Error bodies are reported as [`Error::BadResponse`] even when the
    /// server answers with a 200 status, as GitHub does.
    pub fn decode(response: &HttpResponse) -> Result<Self> {
        if let Some(err) = ErrorResponse::decode(&response.body) {
            return Err(err.into_error(response.status));
        }
        if !response.is_success() {
            return Err(Error::BadResponse(format!(
                "token request failed ({}): {}",
                response.status,
                response.text()
            )));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| Error::Decoding(format!("invalid token response: {}", e)))
    }
}

/// A token issued to one provider, stamped with its issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Id of the issuing provider.
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub token: Token,
}

impl Credential {
    pub fn new(issuer: impl Into<String>, issued_at: DateTime<Utc>, token: Token) -> Self {
        Self {
            issuer: issuer.into(),
            issued_at,
            token,
        }
    }

    /// `issued_at + expires_in`, or `None` for tokens that never expire.
    /// Lifetimes past the representable date range count as never.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.token
            .expires_in
            .and_then(|secs| expires_after(self.issued_at, secs))
    }

    /// Check expiry against a given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration().map(|exp| now > exp).unwrap_or(false)
    }

    /// Check expiry against the system clock.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.token.refresh_token.as_deref()
    }

    pub fn authorization_header(&self) -> String {
        self.token.authorization_header()
    }
}

/// Device authorization response, stamped with its issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    /// Code the user enters at the verification URI.
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    /// Verification URI with the user code embedded (not all servers send it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Lifetime in seconds of the device and user codes.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Minimum polling interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

fn default_interval() -> u64 {
    5
}

impl DeviceCode {
    /// Decode a device authorization response issued at `issued_at`.
    pub fn decode(response: &HttpResponse, issued_at: DateTime<Utc>) -> Result<Self> {
        if let Some(err) = ErrorResponse::decode(&response.body) {
            return Err(err.into_error(response.status));
        }
        if !response.is_success() {
            return Err(Error::BadResponse(format!(
                "device code request failed ({}): {}",
                response.status,
                response.text()
            )));
        }
        let mut code: Self = serde_json::from_slice(&response.body)
            .map_err(|e| Error::Decoding(format!("invalid device code response: {}", e)))?;
        code.issued_at = issued_at;
        Ok(code)
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .and_then(|secs| expires_after(self.issued_at, secs))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration().map(|exp| now > exp).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Poll interval as a std duration, never below one second.
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval.max(1))
    }
}

/// `issued_at + secs`, or `None` when the sum overflows.
fn expires_after(issued_at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
}

/// Error body returned by token and device endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// Parse an error body, if `body` is one.
    pub fn decode(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// Description when present, otherwise the error code.
    pub fn message(&self) -> &str {
        self.error_description.as_deref().unwrap_or(&self.error)
    }

    fn into_error(self, status: u16) -> Error {
        if self.error == "access_denied" {
            Error::AccessDenied(self.message().to_string())
        } else {
            Error::BadResponse(format!("{} ({}): {}", self.error, status, self.message()))
        }
    }
}

/// Outcome of one device code poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// Token received.
    Success(Token),
    /// The user has not completed authorization yet.
    Pending,
    /// The server asked for a longer interval.
    SlowDown,
    /// The device code expired on the server.
    Expired,
    /// The user denied the authorization.
    AccessDenied(String),
    /// Transport failure, unexpected status, or an unreadable body.
    /// Polling continues at the current interval.
    Retry(String),
}

impl PollResult {
    /// Classify a poll response per RFC 8628 §3.5.
    pub fn classify(response: &HttpResponse) -> Self {
        if response.is_success() {
            if let Ok(token) = serde_json::from_slice::<Token>(&response.body) {
                return Self::Success(token);
            }
        }

        match ErrorResponse::decode(&response.body) {
            Some(err) => match err.error.as_str() {
                "authorization_pending" => Self::Pending,
                "slow_down" => Self::SlowDown,
                "expired_token" => Self::Expired,
                "access_denied" => Self::AccessDenied(err.message().to_string()),
                _ => Self::Retry(format!("{}: {}", err.error, err.message())),
            },
            None => Self::Retry(format!(
                "unexpected poll response ({}): {}",
                response.status,
                response.text()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(status, body)
    }

    #[test]
    fn test_token_deserialization() {
        let json = r#"{
            "access_token": "gho_xxxx",
            "token_type": "bearer",
            "scope": "read:user"
        }"#;

        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "gho_xxxx");
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.scope, Some("read:user".to_string()));
        assert!(token.refresh_token.is_none());
        assert!(token.expires_in.is_none());
    }

    #[test]
    fn test_token_type_defaults_to_bearer() {
        let token: Token = serde_json::from_str(r#"{"access_token": "abc"}"#).unwrap();
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn test_authorization_header_normalises_bearer() {
        let mut token = Token::bearer("abc");
        token.token_type = "bearer".to_string();
        assert_eq!(token.authorization_header(), "Bearer abc");

        token.token_type = "MAC".to_string();
        assert_eq!(token.authorization_header(), "MAC abc");
    }

    #[test]
    fn test_id_token_wire_name() {
        let token: Token =
            serde_json::from_str(r#"{"access_token": "a", "id_token": "eyJ..."}"#).unwrap();
        assert_eq!(token.open_id_token.as_deref(), Some("eyJ..."));
    }

    #[test]
    fn test_credential_expiration() {
        let issued = Utc::now();
        let mut token = Token::bearer("t");
        token.expires_in = Some(3600);
        let cred = Credential::new("p", issued, token);

        assert_eq!(cred.expiration(), Some(issued + Duration::hours(1)));
        assert!(!cred.is_expired_at(issued));
        assert!(!cred.is_expired_at(issued + Duration::seconds(3600)));
        assert!(cred.is_expired_at(issued + Duration::seconds(3601)));
    }

    #[test]
    fn test_credential_without_expiry_never_expires() {
        let cred = Credential::new("p", Utc::now(), Token::bearer("t"));
        assert!(cred.expiration().is_none());
        assert!(!cred.is_expired_at(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn test_huge_expires_in_never_expires() {
        let resp = response(
            200,
            r#"{"access_token":"a","token_type":"Bearer","expires_in":18446744073709551615}"#,
        );
        let token = Token::decode(&resp).unwrap();
        assert_eq!(token.expires_in, Some(u64::MAX));

        let issued = Utc::now();
        let cred = Credential::new("p", issued, token.clone());
        assert!(cred.expiration().is_none());
        assert!(!cred.is_expired_at(issued + Duration::days(3650)));

        // Fits in i64 but not in a chrono duration.
        let mut token = token;
        token.expires_in = Some(100_000_000_000_000_000);
        let cred = Credential::new("p", issued, token);
        assert!(cred.expiration().is_none());
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_decode_token_success() {
        let resp = response(
            200,
            r#"{"access_token":"a","refresh_token":"r","expires_in":60,"token_type":"Bearer"}"#,
        );
        let token = Token::decode(&resp).unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("r"));
        assert_eq!(token.expires_in, Some(60));
    }

    #[test]
    fn test_decode_token_error_body_with_ok_status() {
        let resp = response(
            200,
            r#"{"error":"bad_verification_code","error_description":"The code passed is incorrect or expired."}"#,
        );
        let err = Token::decode(&resp).unwrap_err();
        assert!(matches!(err, Error::BadResponse(msg) if msg.contains("bad_verification_code")));
    }

    #[test]
    fn test_decode_token_bad_status() {
        let err = Token::decode(&response(500, "oops")).unwrap_err();
        assert!(matches!(err, Error::BadResponse(_)));
    }

    #[test]
    fn test_decode_token_garbage() {
        let err = Token::decode(&response(200, r#"{"nope": true}"#)).unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
    }

    #[test]
    fn test_device_code_deserialization() {
        let issued = Utc::now();
        let resp = response(
            200,
            r#"{
                "device_code": "device123",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5
            }"#,
        );

        let code = DeviceCode::decode(&resp, issued).unwrap();
        assert_eq!(code.device_code, "device123");
        assert_eq!(code.user_code, "ABCD-1234");
        assert_eq!(code.expires_in, Some(900));
        assert_eq!(code.issued_at, issued);
        assert!(!code.is_expired_at(issued));
        assert!(code.is_expired_at(issued + Duration::seconds(901)));
    }

    #[test]
    fn test_device_code_defaults_and_alias() {
        let resp = response(
            200,
            r#"{
                "device_code": "test",
                "user_code": "TEST",
                "verification_url": "https://www.google.com/device"
            }"#,
        );

        let code = DeviceCode::decode(&resp, Utc::now()).unwrap();
        assert_eq!(code.interval, 5);
        assert_eq!(code.verification_uri, "https://www.google.com/device");
        assert!(code.expires_in.is_none());
        assert!(!code.is_expired());
    }

    #[test]
    fn test_device_code_huge_lifetime_and_zero_interval() {
        let issued = Utc::now();
        let resp = response(
            200,
            r#"{
                "device_code": "d",
                "user_code": "U",
                "verification_uri": "https://example.com/device",
                "expires_in": 18446744073709551615,
                "interval": 0
            }"#,
        );

        let code = DeviceCode::decode(&resp, issued).unwrap();
        assert!(code.expiration().is_none());
        assert!(!code.is_expired_at(issued + Duration::days(365)));
        assert_eq!(code.interval, 0);
        assert_eq!(code.poll_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_poll_classification() {
        assert_eq!(
            PollResult::classify(&response(400, r#"{"error":"authorization_pending"}"#)),
            PollResult::Pending
        );
        assert_eq!(
            PollResult::classify(&response(200, r#"{"error":"slow_down"}"#)),
            PollResult::SlowDown
        );
        assert_eq!(
            PollResult::classify(&response(400, r#"{"error":"expired_token"}"#)),
            PollResult::Expired
        );
        assert!(matches!(
            PollResult::classify(&response(400, r#"{"error":"access_denied"}"#)),
            PollResult::AccessDenied(_)
        ));
        assert!(matches!(
            PollResult::classify(&response(502, "<html>bad gateway</html>")),
            PollResult::Retry(_)
        ));
        assert!(matches!(
            PollResult::classify(&response(200, r#"{"access_token":"tok"}"#)),
            PollResult::Success(t) if t.access_token == "tok"
        ));
    }
}
