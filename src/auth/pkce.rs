//! PKCE (Proof Key for Code Exchange, RFC 7636) challenge generation.
//!
//! A fresh challenge is generated for every authorization attempt and is
//! consumed by the first callback that presents its `state`.

use serde::{Deserialize, Serialize};

use super::crypto;

/// The only challenge method this crate emits.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair plus the CSRF state sent alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// Code verifier, a cryptographically random string (43-128 characters).
    pub code_verifier: String,
    /// Code challenge, base64url(sha256(code_verifier)).
    pub code_challenge: String,
    /// Always `S256`.
    pub code_challenge_method: String,
    /// CSRF state, generated independently of the verifier.
    pub state: String,
}

impl PkceChallenge {
    /// Generate a new challenge.
    ///
    /// The verifier is 64 random bytes, base64url encoded (86 characters).
    /// The state is 32 independent random bytes (43 characters).
    pub fn new() -> Self {
        let code_verifier = crypto::random_string(64);
        let code_challenge = Self::compute_challenge(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
            code_challenge_method: CODE_CHALLENGE_METHOD.to_string(),
            state: crypto::random_string(32),
        }
    }

    /// Compute the S256 challenge for a verifier.
    pub fn compute_challenge(verifier: &str) -> String {
        crypto::base64url(&crypto::sha256(verifier.as_bytes()))
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}
