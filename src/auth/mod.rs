//! OAuth 2.0 building blocks: providers, grants, wire records, request
//! construction, and credential storage.
//!
//! These pieces are pure or synchronous; the engine in [`crate::engine`]
//! composes them into flows.

pub mod clock;
pub mod crypto;
mod grant;
mod oauth;
mod pkce;
mod provider;
pub mod request;
mod state;
mod storage;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use grant::GrantType;
pub use oauth::{
    Credential, DeviceCode, ErrorResponse, PollResult, Token, DEVICE_CODE_GRANT,
    SLOW_DOWN_INCREMENT,
};
pub use pkce::{PkceChallenge, CODE_CHALLENGE_METHOD};
pub use provider::Provider;
pub use state::State;
pub use storage::{CredentialStore, FileStore, MemoryStore, SecureStore};
