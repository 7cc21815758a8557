//! Attaches stored credentials to outbound requests by URL pattern.
//!
//! A [`CredentialInjector`] is an explicit object shared through `Arc`: the
//! engine registers credentials on it, and HTTP call sites (or an
//! [`AuthorizedClient`]) consult it per request.

use regex::Regex;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::auth::{Clock, Credential, Provider, SystemClock};

struct Entry {
    provider: Provider,
    pattern: Regex,
    credential: Credential,
}

/// Lock-protected table of provider → credential, matched by regex.
pub struct CredentialInjector {
    entries: Mutex<Vec<Entry>>,
    clock: Arc<dyn Clock>,
}

impl CredentialInjector {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `credential` for `provider`, replacing any previous entry.
    ///
    /// No-op when the provider has no `authorization_pattern`, or when the
    /// pattern is not a valid regular expression.
    pub fn add_credential(&self, credential: Credential, provider: &Provider) {
        let Some(ref raw) = provider.authorization_pattern else {
            return;
        };
        let pattern = match Regex::new(raw) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(provider = %provider.id, error = %e, "invalid authorization pattern");
                return;
            }
        };

        let mut entries = self.lock();
        let entry = Entry {
            provider: provider.clone(),
            pattern,
            credential,
        };
        match entries.iter_mut().find(|e| e.provider == *provider) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        debug!(provider = %provider.id, "credential registered for injection");
    }

    /// Drop the entry for a provider.
    pub fn remove(&self, provider_id: &str) {
        self.lock().retain(|e| e.provider.id != provider_id);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of live entries, after purging expired ones.
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        self.purge(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, entries: &mut Vec<Entry>) {
        let now = self.clock.now();
        entries.retain(|e| {
            let expired = e.credential.is_expired_at(now);
            if expired {
                debug!(provider = %e.provider.id, "evicting expired credential");
            }
            !expired
        });
    }

    /// First registered provider whose pattern matches `url`.
    pub fn matching(&self, url: &str) -> Option<(Provider, Credential)> {
        let mut entries = self.lock();
        self.purge(&mut entries);
        entries
            .iter()
            .find(|e| e.pattern.is_match(url))
            .map(|e| (e.provider.clone(), e.credential.clone()))
    }

    /// `Authorization` header value for `url`, if a credential matches.
    pub fn authorization_header(&self, url: &str) -> Option<String> {
        self.matching(url)
            .map(|(_, credential)| credential.authorization_header())
    }

    /// Set the `Authorization` header on `request` when its URL matches.
    /// Returns whether a header was attached.
    pub fn inject(&self, request: &mut reqwest::Request) -> bool {
        let Some(value) = self.authorization_header(request.url().as_str()) else {
            return false;
        };
        match HeaderValue::from_str(&value) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
                true
            }
            Err(e) => {
                warn!(error = %e, "credential is not a valid header value");
                false
            }
        }
    }
}

impl Default for CredentialInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<String> = self.lock().iter().map(|e| e.provider.id.clone()).collect();
        f.debug_struct("CredentialInjector")
            .field("providers", &providers)
            .finish()
    }
}

/// `reqwest::Client` that runs every request through an injector.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    client: reqwest::Client,
    injector: Arc<CredentialInjector>,
}

impl AuthorizedClient {
    pub fn new(client: reqwest::Client, injector: Arc<CredentialInjector>) -> Self {
        Self { client, injector }
    }

    /// Start building a GET request. Call [`AuthorizedClient::execute`] with
    /// the built request.
    pub fn get(&self, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    /// Attach a matching credential and send.
    pub async fn execute(&self, mut request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.injector.inject(&mut request);
        self.client.execute(request).await
    }
}
