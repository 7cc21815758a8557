//! The authorization state machine.
//!
//! [`OAuth`] owns the published [`State`] and drives every grant: it builds
//! requests, sends them through the configured [`HttpClient`], persists the
//! resulting [`Credential`], keeps the [`CredentialInjector`] in sync, and
//! schedules refresh and device-code polling.
//!
//! Every state publication and every store/scheduler mutation happens under
//! one async writer lock. Network calls run outside it. Operations capture a
//! ticket when they start: the engine epoch, bumped by `clear()`, and the
//! provider's generation, bumped by `authorize()` and `remove()`. A
//! completion whose ticket is outdated is dropped instead of resurrecting
//! state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::request;
use crate::auth::{
    Clock, Credential, CredentialStore, DeviceCode, GrantType, MemoryStore, PollResult, Provider,
    SecureStore, State, SystemClock, Token, SLOW_DOWN_INCREMENT,
};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
use crate::injector::CredentialInjector;
use crate::scheduler::{Scheduler, TaskKey};

/// Application tag used when none is configured.
pub const DEFAULT_APPLICATION_TAG: &str = "oauthkit";

/// Optional user-presence check consulted before restoring credentials.
#[async_trait]
pub trait BiometricGate: Send + Sync {
    /// Returns `true` when the user passed the check.
    async fn evaluate(&self) -> bool;
}

/// Construction-time options for [`OAuth`].
#[derive(Clone)]
pub struct Options {
    /// Refresh credentials automatically when they expire.
    pub auto_refresh: bool,
    /// Namespace for stored credentials.
    pub application_tag: String,
    /// Ask the browser collaborator for a non-persistent session.
    pub ephemeral_browsing: bool,
    /// Only restore credentials after the biometric gate passes.
    pub require_biometric_gate: bool,
    http_client: Option<Arc<dyn HttpClient>>,
    store: Option<Arc<dyn SecureStore>>,
    biometric_gate: Option<Arc<dyn BiometricGate>>,
    clock: Option<Arc<dyn Clock>>,
    injector: Option<Arc<CredentialInjector>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            application_tag: DEFAULT_APPLICATION_TAG.to_string(),
            ephemeral_browsing: false,
            require_biometric_gate: false,
            http_client: None,
            store: None,
            biometric_gate: None,
            clock: None,
            injector: None,
        }
    }
}

impl Options {
    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn with_application_tag(mut self, tag: impl Into<String>) -> Self {
        self.application_tag = tag.into();
        self
    }

    pub fn with_ephemeral_browsing(mut self, ephemeral: bool) -> Self {
        self.ephemeral_browsing = ephemeral;
        self
    }

    /// Use a custom HTTP client instead of the default `reqwest` one.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Persist credentials in `store` instead of process memory.
    pub fn with_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Install a biometric gate and require it at restore.
    pub fn with_biometric_gate(mut self, gate: Arc<dyn BiometricGate>) -> Self {
        self.biometric_gate = Some(gate);
        self.require_biometric_gate = true;
        self
    }

    pub fn with_biometric_requirement(mut self, required: bool) -> Self {
        self.require_biometric_gate = required;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share an injector with other parts of the application.
    pub fn with_injector(mut self, injector: Arc<CredentialInjector>) -> Self {
        self.injector = Some(injector);
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("auto_refresh", &self.auto_refresh)
            .field("application_tag", &self.application_tag)
            .field("ephemeral_browsing", &self.ephemeral_browsing)
            .field("require_biometric_gate", &self.require_biometric_gate)
            .field("custom_http_client", &self.http_client.is_some())
            .field("custom_store", &self.store.is_some())
            .finish()
    }
}

/// What the browser collaborator needs to run an authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub provider: Provider,
    /// URL to load.
    pub url: Url,
    /// Navigation to this URI carries the callback.
    pub redirect_uri: Option<String>,
    /// Use a private, non-persistent browsing session.
    pub ephemeral: bool,
}

struct Inner {
    providers: Vec<Provider>,
    options: Options,
    http: Arc<dyn HttpClient>,
    store: CredentialStore,
    scheduler: Scheduler,
    injector: Arc<CredentialInjector>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<State>,
    writer: Mutex<()>,
    epoch: AtomicU64,
    generations: std::sync::Mutex<HashMap<String, u64>>,
}

/// Counters an operation captures when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    epoch: u64,
    generation: u64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}

/// OAuth 2.0 client engine.
///
/// Cheap to clone; clones share the same state, store and tasks.
#[derive(Clone)]
pub struct OAuth {
    inner: Arc<Inner>,
}

impl OAuth {
    /// Create an engine for `providers`. Call [`OAuth::restore`] to load
    /// persisted credentials.
    pub fn new(providers: Vec<Provider>, options: Options) -> Self {
        let clock = options
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let http = options
            .http_client
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestClient::new()) as Arc<dyn HttpClient>);
        let backend = options
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn SecureStore>);
        let injector = options
            .injector
            .clone()
            .unwrap_or_else(|| Arc::new(CredentialInjector::with_clock(Arc::clone(&clock))));
        let (state, _) = watch::channel(State::Empty);

        Self {
            inner: Arc::new(Inner {
                store: CredentialStore::new(backend, options.application_tag.clone()),
                providers,
                options,
                http,
                scheduler: Scheduler::new(),
                injector,
                clock,
                state,
                writer: Mutex::new(()),
                epoch: AtomicU64::new(0),
                generations: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Snapshot of the current state.
    pub fn state(&self) -> State {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every published state.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    pub fn providers(&self) -> &[Provider] {
        &self.inner.providers
    }

    /// Look up a configured provider by id.
    pub fn provider(&self, id: &str) -> Result<&Provider> {
        self.inner
            .providers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::UnknownProvider(id.to_string()))
    }

    /// The stored credential for a provider, if any.
    pub fn credential(&self, provider: &Provider) -> Result<Option<Credential>> {
        self.inner.store.load(&provider.id)
    }

    /// Provider ids with a stored credential.
    pub fn stored_providers(&self) -> Result<Vec<String>> {
        self.inner.store.provider_ids()
    }

    pub fn injector(&self) -> Arc<CredentialInjector> {
        Arc::clone(&self.inner.injector)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn application_tag(&self) -> &str {
        self.inner.store.tag()
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// What the browser collaborator should load, when the engine is
    /// waiting for a redirect callback.
    pub fn authorization_request(&self) -> Option<AuthorizationRequest> {
        let State::Authorizing(provider, grant) = self.state() else {
            return None;
        };
        let request = request::build_authorization_request(&provider, &grant).ok()?;
        Some(AuthorizationRequest {
            url: request.url,
            redirect_uri: provider.redirect_uri.clone(),
            ephemeral: self.inner.options.ephemeral_browsing,
            provider,
        })
    }

    // ---------------------------------------------------------------------
    // Flow control
    // ---------------------------------------------------------------------

    /// Start an authorization for `provider` with `grant`.
    ///
    /// Fire-and-forget: outcomes are only visible through [`OAuth::state`]
    /// and [`OAuth::subscribe`]. Work already underway for the provider is
    /// abandoned, including requests on the wire.
    pub async fn authorize(&self, provider: &Provider, grant: GrantType) {
        let provider = provider.clone();
        let id = provider.id.clone();
        info!(provider = %id, grant = grant.name(), "authorize");

        // Held while superseding so no earlier flow commits in between.
        let _writer = self.writer().await;
        self.supersede(&id);
        self.inner.scheduler.cancel(&TaskKey::Request(id.clone()));
        self.inner.scheduler.cancel(&TaskKey::Poll(id.clone()));

        match grant {
            GrantType::AuthorizationCode { .. } | GrantType::Pkce { .. } => {
                match request::build_authorization_request(&provider, &grant) {
                    Ok(_) => self.publish(State::Authorizing(provider, grant)),
                    Err(e) => self.publish(State::Error(provider, e)),
                }
            }
            GrantType::DeviceCode => {
                self.publish(State::RequestingDeviceCode(provider.clone()));
                self.schedule(TaskKey::Request(id), Duration::ZERO, move |engine| {
                    device_authorization_task(engine, provider)
                });
            }
            GrantType::ClientCredentials => {
                self.schedule(TaskKey::Request(id), Duration::ZERO, move |engine| {
                    client_credentials_task(engine, provider)
                });
            }
            GrantType::RefreshToken => {
                self.schedule(TaskKey::Refresh(id), Duration::ZERO, move |engine| {
                    refresh_task(engine, provider)
                });
            }
        }
    }

    /// Handle a navigation observed by the browser collaborator.
    ///
    /// Returns `Ok(None)` when the engine is not authorizing or `url` is not
    /// the provider's redirect URI. Otherwise the pending grant is consumed,
    /// its `state` is checked, and the code is exchanged.
    pub async fn handle_redirect(&self, url: &Url) -> Result<Option<Credential>> {
        let (provider, grant, code) = {
            let _writer = self.writer().await;
            let State::Authorizing(provider, grant) = self.state() else {
                return Ok(None);
            };
            let Some(redirect_uri) = provider.redirect_uri.as_deref() else {
                return Ok(None);
            };
            if !is_redirect(url, redirect_uri) {
                return Ok(None);
            }

            let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
            if let Some(error) = params.get("error") {
                let message = params.get("error_description").unwrap_or(error).clone();
                let err = if error == "access_denied" {
                    Error::AccessDenied(message)
                } else {
                    Error::BadResponse(format!("{}: {}", error, message))
                };
                self.publish(State::Error(provider, err.clone()));
                return Err(err);
            }
            if params.get("state").map(String::as_str) != grant.state() {
                warn!(provider = %provider.id, "callback state mismatch");
                self.publish(State::Error(provider, Error::StateMismatch));
                return Err(Error::StateMismatch);
            }
            let Some(code) = params.get("code").cloned() else {
                let err = Error::BadResponse("callback carries no authorization code".to_string());
                self.publish(State::Error(provider, err.clone()));
                return Err(err);
            };

            // Consumes the pending grant so its state cannot be replayed.
            self.publish(State::RequestingAccessToken(provider.clone()));
            (provider, grant, code)
        };

        self.exchange_code(&provider, &code, grant.code_verifier())
            .await
            .map(Some)
    }

    /// Exchange an authorization code for a credential.
    ///
    /// Publishes `RequestingAccessToken`, then `Authorized` or `Error`.
    pub async fn exchange_code(
        &self,
        provider: &Provider,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<Credential> {
        let ticket = self.ticket(provider);
        self.transition(provider, ticket, State::RequestingAccessToken(provider.clone()))
            .await?;

        let result = match request::build_token_request(provider, code, pkce_verifier) {
            Ok(request) => self.request_token(provider, request).await,
            Err(e) => Err(e),
        };
        self.complete_token_request(provider, ticket, result).await
    }

    /// Run the client credentials grant and wait for the outcome.
    pub async fn request_client_credentials(&self, provider: &Provider) -> Result<Credential> {
        let ticket = self.ticket(provider);
        self.transition(provider, ticket, State::RequestingAccessToken(provider.clone()))
            .await?;

        let result = match request::build_client_credentials_request(provider) {
            Ok(request) => self.request_token(provider, request).await,
            Err(e) => Err(e),
        };
        self.complete_token_request(provider, ticket, result).await
    }

    /// Refresh the stored credential for `provider`.
    ///
    /// Returns `Ok(None)` when nothing is stored. A credential without a
    /// refresh token is returned unchanged while valid; once expired, it
    /// triggers [`OAuth::clear`]. Failures publish `Error`.
    pub async fn refresh(&self, provider: &Provider) -> Result<Option<Credential>> {
        let ticket = self.ticket(provider);
        let stored = match self.inner.store.load(&provider.id) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(provider = %provider.id, error = %e, "failed to load credential");
                let _ = self
                    .transition(provider, ticket, State::Error(provider.clone(), e.clone()))
                    .await;
                return Err(e);
            }
        };
        let Some(stored) = stored else {
            debug!(provider = %provider.id, "nothing to refresh");
            return Ok(None);
        };

        if stored.refresh_token().is_none() {
            if stored.is_expired_at(self.now()) {
                info!(provider = %provider.id, "credential expired without refresh token");
                self.clear().await;
                return Ok(None);
            }
            return Ok(Some(stored));
        }

        info!(provider = %provider.id, "refreshing credential");
        let result = match request::build_refresh_request(provider, &stored.token) {
            Ok(request) => self.request_token(provider, request).await,
            Err(e) => Err(e),
        };
        // Servers may omit the refresh token when they do not rotate it.
        let result = result.map(|mut token| {
            if token.refresh_token.is_none() {
                token.refresh_token = stored.token.refresh_token.clone();
            }
            token
        });

        self.complete_token_request(provider, ticket, result)
            .await
            .map(Some)
    }

    /// Poll once for a device code token, rescheduling as RFC 8628 asks.
    pub async fn poll(&self, provider: &Provider, mut device_code: DeviceCode) {
        let ticket = self.ticket(provider);
        if device_code.is_expired_at(self.now()) {
            info!(provider = %provider.id, "device code expired");
            let _ = self.transition(provider, ticket, State::Empty).await;
            return;
        }

        let outcome = match request::build_device_poll_request(provider, &device_code) {
            Ok(request) => match self.send(provider, request).await {
                Ok(response) => PollResult::classify(&response),
                Err(e) => PollResult::Retry(e.to_string()),
            },
            Err(e) => {
                let _ = self
                    .transition(provider, ticket, State::Error(provider.clone(), e))
                    .await;
                return;
            }
        };

        match outcome {
            PollResult::Success(token) => {
                let _ = self.complete_token_request(provider, ticket, Ok(token)).await;
            }
            PollResult::Pending => {
                debug!(provider = %provider.id, "authorization pending");
                self.reschedule_poll(provider, ticket, device_code).await;
            }
            PollResult::SlowDown => {
                device_code.interval = device_code.interval.saturating_add(SLOW_DOWN_INCREMENT);
                debug!(provider = %provider.id, interval = device_code.interval, "slow down");
                self.reschedule_poll(provider, ticket, device_code).await;
            }
            PollResult::Retry(reason) => {
                warn!(provider = %provider.id, reason = %reason, "device poll failed, retrying");
                self.reschedule_poll(provider, ticket, device_code).await;
            }
            PollResult::Expired => {
                info!(provider = %provider.id, "device code expired on server");
                let _ = self.transition(provider, ticket, State::Empty).await;
            }
            PollResult::AccessDenied(message) => {
                let _ = self
                    .transition(
                        provider,
                        ticket,
                        State::Error(provider.clone(), Error::AccessDenied(message)),
                    )
                    .await;
            }
        }
    }

    /// Delete every credential for the application tag, cancel all
    /// scheduled work and publish `Empty`. Never fails.
    pub async fn clear(&self) {
        let _writer = self.writer().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "failed to clear credential store");
        }
        self.inner.injector.clear();
        self.publish(State::Empty);
        self.inner.scheduler.cancel_all();
    }

    /// Delete the credential for one provider and stop its tasks, including
    /// any request already on the wire.
    ///
    /// Publishes `Empty` when the current state belongs to that provider.
    pub async fn remove(&self, provider: &Provider) -> Result<bool> {
        let _writer = self.writer().await;
        self.supersede(&provider.id);
        self.inner.scheduler.cancel_provider(&provider.id);
        self.inner.injector.remove(&provider.id);
        let existed = self.inner.store.remove(&provider.id)?;
        if self.state().provider() == Some(provider) {
            self.publish(State::Empty);
        }
        Ok(existed)
    }

    /// Load persisted credentials for every configured provider.
    ///
    /// Valid credentials are published as `Authorized` and armed for
    /// refresh. Expired ones are refreshed immediately when possible and
    /// deleted otherwise. Returns the number of credentials restored.
    pub async fn restore(&self) -> usize {
        if self.inner.options.require_biometric_gate {
            match self.inner.options.biometric_gate {
                Some(ref gate) => {
                    if !gate.evaluate().await {
                        info!("biometric gate refused, skipping restore");
                        return 0;
                    }
                }
                None => {
                    warn!("biometric gate required but none configured, skipping restore");
                    return 0;
                }
            }
        }

        let _writer = self.writer().await;
        let now = self.now();
        let mut restored = 0;

        for provider in &self.inner.providers {
            let credential = match self.inner.store.load(&provider.id) {
                Ok(Some(credential)) => credential,
                Ok(None) => continue,
                Err(e) => {
                    warn!(provider = %provider.id, error = %e, "skipping unreadable credential");
                    continue;
                }
            };

            if !credential.is_expired_at(now) {
                self.inner.injector.add_credential(credential.clone(), provider);
                self.schedule_refresh(provider, &credential);
                self.publish(State::Authorized(provider.clone(), credential));
                restored += 1;
            } else if credential.refresh_token().is_some() && self.inner.options.auto_refresh
            {
                let provider = provider.clone();
                self.schedule(
                    TaskKey::Refresh(provider.id.clone()),
                    Duration::ZERO,
                    move |engine| refresh_task(engine, provider),
                );
            } else {
                info!(provider = %provider.id, "discarding expired credential");
                if let Err(e) = self.inner.store.remove(&provider.id) {
                    warn!(provider = %provider.id, error = %e, "failed to remove credential");
                }
            }
        }

        info!(restored, "restore complete");
        restored
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn generation(&self, provider_id: &str) -> u64 {
        let generations = self
            .inner
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generations.get(provider_id).copied().unwrap_or(0)
    }

    /// Invalidate every operation already started for a provider. Callers
    /// hold the writer lock.
    fn supersede(&self, provider_id: &str) {
        let mut generations = self
            .inner
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generations.entry(provider_id.to_string()).or_insert(0) += 1;
    }

    fn ticket(&self, provider: &Provider) -> Ticket {
        Ticket {
            epoch: self.epoch(),
            generation: self.generation(&provider.id),
        }
    }

    fn is_stale(&self, provider: &Provider, ticket: Ticket) -> bool {
        self.ticket(provider) != ticket
    }

    async fn writer(&self) -> MutexGuard<'_, ()> {
        self.inner.writer.lock().await
    }

    /// Replace the published state. Callers hold the writer lock.
    fn publish(&self, state: State) {
        info!(
            state = state.label(),
            provider = state.provider().map(|p| p.id.as_str()).unwrap_or("-"),
            "state transition"
        );
        self.inner.state.send_replace(state);
    }

    /// Publish `state` unless `ticket` was invalidated.
    async fn transition(&self, provider: &Provider, ticket: Ticket, state: State) -> Result<()> {
        let _writer = self.writer().await;
        if self.is_stale(provider, ticket) {
            debug!(state = state.label(), "dropping stale transition");
            return Err(Error::Cancelled);
        }
        self.publish(state);
        Ok(())
    }

    async fn send(&self, provider: &Provider, request: HttpRequest) -> Result<HttpResponse> {
        if provider.debug {
            debug!(provider = %provider.id, method = %request.method, url = %request.url, "request");
        }
        let response = self.inner.http.send(request).await;
        match response {
            Ok(ref r) if provider.debug => {
                debug!(provider = %provider.id, status = r.status, body = %r.text(), "response");
            }
            Err(ref e) => warn!(provider = %provider.id, error = %e, "request failed"),
            _ => {}
        }
        response
    }

    async fn request_token(&self, provider: &Provider, request: HttpRequest) -> Result<Token> {
        let response = self.send(provider, request).await?;
        Token::decode(&response)
    }

    /// Persist and publish a token result, or publish its error.
    async fn complete_token_request(
        &self,
        provider: &Provider,
        ticket: Ticket,
        result: Result<Token>,
    ) -> Result<Credential> {
        let _writer = self.writer().await;
        if self.is_stale(provider, ticket) {
            debug!(provider = %provider.id, "dropping superseded token response");
            return Err(Error::Cancelled);
        }

        let token = match result {
            Ok(token) => token,
            Err(e) => {
                warn!(provider = %provider.id, error = %e, "token request failed");
                self.publish(State::Error(provider.clone(), e.clone()));
                return Err(e);
            }
        };

        let credential = Credential::new(provider.id.clone(), self.now(), token);
        if let Err(e) = self.inner.store.save(&credential) {
            warn!(provider = %provider.id, error = %e, "failed to persist credential");
            self.publish(State::Error(provider.clone(), e.clone()));
            return Err(e);
        }

        self.inner
            .injector
            .add_credential(credential.clone(), provider);
        self.schedule_refresh(provider, &credential);
        self.publish(State::Authorized(provider.clone(), credential.clone()));
        Ok(credential)
    }

    /// Arm the refresh task for `credential`, or disarm it when the
    /// credential cannot or need not be refreshed. Callers hold the writer
    /// lock.
    fn schedule_refresh(&self, provider: &Provider, credential: &Credential) {
        let key = TaskKey::Refresh(provider.id.clone());
        let expiration = match credential.expiration() {
            Some(exp) if self.inner.options.auto_refresh && credential.refresh_token().is_some() => {
                exp
            }
            _ => {
                self.inner.scheduler.cancel_pending(&key);
                return;
            }
        };

        let delay = (expiration - self.now()).to_std().unwrap_or(Duration::ZERO);
        debug!(provider = %provider.id, delay_secs = delay.as_secs(), "refresh scheduled");
        let provider = provider.clone();
        self.schedule(key, delay, move |engine| refresh_task(engine, provider));
    }

    async fn reschedule_poll(&self, provider: &Provider, ticket: Ticket, device_code: DeviceCode) {
        let _writer = self.writer().await;
        if self.is_stale(provider, ticket) {
            return;
        }
        let delay = device_code.poll_interval();
        let provider = provider.clone();
        self.schedule(
            TaskKey::Poll(provider.id.clone()),
            delay,
            move |engine| poll_task(engine, provider, device_code),
        );
    }

    /// The device authorization half of the device code grant.
    async fn device_authorization(&self, provider: &Provider) {
        let ticket = self.ticket(provider);
        let result = match request::build_device_authorization_request(provider) {
            Ok(request) => match self.send(provider, request).await {
                Ok(response) => DeviceCode::decode(&response, self.now()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let _writer = self.writer().await;
        if self.is_stale(provider, ticket) {
            return;
        }
        match result {
            Ok(device_code) => {
                info!(
                    provider = %provider.id,
                    user_code = %device_code.user_code,
                    verification_uri = %device_code.verification_uri,
                    "device code received"
                );
                let delay = device_code.poll_interval();
                let task_provider = provider.clone();
                let task_code = device_code.clone();
                self.schedule(
                    TaskKey::Poll(provider.id.clone()),
                    delay,
                    move |engine| poll_task(engine, task_provider, task_code),
                );
                self.publish(State::ReceivedDeviceCode(provider.clone(), device_code));
            }
            Err(e) => {
                warn!(provider = %provider.id, error = %e, "device authorization failed");
                self.publish(State::Error(provider.clone(), e));
            }
        }
    }

    /// Schedule an engine operation. The task holds only a weak reference,
    /// so pending work never keeps a dropped engine alive.
    fn schedule<F>(&self, key: TaskKey, after: Duration, operation: F)
    where
        F: FnOnce(OAuth) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(key, after, async move {
            if let Some(inner) = weak.upgrade() {
                operation(OAuth { inner }).await;
            }
        });
    }
}

impl fmt::Debug for OAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth")
            .field("providers", &self.inner.providers.len())
            .field("application_tag", &self.inner.store.tag())
            .field("state", &self.state().label())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

/// Whether `url` is a navigation to `redirect_uri`: the same URI, or one
/// continued by a query, fragment or path segment.
fn is_redirect(url: &Url, redirect_uri: &str) -> bool {
    match url.as_str().strip_prefix(redirect_uri) {
        Some(rest) => rest.is_empty() || rest.starts_with(['?', '#', '/']),
        None => false,
    }
}

fn refresh_task(engine: OAuth, provider: Provider) -> BoxFuture<'static, ()> {
    async move {
        let _ = engine.refresh(&provider).await;
    }
    .boxed()
}

fn poll_task(engine: OAuth, provider: Provider, device_code: DeviceCode) -> BoxFuture<'static, ()> {
    async move {
        engine.poll(&provider, device_code).await;
    }
    .boxed()
}

fn device_authorization_task(engine: OAuth, provider: Provider) -> BoxFuture<'static, ()> {
    async move {
        engine.device_authorization(&provider).await;
    }
    .boxed()
}

fn client_credentials_task(engine: OAuth, provider: Provider) -> BoxFuture<'static, ()> {
    async move {
        let _ = engine.request_client_credentials(&provider).await;
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Provider {
        Provider::new(
            "GitHub",
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            "CID",
        )
        .with_redirect_uri("app://cb")
    }

    #[test]
    fn test_options_default() {
        let options = Options::default();
        assert!(options.auto_refresh);
        assert_eq!(options.application_tag, DEFAULT_APPLICATION_TAG);
        assert!(!options.ephemeral_browsing);
        assert!(!options.require_biometric_gate);
    }

    #[test]
    fn test_provider_lookup() {
        let engine = OAuth::new(vec![provider()], Options::default());
        assert!(engine.provider("GitHub").is_ok());
        assert_eq!(
            engine.provider("Nope").unwrap_err(),
            Error::UnknownProvider("Nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_authorize_code_announces_browser_request() {
        let engine = OAuth::new(
            vec![provider()],
            Options::default().with_ephemeral_browsing(true),
        );
        let p = provider();
        engine
            .authorize(
                &p,
                GrantType::AuthorizationCode {
                    state: "STATE1".to_string(),
                },
            )
            .await;

        assert!(matches!(engine.state(), State::Authorizing(..)));
        let request = engine.authorization_request().unwrap();
        assert!(request.ephemeral);
        assert_eq!(request.redirect_uri.as_deref(), Some("app://cb"));
        assert!(request.url.as_str().contains("state=STATE1"));
    }

    #[tokio::test]
    async fn test_authorize_with_malformed_url_publishes_error() {
        let mut p = provider();
        p.authorization_url = "::not a url::".to_string();
        let engine = OAuth::new(vec![p.clone()], Options::default());

        engine.authorize(&p, GrantType::pkce()).await;
        assert!(matches!(
            engine.state(),
            State::Error(_, Error::MalformedUrl(_))
        ));
        assert!(engine.authorization_request().is_none());
    }

    #[tokio::test]
    async fn test_redirect_ignored_when_not_authorizing() {
        let engine = OAuth::new(vec![provider()], Options::default());
        let url = Url::parse("app://cb?code=abc&state=x").unwrap();
        assert_eq!(engine.handle_redirect(&url).await, Ok(None));
    }

    #[test]
    fn test_redirect_match_requires_boundary() {
        let matches = |url: &str, uri: &str| is_redirect(&Url::parse(url).unwrap(), uri);

        assert!(matches("app://cb?code=abc", "app://cb"));
        assert!(matches("app://cb#code=abc", "app://cb"));
        assert!(matches("app://cb/done?code=abc", "app://cb"));
        assert!(matches("app://cb", "app://cb"));
        assert!(matches("http://localhost:8080/callback?code=x", "http://localhost:8080/callback"));

        assert!(!matches("app://cbevil?code=abc", "app://cb"));
        assert!(!matches("http://localhost:8080/callbackx?code=x", "http://localhost:8080/callback"));
        assert!(!matches("app://other?code=abc", "app://cb"));
    }
}
