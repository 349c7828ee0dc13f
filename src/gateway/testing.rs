//! In-process fake backend for gateway and coordinator tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::error::TransportError;
use super::transport::{HttpTransport, TransportRequest, TransportResponse};
use super::types::{ApiEnvelope, CredentialPair};
use crate::config::ClientConfig;
use crate::session::{keys, Namespace, SessionStore};

pub(crate) const BASE_URL: &str = "http://backend.test";
pub(crate) const PASSWORD: &str = "secret";

#[derive(Default)]
struct ServerState {
    issued: u32,
    access: Option<String>,
    refresh: Option<String>,
    fail_refresh: bool,
    refresh_delay: Duration,
    profile: Option<Value>,
    reject_all: bool,
    sibling: Option<Arc<SessionStore>>,
    refresh_racer: Option<Arc<SessionStore>>,
    requests: Vec<TransportRequest>,
}

/// Token-rotating backend
///
/// Issues `A{n}`/`R{n}` pairs, accepts only the current access token on
/// protected paths and echoes the bearer token it saw.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<ServerState>>,
    refresh_calls: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config() -> ClientConfig {
        ClientConfig::with_base_url(BASE_URL)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Issues the next pair and makes it current
    pub fn issue(&self) -> CredentialPair {
        let mut state = self.state();
        state.issued += 1;
        let access = format!("A{}", state.issued);
        let refresh = format!("R{}", state.issued);
        state.access = Some(access.clone());
        state.refresh = Some(refresh.clone());
        CredentialPair::new(access, refresh)
    }

    /// Rejects the current access token from now on
    pub fn expire_access(&self) {
        self.state().access = None;
    }

    /// Protected paths answer 401 whatever token is presented
    pub fn reject_all_tokens(&self) {
        self.state().reject_all = true;
    }

    /// On the next 401, rotates the pair and writes it into `store`, as a
    /// sibling context finishing its own refresh would
    pub fn rotate_on_reject(&self, store: Arc<SessionStore>) {
        self.state().sibling = Some(store);
    }

    /// On the next refresh call, rotates the pair into `store` first, so the
    /// presented refresh token is already stale and gets rejected
    pub fn race_refresh(&self, store: Arc<SessionStore>) {
        self.state().refresh_racer = Some(store);
    }

    pub fn fail_refresh(&self) {
        self.state().fail_refresh = true;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state().refresh_delay = delay;
    }

    pub fn set_profile(&self, profile: Value) {
        self.state().profile = Some(profile);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state().requests.clone()
    }

    pub fn last_request(&self) -> TransportRequest {
        self.requests().pop().unwrap()
    }

    fn envelope(status: StatusCode, envelope: ApiEnvelope) -> TransportResponse {
        TransportResponse::json(status, &serde_json::to_value(envelope).unwrap())
    }

    fn pair(pair: &CredentialPair) -> TransportResponse {
        Self::envelope(
            StatusCode::OK,
            ApiEnvelope::ok(serde_json::to_value(pair).unwrap()),
        )
    }

    fn login(&self, body: &Value) -> TransportResponse {
        if body["password"] == PASSWORD {
            Self::pair(&self.issue())
        } else {
            Self::envelope(
                StatusCode::UNAUTHORIZED,
                ApiEnvelope::failure(401, "Invalid username or password"),
            )
        }
    }

    async fn refresh(&self, body: &Value) -> TransportResponse {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let racer = self.state().refresh_racer.take();
        if let Some(store) = racer {
            let pair = self.issue();
            store.set(Namespace::Auth, keys::CREDENTIALS, &pair).await;
        }

        let accepted = {
            let state = self.state();
            !state.fail_refresh && state.refresh.as_deref() == body["refreshToken"].as_str()
        };
        if accepted {
            Self::pair(&self.issue())
        } else {
            Self::envelope(
                StatusCode::UNAUTHORIZED,
                ApiEnvelope::failure(401, "Refresh token revoked"),
            )
        }
    }

    fn protected(&self, path: &str, request: &TransportRequest) -> TransportResponse {
        let state = self.state();
        let presented = request
            .header("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "));
        if state.reject_all || presented.is_none() || presented != state.access.as_deref() {
            return TransportResponse::new(StatusCode::UNAUTHORIZED, "token expired");
        }
        let token = presented.unwrap_or_default();

        match path {
            "/users/me" => match &state.profile {
                Some(profile) => Self::envelope(StatusCode::OK, ApiEnvelope::ok(profile.clone())),
                None => Self::envelope(StatusCode::OK, ApiEnvelope::failure(404, "No profile")),
            },
            "/domain-error" => Self::envelope(
                StatusCode::OK,
                ApiEnvelope::failure(422, "Invalid price"),
            ),
            "/revoked" => Self::envelope(
                StatusCode::OK,
                ApiEnvelope::failure(401, "Session revoked"),
            ),
            "/broken" => TransportResponse::new(StatusCode::OK, "<html>"),
            "/outage" => TransportResponse::new(StatusCode::BAD_GATEWAY, "upstream down"),
            _ => Self::envelope(
                StatusCode::OK,
                ApiEnvelope::ok(json!({ "path": path, "token": token })),
            ),
        }
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.state().requests.push(request.clone());

        let path = request.url.trim_start_matches(BASE_URL).to_string();
        let body = request.body.clone().unwrap_or(Value::Null);
        let response = match path.as_str() {
            "/auth/login" => self.login(&body),
            "/auth/refresh" => self.refresh(&body).await,
            "/offline" => return Err(TransportError::Unavailable("network down".into())),
            _ => self.protected(&path, &request),
        };

        if response.status == StatusCode::UNAUTHORIZED {
            let sibling = self.state().sibling.take();
            if let Some(store) = sibling {
                let pair = self.issue();
                store.set(Namespace::Auth, keys::CREDENTIALS, &pair).await;
            }
        }
        Ok(response)
    }
}
