//! Token gateway
//!
//! Every outbound call goes through [`TokenGateway::dispatch`]. Credentials
//! are re-read from the [`SessionStore`] before each attempt; an expired
//! access token triggers one single-flight refresh and one retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::error::GatewayError;
use super::refresh::{RefreshGate, RefreshOutcome, RefreshPhase, RefreshTicket};
use super::transport::{HttpTransport, TransportRequest, TransportResponse};
use super::types::{
    ApiEnvelope, CredentialPair, LoginRequest, RefreshRequest, RequestDescriptor, UNAUTHORIZED_CODE,
};
use crate::config::ClientConfig;
use crate::security::{Sanitizer, SecretString};
use crate::session::{keys, Namespace, SessionStore};

/// Result of one pass through build / execute / interpret
enum Attempt {
    Completed(Value),
    /// Transport-level unauthorized on an authenticated request. Carries
    /// the access token that was rejected.
    Expired(SecretString),
}

/// Subset of the cached profile used for correlation headers
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Correlation {
    id: String,
    #[serde(default)]
    tenant_id: Option<String>,
}

struct GatewayInner {
    config: ClientConfig,
    store: Arc<SessionStore>,
    transport: Arc<dyn HttpTransport>,
    refresh: RefreshGate,
    refresh_calls: AtomicU64,
}

/// Request gateway with transparent credential refresh
///
/// Cheap to clone; clones share the refresh state.
#[derive(Clone)]
pub struct TokenGateway {
    inner: Arc<GatewayInner>,
}

impl TokenGateway {
    pub fn new(
        config: ClientConfig,
        store: Arc<SessionStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                store,
                transport,
                refresh: RefreshGate::new(),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    /// Stores a credential pair, announcing it to other contexts
    pub async fn set_credentials(&self, credentials: &CredentialPair) {
        self.inner
            .store
            .set(Namespace::Auth, keys::CREDENTIALS, credentials)
            .await;
    }

    pub async fn get_credentials(&self) -> Option<CredentialPair> {
        self.inner
            .store
            .get(Namespace::Auth, keys::CREDENTIALS)
            .await
    }

    pub async fn clear_credentials(&self) {
        self.inner
            .store
            .remove(Namespace::Auth, keys::CREDENTIALS)
            .await;
    }

    /// True while a refresh call is in flight
    pub fn refresh_in_progress(&self) -> bool {
        matches!(self.inner.refresh.phase(), RefreshPhase::Refreshing { .. })
    }

    pub fn refresh_phase(&self) -> RefreshPhase {
        self.inner.refresh.phase()
    }

    /// Number of calls made to the refresh endpoint
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    /// Exchanges a username and password for a credential pair and stores it
    pub async fn login(
        &self,
        username: &str,
        password: impl Into<SecretString>,
    ) -> Result<CredentialPair, GatewayError> {
        let body = serde_json::to_value(LoginRequest {
            username: username.to_string(),
            password: password.into(),
        })
        .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let descriptor = RequestDescriptor::post(self.inner.config.login_path.as_str())
            .with_body(body)
            .skip_auth();
        let credentials: CredentialPair = decode(self.dispatch(descriptor).await?)?;

        self.set_credentials(&credentials).await;
        tracing::info!("Signed in as {}", Sanitizer::mask_string(username, 2));
        Ok(credentials)
    }

    /// Dispatches a request and decodes the envelope's `data`
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, GatewayError> {
        decode(self.dispatch(descriptor).await?)
    }

    /// Sends a request, refreshing credentials once if they have expired
    ///
    /// Returns the envelope's `data` on success.
    pub async fn dispatch(&self, descriptor: RequestDescriptor) -> Result<Value, GatewayError> {
        let rejected = match self.attempt(&descriptor).await? {
            Attempt::Completed(data) => return Ok(data),
            Attempt::Expired(rejected) => rejected,
        };
        tracing::debug!(
            "Access token {} rejected for {}",
            rejected.redacted(),
            descriptor.endpoint
        );

        // Another cycle already rotated the token this request was sent with
        if let Some(current) = self.get_credentials().await {
            if current.access_token != rejected {
                return self.retry(&descriptor).await;
            }
        }

        match self.inner.refresh.enter(descriptor) {
            RefreshTicket::Queued(waiter) => waiter
                .await
                .unwrap_or_else(|_| Err(GatewayError::RefreshAbandoned)),
            RefreshTicket::Leader(lease, descriptor) => {
                let outcome = self.refresh_credentials(&rejected).await;
                let queued = lease.complete(outcome.clone());

                match outcome {
                    RefreshOutcome::Success => {
                        tracing::debug!("Replaying {} queued requests", queued.len());
                        for request in queued {
                            let gateway = self.clone();
                            tokio::spawn(async move {
                                let result = gateway.retry(&request.descriptor).await;
                                request.settle(result);
                            });
                        }
                        self.retry(&descriptor).await
                    }
                    RefreshOutcome::Failed(reason) => {
                        tracing::warn!(
                            "Refresh failed, rejecting {} queued requests: {}",
                            queued.len(),
                            reason
                        );
                        for request in queued {
                            request.settle(Err(GatewayError::ReauthRequired(reason.clone())));
                        }
                        Err(GatewayError::ReauthRequired(reason))
                    }
                }
            }
        }
    }

    /// Second and last attempt after a refresh
    async fn retry(&self, descriptor: &RequestDescriptor) -> Result<Value, GatewayError> {
        match self.attempt(descriptor).await? {
            Attempt::Completed(data) => Ok(data),
            Attempt::Expired(_) => {
                tracing::warn!("Refreshed credentials rejected for {}", descriptor.endpoint);
                Err(GatewayError::ReauthRequired(
                    "credentials rejected after refresh".to_string(),
                ))
            }
        }
    }

    async fn attempt(&self, descriptor: &RequestDescriptor) -> Result<Attempt, GatewayError> {
        let credentials = if descriptor.skip_auth {
            None
        } else {
            Some(
                self.get_credentials()
                    .await
                    .ok_or(GatewayError::NoCredentials)?,
            )
        };

        let request = self.build_request(descriptor, credentials.as_ref()).await;
        let response = self.inner.transport.execute(request).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            if let Some(credentials) = credentials {
                return Ok(Attempt::Expired(credentials.access_token));
            }
        }

        self.interpret(descriptor, response)
            .await
            .map(Attempt::Completed)
    }

    async fn build_request(
        &self,
        descriptor: &RequestDescriptor,
        credentials: Option<&CredentialPair>,
    ) -> TransportRequest {
        let config = &self.inner.config;
        let mut headers = Vec::new();

        if let Some(credentials) = credentials {
            put_header(
                &mut headers,
                "Authorization",
                format!("Bearer {}", credentials.access_token.expose()),
            );
        }
        put_header(&mut headers, &config.headers.locale, config.locale.clone());

        if credentials.is_some() {
            let correlation: Option<Correlation> = self
                .inner
                .store
                .get(Namespace::User, keys::PROFILE)
                .await;
            if let Some(correlation) = correlation {
                if let Some(tenant) = correlation.tenant_id {
                    put_header(&mut headers, &config.headers.tenant, tenant);
                }
                put_header(&mut headers, &config.headers.user, correlation.id);
            }
        }

        for (name, value) in &descriptor.headers {
            put_header(&mut headers, name, value.clone());
        }

        TransportRequest {
            method: descriptor.method.clone(),
            url: config.url_for(&descriptor.endpoint),
            headers,
            body: descriptor.body.clone(),
            timeout: Some(config.request_timeout()),
        }
    }

    /// Checks both the transport status and the envelope's result code
    async fn interpret(
        &self,
        descriptor: &RequestDescriptor,
        response: TransportResponse,
    ) -> Result<Value, GatewayError> {
        let envelope = serde_json::from_str::<ApiEnvelope>(&response.body);

        if !response.status.is_success() {
            return Err(match envelope {
                Ok(envelope) if !envelope.is_success() => {
                    self.domain_failure(descriptor, envelope).await
                }
                _ => GatewayError::Status {
                    status: response.status.as_u16(),
                    body: response.body,
                },
            });
        }

        let envelope = envelope.map_err(|e| GatewayError::Decode(e.to_string()))?;
        if envelope.is_success() {
            Ok(envelope.data)
        } else {
            Err(self.domain_failure(descriptor, envelope).await)
        }
    }

    async fn domain_failure(
        &self,
        descriptor: &RequestDescriptor,
        envelope: ApiEnvelope,
    ) -> GatewayError {
        let result = envelope.result;
        let description = result.description.unwrap_or_default();

        if result.status_code == UNAUTHORIZED_CODE && !descriptor.skip_auth {
            tracing::warn!(
                "Backend revoked the session on {}: {}",
                descriptor.endpoint,
                description
            );
            self.clear_credentials().await;
            return GatewayError::ReauthRequired(description);
        }

        GatewayError::DomainFailure {
            status_code: result.status_code,
            description,
            details: result.details,
        }
    }

    /// Leader side of the refresh protocol
    async fn refresh_credentials(&self, rejected: &SecretString) -> RefreshOutcome {
        let Some(current) = self.get_credentials().await else {
            return RefreshOutcome::Failed("no refresh token stored".to_string());
        };
        if current.access_token != *rejected {
            tracing::debug!("Credentials already rotated, skipping refresh");
            return RefreshOutcome::Success;
        }

        self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let timeout = self.inner.config.refresh_timeout();
        tracing::info!("Refreshing credentials");

        let reason = match tokio::time::timeout(timeout, self.request_refresh(&current.refresh_token))
            .await
        {
            Ok(Ok(credentials)) => {
                self.set_credentials(&credentials).await;
                tracing::info!("Credentials refreshed");
                return RefreshOutcome::Success;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("refresh timed out after {:?}", timeout),
        };

        // A sibling context may have rotated the pair while we were waiting
        match self.get_credentials().await {
            Some(latest) if latest.refresh_token != current.refresh_token => {
                tracing::debug!("Refresh lost a race with another context, adopting its pair");
                RefreshOutcome::Success
            }
            _ => {
                tracing::warn!("Refresh failed, clearing credentials: {}", reason);
                self.clear_credentials().await;
                RefreshOutcome::Failed(reason)
            }
        }
    }

    async fn request_refresh(
        &self,
        refresh_token: &SecretString,
    ) -> Result<CredentialPair, GatewayError> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        let descriptor = RequestDescriptor::post(self.inner.config.refresh_path.as_str())
            .with_body(body)
            .skip_auth();

        match self.attempt(&descriptor).await? {
            Attempt::Completed(data) => decode(data),
            Attempt::Expired(_) => Err(GatewayError::ReauthRequired(
                "refresh token rejected".to_string(),
            )),
        }
    }
}

/// Sets a header, replacing any earlier value with the same name
fn put_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value));
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{FakeBackend, PASSWORD};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinSet;

    fn gateway_with(backend: &FakeBackend, config: ClientConfig) -> TokenGateway {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryStorage::new()),
            config.storage_prefix.clone(),
        ));
        TokenGateway::new(config, store, Arc::new(backend.clone()))
    }

    fn gateway(backend: &FakeBackend) -> TokenGateway {
        gateway_with(backend, FakeBackend::config())
    }

    async fn signed_in(backend: &FakeBackend) -> TokenGateway {
        let gateway = gateway(backend);
        gateway.set_credentials(&backend.issue()).await;
        gateway
    }

    async fn dispatch_concurrently(
        gateway: &TokenGateway,
        n: usize,
    ) -> Vec<Result<Value, GatewayError>> {
        let mut set = JoinSet::new();
        for i in 0..n {
            let gateway = gateway.clone();
            set.spawn(async move { gateway.dispatch(RequestDescriptor::get(format!("/orders/{}", i))).await });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            results.push(joined.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_login_stores_credentials() {
        let backend = FakeBackend::new();
        let gateway = gateway(&backend);

        let credentials = gateway.login("ana", PASSWORD).await.unwrap();

        assert_eq!(credentials, CredentialPair::new("A1", "R1"));
        assert_eq!(gateway.get_credentials().await, Some(credentials));
        let login = backend.last_request();
        assert_eq!(login.header("Authorization"), None);
        assert_eq!(login.body.unwrap()["username"], "ana");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let backend = FakeBackend::new();
        let gateway = gateway(&backend);

        let err = gateway.login("ana", "wrong").await.unwrap_err();

        assert_eq!(err.status_code(), Some(401));
        assert!(!err.is_reauth_required());
        assert!(gateway.get_credentials().await.is_none());
        assert_eq!(gateway.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_no_credentials_fails_fast() {
        let backend = FakeBackend::new();
        let gateway = gateway(&backend);

        let err = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap_err();

        assert!(matches!(err, GatewayError::NoCredentials));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_injects_headers() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;
        gateway
            .store()
            .set(
                Namespace::User,
                keys::PROFILE,
                &json!({"id": "u-7", "tenantId": "t-3", "version": 1}),
            )
            .await;

        let data = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap();

        assert_eq!(data["token"], "A1");
        let sent = backend.last_request();
        assert_eq!(sent.url, "http://backend.test/orders");
        assert_eq!(sent.header("Authorization"), Some("Bearer A1"));
        assert_eq!(sent.header("Accept-Language"), Some("en"));
        assert_eq!(sent.header("X-Tenant-Id"), Some("t-3"));
        assert_eq!(sent.header("X-User-Id"), Some("u-7"));
    }

    #[tokio::test]
    async fn test_caller_headers_override() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;

        gateway
            .dispatch(RequestDescriptor::get("/orders").with_header("accept-language", "es-MX"))
            .await
            .unwrap();

        let sent = backend.last_request();
        assert_eq!(sent.header("Accept-Language"), Some("es-MX"));
        let count = sent
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("accept-language"))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_domain_failure_on_transport_success() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;

        let err = gateway
            .dispatch(RequestDescriptor::post("/domain-error"))
            .await
            .unwrap_err();

        match err {
            GatewayError::DomainFailure {
                status_code,
                description,
                ..
            } => {
                assert_eq!(status_code, 422);
                assert_eq!(description, "Invalid price");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(gateway.get_credentials().await.is_some());
    }

    #[tokio::test]
    async fn test_domain_unauthorized_clears_credentials() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;

        let err = gateway.dispatch(RequestDescriptor::get("/revoked")).await.unwrap_err();

        assert!(err.is_reauth_required());
        assert!(gateway.get_credentials().await.is_none());
        assert_eq!(gateway.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_and_status_errors() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;

        let broken = gateway.dispatch(RequestDescriptor::get("/broken")).await;
        assert!(matches!(broken, Err(GatewayError::Decode(_))));

        let outage = gateway.dispatch(RequestDescriptor::get("/outage")).await;
        assert!(matches!(outage, Err(GatewayError::Status { status: 502, .. })));

        let offline = gateway.dispatch(RequestDescriptor::get("/offline")).await;
        assert!(matches!(offline, Err(GatewayError::Transport(_))));
        assert_eq!(gateway.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_and_retries() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;
        backend.expire_access();

        let data = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap();

        assert_eq!(data["token"], "A2");
        assert_eq!(gateway.refresh_count(), 1);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(
            gateway.get_credentials().await,
            Some(CredentialPair::new("A2", "R2"))
        );
        assert!(!gateway.refresh_in_progress());
        assert_eq!(
            gateway.refresh_phase(),
            RefreshPhase::Settled(RefreshOutcome::Success)
        );
    }

    #[tokio::test]
    async fn test_single_flight_refresh() {
        for n in [1, 2, 10] {
            let backend = FakeBackend::new();
            backend.set_refresh_delay(Duration::from_millis(100));
            let gateway = signed_in(&backend).await;
            backend.expire_access();

            let results = dispatch_concurrently(&gateway, n).await;

            assert_eq!(results.len(), n);
            assert_eq!(backend.refresh_calls(), 1, "n = {n}");
            assert_eq!(gateway.refresh_count(), 1, "n = {n}");
            for result in results {
                // Nobody is served with the pre-refresh token
                assert_eq!(result.unwrap()["token"], "A2");
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_rejects_every_caller() {
        for n in [1, 2, 10] {
            let backend = FakeBackend::new();
            backend.set_refresh_delay(Duration::from_millis(100));
            backend.fail_refresh();
            let gateway = signed_in(&backend).await;
            backend.expire_access();

            let results = dispatch_concurrently(&gateway, n).await;

            assert_eq!(backend.refresh_calls(), 1, "n = {n}");
            for result in results {
                assert!(result.unwrap_err().is_reauth_required(), "n = {n}");
            }
            assert!(gateway.get_credentials().await.is_none());
            assert!(matches!(
                gateway.refresh_phase(),
                RefreshPhase::Settled(RefreshOutcome::Failed(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_second_expiry_is_not_retried() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;
        backend.reject_all_tokens();

        let err = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap_err();

        assert!(err.is_reauth_required());
        assert_eq!(gateway.refresh_count(), 1);
        // The first attempt and exactly one retry
        let orders = backend
            .requests()
            .iter()
            .filter(|r| r.url.ends_with("/orders"))
            .count();
        assert_eq!(orders, 2);
    }

    #[tokio::test]
    async fn test_rotated_token_skips_refresh() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;
        // A sibling context refreshes while our request is being rejected
        backend.rotate_on_reject(gateway.store().clone());
        backend.expire_access();

        let data = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap();

        assert_eq!(data["token"], "A2");
        assert_eq!(gateway.refresh_count(), 0);
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_adopts_pair_rotated_elsewhere() {
        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;
        backend.race_refresh(gateway.store().clone());
        backend.expire_access();

        let data = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap();

        assert_eq!(data["token"], "A2");
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(
            gateway.get_credentials().await,
            Some(CredentialPair::new("A2", "R2"))
        );
        assert_eq!(
            gateway.refresh_phase(),
            RefreshPhase::Settled(RefreshOutcome::Success)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_abandons_queued_requests() {
        let backend = FakeBackend::new();
        backend.set_refresh_delay(Duration::from_secs(60));
        let gateway = signed_in(&backend).await;
        backend.expire_access();

        let leader = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.dispatch(RequestDescriptor::get("/orders/0")).await })
        };
        while !gateway.refresh_in_progress() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut waiters = Vec::new();
        for i in 1..=2 {
            let gateway = gateway.clone();
            waiters.push(tokio::spawn(async move {
                gateway.dispatch(RequestDescriptor::get(format!("/orders/{}", i))).await
            }));
        }
        while gateway.refresh_phase() != (RefreshPhase::Refreshing { queued: 2 }) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, GatewayError::RefreshAbandoned));
        }
        assert!(matches!(
            gateway.refresh_phase(),
            RefreshPhase::Settled(RefreshOutcome::Failed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_is_a_failure() {
        let backend = FakeBackend::new();
        backend.set_refresh_delay(Duration::from_secs(60));
        let mut config = FakeBackend::config();
        config.refresh_timeout_secs = 5;
        let gateway = gateway_with(&backend, config);
        gateway.set_credentials(&backend.issue()).await;
        backend.expire_access();

        let err = gateway.dispatch(RequestDescriptor::get("/orders")).await.unwrap_err();

        match err {
            GatewayError::ReauthRequired(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(gateway.get_credentials().await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_decodes_data() {
        #[derive(Deserialize)]
        struct Echo {
            path: String,
            token: String,
        }

        let backend = FakeBackend::new();
        let gateway = signed_in(&backend).await;

        let echo: Echo = gateway.fetch(RequestDescriptor::get("/menu")).await.unwrap();

        assert_eq!(echo.path, "/menu");
        assert_eq!(echo.token, "A1");
    }

    #[test]
    fn test_put_header_replaces_case_insensitively() {
        let mut headers = Vec::new();
        put_header(&mut headers, "X-Tenant-Id", "a".into());
        put_header(&mut headers, "x-tenant-id", "b".into());
        assert_eq!(headers, vec![("x-tenant-id".to_string(), "b".to_string())]);
    }
}
