//! Full session flow against a mock HTTP backend

use std::sync::Arc;

use serde_json::{json, Value};
use session_gate::config::ClientConfig;
use session_gate::gateway::{
    CredentialPair, GatewayError, ReqwestTransport, RequestDescriptor,
};
use session_gate::storage::MemoryStorage;
use session_gate::SessionContext;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn envelope(data: Value) -> Value {
    json!({ "data": data, "result": { "statusCode": 200, "description": null, "details": null } })
}

fn context(server: &MockServer) -> SessionContext {
    SessionContext::new(
        ClientConfig::with_base_url(server.uri()),
        Arc::new(MemoryStorage::new()),
        Arc::new(ReqwestTransport::new()),
    )
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({ "username": "ana", "password": "secret" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(json!({ "accessToken": "A1", "refreshToken": "R1" }))),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once_and_retried() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("Authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(json!({ "accessToken": "A2", "refreshToken": "R2" }))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("Authorization", "Bearer A2"))
        .and(header("Accept-Language", "en"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([{ "id": 1 }]))))
        .expect(1)
        .mount(&server)
        .await;

    let context = context(&server);
    let initial = context.gateway.login("ana", "secret").await.unwrap();
    assert_eq!(initial, CredentialPair::new("A1", "R1"));

    let orders = context
        .gateway
        .dispatch(RequestDescriptor::get("/orders"))
        .await
        .unwrap();

    assert_eq!(orders, json!([{ "id": 1 }]));
    assert_eq!(context.gateway.refresh_count(), 1);
    let stored = context.gateway.get_credentials().await.unwrap();
    assert_ne!(stored, initial);
    assert_eq!(stored, CredentialPair::new("A2", "R2"));
}

#[tokio::test]
async fn test_rejected_refresh_signs_out() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "data": null,
            "result": { "statusCode": 401, "description": "Refresh token expired", "details": null }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let context = context(&server);
    context.gateway.login("ana", "secret").await.unwrap();

    let err = context
        .gateway
        .dispatch(RequestDescriptor::get("/orders"))
        .await
        .unwrap_err();

    assert!(err.is_reauth_required());
    assert!(context.gateway.get_credentials().await.is_none());
}

#[tokio::test]
async fn test_domain_failure_in_successful_response() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "result": { "statusCode": 409, "description": "Duplicate SKU", "details": { "sku": "X-1" } }
        })))
        .mount(&server)
        .await;

    let context = context(&server);
    context.gateway.login("ana", "secret").await.unwrap();

    let err = context
        .gateway
        .dispatch(RequestDescriptor::post("/products").with_body(json!({ "sku": "X-1" })))
        .await
        .unwrap_err();

    match err {
        GatewayError::DomainFailure {
            status_code,
            description,
            details,
        } => {
            assert_eq!(status_code, 409);
            assert_eq!(description, "Duplicate SKU");
            assert_eq!(details, Some(json!({ "sku": "X-1" })));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(context.gateway.refresh_count(), 0);
}

#[tokio::test]
async fn test_restore_after_login_uses_fetched_profile() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/users/me"))
        .and(header("Authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "id": "u-1",
            "tenantId": "t-1",
            "version": 2,
            "displayName": "Ana"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let context = context(&server);
    let user = context.coordinator.login("ana", "secret").await.unwrap();
    assert_eq!(user.tenant_id.as_deref(), Some("t-1"));

    // Cached profile: no second profile request
    let state = context.coordinator.restore().await;
    assert_eq!(state.user().map(|u| u.version), Some(2));
}
