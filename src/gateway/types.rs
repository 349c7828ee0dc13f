//! Request, credential and response envelope types

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::SecretString;

/// Result code the backend uses for success
pub const SUCCESS_CODE: i64 = 200;
/// Result code the backend uses for "not authorized"
pub const UNAUTHORIZED_CODE: i64 = 401;

/// Access/refresh token pair issued by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<SecretString>, refresh_token: impl Into<SecretString>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: SecretString,
}

/// Refresh request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a SecretString,
}

/// Outbound request as the application describes it
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Path relative to the configured base address, or an absolute URL
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Applied after the gateway's own headers, so they can override them
    pub headers: Vec<(String, String)>,
    /// Send without credentials. Login and refresh calls set this so they
    /// cannot recurse into the refresh protocol.
    pub skip_auth: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
            headers: Vec::new(),
            skip_auth: false,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    /// Sets a JSON body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Marks the request as unauthenticated
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Result block of the response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResult {
    pub status_code: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// `{ data, result }` envelope every backend response is wrapped in
///
/// A 2xx transport status and a non-200 `result.statusCode` is still a
/// failure; both signals are checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub data: Value,
    pub result: ApiResult,
}

impl ApiEnvelope {
    /// Successful envelope around `data`
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            result: ApiResult {
                status_code: SUCCESS_CODE,
                description: None,
                details: None,
            },
        }
    }

    /// Failed envelope with the given code and description
    pub fn failure(status_code: i64, description: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            result: ApiResult {
                status_code,
                description: Some(description.into()),
                details: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.status_code == SUCCESS_CODE
    }
}
