//! Resilient control-plane client.
//!
//! Every call carries the manager's current bearer token. A 401 gets one
//! silent renewal and one retry; if that does not clear it, one interactive
//! sign-in and one more retry. Nothing else is retried.

pub mod arm;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;

use crate::activity::ActivityLog;
use crate::auth::{Credential, TokenManager};
use crate::config::Config;
use crate::errors::{ControllerError, PermissionReason};

/// Outcome of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(Value),
    /// 2xx with no body, e.g. 202 on resume/suspend.
    Accepted,
}

impl ApiResponse {
    pub fn into_json(self) -> Option<Value> {
        match self {
            ApiResponse::Json(v) => Some(v),
            ApiResponse::Accepted => None,
        }
    }
}

pub fn build_http(config: &Config) -> Result<Client, ControllerError> {
    Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("capctl/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ControllerError::Transport(format!("failed to build HTTP client: {}", e)))
}

pub struct ApiClient {
    http: Client,
    tokens: Arc<TokenManager>,
    log: ActivityLog,
}

impl ApiClient {
    pub fn new(http: Client, tokens: Arc<TokenManager>, log: ActivityLog) -> Self {
        Self { http, tokens, log }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        cred: &Credential,
    ) -> Result<Response, ControllerError> {
        let mut req = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, cred.bearer())
            .header(reqwest::header::ACCEPT, "application/json")
            .header("x-ms-client-request-id", uuid::Uuid::new_v4().to_string());
        if let Some(b) = body {
            req = req.json(b);
        }
        req.send().await.map_err(|e| {
            tracing::warn!("{} {} failed: {}", method, url, e);
            ControllerError::Transport(e.to_string())
        })
    }

    /// Issue `method url` with an optional JSON body and parse the result.
    pub async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ControllerError> {
        let cred = self.tokens.get_valid_credential().await?;
        let mut resp = self.send(&method, url, body, &cred).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            self.log
                .debug(format!("{} {} returned 401; renewing token", method, url));
            let mut rejected = cred.fingerprint;
            let mut retried = false;
            if let Some(fresh) = self.tokens.renew_silently(Some(&rejected)).await {
                resp = self.send(&method, url, body, &fresh).await?;
                rejected = fresh.fingerprint;
                retried = true;
            }
            if !retried || resp.status() == StatusCode::UNAUTHORIZED {
                let fresh = self.tokens.acquire_interactive(Some(&rejected)).await?;
                resp = self.send(&method, url, body, &fresh).await?;
            }
            if resp.status() == StatusCode::UNAUTHORIZED {
                return Err(ControllerError::Authorization);
            }
        }

        parse_response(resp).await
    }

    pub async fn get(&self, url: &str) -> Result<ApiResponse, ControllerError> {
        self.call(Method::GET, url, None).await
    }
}

/// Pull `error.message` (ARM) or `error_description` (identity platform) out of a body.
fn error_detail(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.pointer("/error/message")
        .or_else(|| v.get("error_description"))
        .or_else(|| v.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}

async fn parse_response(resp: Response) -> Result<ApiResponse, ControllerError> {
    let status = resp.status();
    let body = resp.text().await?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(ApiResponse::Accepted);
        }
        return serde_json::from_str(&body)
            .map(ApiResponse::Json)
            .map_err(|e| ControllerError::Api {
                status: status.as_u16(),
                reason: format!("unparsable response body: {}", e),
            });
    }

    if status == StatusCode::FORBIDDEN {
        return Err(ControllerError::PermissionDenied(PermissionReason::classify(
            &body,
        )));
    }

    let reason = error_detail(&body)
        .or_else(|| status.canonical_reason().map(String::from))
        .unwrap_or_else(|| "unknown error".into());
    Err(ControllerError::Api {
        status: status.as_u16(),
        reason,
    })
}
