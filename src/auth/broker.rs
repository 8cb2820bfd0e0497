//! Interactive round-trip with the identity provider.
//!
//! The implicit grant returns the token in the URL fragment, which the
//! browser never sends to a server. The loopback broker therefore serves
//! a tiny page on the redirect URI that posts `location.hash` back to the
//! same listener, then shuts the listener down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

use super::authorize::AuthorizeRequest;

const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);
const SILENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Silent mode is not available through this broker.
    #[error("silent authorization unavailable")]
    SilentUnavailable,

    #[error("authorization window closed or timed out")]
    Cancelled,

    #[error("redirect listener failed: {0}")]
    Listener(String),
}

/// Opens the provider's authorize URL and returns the redirect it lands on.
#[async_trait]
pub trait AuthorizationBroker: Send + Sync {
    /// Returns the full redirect URL (or bare fragment) from the provider.
    async fn authorize(&self, request: &AuthorizeRequest) -> Result<String, BrokerError>;
}

/// Broker that listens on the loopback redirect URI.
pub struct LoopbackBroker {
    redirect_uri: Url,
    silent_browser: bool,
}

type FragmentSlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

const CALLBACK_PAGE: &str = r#"<!doctype html>
<html><head><meta charset="utf-8"><title>capctl</title></head>
<body><p id="m">Completing sign-in…</p>
<script>
fetch(window.location.pathname + "/capture", {method: "POST", body: window.location.hash.substring(1)})
  .then(function () { document.getElementById("m").textContent = "Signed in. You can close this window."; })
  .catch(function () { document.getElementById("m").textContent = "Could not hand the token back to capctl."; });
</script></body></html>"#;

impl LoopbackBroker {
    pub fn new(redirect_uri: &str, silent_browser: bool) -> Result<Self, BrokerError> {
        let redirect_uri =
            Url::parse(redirect_uri).map_err(|e| BrokerError::Listener(e.to_string()))?;
        Ok(Self {
            redirect_uri,
            silent_browser,
        })
    }

    fn bind_addr(&self) -> Result<String, BrokerError> {
        let host = self
            .redirect_uri
            .host_str()
            .ok_or_else(|| BrokerError::Listener("redirect URI has no host".into()))?;
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        let port = self.redirect_uri.port_or_known_default().unwrap_or(80);
        Ok(format!("{}:{}", host, port))
    }

    fn router(&self, slot: FragmentSlot) -> Router {
        let path = match self.redirect_uri.path() {
            "" | "/" => "/callback".to_string(),
            p => p.trim_end_matches('/').to_string(),
        };
        Router::new()
            .route(&path, get(|| async { Html(CALLBACK_PAGE) }))
            .route(&format!("{}/capture", path), post(capture))
            .with_state(slot)
    }
}

async fn capture(State(slot): State<FragmentSlot>, body: String) -> &'static str {
    if let Ok(mut guard) = slot.lock() {
        if let Some(tx) = guard.take() {
            let _ = tx.send(body);
        }
    }
    "ok"
}

/// Best effort; the URL is always printed as well.
fn open_browser(url: &str) {
    let result = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).spawn()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()
    } else {
        std::process::Command::new("xdg-open").arg(url).spawn()
    };
    if let Err(e) = result {
        tracing::debug!("could not launch browser: {}", e);
    }
}

#[async_trait]
impl AuthorizationBroker for LoopbackBroker {
    async fn authorize(&self, request: &AuthorizeRequest) -> Result<String, BrokerError> {
        let silent = request.prompt.is_silent();
        if silent && !self.silent_browser {
            return Err(BrokerError::SilentUnavailable);
        }

        let (tx, rx) = oneshot::channel::<String>();
        let slot: FragmentSlot = Arc::new(Mutex::new(Some(tx)));
        let app = self.router(slot);

        let listener = tokio::net::TcpListener::bind(self.bind_addr()?)
            .await
            .map_err(|e| BrokerError::Listener(e.to_string()))?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        if !silent {
            eprintln!("Opening the sign-in page. If no browser appears, visit:\n  {}", request.url);
        }
        open_browser(request.url.as_str());

        let wait = if silent { SILENT_TIMEOUT } else { INTERACTIVE_TIMEOUT };
        let outcome = tokio::time::timeout(wait, rx).await;

        let _ = stop_tx.send(());
        if let Err(e) = server.await {
            tracing::debug!("redirect listener task ended abnormally: {}", e);
        }

        match outcome {
            Ok(Ok(fragment)) => Ok(fragment),
            Ok(Err(_)) | Err(_) => Err(BrokerError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorize::{build, Prompt};
    use crate::config::Config;

    #[tokio::test]
    async fn test_silent_unavailable_without_browser_opt_in() {
        let cfg = Config::for_base_url("cid", "http://localhost");
        let broker = LoopbackBroker::new(&cfg.redirect_uri, false).unwrap();
        let req = build(&cfg, crate::config::MANAGEMENT_SCOPE, Prompt::None).unwrap();
        assert!(matches!(
            broker.authorize(&req).await,
            Err(BrokerError::SilentUnavailable)
        ));
    }

    #[test]
    fn test_bind_addr_maps_localhost() {
        let broker = LoopbackBroker::new("http://localhost:8400/callback", false).unwrap();
        assert_eq!(broker.bind_addr().unwrap(), "127.0.0.1:8400");
    }

    #[tokio::test]
    async fn test_capture_hands_fragment_over_once() {
        let (tx, rx) = oneshot::channel();
        let slot: FragmentSlot = Arc::new(Mutex::new(Some(tx)));
        capture(State(slot.clone()), "access_token=a".into()).await;
        capture(State(slot), "access_token=b".into()).await;
        assert_eq!(rx.await.unwrap(), "access_token=a");
    }
}
