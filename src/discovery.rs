//! Cross-subscription capacity discovery.
//!
//! One bad subscription never fails the pass: its error is logged and it
//! contributes nothing. Only one pass may run at a time; a second request
//! while one is in flight gets [`ControllerError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;

use crate::activity::ActivityLog;
use crate::client::arm::ArmClient;
use crate::errors::ControllerError;
use crate::models::{Capacity, Subscription};

pub struct DiscoveryEngine {
    arm: Arc<ArmClient>,
    log: ActivityLog,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DiscoveryEngine {
    pub fn new(arm: Arc<ArmClient>, log: ActivityLog) -> Self {
        Self {
            arm,
            log,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<PassGuard<'_>, ControllerError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| PassGuard(&self.in_flight))
            .map_err(|_| ControllerError::Busy)
    }

    /// List every subscription, then every capacity in each.
    pub async fn discover_all(&self) -> Result<Vec<Capacity>, ControllerError> {
        let _pass = self.begin()?;
        self.discover_all_inner().await
    }

    async fn discover_all_inner(&self) -> Result<Vec<Capacity>, ControllerError> {
        let subscriptions = self.arm.list_subscriptions().await?;
        self.log.debug(format!("Found {} subscription(s)", subscriptions.len()));
        let ids: Vec<(String, String)> = subscriptions
            .iter()
            .map(|s: &Subscription| (s.subscription_id.clone(), s.label().to_string()))
            .collect();
        Ok(self.collect(&ids).await)
    }

    /// Re-query only the subscriptions already known. With none known,
    /// this is a full discovery.
    pub async fn refresh(&self, known_scope_ids: &[String]) -> Result<Vec<Capacity>, ControllerError> {
        let _pass = self.begin()?;
        if known_scope_ids.is_empty() {
            return self.discover_all_inner().await;
        }
        let ids: Vec<(String, String)> = known_scope_ids
            .iter()
            .map(|id| (id.clone(), id.clone()))
            .collect();
        Ok(self.collect(&ids).await)
    }

    /// Query each subscription concurrently; results keep subscription order.
    async fn collect(&self, scopes: &[(String, String)]) -> Vec<Capacity> {
        let results = join_all(
            scopes
                .iter()
                .map(|(id, _)| self.arm.list_capacities(id)),
        )
        .await;

        let mut capacities = Vec::new();
        for ((id, label), result) in scopes.iter().zip(results) {
            match result {
                Ok(found) => {
                    self.log
                        .debug(format!("{}: {} capacit(ies)", label, found.len()));
                    capacities.extend(found);
                }
                Err(e) => {
                    tracing::warn!(subscription_id = %id, "capacity listing failed: {}", e);
                    self.log
                        .debug(format!("Skipping subscription {}: {}", label, e));
                }
            }
        }
        capacities
    }
}

/// Subscriptions represented in an inventory, in first-seen order.
pub fn known_scopes(capacities: &[Capacity]) -> Vec<String> {
    let mut seen = Vec::new();
    for c in capacities {
        if !seen.contains(&c.subscription_id) {
            seen.push(c.subscription_id.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{signed_in_client, ScriptedBroker};
    use crate::config::Config;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capacity_json(sub: &str, name: &str) -> serde_json::Value {
        json!({
            "id": format!("/subscriptions/{}/resourceGroups/rg/providers/Microsoft.Fabric/capacities/{}", sub, name),
            "name": name,
            "sku": {"name": "F2"},
            "properties": {"state": "Active"}
        })
    }

    async fn mount_capacities(server: &MockServer, sub: &str, names: &[&str]) {
        let value: Vec<_> = names.iter().map(|n| capacity_json(sub, n)).collect();
        Mock::given(method("GET"))
            .and(path(format!("/subscriptions/{}/providers/Microsoft.Fabric/capacities", sub)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": value })))
            .mount(server)
            .await;
    }

    async fn engine(server: &MockServer) -> DiscoveryEngine {
        engine_with(server, Arc::new(ScriptedBroker::new(true))).await
    }

    async fn engine_with(server: &MockServer, broker: Arc<ScriptedBroker>) -> DiscoveryEngine {
        let api = signed_in_client(server, broker).await;
        let arm = ArmClient::new(
            Arc::new(api),
            Arc::new(Config::for_base_url("cid", &server.uri())),
        );
        DiscoveryEngine::new(Arc::new(arm), ActivityLog::new(true))
    }

    #[tokio::test]
    async fn test_one_failing_scope_does_not_sink_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"subscriptionId": "s1"},
                    {"subscriptionId": "bad"},
                    {"subscriptionId": "s3"}
                ]
            })))
            .mount(&server)
            .await;
        mount_capacities(&server, "s1", &["a", "b"]).await;
        mount_capacities(&server, "s3", &["c"]).await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/bad/providers/Microsoft.Fabric/capacities"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let caps = engine(&server).await.discover_all().await.unwrap();
        let names: Vec<_> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_parallel_401s_share_one_interactive_sign_in() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"subscriptionId": "s1"},
                    {"subscriptionId": "s2"},
                    {"subscriptionId": "s3"}
                ]
            })))
            .mount(&server)
            .await;
        for sub in ["s1", "s2", "s3"] {
            Mock::given(method("GET"))
                .and(path(format!("/subscriptions/{}/providers/Microsoft.Fabric/capacities", sub)))
                .and(header("authorization", "Bearer interactive-0"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/subscriptions/{}/providers/Microsoft.Fabric/capacities", sub)))
                .and(header("authorization", "Bearer interactive-1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "value": [capacity_json(sub, "c")]
                })))
                .mount(&server)
                .await;
        }

        let broker = Arc::new(ScriptedBroker::new(false));
        let caps = engine_with(&server, broker.clone())
            .await
            .discover_all()
            .await
            .unwrap();

        assert_eq!(caps.len(), 3);
        // the initial sign-in plus exactly one for the whole burst
        assert_eq!(broker.interactive.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_queries_known_scopes_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(0)
            .mount(&server)
            .await;
        mount_capacities(&server, "s1", &["a"]).await;

        let caps = engine(&server)
            .await
            .refresh(&["s1".to_string()])
            .await
            .unwrap();
        assert_eq!(caps.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_known_scopes_is_full_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"subscriptionId": "s1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_capacities(&server, "s1", &["a"]).await;

        let caps = engine(&server).await.refresh(&[]).await.unwrap();
        assert_eq!(caps[0].name, "a");
    }

    #[tokio::test]
    async fn test_second_pass_while_running_is_busy() {
        let server = MockServer::start().await;
        let engine = engine(&server).await;
        let _held = engine.begin().unwrap();
        assert!(matches!(engine.discover_all().await, Err(ControllerError::Busy)));
        drop(_held);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_known_scopes_dedup_in_order() {
        let mk = |sub: &str| Capacity {
            id: format!("/{}", sub),
            name: "x".into(),
            subscription_id: sub.into(),
            resource_group: None,
            location: None,
            sku: crate::models::Sku::F2,
            state: crate::models::CapacityState::Active,
            label: String::new(),
        };
        let inv = vec![mk("s2"), mk("s1"), mk("s2")];
        assert_eq!(known_scopes(&inv), vec!["s2".to_string(), "s1".to_string()]);
    }
}
