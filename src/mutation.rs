//! Start / stop / resize state machine.
//!
//! Per capacity: `Idle -> Pending(action) -> Idle`. The pending map is the
//! only mutual exclusion: a second request against a capacity that already
//! has one in flight is rejected with `Busy` before any network call.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

use crate::client::arm::{ArmClient, PowerAction};
use crate::client::ApiResponse;
use crate::errors::ControllerError;
use crate::models::{Capacity, CapacityState, Sku};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "sku", rename_all = "lowercase")]
pub enum Action {
    Resume,
    Suspend,
    Resize(Sku),
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Resume => f.write_str("start"),
            Action::Suspend => f.write_str("stop"),
            Action::Resize(sku) => write!(f, "resize to {}", sku),
        }
    }
}

/// Asks the user to approve a disruptive operation.
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Pre-approved, e.g. `--yes` or `"confirm": true` from the dashboard.
pub struct Approved;

#[async_trait]
impl Confirmation for Approved {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Refuses everything.
pub struct Declined;

#[async_trait]
impl Confirmation for Declined {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

pub struct MutationMachine {
    arm: Arc<ArmClient>,
    pending: DashMap<String, Action>,
}

/// Returns the capacity to `Idle` when dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, Action>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl MutationMachine {
    pub fn new(arm: Arc<ArmClient>) -> Self {
        Self {
            arm,
            pending: DashMap::new(),
        }
    }

    pub fn is_pending(&self, capacity_id: &str) -> bool {
        self.pending.contains_key(capacity_id)
    }

    pub fn any_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_action(&self, capacity_id: &str) -> Option<Action> {
        self.pending.get(capacity_id).map(|a| a.value().clone())
    }

    fn begin(&self, capacity_id: &str, action: Action) -> Result<PendingGuard<'_>, ControllerError> {
        match self.pending.entry(capacity_id.to_string()) {
            Entry::Occupied(_) => Err(ControllerError::Busy),
            Entry::Vacant(slot) => {
                slot.insert(action);
                Ok(PendingGuard {
                    pending: &self.pending,
                    id: capacity_id.to_string(),
                })
            }
        }
    }

    pub async fn request_start(&self, capacity: &Capacity) -> Result<ApiResponse, ControllerError> {
        if capacity.state == CapacityState::Active {
            return Err(ControllerError::Rejected(format!(
                "{} is already running",
                capacity.name
            )));
        }
        let _pending = self.begin(&capacity.id, Action::Resume)?;
        self.arm.set_power(&capacity.id, PowerAction::Resume).await
    }

    pub async fn request_stop(&self, capacity: &Capacity) -> Result<ApiResponse, ControllerError> {
        if capacity.state == CapacityState::Paused {
            return Err(ControllerError::Rejected(format!(
                "{} is already paused",
                capacity.name
            )));
        }
        let _pending = self.begin(&capacity.id, Action::Suspend)?;
        self.arm.set_power(&capacity.id, PowerAction::Suspend).await
    }

    /// Resizing a running capacity can interrupt workloads, so Active
    /// capacities need an affirmative answer from `confirm` first.
    pub async fn request_sku_change(
        &self,
        capacity: &Capacity,
        new_sku: &Sku,
        confirm: &dyn Confirmation,
    ) -> Result<ApiResponse, ControllerError> {
        if *new_sku == capacity.sku {
            return Err(ControllerError::Rejected(format!(
                "{} is already {}",
                capacity.name, new_sku
            )));
        }
        if !new_sku.is_known() {
            return Err(ControllerError::Rejected(format!(
                "unsupported sku '{}'",
                new_sku
            )));
        }
        if self.is_pending(&capacity.id) {
            return Err(ControllerError::Busy);
        }

        if capacity.state == CapacityState::Active {
            let prompt = format!(
                "{} is running. Resizing {} -> {} may interrupt active workloads. Continue?",
                capacity.name, capacity.sku, new_sku
            );
            if !confirm.confirm(&prompt).await {
                return Err(ControllerError::ConfirmationDeclined);
            }
        }

        let _pending = self.begin(&capacity.id, Action::Resize(new_sku.clone()))?;
        self.arm.update_sku(&capacity.id, new_sku).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{signed_in_client, ScriptedBroker};
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ID: &str = "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Fabric/capacities/c1";

    fn capacity(state: CapacityState, sku: Sku) -> Capacity {
        Capacity {
            id: ID.into(),
            name: "c1".into(),
            subscription_id: "s1".into(),
            resource_group: Some("rg".into()),
            location: None,
            label: Capacity::make_label("c1", &sku, &state),
            sku,
            state,
        }
    }

    async fn machine(server: &MockServer) -> MutationMachine {
        let api = signed_in_client(server, Arc::new(ScriptedBroker::new(true))).await;
        MutationMachine::new(Arc::new(ArmClient::new(
            Arc::new(api),
            Arc::new(Config::for_base_url("cid", &server.uri())),
        )))
    }

    struct CountingConfirm(AtomicUsize, bool);

    #[async_trait]
    impl Confirmation for CountingConfirm {
        async fn confirm(&self, _prompt: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1
        }
    }

    #[tokio::test]
    async fn test_double_start_issues_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/resume", ID)))
            .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let m = machine(&server).await;
        let cap = capacity(CapacityState::Paused, Sku::F2);
        let (a, b) = tokio::join!(m.request_start(&cap), m.request_start(&cap));

        let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(ControllerError::Busy)))
            .count();
        assert_eq!((oks, busy), (1, 1));
        assert!(!m.is_pending(ID), "back to idle after completion");
    }

    #[tokio::test]
    async fn test_start_rejected_when_active() {
        let server = MockServer::start().await;
        let m = machine(&server).await;
        let err = m
            .request_start(&capacity(CapacityState::Active, Sku::F2))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_stop_rejected_when_paused() {
        let server = MockServer::start().await;
        let m = machine(&server).await;
        let err = m
            .request_stop(&capacity(CapacityState::Paused, Sku::F2))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_same_sku_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;
        let m = machine(&server).await;
        let err = m
            .request_sku_change(&capacity(CapacityState::Paused, Sku::F8), &Sku::F8, &Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_resize_active_requires_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(ID))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let m = machine(&server).await;
        let cap = capacity(CapacityState::Active, Sku::F8);

        let no = CountingConfirm(AtomicUsize::new(0), false);
        assert!(matches!(
            m.request_sku_change(&cap, &Sku::F16, &no).await,
            Err(ControllerError::ConfirmationDeclined)
        ));
        assert_eq!(no.0.load(Ordering::SeqCst), 1);

        let yes = CountingConfirm(AtomicUsize::new(0), true);
        m.request_sku_change(&cap, &Sku::F16, &yes).await.unwrap();
        assert_eq!(yes.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resize_paused_skips_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(ID))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let m = machine(&server).await;
        let never = CountingConfirm(AtomicUsize::new(0), false);
        m.request_sku_change(&capacity(CapacityState::Paused, Sku::F8), &Sku::F4, &never)
            .await
            .unwrap();
        assert_eq!(never.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_returns_to_idle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/suspend", ID)))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let m = machine(&server).await;
        let cap = capacity(CapacityState::Active, Sku::F2);
        assert!(m.request_stop(&cap).await.is_err());
        assert!(!m.is_pending(ID));
        assert!(!m.any_pending());
    }
}
