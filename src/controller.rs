//! Session controller: inventory, selection, and user intents.
//!
//! Holds the capacity list produced by the last discovery pass and the id
//! of the selected capacity. The list is rebuilt on every pass, so the
//! selection is always re-resolved by id, never by position.
//!
//! Every sign-out starts a new session generation. Discovery results and
//! scheduled refreshes that belong to an older generation are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::activity::ActivityLog;
use crate::auth::broker::AuthorizationBroker;
use crate::auth::{SessionContext, TokenManager};
use crate::client::arm::ArmClient;
use crate::client::{build_http, ApiClient};
use crate::clock::Clock;
use crate::config::Config;
use crate::discovery::{known_scopes, DiscoveryEngine};
use crate::errors::ControllerError;
use crate::models::{Capacity, CapacityState, Sku};
use crate::mutation::{Action, Confirmation, MutationMachine};
use crate::store::{CredentialStore, KeyValueStore};

#[derive(Debug, Default)]
struct Inventory {
    capacities: Vec<Capacity>,
    selected: Option<String>,
}

impl Inventory {
    fn replace(&mut self, capacities: Vec<Capacity>) {
        if let Some(id) = &self.selected {
            if !capacities.iter().any(|c| &c.id == id) {
                self.selected = None;
            }
        }
        self.capacities = capacities;
    }

    fn find(&self, id: &str) -> Option<&Capacity> {
        self.capacities.iter().find(|c| c.id == id)
    }

    fn selected_index(&self) -> Option<usize> {
        let id = self.selected.as_ref()?;
        self.capacities.iter().position(|c| &c.id == id)
    }
}

/// Which controls the UI should enable right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlState {
    pub start: bool,
    pub stop: bool,
    pub sku_select: bool,
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub capacities: Vec<Capacity>,
    pub selected: Option<String>,
    pub selected_index: Option<usize>,
    pub pending: Option<Action>,
    pub controls: ControlState,
}

pub struct Controller {
    config: Arc<Config>,
    tokens: Arc<TokenManager>,
    discovery: DiscoveryEngine,
    mutations: MutationMachine,
    log: ActivityLog,
    inventory: RwLock<Inventory>,
    generation: AtomicU64,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        tokens: Arc<TokenManager>,
        discovery: DiscoveryEngine,
        mutations: MutationMachine,
        log: ActivityLog,
    ) -> Self {
        Self {
            config,
            tokens,
            discovery,
            mutations,
            log,
            inventory: RwLock::new(Inventory::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Wire the token manager, client, discovery and mutation machine
    /// around one key/value store and one broker.
    pub async fn build(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        broker: Arc<dyn AuthorizationBroker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ControllerError> {
        let config = Arc::new(config);
        let store = CredentialStore::new(kv);
        let log = ActivityLog::new(store.debug_enabled().await);
        let http = build_http(&config)?;

        let tokens = Arc::new(TokenManager::new(
            config.clone(),
            store,
            broker,
            clock,
            log.clone(),
            http.clone(),
        ));
        let api = Arc::new(ApiClient::new(http, tokens.clone(), log.clone()));
        let arm = Arc::new(ArmClient::new(api, config.clone()));

        Ok(Arc::new(Self::new(
            config,
            tokens,
            DiscoveryEngine::new(arm.clone(), log.clone()),
            MutationMachine::new(arm),
            log,
        )))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Log a terminal failure exactly once and hand it back.
    fn report<T>(&self, op: &str, result: Result<T, ControllerError>) -> Result<T, ControllerError> {
        if let Err(e) = &result {
            self.log.error(format!("{} failed: {}", op, e));
        }
        result
    }

    pub async fn authenticate(&self) -> Result<Option<SessionContext>, ControllerError> {
        let result = self.tokens.get_valid_credential().await;
        self.report("Sign-in", result)?;
        Ok(self.tokens.session_context().await)
    }

    pub async fn session(&self) -> Option<SessionContext> {
        self.tokens.session_context().await
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the inventory unless the session changed since `generation`.
    fn install(&self, generation: u64, capacities: Vec<Capacity>) -> bool {
        if self.generation() != generation {
            self.log.debug("Discarding discovery results from a previous session");
            return false;
        }
        if let Ok(mut inv) = self.inventory.write() {
            inv.replace(capacities);
        }
        true
    }

    /// Full discovery across every subscription.
    pub async fn load(&self) -> Result<Snapshot, ControllerError> {
        self.log.info("Loading capacities");
        let generation = self.generation();
        match self.discovery.discover_all().await {
            Ok(caps) => {
                let count = caps.len();
                if self.install(generation, caps) {
                    self.log.success(format!("Loaded {} capacit(ies)", count));
                }
                Ok(self.snapshot())
            }
            Err(ControllerError::Busy) => {
                self.log.debug("Discovery already running; request coalesced");
                Ok(self.snapshot())
            }
            Err(e) => self.report("Loading capacities", Err(e)),
        }
    }

    /// Re-query the subscriptions already in the inventory. Ignored while
    /// a discovery pass or a mutation is in flight.
    pub async fn refresh(&self) -> Result<Snapshot, ControllerError> {
        if self.discovery.is_running() {
            self.log.debug("Refresh ignored; discovery already running");
            return Ok(self.snapshot());
        }
        if self.mutations.any_pending() {
            self.log.debug("Refresh ignored; a change is still pending");
            return Ok(self.snapshot());
        }
        self.refresh_known().await
    }

    async fn refresh_known(&self) -> Result<Snapshot, ControllerError> {
        let generation = self.generation();
        let scopes = self
            .inventory
            .read()
            .map(|inv| known_scopes(&inv.capacities))
            .unwrap_or_default();

        match self.discovery.refresh(&scopes).await {
            Ok(caps) => {
                let count = caps.len();
                if self.install(generation, caps) {
                    self.log.debug(format!("Refreshed {} capacit(ies)", count));
                }
                Ok(self.snapshot())
            }
            Err(ControllerError::Busy) => Ok(self.snapshot()),
            Err(e) => self.report("Refresh", Err(e)),
        }
    }

    /// Select by id; `None` clears the selection.
    pub fn select(&self, id: Option<&str>) -> Result<Snapshot, ControllerError> {
        {
            let mut inv = self
                .inventory
                .write()
                .map_err(|_| ControllerError::Rejected("inventory unavailable".into()))?;
            match id {
                Some(id) if inv.find(id).is_none() => {
                    return Err(ControllerError::Rejected(format!("unknown capacity '{}'", id)));
                }
                Some(id) => inv.selected = Some(id.to_string()),
                None => inv.selected = None,
            }
        }
        Ok(self.snapshot())
    }

    pub fn selected(&self) -> Option<Capacity> {
        let inv = self.inventory.read().ok()?;
        let id = inv.selected.as_ref()?;
        inv.find(id).cloned()
    }

    pub fn capacity(&self, id: &str) -> Option<Capacity> {
        self.inventory.read().ok()?.find(id).cloned()
    }

    pub fn controls(&self) -> ControlState {
        let refresh = !self.discovery.is_running() && !self.mutations.any_pending();
        let Some(cap) = self.selected() else {
            return ControlState {
                refresh,
                ..ControlState::default()
            };
        };
        let idle = !self.mutations.is_pending(&cap.id);
        ControlState {
            start: idle && cap.state != CapacityState::Active,
            stop: idle && cap.state != CapacityState::Paused,
            sku_select: idle,
            refresh,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let (capacities, selected, selected_index) = self
            .inventory
            .read()
            .map(|inv| (inv.capacities.clone(), inv.selected.clone(), inv.selected_index()))
            .unwrap_or_default();
        let pending = selected
            .as_deref()
            .and_then(|id| self.mutations.pending_action(id));
        Snapshot {
            capacities,
            selected,
            selected_index,
            pending,
            controls: self.controls(),
        }
    }

    fn resolve(&self, id: &str) -> Result<Capacity, ControllerError> {
        self.capacity(id)
            .ok_or_else(|| ControllerError::Rejected(format!("unknown capacity '{}'", id)))
    }

    pub async fn start(self: &Arc<Self>, id: &str) -> Result<JoinHandle<()>, ControllerError> {
        let cap = self.resolve(id)?;
        self.log.info(format!("Starting {}", cap.name));
        let result = self.mutations.request_start(&cap).await;
        self.finish(&cap, Action::Resume, result)
    }

    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<JoinHandle<()>, ControllerError> {
        let cap = self.resolve(id)?;
        self.log.info(format!("Stopping {}", cap.name));
        let result = self.mutations.request_stop(&cap).await;
        self.finish(&cap, Action::Suspend, result)
    }

    pub async fn change_sku(
        self: &Arc<Self>,
        id: &str,
        sku: Sku,
        confirm: &dyn Confirmation,
    ) -> Result<JoinHandle<()>, ControllerError> {
        let cap = self.resolve(id)?;
        let result = self.mutations.request_sku_change(&cap, &sku, confirm).await;
        if matches!(result, Err(ControllerError::ConfirmationDeclined)) {
            self.log.info(format!("Resize of {} cancelled", cap.name));
            return Err(ControllerError::ConfirmationDeclined);
        }
        self.finish(&cap, Action::Resize(sku), result)
    }

    fn finish<T>(
        self: &Arc<Self>,
        cap: &Capacity,
        action: Action,
        result: Result<T, ControllerError>,
    ) -> Result<JoinHandle<()>, ControllerError> {
        let op = format!("{} {}", capitalize(&action.to_string()), cap.name);
        self.report(&op, result)?;
        self.log.success(format!("{} accepted", op));
        Ok(self.schedule_refresh())
    }

    /// Refresh after the provider has had time to apply the change.
    /// Skipped if the user signed out in the meantime.
    pub fn schedule_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let delay = self.config.refresh_delay();
        let generation = self.generation();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.generation() != generation {
                this.log.debug("Scheduled refresh dropped; signed out since");
                return;
            }
            // errors are already reported inside refresh_known()
            let _ = this.refresh_known().await;
        })
    }

    pub async fn logout(&self) -> Result<(), ControllerError> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let result = self.tokens.logout().await;
        self.report("Sign-out", result)?;
        if let Ok(mut inv) = self.inventory.write() {
            *inv = Inventory::default();
        }
        Ok(())
    }

    pub async fn set_debug(&self, on: bool) -> Result<(), ControllerError> {
        self.tokens.store().set_debug(on).await?;
        self.log.set_debug(on);
        self.log.info(format!("Debug logging {}", if on { "enabled" } else { "disabled" }));
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(id: &str, state: CapacityState) -> Capacity {
        Capacity {
            id: id.into(),
            name: id.into(),
            subscription_id: "s1".into(),
            resource_group: None,
            location: None,
            sku: Sku::F2,
            label: Capacity::make_label(id, &Sku::F2, &state),
            state,
        }
    }

    #[test]
    fn test_selection_cleared_when_removed() {
        let mut inv = Inventory::default();
        inv.replace(vec![
            cap("A", CapacityState::Active),
            cap("B", CapacityState::Active),
            cap("C", CapacityState::Active),
        ]);
        inv.selected = Some("B".into());
        inv.replace(vec![cap("A", CapacityState::Active), cap("C", CapacityState::Active)]);
        assert_eq!(inv.selected, None);
    }

    #[test]
    fn test_selection_follows_id_on_reorder() {
        let mut inv = Inventory::default();
        inv.replace(vec![
            cap("A", CapacityState::Active),
            cap("B", CapacityState::Paused),
            cap("C", CapacityState::Active),
        ]);
        inv.selected = Some("B".into());
        assert_eq!(inv.selected_index(), Some(1));

        inv.replace(vec![
            cap("C", CapacityState::Active),
            cap("A", CapacityState::Active),
            cap("B", CapacityState::Active),
        ]);
        assert_eq!(inv.selected.as_deref(), Some("B"));
        assert_eq!(inv.selected_index(), Some(2));
        assert_eq!(inv.find("B").unwrap().state, CapacityState::Active);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("start"), "Start");
        assert_eq!(capitalize(""), "");
    }
}
