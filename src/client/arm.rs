//! Azure Resource Manager endpoints for subscriptions and Fabric capacities.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use super::{ApiClient, ApiResponse};
use crate::config::Config;
use crate::errors::ControllerError;
use crate::models::capacity::ArmCapacity;
use crate::models::{ArmPage, Capacity, Sku, Subscription};

/// Upper bound on `nextLink` hops for a single listing.
const MAX_PAGES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Resume,
    Suspend,
}

impl PowerAction {
    pub fn verb(&self) -> &'static str {
        match self {
            PowerAction::Resume => "resume",
            PowerAction::Suspend => "suspend",
        }
    }
}

pub struct ArmClient {
    api: Arc<ApiClient>,
    config: Arc<Config>,
}

impl ArmClient {
    pub fn new(api: Arc<ApiClient>, config: Arc<Config>) -> Self {
        Self { api, config }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    fn base(&self) -> &str {
        &self.config.arm_base_url
    }

    /// True if `link` points at the configured ARM host. The bearer token is
    /// attached to every page, so it must never follow a link elsewhere.
    fn same_origin(&self, link: &str) -> bool {
        match (Url::parse(self.base()), Url::parse(link)) {
            (Ok(base), Ok(link)) => base.origin() == link.origin(),
            _ => false,
        }
    }

    /// Follow `nextLink` until the listing is exhausted.
    async fn list_all<T: DeserializeOwned>(&self, first: String) -> Result<Vec<T>, ControllerError> {
        let mut out = Vec::new();
        let mut next = Some(first);
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                tracing::warn!("stopping pagination after {} pages", MAX_PAGES);
                self.api.log().info(format!(
                    "Listing truncated after {} pages; results may be incomplete",
                    MAX_PAGES
                ));
                break;
            }
            let value = match self.api.get(&url).await? {
                ApiResponse::Json(v) => v,
                ApiResponse::Accepted => break,
            };
            let page: ArmPage<T> = serde_json::from_value(value).map_err(|e| ControllerError::Api {
                status: 200,
                reason: format!("unexpected listing shape: {}", e),
            })?;
            out.extend(page.value);
            next = page.next_link.filter(|l| !l.is_empty());
            if let Some(link) = next.as_deref() {
                if !self.same_origin(link) {
                    tracing::warn!(next_link = link, "refusing nextLink outside the ARM endpoint");
                    self.api
                        .log()
                        .error("Listing stopped: nextLink points outside the management endpoint");
                    next = None;
                }
            }
        }
        Ok(out)
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ControllerError> {
        let url = format!(
            "{}/subscriptions?api-version={}",
            self.base(),
            self.config.subscriptions_api_version
        );
        self.list_all(url).await
    }

    /// Capacities in one subscription. A 404 means the resource provider is
    /// not registered there, which is an empty result, not an error.
    pub async fn list_capacities(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<Capacity>, ControllerError> {
        let url = format!(
            "{}/subscriptions/{}/providers/{}/capacities?api-version={}",
            self.base(),
            urlencoding::encode(subscription_id),
            self.config.provider_namespace,
            self.config.capacities_api_version
        );
        match self.list_all::<ArmCapacity>(url).await {
            Ok(raw) => Ok(raw
                .into_iter()
                .map(|c| Capacity::from_arm(c, subscription_id))
                .collect()),
            Err(ControllerError::Api { status: 404, .. }) => {
                tracing::debug!(subscription_id, "capacity provider not available");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn resource_url(&self, capacity_id: &str, suffix: &str) -> String {
        format!(
            "{}{}{}?api-version={}",
            self.base(),
            capacity_id,
            suffix,
            self.config.capacities_api_version
        )
    }

    pub async fn set_power(
        &self,
        capacity_id: &str,
        action: PowerAction,
    ) -> Result<ApiResponse, ControllerError> {
        let url = self.resource_url(capacity_id, &format!("/{}", action.verb()));
        self.api.call(Method::POST, &url, None).await
    }

    pub async fn update_sku(
        &self,
        capacity_id: &str,
        sku: &Sku,
    ) -> Result<ApiResponse, ControllerError> {
        let url = self.resource_url(capacity_id, "");
        let body = json!({ "sku": { "name": sku.name(), "tier": "Fabric" } });
        self.api.call(Method::PATCH, &url, Some(&body)).await
    }
}
