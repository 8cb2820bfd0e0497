pub mod capacity;
pub mod subscription;

pub use capacity::{Capacity, CapacityState, Sku};
pub use subscription::Subscription;

use serde::Deserialize;

/// ARM list envelope: `{"value": [...], "nextLink": "..."}`.
#[derive(Debug, Deserialize)]
pub struct ArmPage<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "nextLink")]
    pub next_link: Option<String>,
}
