use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fabric F-series size tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sku {
    F2,
    F4,
    F8,
    F16,
    F32,
    F64,
    F128,
    F256,
    F512,
    F1024,
    F2048,
    /// A tier this build does not know about, kept verbatim.
    Other(String),
}

impl Sku {
    pub const ALL: [Sku; 11] = [
        Sku::F2,
        Sku::F4,
        Sku::F8,
        Sku::F16,
        Sku::F32,
        Sku::F64,
        Sku::F128,
        Sku::F256,
        Sku::F512,
        Sku::F1024,
        Sku::F2048,
    ];

    pub fn name(&self) -> &str {
        match self {
            Sku::F2 => "F2",
            Sku::F4 => "F4",
            Sku::F8 => "F8",
            Sku::F16 => "F16",
            Sku::F32 => "F32",
            Sku::F64 => "F64",
            Sku::F128 => "F128",
            Sku::F256 => "F256",
            Sku::F512 => "F512",
            Sku::F1024 => "F1024",
            Sku::F2048 => "F2048",
            Sku::Other(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Sku::Other(_))
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Sku {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Ok(Sku::ALL
            .iter()
            .find(|k| k.name() == upper)
            .cloned()
            .unwrap_or_else(|| Sku::Other(s.trim().to_string())))
    }
}

impl Serialize for Sku {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Sku {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(raw.parse().unwrap_or(Sku::Other(raw)))
    }
}

/// Operational state. Anything that is neither running nor paused
/// (`Resuming`, `Pausing`, `Updating`, ...) is transitional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityState {
    Active,
    Paused,
    Transitional(String),
}

impl CapacityState {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.eq_ignore_ascii_case("active") => CapacityState::Active,
            Some(s) if s.eq_ignore_ascii_case("paused") => CapacityState::Paused,
            Some(s) if !s.is_empty() => CapacityState::Transitional(s.to_string()),
            _ => CapacityState::Transitional("Unknown".into()),
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, CapacityState::Transitional(_))
    }
}

impl fmt::Display for CapacityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityState::Active => f.write_str("Active"),
            CapacityState::Paused => f.write_str("Paused"),
            CapacityState::Transitional(s) => f.write_str(s),
        }
    }
}

impl Serialize for CapacityState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// ── ARM wire shape ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ArmSku {
    pub name: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ArmCapacityProperties {
    pub state: Option<String>,
    #[serde(rename = "provisioningState")]
    pub provisioning_state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArmCapacity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub sku: ArmSku,
    #[serde(default)]
    pub properties: ArmCapacityProperties,
}

// ── Domain type ──────────────────────────────────────────────

/// A capacity as shown to the user, annotated with its owning subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capacity {
    /// Full ARM resource id, the stable identity used for selection.
    pub id: String,
    pub name: String,
    pub subscription_id: String,
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub sku: Sku,
    pub state: CapacityState,
    pub label: String,
}

impl Capacity {
    pub fn from_arm(raw: ArmCapacity, subscription_id: &str) -> Self {
        let sku: Sku = raw.sku.name.parse().unwrap_or(Sku::Other(raw.sku.name.clone()));
        let state = CapacityState::parse(
            raw.properties
                .state
                .as_deref()
                .or(raw.properties.provisioning_state.as_deref()),
        );
        let label = Self::make_label(&raw.name, &sku, &state);
        Self {
            resource_group: resource_group_of(&raw.id),
            id: raw.id,
            name: raw.name,
            subscription_id: subscription_id.to_string(),
            location: raw.location,
            sku,
            state,
            label,
        }
    }

    pub fn make_label(name: &str, sku: &Sku, state: &CapacityState) -> String {
        format!("{} ({}) - {}", name, sku, state)
    }
}

/// `/subscriptions/x/resourceGroups/rg/providers/...` → `rg`.
fn resource_group_of(id: &str) -> Option<String> {
    let mut segments = id.split('/');
    while let Some(seg) = segments.next() {
        if seg.eq_ignore_ascii_case("resourceGroups") {
            return segments.next().filter(|s| !s.is_empty()).map(String::from);
        }
    }
    None
}
