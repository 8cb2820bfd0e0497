use serde::{Deserialize, Serialize};

/// An accessible subscription (the top-level scope capacities live under).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(default)]
    pub state: Option<String>,
}

impl Subscription {
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.subscription_id
        } else {
            &self.display_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_arm_subscription() {
        let s: Subscription = serde_json::from_str(
            r#"{"id":"/subscriptions/s1","subscriptionId":"s1","displayName":"Prod","state":"Enabled","tenantId":"t"}"#,
        )
        .unwrap();
        assert_eq!(s.subscription_id, "s1");
        assert_eq!(s.label(), "Prod");
        assert_eq!(s.state.as_deref(), Some("Enabled"));
    }

    #[test]
    fn test_label_falls_back_to_id() {
        let s: Subscription = serde_json::from_str(r#"{"subscriptionId":"s2"}"#).unwrap();
        assert_eq!(s.label(), "s2");
    }
}
