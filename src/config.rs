use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Management-plane scope; the legacy minimal mode asks for this alone.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/user_impersonation";

/// Canonical scope set: management plus the Graph profile read.
pub const CANONICAL_SCOPES: &str =
    "https://management.azure.com/user_impersonation openid profile User.Read";

const MIN_RENEWAL_BUFFER_MINS: i64 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client_id: String,
    /// Tenant segment of the authorize URL (`organizations`, `common` or a tenant id).
    pub tenant: String,
    pub authority: String,
    pub redirect_uri: String,
    pub arm_base_url: String,
    pub subscriptions_api_version: String,
    pub capacities_api_version: String,
    /// Resource provider namespace that owns the capacities.
    pub provider_namespace: String,
    /// A cached token is usable only while `now < expires_at - renewal_buffer`.
    /// Set via CAPCTL_RENEWAL_BUFFER_MINS. Default: 5, never below 2.
    pub renewal_buffer_mins: i64,
    /// How often the proactive renewal job wakes up.
    pub renewal_interval_secs: u64,
    /// Remaining lifetime below which the renewal job renews silently.
    pub renewal_threshold_mins: i64,
    /// Delay between a successful mutation and the follow-up refresh.
    pub refresh_delay_ms: u64,
    pub store_path: PathBuf,
    pub http_timeout_secs: u64,
    /// Retry silent auth with the management scope alone before going interactive.
    pub legacy_scope_fallback: bool,
    /// Let the loopback broker open a browser with `prompt=none` for silent renewal.
    pub silent_browser: bool,
}

impl Config {
    pub fn renewal_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.renewal_buffer_mins.max(MIN_RENEWAL_BUFFER_MINS))
    }

    pub fn renewal_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.renewal_threshold_mins)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn authorize_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/authorize",
            self.authority.trim_end_matches('/'),
            self.tenant
        )
    }

    /// Defaults suitable for tests and for pointing at a mock control plane.
    pub fn for_base_url(client_id: &str, arm_base_url: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            tenant: "organizations".into(),
            authority: "https://login.microsoftonline.com".into(),
            redirect_uri: "http://localhost:8400/callback".into(),
            arm_base_url: arm_base_url.trim_end_matches('/').to_string(),
            subscriptions_api_version: "2022-12-01".into(),
            capacities_api_version: "2023-11-01".into(),
            provider_namespace: "Microsoft.Fabric".into(),
            renewal_buffer_mins: 5,
            renewal_interval_secs: 600,
            renewal_threshold_mins: 15,
            refresh_delay_ms: 2500,
            store_path: default_store_path(),
            http_timeout_secs: 30,
            legacy_scope_fallback: false,
            silent_browser: false,
        }
    }
}

fn default_store_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".capctl")
        .join("session.json")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let client_id = std::env::var("CAPCTL_CLIENT_ID").map_err(|_| {
        anyhow::anyhow!("CAPCTL_CLIENT_ID is not set. Register an app with the implicit grant enabled and export its client id.")
    })?;

    let renewal_buffer_mins = env_parse("CAPCTL_RENEWAL_BUFFER_MINS", 5i64);
    if renewal_buffer_mins < MIN_RENEWAL_BUFFER_MINS {
        eprintln!(
            "CAPCTL_RENEWAL_BUFFER_MINS={} is below the minimum; using {} minutes",
            renewal_buffer_mins, MIN_RENEWAL_BUFFER_MINS
        );
    }

    Ok(Config {
        client_id,
        tenant: env_or("CAPCTL_TENANT", "organizations"),
        authority: env_or("CAPCTL_AUTHORITY", "https://login.microsoftonline.com"),
        redirect_uri: env_or("CAPCTL_REDIRECT_URI", "http://localhost:8400/callback"),
        arm_base_url: env_or("CAPCTL_ARM_BASE_URL", "https://management.azure.com")
            .trim_end_matches('/')
            .to_string(),
        subscriptions_api_version: env_or("CAPCTL_SUBSCRIPTIONS_API_VERSION", "2022-12-01"),
        capacities_api_version: env_or("CAPCTL_CAPACITIES_API_VERSION", "2023-11-01"),
        provider_namespace: env_or("CAPCTL_PROVIDER_NAMESPACE", "Microsoft.Fabric"),
        renewal_buffer_mins: renewal_buffer_mins.max(MIN_RENEWAL_BUFFER_MINS),
        renewal_interval_secs: env_parse("CAPCTL_RENEWAL_INTERVAL_SECS", 600),
        renewal_threshold_mins: env_parse("CAPCTL_RENEWAL_THRESHOLD_MINS", 15),
        refresh_delay_ms: env_parse("CAPCTL_REFRESH_DELAY_MS", 2500),
        store_path: std::env::var("CAPCTL_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_store_path()),
        http_timeout_secs: env_parse("CAPCTL_HTTP_TIMEOUT_SECS", 30),
        legacy_scope_fallback: env_flag("CAPCTL_LEGACY_SCOPE_FALLBACK"),
        silent_browser: env_flag("CAPCTL_SILENT_BROWSER"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_buffer_is_clamped() {
        let mut cfg = Config::for_base_url("cid", "http://localhost");
        cfg.renewal_buffer_mins = 0;
        assert_eq!(cfg.renewal_buffer(), chrono::Duration::minutes(2));
        cfg.renewal_buffer_mins = 5;
        assert_eq!(cfg.renewal_buffer(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_authorize_endpoint() {
        let mut cfg = Config::for_base_url("cid", "http://localhost/");
        cfg.authority = "https://login.example.com/".into();
        assert_eq!(
            cfg.authorize_endpoint(),
            "https://login.example.com/organizations/oauth2/v2.0/authorize"
        );
        assert_eq!(cfg.arm_base_url, "http://localhost");
    }
}
