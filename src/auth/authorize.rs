//! Implicit-grant authorize request and redirect fragment handling.

use rand::RngCore;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use super::MAX_LIFETIME_SECS;
use crate::config::Config;

/// Provider error codes that mean "no usable session, ask the user".
const SILENT_MISS_CODES: &[&str] = &[
    "interaction_required",
    "login_required",
    "consent_required",
    "account_selection_required",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    SelectAccount,
    /// Silent: the provider must not show any UI.
    None,
}

impl Prompt {
    fn as_str(&self) -> &'static str {
        match self {
            Prompt::SelectAccount => "select_account",
            Prompt::None => "none",
        }
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, Prompt::None)
    }
}

/// A built authorize URL plus the anti-forgery values it carries.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub url: Url,
    pub state: String,
    pub nonce: String,
    pub prompt: Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizeError {
    #[error("state mismatch in authorization response (possible CSRF)")]
    Csrf,

    #[error("no active provider session")]
    InteractionRequired,

    #[error("identity provider returned {error}: {description}")]
    Provider { error: String, description: String },

    #[error("malformed authorization response: {0}")]
    Malformed(String),
}

/// 32 random bytes, hex encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn build(config: &Config, scopes: &str, prompt: Prompt) -> Result<AuthorizeRequest, AuthorizeError> {
    let state = generate_state();
    let nonce = Uuid::new_v4().to_string();

    let mut url = Url::parse(&config.authorize_endpoint())
        .map_err(|e| AuthorizeError::Malformed(format!("authorize endpoint: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("response_type", "token")
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("scope", scopes)
        .append_pair("state", &state)
        .append_pair("nonce", &nonce)
        .append_pair("response_mode", "fragment")
        .append_pair("prompt", prompt.as_str());

    Ok(AuthorizeRequest {
        url,
        state,
        nonce,
        prompt,
    })
}

/// Pull key/value pairs out of a redirect. Accepts a full redirect URL or
/// a bare fragment (with or without the leading `#`).
fn fragment_params(redirect: &str) -> Vec<(String, String)> {
    let fragment = match Url::parse(redirect) {
        Ok(u) => u.fragment().unwrap_or_default().to_string(),
        Err(_) => redirect.trim_start_matches('#').to_string(),
    };
    url::form_urlencoded::parse(fragment.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

impl AuthorizeRequest {
    /// Validate the provider's redirect against this request.
    pub fn complete(&self, redirect: &str) -> Result<TokenResponse, AuthorizeError> {
        let params = fragment_params(redirect);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        // State is checked before anything else, including provider errors.
        if let Some(state) = get("state") {
            if state != self.state {
                return Err(AuthorizeError::Csrf);
            }
        }

        if let Some(error) = get("error") {
            if SILENT_MISS_CODES.contains(&error) {
                return Err(AuthorizeError::InteractionRequired);
            }
            return Err(AuthorizeError::Provider {
                error: error.to_string(),
                description: get("error_description").unwrap_or_default().to_string(),
            });
        }

        if get("state").is_none() {
            return Err(AuthorizeError::Csrf);
        }

        let access_token = get("access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthorizeError::Malformed("missing access_token".into()))?;
        let expires_in = get("expires_in")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0 && *v <= MAX_LIFETIME_SECS)
            .ok_or_else(|| AuthorizeError::Malformed("missing or invalid expires_in".into()))?;
        let token_type = get("token_type").unwrap_or("Bearer");
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(AuthorizeError::Malformed(format!(
                "unsupported token_type '{}'",
                token_type
            )));
        }

        Ok(TokenResponse {
            access_token: access_token.to_string(),
            expires_in,
            token_type: token_type.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthorizeRequest {
        let cfg = Config::for_base_url("client-123", "http://localhost");
        build(&cfg, crate::config::CANONICAL_SCOPES, Prompt::SelectAccount).unwrap()
    }

    #[test]
    fn test_build_carries_all_parameters() {
        let req = request();
        let pairs: Vec<(String, String)> = req
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

        assert_eq!(get("client_id").as_deref(), Some("client-123"));
        assert_eq!(get("response_type").as_deref(), Some("token"));
        assert_eq!(get("response_mode").as_deref(), Some("fragment"));
        assert_eq!(get("prompt").as_deref(), Some("select_account"));
        assert_eq!(get("state"), Some(req.state.clone()));
        assert_eq!(get("redirect_uri").as_deref(), Some("http://localhost:8400/callback"));
        assert!(get("scope").unwrap().contains("user_impersonation"));
    }

    #[test]
    fn test_state_is_fresh_per_request() {
        let a = request();
        let b = request();
        assert_ne!(a.state, b.state);
        assert_eq!(a.state.len(), 64);
    }

    #[test]
    fn test_complete_success() {
        let req = request();
        let redirect = format!(
            "http://localhost:8400/callback#access_token=tok&token_type=Bearer&expires_in=3599&state={}",
            req.state
        );
        let resp = req.complete(&redirect).unwrap();
        assert_eq!(resp.access_token, "tok");
        assert_eq!(resp.expires_in, 3599);
    }

    #[test]
    fn test_complete_bare_fragment() {
        let req = request();
        let fragment = format!("#access_token=tok&expires_in=60&state={}", req.state);
        assert!(req.complete(&fragment).is_ok());
    }

    #[test]
    fn test_state_mismatch_is_csrf() {
        let req = request();
        let fragment = "access_token=tok&expires_in=60&state=forged";
        assert_eq!(req.complete(fragment), Err(AuthorizeError::Csrf));
    }

    #[test]
    fn test_missing_state_is_csrf() {
        let req = request();
        assert_eq!(
            req.complete("access_token=tok&expires_in=60"),
            Err(AuthorizeError::Csrf)
        );
    }

    #[test]
    fn test_silent_miss_codes() {
        let req = request();
        let fragment = format!("error=login_required&state={}", req.state);
        assert_eq!(req.complete(&fragment), Err(AuthorizeError::InteractionRequired));
    }

    #[test]
    fn test_provider_error() {
        let req = request();
        let fragment = format!(
            "error=access_denied&error_description=user+cancelled&state={}",
            req.state
        );
        assert_eq!(
            req.complete(&fragment),
            Err(AuthorizeError::Provider {
                error: "access_denied".into(),
                description: "user cancelled".into()
            })
        );
    }

    #[test]
    fn test_oversized_expiry_is_malformed() {
        let req = request();
        let fragment = format!(
            "access_token=t&expires_in=99999999999999999&state={}",
            req.state
        );
        assert!(matches!(req.complete(&fragment), Err(AuthorizeError::Malformed(_))));

        let fragment = format!("access_token=t&expires_in=86401&state={}", req.state);
        assert!(matches!(req.complete(&fragment), Err(AuthorizeError::Malformed(_))));

        let fragment = format!("access_token=t&expires_in=86400&state={}", req.state);
        assert_eq!(req.complete(&fragment).unwrap().expires_in, 86400);
    }

    #[test]
    fn test_missing_expiry_is_malformed() {
        let req = request();
        let fragment = format!("access_token=tok&state={}", req.state);
        assert!(matches!(req.complete(&fragment), Err(AuthorizeError::Malformed(_))));
    }
}
