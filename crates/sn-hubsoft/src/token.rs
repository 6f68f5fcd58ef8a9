//! OAuth2 resource-owner token cache.
//!
//! One token per process, refreshed lazily inside a single async mutex so
//! concurrent callers never stampede the token endpoint. Refresh happens
//! when the token is within the expiry buffer; consecutive refresh attempts
//! are at least one second apart. The token value itself is never logged.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sn_config::HubSoftConfig;

use crate::error::HubSoftError;
use crate::types::TokenResponse;

const EXPIRY_BUFFER: Duration = Duration::from_secs(300);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<Instant>,
    last_refresh_attempt: Option<Instant>,
}

pub struct TokenManager {
    http: reqwest::Client,
    config: HubSoftConfig,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, config: HubSoftConfig) -> Self {
        Self {
            http,
            config,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// A valid access token, from cache or freshly acquired.
    pub async fn access_token(&self) -> Result<String, HubSoftError> {
        let mut state = self.state.lock().await;

        if let (Some(token), Some(expires_at)) = (&state.token, state.expires_at) {
            if Instant::now() + EXPIRY_BUFFER < expires_at {
                debug!("Using cached HubSoft token");
                return Ok(token.clone());
            }
        }

        self.refresh_locked(&mut state).await
    }

    /// Drops the cached token, forcing re-acquisition on the next call.
    /// Used when a request comes back 401.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.token.take().is_some() {
            warn!("HubSoft token invalidated after upstream rejection");
        }
        state.expires_at = None;
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String, HubSoftError> {
        // Back-to-back refresh attempts are throttled while the lock is
        // held, which also serializes every waiter behind this one.
        if let Some(last) = state.last_refresh_attempt {
            let since = last.elapsed();
            if since < MIN_REFRESH_INTERVAL {
                tokio::time::sleep(MIN_REFRESH_INTERVAL - since).await;
            }
        }
        state.last_refresh_attempt = Some(Instant::now());

        info!("Requesting new HubSoft access token");
        let url = format!(
            "{}{}",
            self.config.host.trim_end_matches('/'),
            self.config.endpoints.token
        );

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("username", self.config.user.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(HubSoftError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubSoftError::from_status(status.as_u16(), body));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("token response: {e}")))?;

        state.token = Some(parsed.access_token.clone());
        state.expires_at = Some(Instant::now() + Duration::from_secs(parsed.expires_in));
        info!(valid_for_mins = parsed.expires_in / 60, "HubSoft token refreshed");

        Ok(parsed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(host: &str) -> HubSoftConfig {
        let mut config = HubSoftConfig::default();
        config.host = host.to_string();
        config.client_id = "cid".into();
        config.client_secret = "secret".into();
        config.user = "integration@isp.example".into();
        config.password = "hunter2".into();
        config.enabled = true;
        config
    }

    fn manager(host: &str) -> TokenManager {
        TokenManager::new(reqwest::Client::new(), config(host))
    }

    #[tokio::test]
    async fn acquires_and_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server.uri());
        assert_eq!(manager.access_token().await.unwrap(), "tok-1");
        // Second call must hit the cache, not the endpoint (expect(1)).
        assert_eq!(manager.access_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn invalidate_forces_reacquisition() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-2",
                "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;

        let manager = manager(&server.uri());
        manager.access_token().await.unwrap();
        manager.invalidate().await;
        manager.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let manager = manager(&server.uri());
        assert!(matches!(
            manager.access_token().await,
            Err(HubSoftError::Server { status: 500 })
        ));
    }
}
