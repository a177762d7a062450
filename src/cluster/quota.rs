//! Per-client byte-rate quotas.
//!
//! Each client id gets a fixed accounting window. Bytes admitted inside the
//! window beyond `target_bytes_per_sec * window` translate into a delay long
//! enough for the client to fall back under its rate, capped at `max_delay`.
//! Requests without a client id share one bucket.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::traits::QuotaManager;
use crate::constants::{
    DEFAULT_QUOTA_BYTES_PER_SEC, DEFAULT_QUOTA_MAX_DELAY_MS, DEFAULT_QUOTA_MAX_TRACKED_CLIENTS,
    DEFAULT_QUOTA_WINDOW_MS,
};
use crate::server::request::ApiKey;

/// Configuration for client quotas.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Sustained rate a single client may use before it is delayed.
    pub target_bytes_per_sec: u64,
    /// Length of one accounting window.
    pub window: Duration,
    /// Maximum delay applied to a single request.
    pub max_delay: Duration,
    /// Maximum number of clients to track (prevents memory exhaustion).
    pub max_tracked_clients: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            target_bytes_per_sec: DEFAULT_QUOTA_BYTES_PER_SEC,
            window: Duration::from_millis(DEFAULT_QUOTA_WINDOW_MS),
            max_delay: Duration::from_millis(DEFAULT_QUOTA_MAX_DELAY_MS),
            max_tracked_clients: DEFAULT_QUOTA_MAX_TRACKED_CLIENTS,
        }
    }
}

impl QuotaConfig {
    /// Load from `QUOTA_BYTES_PER_SEC`, `QUOTA_WINDOW_MS`,
    /// `QUOTA_MAX_DELAY_MS` and `QUOTA_MAX_TRACKED_CLIENTS`, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            target_bytes_per_sec: std::env::var("QUOTA_BYTES_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.target_bytes_per_sec),
            window: std::env::var("QUOTA_WINDOW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.window),
            max_delay: std::env::var("QUOTA_MAX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            max_tracked_clients: std::env::var("QUOTA_MAX_TRACKED_CLIENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tracked_clients),
        }
    }

    /// Check the configuration, collecting every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.target_bytes_per_sec == 0 {
            errors.push("target_bytes_per_sec must be positive".to_string());
        }
        if self.window.is_zero() {
            errors.push("window must be positive".to_string());
        }
        if self.max_tracked_clients == 0 {
            errors.push("max_tracked_clients must be positive".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    window_start: Instant,
    bytes_in_window: u64,
    last_seen: Instant,
}

/// Quota manager tracking a byte rate per client id.
pub struct ClientQuotaManager {
    state: RwLock<HashMap<String, ClientState>>,
    config: QuotaConfig,
}

impl ClientQuotaManager {
    pub fn new() -> Self {
        Self::with_config(QuotaConfig::default())
    }

    pub fn with_config(config: QuotaConfig) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Number of clients currently tracked.
    pub async fn tracked_clients(&self) -> usize {
        self.state.read().await.len()
    }

    fn window_allowance(&self) -> u64 {
        let per_window =
            self.config.target_bytes_per_sec as u128 * self.config.window.as_millis() / 1000;
        u64::try_from(per_window).unwrap_or(u64::MAX)
    }

    fn delay_for_overshoot(&self, overshoot: u64) -> Duration {
        let millis = overshoot as u128 * 1000 / self.config.target_bytes_per_sec.max(1) as u128;
        let delay = Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX));
        delay.min(self.config.max_delay)
    }

    /// Drop idle clients, then the least recently seen if still full.
    fn cleanup_old_entries(&self, state: &mut HashMap<String, ClientState>, now: Instant) {
        state.retain(|_, s| now.duration_since(s.last_seen) < self.config.window);

        if state.len() >= self.config.max_tracked_clients {
            let oldest = state
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                state.remove(&id);
            }
        }
    }
}

impl Default for ClientQuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaManager for ClientQuotaManager {
    async fn compute_delay(
        &self,
        client_id: Option<&str>,
        api_key: ApiKey,
        bytes: usize,
    ) -> Duration {
        let key = client_id.unwrap_or_default();
        let now = Instant::now();
        let mut state = self.state.write().await;

        if !state.contains_key(key) && state.len() >= self.config.max_tracked_clients {
            self.cleanup_old_entries(&mut state, now);
        }

        let client = state.entry(key.to_string()).or_insert(ClientState {
            window_start: now,
            bytes_in_window: 0,
            last_seen: now,
        });
        if now.duration_since(client.window_start) >= self.config.window {
            client.window_start = now;
            client.bytes_in_window = 0;
        }
        client.bytes_in_window = client.bytes_in_window.saturating_add(bytes as u64);
        client.last_seen = now;

        let allowance = self.window_allowance();
        if client.bytes_in_window <= allowance {
            return Duration::ZERO;
        }
        let delay = self.delay_for_overshoot(client.bytes_in_window - allowance);
        tracing::warn!(
            client_id = key,
            api = api_key.as_str(),
            bytes_in_window = client.bytes_in_window,
            delay_ms = delay.as_millis() as u64,
            "Client over quota, throttling"
        );
        delay
    }
}

/// Quota manager that never delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuota;

#[async_trait]
impl QuotaManager for NoQuota {
    async fn compute_delay(&self, _: Option<&str>, _: ApiKey, _: usize) -> Duration {
        Duration::ZERO
    }
}
