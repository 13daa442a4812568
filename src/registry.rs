//! Backend registry and per-backend health tracking.
//!
//! Descriptors are immutable after startup. Health lives in one table behind a
//! single mutex; every read or update of failure counters goes through
//! [`BackendRegistry`] methods that hold that lock only for the bookkeeping
//! itself, never across an await point.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{BackendConfig, GatewayConfig};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub enabled: bool,
    pub priority: u32,
    pub api_key_env: Option<String>,
}

impl BackendDescriptor {
    pub fn from_config(config: &GatewayConfig, backend: &BackendConfig, position: usize) -> Self {
        Self {
            name: backend.name.clone(),
            base_url: backend.url.trim_end_matches('/').to_string(),
            timeout: config.backend_timeout(backend),
            enabled: backend.enabled,
            priority: backend.effective_priority(position),
            api_key_env: backend.api_key_env.clone(),
        }
    }

    /// Join a request path (with optional query) onto this backend's base URL.
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// Bearer token for the backend, if one is configured and present in the environment.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendState {
    Healthy,
    Suspect,
    Disabled,
}

#[derive(Debug, Clone, Default)]
struct BackendHealth {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_error: Option<String>,
    last_contact: Option<DateTime<Utc>>,
}

impl BackendHealth {
    fn cooled_down(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        }
    }

    /// Expire a stale failure streak once the cool-down has passed.
    fn refresh(&mut self, now: Instant, cooldown: Duration) {
        if self.consecutive_failures > 0 && self.cooled_down(now, cooldown) {
            self.consecutive_failures = 0;
            self.last_failure = None;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl HealthPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            failure_threshold: config.health.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.health.cooldown_secs),
        }
    }
}

/// A backend chosen for one attempt, identified by its slot in the registry.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub slot: usize,
    pub backend: Arc<BackendDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthSnapshot {
    pub name: String,
    pub state: BackendState,
    #[serde(rename = "lastContact")]
    pub last_contact: Option<DateTime<Utc>>,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Arc<BackendDescriptor>>,
    health: Mutex<Vec<BackendHealth>>,
    policy: HealthPolicy,
}

impl BackendRegistry {
    /// Build the registry from configuration, ordered by priority (ties keep config order).
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let descriptors = config
            .backends
            .iter()
            .enumerate()
            .map(|(idx, b)| BackendDescriptor::from_config(config, b, idx))
            .collect();
        Self::new(descriptors, HealthPolicy::from_config(config))
    }

    pub fn new(mut descriptors: Vec<BackendDescriptor>, policy: HealthPolicy) -> Result<Self> {
        if !descriptors.iter().any(|d| d.enabled) {
            return Err(GatewayError::config("At least one backend must be enabled"));
        }
        descriptors.sort_by_key(|d| d.priority);
        let health = vec![BackendHealth::default(); descriptors.len()];
        Ok(Self {
            backends: descriptors.into_iter().map(Arc::new).collect(),
            health: Mutex::new(health),
            policy,
        })
    }

    pub fn backends(&self) -> &[Arc<BackendDescriptor>] {
        &self.backends
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackendHealth>> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Backends to try for one call, in order.
    ///
    /// Enabled backends in priority order, skipping any whose failure streak
    /// reached the threshold within the cool-down window. If that skips
    /// everything, all enabled backends are returned.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates_at(Instant::now())
    }

    pub fn candidates_at(&self, now: Instant) -> Vec<Candidate> {
        let mut health = self.lock();
        let mut eligible = Vec::new();
        let mut enabled = Vec::new();

        for (slot, backend) in self.backends.iter().enumerate() {
            if !backend.enabled {
                continue;
            }
            let h = &mut health[slot];
            h.refresh(now, self.policy.cooldown);
            let candidate = Candidate {
                slot,
                backend: Arc::clone(backend),
            };
            if h.consecutive_failures < self.policy.failure_threshold {
                eligible.push(candidate.clone());
            }
            enabled.push(candidate);
        }

        if eligible.is_empty() {
            enabled
        } else {
            eligible
        }
    }

    /// The backend reached and answered, whatever it answered.
    pub fn record_success(&self, slot: usize) {
        let mut health = self.lock();
        if let Some(h) = health.get_mut(slot) {
            h.consecutive_failures = 0;
            h.last_failure = None;
            h.last_error = None;
            h.last_contact = Some(Utc::now());
        }
    }

    /// A transport-level failure (refused, reset, timed out).
    pub fn record_failure(&self, slot: usize, message: impl Into<String>) {
        self.record_failure_at(slot, message, Instant::now());
    }

    pub fn record_failure_at(&self, slot: usize, message: impl Into<String>, now: Instant) {
        let mut health = self.lock();
        if let Some(h) = health.get_mut(slot) {
            h.refresh(now, self.policy.cooldown);
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
            h.last_failure = Some(now);
            h.last_error = Some(message.into());
        }
    }

    pub fn state_of(&self, slot: usize, now: Instant) -> Option<BackendState> {
        let backend = self.backends.get(slot)?;
        let health = self.lock();
        Some(state_for(backend, &health[slot], now, self.policy.cooldown))
    }

    pub fn snapshot(&self) -> Vec<BackendHealthSnapshot> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<BackendHealthSnapshot> {
        let health = self.lock();
        self.backends
            .iter()
            .zip(health.iter())
            .map(|(backend, h)| {
                let state = state_for(backend, h, now, self.policy.cooldown);
                BackendHealthSnapshot {
                    name: backend.name.clone(),
                    state,
                    last_contact: h.last_contact,
                    consecutive_failures: if state == BackendState::Suspect {
                        h.consecutive_failures
                    } else {
                        0
                    },
                    last_error: h.last_error.clone(),
                }
            })
            .collect()
    }
}

fn state_for(
    backend: &BackendDescriptor,
    health: &BackendHealth,
    now: Instant,
    cooldown: Duration,
) -> BackendState {
    if !backend.enabled {
        BackendState::Disabled
    } else if health.consecutive_failures > 0 && !health.cooled_down(now, cooldown) {
        BackendState::Suspect
    } else {
        BackendState::Healthy
    }
}
