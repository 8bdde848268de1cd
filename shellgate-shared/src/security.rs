//! Security gate: PIN validation, per-client rate limiting, command whitelist
//!
//! Used on both sides of the wire:
//! - the kernel applies it as admission control before touching the network
//! - the agent applies it again before running anything, keyed by caller IP
//!
//! The rate-limit table is split into independently locked shards chosen by
//! key hash, so admission checks for unrelated clients rarely contend.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;

type HmacSha256 = Hmac<Sha256>;

const PIN_MAC_LABEL: &[u8] = b"shellgate/pin";

/// Default sweep period for expired rate-limit entries
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SecurityError {
    // Same message for PIN and whitelist failures: callers must not learn
    // which check refused them.
    #[error("not authorized")]
    InvalidPin,
    #[error("not authorized")]
    CommandNotAllowed,
    #[error("rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("security policy requires a PIN but none is configured")]
    MissingPin,
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::InvalidPin | SecurityError::CommandNotAllowed => ErrorKind::Unauthorized,
            SecurityError::RateLimited { .. } => ErrorKind::RateLimited,
            SecurityError::MissingPin => ErrorKind::Internal,
        }
    }
}

/// Security configuration, loaded once at startup
#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub pin_required: bool,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub whitelist_enabled: bool,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Requests per client and window; 0 disables limiting
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_shards")]
    pub shards: usize,
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

fn default_shards() -> usize {
    16
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            pin_required: false,
            pin: None,
            whitelist_enabled: false,
            allowed_commands: Vec::new(),
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
            shards: default_shards(),
        }
    }
}

// Hand-written so the PIN never ends up in logs.
impl fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("pin_required", &self.pin_required)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("whitelist_enabled", &self.whitelist_enabled)
            .field("allowed_commands", &self.allowed_commands)
            .field("requests_per_window", &self.requests_per_window)
            .field("window_seconds", &self.window_seconds)
            .field("shards", &self.shards)
            .finish()
    }
}

/// Fixed-window counter for one client key
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_end: Instant,
}

struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, RateLimitEntry>>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration, shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards, limit, window }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, RateLimitEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn check(&self, key: &str) -> Result<(), SecurityError> {
        if self.limit == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut table = self.shard(key).lock();
        match table.get_mut(key) {
            Some(entry) if now < entry.window_end => {
                entry.count = entry.count.saturating_add(1);
                if entry.count > self.limit {
                    let retry_after_ms = (entry.window_end - now).as_millis() as u64;
                    return Err(SecurityError::RateLimited { retry_after_ms });
                }
                Ok(())
            }
            _ => {
                table.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count: 1,
                        window_end: now + self.window,
                    },
                );
                Ok(())
            }
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut table = shard.lock();
                let before = table.len();
                table.retain(|_, entry| entry.window_end > now);
                before - table.len()
            })
            .sum()
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// Admission control shared by dispatch and execution paths
pub struct SecurityGate {
    pin_required: bool,
    pin_tag: Option<Vec<u8>>,
    whitelist_enabled: bool,
    allowed: HashSet<String>,
    limiter: RateLimiter,
}

impl SecurityGate {
    pub fn new(policy: &SecurityPolicy) -> Result<Self, SecurityError> {
        let pin_tag = match policy.pin.as_deref() {
            Some(pin) if !pin.is_empty() => Some(pin_tag(pin)),
            _ if policy.pin_required => return Err(SecurityError::MissingPin),
            _ => None,
        };

        Ok(Self {
            pin_required: policy.pin_required,
            pin_tag,
            whitelist_enabled: policy.whitelist_enabled,
            allowed: policy.allowed_commands.iter().cloned().collect(),
            limiter: RateLimiter::new(
                policy.requests_per_window,
                Duration::from_secs(policy.window_seconds),
                policy.shards,
            ),
        })
    }

    pub fn pin_required(&self) -> bool {
        self.pin_required
    }

    /// Constant-time PIN check; empty or missing input fails closed
    pub fn validate_pin(&self, provided: Option<&str>) -> Result<(), SecurityError> {
        if !self.pin_required {
            return Ok(());
        }
        let (Some(provided), Some(expected)) = (provided, self.pin_tag.as_ref()) else {
            return Err(SecurityError::InvalidPin);
        };
        if provided.is_empty() {
            return Err(SecurityError::InvalidPin);
        }

        let mut mac = pin_mac();
        mac.update(provided.as_bytes());
        mac.verify_slice(expected).map_err(|_| SecurityError::InvalidPin)
    }

    pub fn check_rate_limit(&self, client_key: &str) -> Result<(), SecurityError> {
        self.limiter.check(client_key).inspect_err(|_| {
            warn!("[security] rate limit exceeded for client {}", client_key);
        })
    }

    pub fn validate_command_access(&self, command_id: &str) -> Result<(), SecurityError> {
        if !self.whitelist_enabled || self.allowed.is_empty() {
            return Ok(());
        }
        if self.allowed.contains(command_id) {
            Ok(())
        } else {
            debug!("[security] command {} not in whitelist", command_id);
            Err(SecurityError::CommandNotAllowed)
        }
    }

    /// Drops entries whose window has elapsed; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.limiter.sweep()
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    /// Periodic sweep until the token is cancelled
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!("[security] swept {} expired rate-limit entries", removed);
                        }
                    }
                }
            }
        })
    }
}

fn pin_mac() -> HmacSha256 {
    HmacSha256::new_from_slice(PIN_MAC_LABEL).expect("hmac accepts keys of any length")
}

fn pin_tag(pin: &str) -> Vec<u8> {
    let mut mac = pin_mac();
    mac.update(pin.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
