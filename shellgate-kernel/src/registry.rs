/**
 * REGISTRE DES CONNEXIONS - Devices connus du kernel
 *
 * RÔLE :
 * Une `DeviceConnection` par device id : adresse, transport, état de santé,
 * horodatages et compteur d'échecs consécutifs. Seul le registre crée ou
 * supprime des connexions.
 *
 * FONCTIONNEMENT :
 * - Map structurelle sous `tokio::sync::RwLock`, état par connexion sous
 *   `parking_lot::Mutex` (jamais tenu à travers un `.await`)
 * - Ajout : réservation de l'id sous verrou, connexion hors verrou bornée par
 *   `connect_timeout`, insertion en `Connecting` puis tâche de santé
 * - Tâche de santé : sonde toutes les `health_interval` (premier tick
 *   immédiat), `unhealthy_threshold` échecs consécutifs → `Unhealthy`
 * - Suppression / arrêt : annulation du `CancellationToken`, fermeture du transport
 */

use serde::{Deserialize, Serialize};
use shellgate_shared::contracts::HealthCheckResponse;
use shellgate_shared::ErrorKind;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{AgentTransport, Connector, TransportError, TransportState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device already connected: {0}")]
    AlreadyConnected(String),
    #[error("connection limit reached ({0})")]
    CapacityExceeded(usize),
    #[error("device unhealthy: {0}")]
    Unhealthy(String),
    #[error("registry is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            RegistryError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            RegistryError::Unhealthy(_) => ErrorKind::Unhealthy,
            RegistryError::ShuttingDown => ErrorKind::Unavailable,
            RegistryError::Transport(e) => e.kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Échecs consécutifs avant de passer `Unhealthy`
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_max_connections() -> usize {
    100
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    1
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl RegistryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Connecting,
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct ConnectionState {
    health: DeviceHealth,
    last_probe: Option<OffsetDateTime>,
    failures: u32,
}

pub struct DeviceConnection {
    device_id: String,
    address: String,
    transport: Arc<dyn AgentTransport>,
    connected_at: OffsetDateTime,
    state: parking_lot::Mutex<ConnectionState>,
    token: CancellationToken,
}

/// Vue sérialisable d'une connexion (API / logs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: String,
    pub address: String,
    pub health: DeviceHealth,
    pub connected_at: String,
    pub last_probe: Option<String>,
    pub consecutive_failures: u32,
}

impl DeviceConnection {
    fn new(device_id: &str, address: &str, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            device_id: device_id.to_string(),
            address: address.to_string(),
            transport,
            connected_at: OffsetDateTime::now_utc(),
            state: parking_lot::Mutex::new(ConnectionState {
                health: DeviceHealth::Connecting,
                last_probe: None,
                failures: 0,
            }),
            token: CancellationToken::new(),
        }
    }

    pub fn health(&self) -> DeviceHealth {
        self.state.lock().health
    }

    pub fn view(&self) -> DeviceView {
        let state = self.state.lock();
        DeviceView {
            device_id: self.device_id.clone(),
            address: self.address.clone(),
            health: state.health,
            connected_at: self.connected_at.format(&Rfc3339).unwrap_or_default(),
            last_probe: state.last_probe.and_then(|t| t.format(&Rfc3339).ok()),
            consecutive_failures: state.failures,
        }
    }

    fn record_probe(&self, outcome: &Result<HealthCheckResponse, TransportError>, threshold: u32) {
        let mut state = self.state.lock();
        let before = state.health;
        match outcome {
            Ok(_) => {
                state.health = DeviceHealth::Healthy;
                state.last_probe = Some(OffsetDateTime::now_utc());
                state.failures = 0;
            }
            Err(_) => {
                state.failures = state.failures.saturating_add(1);
                if state.failures >= threshold.max(1) {
                    state.health = DeviceHealth::Unhealthy;
                }
            }
        }

        match (before, state.health, outcome) {
            (DeviceHealth::Healthy, DeviceHealth::Healthy, _) => {}
            (_, DeviceHealth::Healthy, _) => info!("device {} is healthy", self.device_id),
            (DeviceHealth::Unhealthy, DeviceHealth::Unhealthy, _) => {}
            (_, DeviceHealth::Unhealthy, Err(e)) => {
                warn!("device {} marked unhealthy after {} failure(s): {}", self.device_id, state.failures, e)
            }
            (_, _, Err(e)) => debug!("probe of {} failed: {}", self.device_id, e),
            _ => {}
        }
    }
}

/// Une sonde : état du transport d'abord, puis HealthCheck borné
async fn probe_once(
    conn: &DeviceConnection,
    deadline: Duration,
) -> Result<HealthCheckResponse, TransportError> {
    match conn.transport.state() {
        TransportState::Ready => {}
        state => {
            return Err(TransportError::new(
                ErrorKind::Unavailable,
                format!("transport {:?}", state),
            ))
        }
    }

    match tokio::time::timeout(deadline, conn.transport.health_check(deadline)).await {
        Ok(Ok(resp)) if resp.is_serving() => Ok(resp),
        Ok(Ok(_)) => Err(TransportError::new(ErrorKind::Unavailable, "agent not serving")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::new(ErrorKind::Timeout, "health probe timed out")),
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Arc<DeviceConnection>>,
    /// Ids réservés dont la connexion est en cours
    pending: HashSet<String>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    config: Arc<RegistryConfig>,
    connector: Arc<dyn Connector>,
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn add_connection(&self, device_id: &str, address: &str) -> Result<DeviceView, RegistryError> {
        {
            let mut inner = self.inner.write().await;
            if inner.connections.contains_key(device_id) || inner.pending.contains(device_id) {
                return Err(RegistryError::AlreadyConnected(device_id.to_string()));
            }
            if inner.connections.len() + inner.pending.len() >= self.config.max_connections {
                return Err(RegistryError::CapacityExceeded(self.config.max_connections));
            }
            inner.pending.insert(device_id.to_string());
        }

        let connect_timeout = self.config.connect_timeout();
        let dialed = match tokio::time::timeout(connect_timeout, self.connector.connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::failure(format!(
                "connect to {} timed out after {}s",
                address,
                connect_timeout.as_secs()
            ))),
        };

        let transport = match dialed {
            Ok(transport) => transport,
            Err(e) => {
                self.inner.write().await.pending.remove(device_id);
                warn!("failed to connect device {} at {}: {}", device_id, address, e);
                return Err(e.into());
            }
        };

        let conn = Arc::new(DeviceConnection::new(device_id, address, transport));
        {
            let mut inner = self.inner.write().await;
            // stop_all a vidé les réservations pendant la connexion
            if !inner.pending.remove(device_id) {
                drop(inner);
                conn.transport.close().await;
                return Err(RegistryError::ShuttingDown);
            }
            inner.connections.insert(device_id.to_string(), conn.clone());
        }

        self.spawn_health_task(conn.clone());
        info!("device {} connected at {}", device_id, address);
        Ok(conn.view())
    }

    pub async fn remove_connection(&self, device_id: &str) -> Result<(), RegistryError> {
        let conn = self
            .inner
            .write()
            .await
            .connections
            .remove(device_id)
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))?;

        conn.token.cancel();
        conn.transport.close().await;
        info!("device {} removed", device_id);
        Ok(())
    }

    /// Transport d'un device `Healthy`
    pub async fn get_client(&self, device_id: &str) -> Result<Arc<dyn AgentTransport>, RegistryError> {
        let inner = self.inner.read().await;
        let conn = inner
            .connections
            .get(device_id)
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))?;
        if conn.health() != DeviceHealth::Healthy {
            return Err(RegistryError::Unhealthy(device_id.to_string()));
        }
        Ok(conn.transport.clone())
    }

    /// Sonde manuelle, quel que soit l'état de santé courant
    pub async fn probe(&self, device_id: &str, deadline: Duration) -> Result<HealthCheckResponse, RegistryError> {
        let conn = self.lookup(device_id).await?;
        let outcome = probe_once(&conn, deadline).await;
        if !conn.token.is_cancelled() {
            conn.record_probe(&outcome, self.config.unhealthy_threshold);
        }
        Ok(outcome?)
    }

    pub async fn list_healthy(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .connections
            .values()
            .filter(|c| c.health() == DeviceHealth::Healthy)
            .map(|c| c.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn list(&self) -> Vec<DeviceView> {
        let inner = self.inner.read().await;
        let mut views: Vec<DeviceView> = inner.connections.values().map(|c| c.view()).collect();
        views.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        views
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn stop_all(&self) -> usize {
        let drained: Vec<Arc<DeviceConnection>> = {
            let mut inner = self.inner.write().await;
            inner.pending.clear();
            inner.connections.drain().map(|(_, c)| c).collect()
        };

        for conn in &drained {
            conn.token.cancel();
        }
        for conn in &drained {
            conn.transport.close().await;
        }
        if !drained.is_empty() {
            info!("registry stopped, {} connection(s) closed", drained.len());
        }
        drained.len()
    }

    async fn lookup(&self, device_id: &str) -> Result<Arc<DeviceConnection>, RegistryError> {
        self.inner
            .read()
            .await
            .connections
            .get(device_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    async fn is_registered(&self, conn: &Arc<DeviceConnection>) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(&conn.device_id)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }

    fn spawn_health_task(&self, conn: Arc<DeviceConnection>) {
        let registry = self.clone();
        let token = conn.token.clone();
        let interval = self.config.health_interval();
        let probe_timeout = self.config.probe_timeout();
        let threshold = self.config.unhealthy_threshold;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !registry.is_registered(&conn).await {
                    break;
                }

                let outcome = tokio::select! {
                    _ = token.cancelled() => break,
                    outcome = probe_once(&conn, probe_timeout) => outcome,
                };
                conn.record_probe(&outcome, threshold);
            }
            debug!("health task for {} stopped", conn.device_id);
        });
    }
}
