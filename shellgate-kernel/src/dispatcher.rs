/**
 * DISPATCHER DE COMMANDES - Point d'entrée des appels vers les devices
 *
 * RÔLE :
 * Admission (SecurityGate du kernel), résolution du transport dans le
 * registre, calcul de la deadline effective puis transfert à l'agent.
 *
 * FONCTIONNEMENT :
 * - Execute : rate limit → identifiant → whitelist → PIN, tout avant le
 *   moindre appel réseau
 * - Whitelist et PIN du kernel valent pour toute la passerelle ; les drapeaux
 *   par commande (`requires_pin`, `whitelisted`) ne sont connus que de l'agent
 * - List / Reload / Probe : rate limit seul, deadline admin (10s par défaut)
 * - La deadline couvre lookup + appel ; elle est propagée à l'agent
 * - Pas de retry : une panne transport remonte telle quelle
 * - Une commande en échec reste un `Ok` avec `success = false`
 */

use serde::{Deserialize, Serialize};
use shellgate_shared::contracts::{
    ExecuteCommandRequest, HealthCheckResponse, ListCommandsResponse, ReloadConfigResponse,
};
use shellgate_shared::{is_valid_command_id, ErrorKind, ExecutionResult, SecurityError, SecurityGate};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionRegistry, RegistryError};
use crate::transport::{RequestMeta, TransportError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("deadline of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),
    #[error("invalid command id {0:?}")]
    InvalidCommandId(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Security(e) => e.kind(),
            DispatchError::Registry(e) => e.kind(),
            DispatchError::Transport(e) => e.kind,
            DispatchError::Timeout(_) => ErrorKind::Timeout,
            DispatchError::InvalidCommandId(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Sortie partielle d'une exécution interrompue côté agent
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            DispatchError::Transport(e) => e.output.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    /// Deadline de List / Reload / Probe
    #[serde(default = "default_admin_timeout_secs")]
    pub admin_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    300
}

fn default_admin_timeout_secs() -> u64 {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            admin_timeout_secs: default_admin_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn effective_deadline(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_timeout_secs);
        requested
            .unwrap_or(Duration::from_secs(self.default_timeout_secs))
            .min(max)
    }

    pub fn admin_deadline(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }
}

/// Identité de l'appelant pour un appel
#[derive(Debug, Clone)]
pub struct CallContext {
    pub client_key: String,
    pub pin: Option<String>,
    pub request_id: String,
}

impl CallContext {
    pub fn new(client_key: impl Into<String>, pin: Option<String>) -> Self {
        Self {
            client_key: client_key.into(),
            pin,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn meta(&self) -> RequestMeta {
        RequestMeta {
            request_id: self.request_id.clone(),
            pin: self.pin.clone(),
        }
    }
}

pub struct CommandDispatcher {
    gate: Arc<SecurityGate>,
    registry: ConnectionRegistry,
    config: DispatchConfig,
}

impl CommandDispatcher {
    pub fn new(gate: Arc<SecurityGate>, registry: ConnectionRegistry, config: DispatchConfig) -> Self {
        Self { gate, registry, config }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub async fn execute(
        &self,
        ctx: &CallContext,
        device_id: &str,
        command_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, DispatchError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        if !is_valid_command_id(command_id) {
            return Err(DispatchError::InvalidCommandId(command_id.to_string()));
        }
        self.gate.validate_command_access(command_id)?;
        self.gate.validate_pin(ctx.pin.as_deref())?;

        let deadline = self.config.effective_deadline(timeout);
        info!(
            "[{}] execute {} on {} (deadline {}ms)",
            ctx.request_id,
            command_id,
            device_id,
            deadline.as_millis()
        );

        let meta = ctx.meta();
        let request = ExecuteCommandRequest {
            timeout_seconds: timeout.map(|t| t.as_secs().max(1)),
        };
        let result = self
            .forward(device_id, deadline, |transport, remaining| async move {
                transport.execute(command_id, &request, &meta, remaining).await
            })
            .await;

        match &result {
            Ok(r) if !r.success => warn!(
                "[{}] {} on {} failed (exit code {})",
                ctx.request_id, command_id, device_id, r.exit_code
            ),
            Ok(r) => debug!("[{}] {} on {} done in {}ms", ctx.request_id, command_id, device_id, r.duration_ms),
            Err(e) => warn!("[{}] {} on {}: {}", ctx.request_id, command_id, device_id, e),
        }
        result
    }

    pub async fn list(&self, ctx: &CallContext, device_id: &str) -> Result<ListCommandsResponse, DispatchError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let meta = ctx.meta();
        self.forward(device_id, self.config.admin_deadline(), |transport, remaining| async move {
            transport.list_commands(&meta, remaining).await
        })
        .await
    }

    pub async fn reload(&self, ctx: &CallContext, device_id: &str) -> Result<ReloadConfigResponse, DispatchError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let meta = ctx.meta();
        let response = self
            .forward(device_id, self.config.admin_deadline(), |transport, remaining| async move {
                transport.reload(&meta, remaining).await
            })
            .await?;
        if !response.success {
            warn!("[{}] reload on {} failed: {}", ctx.request_id, device_id, response.message);
        }
        Ok(response)
    }

    /// HealthCheck manuel : passe par le registre pour mettre à jour l'état
    pub async fn probe(&self, ctx: &CallContext, device_id: &str) -> Result<HealthCheckResponse, DispatchError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let deadline = self.config.admin_deadline();
        match tokio::time::timeout(deadline, self.registry.probe(device_id, deadline)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DispatchError::Timeout(deadline)),
        }
    }

    // lookup + appel sous une seule deadline
    async fn forward<T, F, Fut>(&self, device_id: &str, deadline: Duration, call: F) -> Result<T, DispatchError>
    where
        F: FnOnce(Arc<dyn crate::transport::AgentTransport>, Duration) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let started = Instant::now();
        let work = async {
            let transport = self.registry.get_client(device_id).await?;
            let remaining = deadline.saturating_sub(started.elapsed());
            call(transport, remaining).await.map_err(DispatchError::from)
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(deadline)),
        }
    }
}
