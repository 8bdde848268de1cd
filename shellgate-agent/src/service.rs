//! Agent service: the four calls served on a device
//!
//! Every call is admitted by the local `SecurityGate` (rate limit keyed by
//! caller address, whitelist, PIN) before the repository or the engine is
//! touched. Health checks bypass admission so the kernel's probes never
//! consume a client's quota.

use shellgate_shared::contracts::{
    CommandSummary, HealthCheckResponse, ListCommandsResponse, ReloadConfigResponse, ServingStatus,
};
use shellgate_shared::{CommandDefinition, ErrorKind, ExecutionResult, SecurityError, SecurityGate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::execution::{ExecutionEngine, ExecutionError};
use crate::repository::{CommandRepository, RepositoryError};

/// Headroom kept from a propagated deadline so our answer beats the caller's timer
pub const PROPAGATION_MARGIN: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("command not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Security(e) => e.kind(),
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::Execution(e) => e.kind(),
            AgentError::Repository(e) => e.kind(),
        }
    }
}

/// Caller metadata extracted by the HTTP layer
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub client_key: String,
    pub pin: Option<String>,
    /// Remaining deadline propagated by the kernel
    pub deadline: Option<Duration>,
}

pub struct AgentService {
    gate: Arc<SecurityGate>,
    engine: ExecutionEngine,
    repository: Arc<dyn CommandRepository>,
    max_timeout: Duration,
    started_at: Instant,
    hostname: Option<String>,
}

impl AgentService {
    pub fn new(
        gate: Arc<SecurityGate>,
        engine: ExecutionEngine,
        repository: Arc<dyn CommandRepository>,
        max_timeout: Duration,
    ) -> Self {
        let hostname = hostname::get().ok().map(|h| h.to_string_lossy().to_string());
        Self {
            gate,
            engine,
            repository,
            max_timeout,
            started_at: Instant::now(),
            hostname,
        }
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    /// ExecuteCommand
    pub async fn execute(
        &self,
        ctx: &CallContext,
        command_id: &str,
        requested_timeout: Option<Duration>,
    ) -> Result<ExecutionResult, AgentError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let def = self.authorize(ctx, command_id)?;

        let deadline = self.effective_deadline(&def, requested_timeout, ctx.deadline);
        info!(
            "Execute {} for {} (deadline: {}ms)",
            command_id,
            ctx.client_key,
            deadline.as_millis()
        );

        let result = self.engine.run(&def, deadline).await?;
        if !result.success {
            warn!("Command {} reported failure (exit code {})", command_id, result.exit_code);
        }
        Ok(result)
    }

    /// ListCommands, optionally filtered by category
    pub fn list(&self, ctx: &CallContext, category: Option<&str>) -> Result<ListCommandsResponse, AgentError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let defs = match category {
            Some(category) => self.repository.by_category(category),
            None => self.repository.list(),
        };
        Ok(self.summaries(defs))
    }

    /// ListCommands restricted to the homepage subset
    pub fn homepage(&self, ctx: &CallContext) -> Result<ListCommandsResponse, AgentError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        Ok(self.summaries(self.repository.homepage()))
    }

    /// ReloadConfig; a failed reload is reported, not raised
    pub fn reload(&self, ctx: &CallContext) -> Result<ReloadConfigResponse, AgentError> {
        self.gate.check_rate_limit(&ctx.client_key)?;
        let response = match self.repository.reload() {
            Ok(count) => ReloadConfigResponse {
                success: true,
                message: format!("Reloaded {} commands at {}", count, chrono::Utc::now().to_rfc3339()),
                commands_loaded: count,
            },
            Err(e) => {
                warn!("Command reload failed: {}", e);
                ReloadConfigResponse {
                    success: false,
                    message: format!("Reload failed: {}", e),
                    commands_loaded: self.repository.list().len(),
                }
            }
        };
        Ok(response)
    }

    /// HealthCheck
    pub fn health(&self) -> HealthCheckResponse {
        HealthCheckResponse {
            status: ServingStatus::Serving,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            hostname: self.hostname.clone(),
        }
    }

    // Whitelist and PIN failures both answer Unauthorized whether or not the
    // command exists, so an unauthorized caller cannot enumerate commands.
    fn authorize(&self, ctx: &CallContext, command_id: &str) -> Result<CommandDefinition, AgentError> {
        let def = self.repository.get(command_id);

        if let Err(e) = self.gate.validate_command_access(command_id) {
            match &def {
                Some(d) if d.security.whitelisted => {}
                _ => return Err(e.into()),
            }
        }

        let pin_check = self.gate.validate_pin(ctx.pin.as_deref());
        match def {
            None => {
                pin_check?;
                Err(AgentError::NotFound(command_id.to_string()))
            }
            Some(def) => {
                if def.security.requires_pin || def.security.admin_only {
                    pin_check?;
                }
                Ok(def)
            }
        }
    }

    fn effective_deadline(
        &self,
        def: &CommandDefinition,
        requested: Option<Duration>,
        propagated: Option<Duration>,
    ) -> Duration {
        let mut deadline = Duration::from_millis(def.timeout_ms).min(self.max_timeout);
        if let Some(requested) = requested {
            deadline = deadline.min(requested);
        }
        if let Some(propagated) = propagated {
            let budget = if propagated > PROPAGATION_MARGIN * 5 {
                propagated - PROPAGATION_MARGIN
            } else {
                propagated
            };
            deadline = deadline.min(budget);
        }
        deadline
    }

    fn summaries(&self, defs: Vec<CommandDefinition>) -> ListCommandsResponse {
        let commands = defs
            .into_iter()
            .map(|def| {
                let resolved = ExecutionEngine::resolve(&def, self.engine.platform()).ok();
                CommandSummary {
                    description: if def.description.is_empty() {
                        def.name.clone().unwrap_or_default()
                    } else {
                        def.description.clone()
                    },
                    platform_supported: resolved.is_some(),
                    platform_command: resolved.map(|c| c.display()),
                    id: def.id,
                }
            })
            .collect();
        ListCommandsResponse { commands }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::repository::YamlCommandRepository;
    use shellgate_shared::SecurityPolicy;
    use std::io::Write;

    pub(crate) const COMMANDS: &str = r#"
commands:
  - id: echo_test
    description: Echo a greeting
    homepage: true
    platforms:
      all: echo hello
  - id: open_status
    description: Status without PIN
    category: diagnostics
    platforms:
      all: echo status
    security:
      requires_pin: false
      whitelisted: true
  - id: slow
    timeout_ms: 10000
    platforms:
      all: sleep 5
  - id: windows_only
    platforms:
      windows: ver
"#;

    pub(crate) fn service_with(policy: SecurityPolicy) -> (AgentService, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(COMMANDS.as_bytes()).unwrap();
        let repo = YamlCommandRepository::open(file.path()).unwrap();
        let service = AgentService::new(
            Arc::new(SecurityGate::new(&policy).unwrap()),
            ExecutionEngine::with_platform("linux"),
            Arc::new(repo),
            Duration::from_secs(60),
        );
        (service, file)
    }

    fn ctx(pin: Option<&str>) -> CallContext {
        CallContext {
            client_key: "127.0.0.1".into(),
            pin: pin.map(String::from),
            deadline: None,
        }
    }

    fn pin_policy() -> SecurityPolicy {
        SecurityPolicy {
            pin_required: true,
            pin: Some("1234".into()),
            ..SecurityPolicy::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_echo() {
        let (service, _file) = service_with(SecurityPolicy::default());
        let result = service.execute(&ctx(None), "echo_test", None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_empty_pin_rejected_before_running() {
        let (service, _file) = service_with(pin_policy());
        let err = service.execute(&ctx(Some("")), "echo_test", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pin_exempt_command() {
        let (service, _file) = service_with(pin_policy());
        let result = service.execute(&ctx(None), "open_status", None).await.unwrap();
        assert!(result.success);

        let result = service.execute(&ctx(Some("1234")), "echo_test", None).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unknown_command_hidden_behind_pin() {
        let (service, _file) = service_with(pin_policy());
        let err = service.execute(&ctx(None), "nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let err = service.execute(&ctx(Some("1234")), "nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_whitelist_with_per_command_override() {
        let (service, _file) = service_with(SecurityPolicy {
            whitelist_enabled: true,
            allowed_commands: vec!["echo_test".into()],
            ..SecurityPolicy::default()
        });

        assert!(service.execute(&ctx(None), "echo_test", None).await.is_ok());
        assert!(service.execute(&ctx(None), "open_status", None).await.is_ok());

        let err = service.execute(&ctx(None), "slow", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = service.execute(&ctx(None), "nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_propagated_deadline_bounds_execution() {
        let (service, _file) = service_with(SecurityPolicy::default());
        let mut call = ctx(None);
        call.deadline = Some(Duration::from_millis(300));

        let err = service.execute(&call, "slow", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_platform_unsupported() {
        let (service, _file) = service_with(SecurityPolicy::default());
        let err = service.execute(&ctx(None), "windows_only", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_every_call() {
        let (service, _file) = service_with(SecurityPolicy {
            requests_per_window: 2,
            ..SecurityPolicy::default()
        });
        assert!(service.list(&ctx(None), None).is_ok());
        assert!(service.reload(&ctx(None)).is_ok());
        let err = service.list(&ctx(None), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        // health checks are never limited
        assert!(service.health().is_serving());
    }

    #[test]
    fn test_list_summaries() {
        let (service, _file) = service_with(SecurityPolicy::default());
        let all = service.list(&ctx(None), None).unwrap();
        assert_eq!(all.commands.len(), 4);

        let windows_only = all.commands.iter().find(|c| c.id == "windows_only").unwrap();
        assert!(!windows_only.platform_supported);
        assert!(windows_only.platform_command.is_none());

        let echo = all.commands.iter().find(|c| c.id == "echo_test").unwrap();
        assert_eq!(echo.platform_command.as_deref(), Some("echo hello"));

        let diagnostics = service.list(&ctx(None), Some("diagnostics")).unwrap();
        assert_eq!(diagnostics.commands.len(), 1);
        assert_eq!(service.homepage(&ctx(None)).unwrap().commands[0].id, "echo_test");
    }

    #[test]
    fn test_reload_reports_failure() {
        let (service, file) = service_with(SecurityPolicy::default());
        std::fs::write(file.path(), "commands: [").unwrap();

        let response = service.reload(&ctx(None)).unwrap();
        assert!(!response.success);
        assert_eq!(response.commands_loaded, 4);
    }
}
