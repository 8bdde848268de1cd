/**
 * TRANSPORT AGENTS - Canal kernel → agent
 *
 * RÔLE :
 * Abstraction du lien vers un agent de device. Le registre et le dispatcher
 * ne voient que le trait `AgentTransport` ; l'implémentation HTTP/JSON parle
 * l'API exposée par `shellgate-agent`.
 *
 * FONCTIONNEMENT :
 * - `Connector` : ouvre un transport vers une adresse (connexion TCP bornée)
 * - `HttpTransport` : client reqwest, deadline propagée via `x-request-timeout-ms`
 * - L'identifiant de commande est poussé comme un segment d'URL encodé,
 *   jamais concaténé au chemin
 * - Les corps d'erreur `{kind, message}` de l'agent redeviennent des `ErrorKind`
 * - Timeout reqwest → `Timeout`, toute autre panne réseau → `TransportFailure`
 *
 * ÉTAT :
 * `Ready` tant que le transport est ouvert, `ShuttingDown` après `close()`.
 */

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shellgate_shared::contracts::{
    ExecuteCommandRequest, HealthCheckResponse, ListCommandsResponse, ReloadConfigResponse,
    COMMANDS_PATH, DEADLINE_HEADER, EXECUTE_SEGMENT, HEALTH_PATH, PIN_HEADER, RELOAD_PATH,
    REQUEST_ID_HEADER,
};
use shellgate_shared::{is_valid_command_id, ErrorBody, ErrorKind, ExecutionResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Ready,
    NotReady,
    ShuttingDown,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    /// Sortie partielle renvoyée par l'agent sur timeout
    pub output: Option<String>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportFailure, message)
    }
}

impl From<ErrorBody> for TransportError {
    fn from(body: ErrorBody) -> Self {
        Self {
            kind: body.kind,
            message: body.message,
            output: body.output,
        }
    }
}

/// Métadonnées d'appel transmises à l'agent
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: String,
    pub pin: Option<String>,
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn health_check(&self, deadline: Duration) -> Result<HealthCheckResponse, TransportError>;

    async fn execute(
        &self,
        command_id: &str,
        request: &ExecuteCommandRequest,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ExecutionResult, TransportError>;

    async fn list_commands(
        &self,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ListCommandsResponse, TransportError>;

    async fn reload(
        &self,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ReloadConfigResponse, TransportError>;

    fn state(&self) -> TransportState;

    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn AgentTransport>, TransportError>;
}

/// Connecteur HTTP : vérifie que l'agent accepte une connexion TCP puis
/// prépare un client reqwest dédié au device.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn AgentTransport>, TransportError> {
        let (base_url, authority) = split_address(address)?;

        match tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(&authority)).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => return Err(TransportError::failure(format!("connect {}: {}", authority, e))),
            Err(_) => {
                return Err(TransportError::failure(format!(
                    "connect {} timed out after {}s",
                    authority,
                    self.connect_timeout.as_secs()
                )))
            }
        }

        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| TransportError::failure(format!("http client: {}", e)))?;

        debug!("transport ready for {}", base_url);
        Ok(Arc::new(HttpTransport {
            base_url,
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Sépare `host:port` ou `http(s)://host:port[/...]` en (URL de base, autorité TCP)
fn split_address(address: &str) -> Result<(String, String), TransportError> {
    let trimmed = address.trim().trim_end_matches('/');
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("http".to_string(), trimmed),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() || !authority.contains(':') {
        return Err(TransportError::failure(format!(
            "invalid agent address '{}': expected host:port",
            address
        )));
    }
    Ok((format!("{}://{}", scheme, rest), authority.to_string()))
}

pub struct HttpTransport {
    base_url: String,
    client: Client,
    closed: AtomicBool,
}

impl HttpTransport {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn execute_url(&self, command_id: &str) -> Result<Url, TransportError> {
        if !is_valid_command_id(command_id) {
            return Err(TransportError::new(
                ErrorKind::InvalidRequest,
                format!("invalid command id {:?}", command_id),
            ));
        }
        let mut url = Url::parse(&self.url(COMMANDS_PATH))
            .map_err(|e| TransportError::failure(format!("invalid agent url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::failure(format!("agent url {} has no path", self.base_url)))?
            .push(command_id)
            .push(EXECUTE_SEGMENT);
        Ok(url)
    }

    fn with_meta(builder: RequestBuilder, meta: &RequestMeta, deadline: Duration) -> RequestBuilder {
        let mut builder = builder
            .timeout(deadline)
            .header(DEADLINE_HEADER, deadline.as_millis().to_string());
        if !meta.request_id.is_empty() {
            builder = builder.header(REQUEST_ID_HEADER, meta.request_id.as_str());
        }
        if let Some(pin) = &meta.pin {
            builder = builder.header(PIN_HEADER, pin.as_str());
        }
        builder
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::new(ErrorKind::Unavailable, "transport closed"));
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(classify);
        }

        let bytes = response.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.into()),
            Err(_) => Err(TransportError::new(
                ErrorKind::from_http_status(status.as_u16()),
                format!("agent answered {}", status),
            )),
        }
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::new(ErrorKind::Timeout, "agent did not answer before the deadline")
    } else if e.is_decode() {
        TransportError::failure(format!("invalid agent response: {}", e))
    } else {
        TransportError::failure(e.to_string())
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn health_check(&self, deadline: Duration) -> Result<HealthCheckResponse, TransportError> {
        let builder = self.client.get(self.url(HEALTH_PATH)).timeout(deadline);
        self.send(builder).await
    }

    async fn execute(
        &self,
        command_id: &str,
        request: &ExecuteCommandRequest,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ExecutionResult, TransportError> {
        let builder = self.client.post(self.execute_url(command_id)?).json(request);
        self.send(Self::with_meta(builder, meta, deadline)).await
    }

    async fn list_commands(
        &self,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ListCommandsResponse, TransportError> {
        let builder = self.client.get(self.url(COMMANDS_PATH));
        self.send(Self::with_meta(builder, meta, deadline)).await
    }

    async fn reload(
        &self,
        meta: &RequestMeta,
        deadline: Duration,
    ) -> Result<ReloadConfigResponse, TransportError> {
        let builder = self.client.post(self.url(RELOAD_PATH));
        self.send(Self::with_meta(builder, meta, deadline)).await
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::Acquire) {
            TransportState::ShuttingDown
        } else {
            TransportState::Ready
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Transport en mémoire pour les tests du registre et du dispatcher

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    pub struct MockTransport {
        pub serving: AtomicBool,
        pub state: Mutex<TransportState>,
        pub probes: AtomicUsize,
        pub executions: AtomicUsize,
        pub closed: AtomicBool,
        /// Délai simulé de chaque appel
        pub latency: Mutex<Duration>,
        pub last_pin: Mutex<Option<String>>,
        pub last_deadline: Mutex<Option<Duration>>,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                serving: AtomicBool::new(true),
                state: Mutex::new(TransportState::Ready),
                probes: AtomicUsize::new(0),
                executions: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                last_pin: Mutex::new(None),
                last_deadline: Mutex::new(None),
            })
        }

        pub fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        async fn wait(&self) {
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
        }
    }

    #[async_trait]
    impl AgentTransport for MockTransport {
        async fn health_check(&self, _deadline: Duration) -> Result<HealthCheckResponse, TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            if !self.serving.load(Ordering::SeqCst) {
                return Err(TransportError::failure("connection refused"));
            }
            Ok(HealthCheckResponse {
                status: shellgate_shared::contracts::ServingStatus::Serving,
                version: "test".into(),
                uptime_seconds: 1,
                hostname: None,
            })
        }

        async fn execute(
            &self,
            command_id: &str,
            _request: &ExecuteCommandRequest,
            meta: &RequestMeta,
            deadline: Duration,
        ) -> Result<ExecutionResult, TransportError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            *self.last_pin.lock() = meta.pin.clone();
            *self.last_deadline.lock() = Some(deadline);
            self.wait().await;
            match command_id {
                "fails" => Ok(ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some("exit status 1".into()),
                    exit_code: 1,
                    duration_ms: 1,
                    failed_step: None,
                }),
                "missing" => Err(TransportError::new(ErrorKind::NotFound, "command not found: missing")),
                _ => Ok(ExecutionResult {
                    success: true,
                    output: format!("{}\n", command_id),
                    error: None,
                    exit_code: 0,
                    duration_ms: 1,
                    failed_step: None,
                }),
            }
        }

        async fn list_commands(
            &self,
            _meta: &RequestMeta,
            _deadline: Duration,
        ) -> Result<ListCommandsResponse, TransportError> {
            self.wait().await;
            Ok(ListCommandsResponse::default())
        }

        async fn reload(
            &self,
            _meta: &RequestMeta,
            _deadline: Duration,
        ) -> Result<ReloadConfigResponse, TransportError> {
            Ok(ReloadConfigResponse {
                success: true,
                message: "reloaded".into(),
                commands_loaded: 0,
            })
        }

        fn state(&self) -> TransportState {
            if self.closed.load(Ordering::SeqCst) {
                TransportState::ShuttingDown
            } else {
                *self.state.lock()
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connecteur qui renvoie des transports pré-enregistrés par adresse
    #[derive(Default)]
    pub struct MockConnector {
        pub transports: Mutex<HashMap<String, Arc<MockTransport>>>,
        pub connect_delay: Mutex<Duration>,
    }

    impl MockConnector {
        pub fn with(address: &str, transport: Arc<MockTransport>) -> Arc<Self> {
            let connector = Self::default();
            connector.transports.lock().insert(address.to_string(), transport);
            Arc::new(connector)
        }

        pub fn add(&self, address: &str, transport: Arc<MockTransport>) {
            self.transports.lock().insert(address.to_string(), transport);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, address: &str) -> Result<Arc<dyn AgentTransport>, TransportError> {
            let delay = *self.connect_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let transport = self.transports.lock().get(address).cloned();
            match transport {
                Some(t) => Ok(t as Arc<dyn AgentTransport>),
                None => Err(TransportError::failure(format!("connection refused: {}", address))),
            }
        }
    }
}
