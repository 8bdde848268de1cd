//! Kernel → real agent over HTTP on an ephemeral port
#![cfg(unix)]

use shellgate_agent::http::build_router;
use shellgate_agent::{AgentService, ExecutionEngine, YamlCommandRepository};
use shellgate_kernel::transport::RequestMeta;
use shellgate_kernel::{
    AgentTransport, CallContext, CommandDispatcher, ConnectionRegistry, Connector, DeviceHealth,
    DispatchConfig, HttpConnector, RegistryConfig,
};
use shellgate_shared::contracts::ExecuteCommandRequest;
use shellgate_shared::{ErrorKind, SecurityGate, SecurityPolicy};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

fn commands_yaml(marker: &Path) -> String {
    format!(
        r#"
commands:
  - id: echo_test
    description: Echo a greeting
    platforms:
      all: echo hello
  - id: touch_marker
    platforms:
      all: touch {}
"#,
        marker.display()
    )
}

async fn spawn_agent(policy: SecurityPolicy, commands: &str) -> (SocketAddr, NamedTempFile) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(commands.as_bytes()).unwrap();

    let repository = YamlCommandRepository::open(file.path()).unwrap();
    let gate = Arc::new(SecurityGate::new(&policy).unwrap());
    let service = AgentService::new(gate, ExecutionEngine::new(), Arc::new(repository), Duration::from_secs(60));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::new(service));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (addr, file)
}

fn dispatcher(gate_policy: SecurityPolicy) -> CommandDispatcher {
    let registry = ConnectionRegistry::new(
        RegistryConfig::default(),
        Arc::new(HttpConnector::new(Duration::from_secs(2))),
    );
    let gate = Arc::new(SecurityGate::new(&gate_policy).unwrap());
    CommandDispatcher::new(gate, registry, DispatchConfig::default())
}

#[tokio::test]
async fn test_execute_through_real_agent() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _file) = spawn_agent(SecurityPolicy::default(), &commands_yaml(&dir.path().join("m"))).await;

    let dispatcher = dispatcher(SecurityPolicy::default());
    let registry = dispatcher.registry().clone();
    registry.add_connection("d1", &addr.to_string()).await.unwrap();

    let ctx = CallContext::new("127.0.0.1", None);
    let health = dispatcher.probe(&ctx, "d1").await.unwrap();
    assert!(health.is_serving());
    assert_eq!(registry.list().await[0].health, DeviceHealth::Healthy);

    let result = dispatcher
        .execute(&ctx, "d1", "echo_test", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, "hello\n");
    assert_eq!(result.exit_code, 0);

    let listed = dispatcher.list(&ctx, "d1").await.unwrap();
    assert_eq!(listed.commands.len(), 2);

    let err = dispatcher.execute(&ctx, "d1", "unknown", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    registry.stop_all().await;
}

#[tokio::test]
async fn test_agent_pin_rejects_empty_pin_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let (addr, _file) = spawn_agent(
        SecurityPolicy {
            pin_required: true,
            pin: Some("1234".into()),
            ..SecurityPolicy::default()
        },
        &commands_yaml(&marker),
    )
    .await;

    let dispatcher = dispatcher(SecurityPolicy::default());
    dispatcher.registry().add_connection("d1", &addr.to_string()).await.unwrap();
    let ctx = CallContext::new("127.0.0.1", Some(String::new()));
    dispatcher.probe(&ctx, "d1").await.unwrap();

    let err = dispatcher
        .execute(&ctx, "d1", "touch_marker", Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!marker.exists());

    let ctx = CallContext::new("127.0.0.1", Some("1234".into()));
    let result = dispatcher
        .execute(&ctx, "d1", "touch_marker", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(result.success);
    assert!(marker.exists());
}

#[tokio::test]
async fn test_command_id_cannot_reach_other_agent_routes() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let (addr, file) = spawn_agent(SecurityPolicy::default(), &commands_yaml(&marker)).await;

    // a reload on the agent would pick up this third command
    let grown = format!(
        "{}  - id: extra\n    platforms:\n      all: echo extra\n",
        commands_yaml(&marker)
    );
    std::fs::write(file.path(), grown).unwrap();

    let dispatcher = dispatcher(SecurityPolicy::default());
    dispatcher.registry().add_connection("d1", &addr.to_string()).await.unwrap();
    let ctx = CallContext::new("127.0.0.1", None);
    dispatcher.probe(&ctx, "d1").await.unwrap();

    for id in ["../../../api/v1/reload?", "..%2F..%2F..%2Fapi%2Fv1%2Freload", "../../reload#"] {
        let err = dispatcher
            .execute(&ctx, "d1", id, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{id:?}");
    }

    // the transport refuses on its own as well
    let transport = HttpConnector::new(Duration::from_secs(2))
        .connect(&addr.to_string())
        .await
        .unwrap();
    let err = transport
        .execute(
            "../../../api/v1/reload?",
            &ExecuteCommandRequest::default(),
            &RequestMeta::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidRequest);

    let listed = dispatcher.list(&ctx, "d1").await.unwrap();
    assert_eq!(listed.commands.len(), 2);
    assert!(listed.commands.iter().all(|c| c.id != "extra"));
}

#[tokio::test]
async fn test_unreachable_agent_is_transport_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dispatcher = dispatcher(SecurityPolicy::default());
    let err = dispatcher
        .registry()
        .add_connection("d1", &addr.to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert!(dispatcher.registry().list().await.is_empty());
}
