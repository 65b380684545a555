//! Coordinator, agent and client over real sockets on 127.0.0.1, with the
//! in-process loopback peer transport standing in for WebRTC.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use homechannel_lib::agent::{AgentIdentity, AgentRuntime};
use homechannel_lib::apps::{
    AppRegistry, ChannelRouter, OperationResult, OperationTable, TableHandler,
};
use homechannel_lib::client::{
    ConnectError, ConnectOptions, Connection, ConnectionEvent, ConnectionState, EventKind,
    MuxError,
};
use homechannel_lib::config::{AgentConfig, ClientConfig, CoordinatorConfig};
use homechannel_lib::coordinator::{server, udp, Coordinator};
use homechannel_lib::crypto::SignatureAlgorithm;
use homechannel_lib::rtc::loopback::LoopbackHub;
use homechannel_lib::signaling::WsSignalingConnector;

const PASSWORD: &str = "open sesame";

struct Echo;

fn say(_: Arc<Echo>, params: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move { Ok::<_, String>(json!({ "said": params["text"] })) })
}

fn stall(_: Arc<Echo>, _: Value) -> BoxFuture<'static, OperationResult> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, String>(Value::Null)
    })
}

struct Stack {
    coordinator: Arc<Coordinator>,
    agent_key: String,
    client_config: ClientConfig,
    hub: LoopbackHub,
    shutdown: CancellationToken,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Stack {
    fn connection(&self) -> Connection {
        Connection::new(
            self.client_config.clone(),
            Arc::new(WsSignalingConnector),
            Arc::new(self.hub.clone()),
        )
    }
}

async fn start() -> Stack {
    let shutdown = CancellationToken::new();

    // Coordinator on ephemeral ports
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = socket.local_addr().unwrap();
    let ws_addr = listener.local_addr().unwrap();
    let (coordinator, outbound_rx) = Coordinator::new(CoordinatorConfig::default());
    let coordinator = Arc::new(coordinator);
    tokio::spawn(udp::serve_agents(
        socket,
        coordinator.clone(),
        outbound_rx,
        shutdown.clone(),
    ));
    tokio::spawn(server::serve(listener, coordinator.clone(), shutdown.clone()));

    // Agent with one echo app and one presentation-only app
    let hub = LoopbackHub::new();
    let registry = AppRegistry::new();
    registry
        .register(
            "echo",
            Arc::new(TableHandler::new(
                Arc::new(Echo),
                OperationTable::new().with("say", say).with("stall", stall),
            )),
        )
        .unwrap();
    registry.register_presentation("dashboard").unwrap();

    let identity = Arc::new(AgentIdentity::generate(SignatureAlgorithm::Ed25519));
    let agent_key = identity.public_key();
    let runtime = Arc::new(AgentRuntime::new(
        AgentConfig {
            coordinator_addr: udp_addr.to_string(),
            password: PASSWORD.into(),
            ..Default::default()
        },
        identity,
        Arc::new(hub.answerer()),
        Arc::new(ChannelRouter::new(Arc::new(registry))),
    ));
    tokio::spawn(runtime.run(shutdown.clone()));

    // Wait for registration
    for _ in 0..100 {
        if coordinator.registry().count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.registry().count(), 1, "agent never registered");

    let client_config = ClientConfig {
        coordinator_url: format!("ws://{}", ws_addr),
        poll_interval_ms: 50,
        poll_max_attempts: 40,
        ..Default::default()
    };

    Stack {
        coordinator,
        agent_key,
        client_config,
        hub,
        shutdown,
    }
}

#[tokio::test]
async fn test_correct_password_reaches_connected() {
    let stack = start().await;
    let conn = stack.connection();

    let mux = conn
        .connect(ConnectOptions::new(stack.agent_key.clone(), PASSWORD))
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    let apps = mux.list_apps().await.unwrap();
    let names: Vec<_> = apps.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["dashboard", "echo"]);

    let echo = mux.open_app_channel("echo").await.unwrap();
    let result = echo.request("say", json!({"text": "hi"})).await.unwrap();
    assert_eq!(result, json!({"said": "hi"}));

    // Unknown operations are answered, not dropped
    let err = echo.request("format_disk", json!({})).await.unwrap_err();
    assert!(matches!(err, MuxError::App(ref m) if m.contains("format_disk")));

    // The answered session was consumed by the successful poll
    assert_eq!(stack.coordinator.sessions().count(), 0);

    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wrong_password_creates_no_session() {
    let stack = start().await;
    let conn = stack.connection();
    let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = errors.clone();
    conn.events().subscribe(EventKind::Error, move |e| seen.lock().push(e.clone()));

    let err = conn
        .connect(ConnectOptions::new(stack.agent_key.clone(), "open barley"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::AuthenticationFailed));
    assert!(!err.is_retryable());
    assert_eq!(stack.coordinator.sessions().count(), 0);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(
        errors.lock().as_slice(),
        [ConnectionEvent::Error { .. }]
    ));
}

#[tokio::test]
async fn test_unknown_agent_is_offline() {
    let stack = start().await;
    let stranger = AgentIdentity::generate(SignatureAlgorithm::Ed25519);

    let err = stack
        .connection()
        .connect(ConnectOptions::new(stranger.public_key(), PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::AgentOffline));
}

#[tokio::test]
async fn test_disconnect_rejects_pending_request_once() {
    let stack = start().await;
    let conn = stack.connection();
    let mux = conn
        .connect(ConnectOptions::new(stack.agent_key.clone(), PASSWORD))
        .await
        .unwrap();

    let echo = mux.open_app_channel("echo").await.unwrap();
    let waiter = {
        let echo = echo.clone();
        tokio::spawn(async move { echo.request("stall", json!({})).await })
    };
    while echo.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    conn.disconnect().await;
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(MuxError::Disconnected)));
    assert_eq!(echo.pending_count(), 0);

    // Already closed: further requests fail immediately
    assert!(matches!(
        echo.request("say", json!({})).await,
        Err(MuxError::Disconnected)
    ));
}

#[tokio::test]
async fn test_control_label_is_reserved() {
    let stack = start().await;
    let conn = stack.connection();
    let mux = conn
        .connect(ConnectOptions::new(stack.agent_key.clone(), PASSWORD))
        .await
        .unwrap();

    assert!(matches!(
        mux.open_app_channel("control").await,
        Err(MuxError::ReservedLabel(_))
    ));
    // The real control channel still works
    assert_eq!(mux.list_apps().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_agent_shutdown_disconnects_client() {
    let stack = start().await;
    let conn = stack.connection();
    let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = reasons.clone();
    conn.events().subscribe(EventKind::Disconnected, move |e| {
        if let ConnectionEvent::Disconnected { reason } = e {
            seen.lock().push(reason.clone());
        }
    });

    let mux = conn
        .connect(ConnectOptions::new(stack.agent_key.clone(), PASSWORD))
        .await
        .unwrap();
    assert_eq!(mux.list_apps().await.unwrap().len(), 2);

    // Agent and coordinator go down together
    stack.shutdown.cancel();
    for _ in 0..100 {
        if conn.state() == ConnectionState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(mux.is_closed());
    assert!(conn.multiplexer().is_none());
    assert!(matches!(
        reasons.lock().as_slice(),
        [Some(reason)] if reason.starts_with("Transport lost")
    ));
    assert!(matches!(
        mux.list_apps().await,
        Err(MuxError::Disconnected)
    ));
}
