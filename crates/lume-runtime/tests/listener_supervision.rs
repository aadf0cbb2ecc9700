//! Integration tests for listener isolation and restart.
//!
//! A listener that cannot bind or whose transport fails must not take the
//! other protocol or the execution loop down with it.

use lume_runtime::config::{
    PvBinding, ServerConfig, VariableDefinition, DEFAULT_CA_PORT, DEFAULT_PVA_PORT,
};
use lume_runtime::engine::EvaluationError;
use lume_runtime::model::{InputSnapshot, OutputValues};
use lume_runtime::transport::local::Endpoint;
use lume_runtime::transport::{
    Access, PvTransport, TransportError, TransportFactory, WireValue,
};
use lume_runtime::{Controller, ListenerFault, ListenerState, LocalHub, Server};
use lume_types::Protocol;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Hub factory whose first `failures` connects for `protocol` fail.
struct FlakyFactory {
    hub: LocalHub,
    protocol: Protocol,
    failures: AtomicU32,
}

impl TransportFactory for FlakyFactory {
    fn connect(
        &self,
        protocol: Protocol,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn PvTransport>, TransportError> {
        if protocol == self.protocol
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TransportError::Closed);
        }
        self.hub.connect(protocol, env)
    }
}

fn config(restart: bool, max_restarts: u32) -> ServerConfig {
    let mut config = ServerConfig::new()
        .with_prefix("s")
        .with_variable("x", VariableDefinition::scalar_input(1.0, 0.0, 10.0))
        .with_variable("y", VariableDefinition::scalar_output(0.0))
        .with_binding("x", PvBinding::ca())
        .with_binding("y", PvBinding::pva());
    config.settings.restart_listeners = restart;
    config.settings.max_listener_restarts = max_restarts;
    config
}

fn double(inputs: &InputSnapshot) -> Result<OutputValues, EvaluationError> {
    Ok(OutputValues::new().with("y", 2.0 * inputs.scalar("x")?))
}

async fn listener_settles(server: &Server, protocol: Protocol) -> ListenerState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = server.status().listener(protocol).cloned();
        match state {
            Some(s @ (ListenerState::Running { .. } | ListenerState::Faulted { .. })) => return s,
            _ => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "listener {protocol} never settled"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn bind_conflict_faults_one_listener_only() {
    let hub = LocalHub::new();
    let mut squatter = hub.open_transport(Endpoint::new(Protocol::PvAccess, DEFAULT_PVA_PORT));
    squatter
        .bind("s:y", WireValue::Double(-1.0), Access::ReadOnly)
        .await
        .expect("squatter bind");

    let config = config(false, 0);
    let server = Server::new(double, config.clone(), Arc::new(hub.clone())).expect("server");
    server.start(false).await.expect("start still succeeds");

    match listener_settles(&server, Protocol::PvAccess).await {
        ListenerState::Faulted { fault, restarts } => {
            assert_eq!(restarts, 0);
            assert!(matches!(
                fault,
                ListenerFault::Transport {
                    source: TransportError::AddressInUse { .. },
                    ..
                }
            ));
        }
        other => panic!("expected Faulted, got {other:?}"),
    }
    assert!(listener_settles(&server, Protocol::ChannelAccess).await.is_running());
    assert!(!server.status().is_healthy());

    // Channel Access keeps accepting writes and the loop keeps evaluating.
    let controller = Controller::new(&config, &hub).expect("controller");
    controller.put("x", 3.0).await.expect("put over ca");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.snapshot().value("y").and_then(|v| v.as_scalar()) != Some(6.0) {
        assert!(tokio::time::Instant::now() < deadline, "y never updated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The squatter's point is untouched.
    assert_eq!(controller.get_scalar("y").await.unwrap(), -1.0);

    server.stop().await;
    assert!(matches!(
        server.status().listener(Protocol::PvAccess),
        Some(ListenerState::Faulted { .. })
    ));
    assert!(hub.is_served(Endpoint::new(Protocol::PvAccess, DEFAULT_PVA_PORT), "s:y"));
    assert!(hub
        .served_pvs(Endpoint::new(Protocol::ChannelAccess, DEFAULT_CA_PORT))
        .is_empty());
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn failed_listener_is_restarted() {
    let hub = LocalHub::new();
    let factory = FlakyFactory {
        hub: hub.clone(),
        protocol: Protocol::PvAccess,
        failures: AtomicU32::new(1),
    };
    let config = config(true, 3);
    let server = Server::new(double, config.clone(), Arc::new(factory)).expect("server");
    server.start(false).await.expect("start");

    assert_eq!(
        listener_settles(&server, Protocol::PvAccess).await,
        ListenerState::Running { restarts: 1 }
    );

    // The restarted listener serves the loop's current values.
    let controller = Controller::new(&config, &hub).expect("controller");
    controller.put("x", 4.0).await.expect("put");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while controller.get_scalar("y").await.ok() != Some(8.0) {
        assert!(tokio::time::Instant::now() < deadline, "y never served");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restarts_are_bounded() {
    let hub = LocalHub::new();
    let factory = FlakyFactory {
        hub: hub.clone(),
        protocol: Protocol::PvAccess,
        failures: AtomicU32::new(u32::MAX),
    };
    let server = Server::new(double, config(true, 2), Arc::new(factory)).expect("server");
    server.start(false).await.expect("start");

    match listener_settles(&server, Protocol::PvAccess).await {
        ListenerState::Faulted { restarts, fault } => {
            assert_eq!(restarts, 2);
            assert_eq!(fault.protocol(), Protocol::PvAccess);
        }
        other => panic!("expected Faulted, got {other:?}"),
    }
    assert!(server
        .status()
        .listener(Protocol::ChannelAccess)
        .is_some_and(ListenerState::is_running));

    server.stop().await;
}
