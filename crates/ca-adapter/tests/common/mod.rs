//! Shared helpers for adapter integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ca_adapter::{AdapterContext, AdapterManager, DiscoveryState, PeerInfo};
use ca_core::{AdapterConfig, MockBinding, ServiceId, ServiceList, TransportKind};

pub const SERVICE: &str = "12341234-1c25-481f-9dfb-59193d238280";

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn services(ids: &[&str]) -> ServiceList {
    ids.iter().map(|id| ServiceId::new(*id)).collect()
}

pub fn config() -> AdapterConfig {
    AdapterConfig::for_transport(TransportKind::Edr)
}

/// Initialized and started manager over a fresh mock binding
pub async fn started_manager(config: AdapterConfig) -> (Arc<MockBinding>, AdapterManager) {
    init_tracing();
    let mock = Arc::new(MockBinding::new(TransportKind::Edr));
    let manager = AdapterManager::new(mock.clone(), config);
    manager
        .initialize(AdapterContext::current())
        .await
        .expect("initialize");
    manager.start().await.expect("start");
    (mock, manager)
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn peer(manager: &AdapterManager, address: &str) -> Option<PeerInfo> {
    manager
        .peers()
        .await
        .expect("manager initialized")
        .into_iter()
        .find(|peer| peer.address.as_str() == address)
}

pub async fn peer_state(manager: &AdapterManager, address: &str) -> Option<DiscoveryState> {
    peer(manager, address).await.map(|peer| peer.state)
}
