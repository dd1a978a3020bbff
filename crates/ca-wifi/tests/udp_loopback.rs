//! UDP binding tests over the loopback interface
//!
//! Sockets bind to 127.0.0.1 on ephemeral ports so tests can run in parallel
//! without touching the real network or the well-known ports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ca_adapter::{AdapterContext, AdapterManager};
use ca_core::{
    AdapterConfig, AdapterStatus, BindingEvent, BindingError, CapabilityBinding, ConnectionHandle,
    DataOrigin, Destination, EventSink, EventStream, ServiceId, TransportKind,
};
use ca_wifi::{UdpBinding, WifiConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn enabled_binding() -> (UdpBinding, EventStream) {
    init_tracing();
    let binding = UdpBinding::new(WifiConfig::loopback());
    binding.enable().await.expect("bind loopback socket");
    let (sink, stream) = EventSink::channel();
    binding.register_events(sink).await.unwrap();
    (binding, stream)
}

async fn next_event(stream: &mut EventStream) -> BindingEvent {
    tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("event within timeout")
        .expect("stream open")
}

#[tokio::test]
async fn connect_and_write_delivers_datagram() {
    let (sender, mut sender_events) = enabled_binding().await;
    let (receiver, mut receiver_events) = enabled_binding().await;
    let target = receiver.local_unicast_addr().unwrap().to_string();

    sender
        .connect(&target.as_str().into(), &ServiceId::new("oic.udp"))
        .await
        .unwrap();
    let handle = match next_event(&mut sender_events).await {
        BindingEvent::SocketConnected { address, handle } => {
            assert_eq!(address.as_str(), target);
            handle
        }
        other => panic!("unexpected event {:?}", other),
    };

    assert_eq!(sender.write(handle, b"hello").await.unwrap(), 5);

    match next_event(&mut receiver_events).await {
        BindingEvent::DataReceived {
            origin: DataOrigin::Address(from),
            payload,
        } => {
            assert_eq!(from.as_str(), sender.local_unicast_addr().unwrap().to_string());
            assert_eq!(payload, Bytes::from("hello"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    sender.disable().await;
    receiver.disable().await;
}

#[tokio::test]
async fn service_search_reports_configured_service() {
    let (binding, mut events) = enabled_binding().await;

    binding
        .start_service_search(&"127.0.0.1".into())
        .await
        .unwrap();
    match next_event(&mut events).await {
        BindingEvent::ServiceSearched { address, services } => {
            assert_eq!(address.as_str(), "127.0.0.1");
            assert!(ServiceId::new("OIC.UDP").is_offered_by(&services));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(matches!(
        binding.start_service_search(&"not-an-ip".into()).await,
        Err(BindingError::UnknownAddress(_))
    ));
}

#[tokio::test]
async fn write_to_unknown_handle_fails() {
    let (binding, _events) = enabled_binding().await;
    assert!(matches!(
        binding.write(ConnectionHandle(99), b"x").await,
        Err(BindingError::UnknownHandle(_))
    ));
}

#[tokio::test]
async fn adapter_manager_sends_over_udp() {
    init_tracing();
    let (remote, mut remote_events) = enabled_binding().await;
    let target = remote.local_unicast_addr().unwrap().to_string();

    let binding = Arc::new(UdpBinding::new(WifiConfig::loopback()));
    let manager = AdapterManager::new(
        binding.clone(),
        AdapterConfig::for_transport(TransportKind::Wifi),
    );
    assert_eq!(
        manager.initialize(AdapterContext::current()).await.unwrap(),
        AdapterStatus::Ready
    );
    manager.start().await.unwrap();

    let accepted = manager
        .send(
            Destination::Unicast(target.as_str().into()),
            TransportKind::Wifi.default_service(),
            "ping",
        )
        .unwrap();
    assert_eq!(accepted, 4);

    match next_event(&mut remote_events).await {
        BindingEvent::DataReceived { payload, .. } => assert_eq!(payload, Bytes::from("ping")),
        other => panic!("unexpected event {:?}", other),
    }

    manager.terminate().await;
    assert!(binding.local_unicast_addr().is_none());
}
