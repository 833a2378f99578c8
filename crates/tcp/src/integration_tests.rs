//! Bridge scenarios over real sockets on the loopback interface.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use rill_bus::{CommandResponse, MessageBus};
use rill_core::{CausationId, CorrelationId, MessageTypeRegistry, MsgId};

use crate::client::TcpBusClient;
use crate::server::TcpBusServer;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TelemetryReported {
    id: MsgId,
    reading: i64,
}
rill_core::impl_message!(TelemetryReported);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    id: MsgId,
    correlation_id: Option<CorrelationId>,
    causation_id: Option<CausationId>,
}
rill_core::impl_command_message!(Ping);

fn registry() -> Arc<MessageTypeRegistry> {
    let registry = MessageTypeRegistry::new();
    registry.register::<TelemetryReported>().unwrap();
    registry.register_command::<Ping>().unwrap();
    registry.register::<CommandResponse>().unwrap();
    Arc::new(registry)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn bridged_pair() -> (MessageBus, MessageBus, TcpBusClient, TcpBusServer) {
    let bus_a = MessageBus::new("side-a", registry());
    let bus_b = MessageBus::new("side-b", registry());

    let server = TcpBusServer::listen("127.0.0.1:0", bus_b.clone()).unwrap();
    let client = TcpBusClient::connect(server.local_addr(), bus_a.clone());
    assert!(wait_until(Duration::from_secs(5), || client.is_connected()));
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 1));

    (bus_a, bus_b, client, server)
}

#[test]
fn bridged_event_crosses_once_and_never_echoes() {
    let (bus_a, bus_b, client, server) = bridged_pair();

    let a_seen = Arc::new(AtomicU32::new(0));
    let b_seen = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&a_seen);
    let _sa = bus_a.subscribe::<TelemetryReported>(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });
    let b = Arc::clone(&b_seen);
    let _sb = bus_b.subscribe::<TelemetryReported>(move |_| {
        b.fetch_add(1, Ordering::SeqCst);
    });

    bus_a.publish(Arc::new(TelemetryReported { id: MsgId::new(), reading: 42 }));

    assert!(wait_until(Duration::from_secs(5), || {
        b_seen.load(Ordering::SeqCst) == 1
    }));

    // Give a would-be echo time to come back, then confirm it never did: one
    // local delivery on A, one bridged delivery on B.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(a_seen.load(Ordering::SeqCst), 1);
    assert_eq!(b_seen.load(Ordering::SeqCst), 1);
    assert!(server.seen().is_empty(), "suppression entries are consumed");

    client.shutdown();
    server.shutdown();
}

#[test]
fn command_response_routes_back_to_the_sending_connection() {
    let (bus_a, bus_b, client, server) = bridged_pair();

    let handled = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&handled);
    let _handler = bus_b
        .subscribe_command::<Ping, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let responses: Arc<Mutex<Vec<CommandResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&responses);
    let _sub = bus_a.subscribe::<CommandResponse>(move |r| {
        sink.lock().unwrap().push(r.clone());
    });

    // Fire the command onto A's bus; the bridge carries it to B, B's handler
    // runs, and the response frame comes back over the same connection.
    let ping = Ping { id: MsgId::new(), correlation_id: None, causation_id: None };
    let command_id = ping.id;
    bus_a.publish(Arc::new(ping));

    assert!(wait_until(Duration::from_secs(5), || {
        !responses.lock().unwrap().is_empty()
    }));
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    let responses = responses.lock().unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_success());
    assert_eq!(responses[0].command_id(), command_id);

    client.shutdown();
    server.shutdown();
}

#[test]
fn disconnected_client_discards_outbound_and_reconnects() {
    // Reserve a port with no listener behind it.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let addr = format!("127.0.0.1:{port}").parse().unwrap();

    let bus_a = MessageBus::new("side-a", registry());
    let bus_b = MessageBus::new("side-b", registry());
    let client = TcpBusClient::connect(addr, bus_a.clone());

    // Nothing to connect to: outbound traffic is discarded, nothing panics.
    assert!(!client.is_connected());
    bus_a.publish(Arc::new(TelemetryReported { id: MsgId::new(), reading: 1 }));

    // Bring the endpoint up; the client's retry loop finds it.
    let server = TcpBusServer::listen(addr, bus_b.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client.is_connected()));

    let b_seen = Arc::new(AtomicU32::new(0));
    let b = Arc::clone(&b_seen);
    let _sb = bus_b.subscribe::<TelemetryReported>(move |_| {
        b.fetch_add(1, Ordering::SeqCst);
    });
    bus_a.publish(Arc::new(TelemetryReported { id: MsgId::new(), reading: 2 }));
    assert!(wait_until(Duration::from_secs(5), || {
        b_seen.load(Ordering::SeqCst) == 1
    }));

    client.shutdown();
    server.shutdown();
}
