//! Client end of the bus bridge: exactly one outgoing connection.
//!
//! On disconnect or socket error the client waits a second and reconnects.
//! While disconnected, outbound traffic is discarded with a debug log; the
//! bus is never blocked on the network.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use rill_bus::{MessageBus, QueuedHandler, SubscriptionHandle};
use rill_core::{Message, MessageTypeRegistry};

use crate::bridge::{OutboundHandler, SeenFromTcp, inbound_publisher};
use crate::conn::{pump_frames, spawn_writer};
use crate::framing::{DEFAULT_MAX_FRAME, frame};
use crate::wire::{decode_message, encode_message};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct ClientShared {
    addr: SocketAddr,
    registry: Arc<MessageTypeRegistry>,
    send_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    connected: AtomicBool,
    stop: AtomicBool,
    max_frame: usize,
}

/// Bridges one remote endpoint onto the local bus.
pub struct TcpBusClient {
    shared: Arc<ClientShared>,
    seen: Arc<SeenFromTcp>,
    inbound: Arc<QueuedHandler>,
    outbound_sub: Mutex<Option<SubscriptionHandle>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpBusClient {
    pub fn connect(addr: SocketAddr, bus: MessageBus) -> Self {
        Self::connect_with(addr, bus, DEFAULT_MAX_FRAME)
    }

    pub fn connect_with(addr: SocketAddr, bus: MessageBus, max_frame: usize) -> Self {
        let registry = Arc::clone(bus.registry());
        let seen = Arc::new(SeenFromTcp::new());
        let shared = Arc::new(ClientShared {
            addr,
            registry: Arc::clone(&registry),
            send_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            max_frame,
        });

        let inbound = inbound_publisher(
            format!("tcp-client-inbound-{addr}"),
            bus.clone(),
            Arc::clone(&registry),
            Arc::clone(&seen),
        );

        let outbound_shared = Arc::clone(&shared);
        let outbound_sub = bus.subscribe_any(Arc::new(OutboundHandler::new(
            Arc::clone(&seen),
            move |message| forward_outbound(&outbound_shared, message),
        )));

        let worker_shared = Arc::clone(&shared);
        let worker_inbound = Arc::clone(&inbound);
        let worker = thread::Builder::new()
            .name(format!("tcp-client-{addr}"))
            .spawn(move || connection_loop(worker_shared, worker_inbound))
            .expect("failed to spawn tcp client thread");

        Self {
            shared,
            seen,
            inbound,
            outbound_sub: Mutex::new(Some(outbound_sub)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> &Arc<SeenFromTcp> {
        &self.seen
    }

    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(sub) = self.outbound_sub.lock().expect("client lock poisoned").take() {
            sub.cancel();
        }
        if let Some(worker) = self.worker.lock().expect("client lock poisoned").take() {
            let _ = worker.join();
        }
        self.inbound.stop();
    }
}

impl core::fmt::Debug for TcpBusClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpBusClient")
            .field("addr", &self.shared.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn forward_outbound(shared: &Arc<ClientShared>, message: Arc<dyn Message>) {
    if !shared.connected.load(Ordering::SeqCst) {
        debug!(
            message = message.type_name(),
            "discarding outbound message while disconnected"
        );
        return;
    }
    let payload = match encode_message(&shared.registry, message.as_ref()) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "skipping unencodable outbound message");
            return;
        }
    };
    let guard = shared.send_tx.lock().expect("client lock poisoned");
    if let Some(tx) = guard.as_ref() {
        if tx.send(frame(&payload)).is_err() {
            debug!("outbound queue closed mid-send");
        }
    }
}

fn connection_loop(shared: Arc<ClientShared>, inbound: Arc<QueuedHandler>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        match TcpStream::connect(shared.addr) {
            Ok(stream) => {
                info!(addr = %shared.addr, "tcp bus client connected");
                run_connection(&shared, &inbound, stream);
                info!(addr = %shared.addr, "tcp bus client disconnected");
            }
            Err(err) => {
                debug!(addr = %shared.addr, error = %err, "tcp connect failed");
            }
        }
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(RECONNECT_DELAY);
    }
}

fn run_connection(shared: &Arc<ClientShared>, inbound: &Arc<QueuedHandler>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            debug!(error = %err, "failed to clone client socket");
            return;
        }
    };
    let (send_tx, send_rx) = mpsc::channel();
    let writer = spawn_writer(writer_stream, send_rx);
    *shared.send_tx.lock().expect("client lock poisoned") = Some(send_tx);
    shared.connected.store(true, Ordering::SeqCst);

    let mut stream = stream;
    let result = pump_frames(&mut stream, shared.max_frame, &shared.stop, |payload| {
        match decode_message(&shared.registry, &payload) {
            Ok(Some(message)) => inbound.enqueue(message),
            Ok(None) => debug!("dropping frame with unknown message type"),
            Err(err) => debug!(error = %err, "dropping malformed frame"),
        }
    });
    if let Err(err) = result {
        debug!(error = %err, "client connection ended");
    }

    shared.connected.store(false, Ordering::SeqCst);
    // Dropping the sender stops the writer.
    *shared.send_tx.lock().expect("client lock poisoned") = None;
    let _ = writer.join();
}
