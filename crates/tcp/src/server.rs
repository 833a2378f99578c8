//! Server end of the bus bridge.
//!
//! Accepts any number of connections, each with its own receive loop and send
//! queue. Inbound frames land on the local bus through the inbound queued
//! handler; the id of every inbound message is remembered together with the
//! connection that delivered it, so command responses can be routed back to
//! the process that sent the command. Nothing else is written outbound.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use rill_bus::{CommandResponse, MessageBus, QueuedHandler, SubscriptionHandle};
use rill_core::{Message, MessageTypeRegistry, MsgId};

use crate::bridge::{OutboundHandler, SeenFromTcp, inbound_publisher};
use crate::conn::{pump_frames, spawn_writer};
use crate::framing::{DEFAULT_MAX_FRAME, TransportError, frame};
use crate::wire::{decode_message, encode_message};

const ACCEPT_TICK: Duration = Duration::from_millis(50);

struct ConnectionHandle {
    send_tx: mpsc::Sender<Bytes>,
    peer: SocketAddr,
}

struct ServerShared {
    registry: Arc<MessageTypeRegistry>,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    /// Inbound message id -> connection that delivered it.
    routes: Mutex<HashMap<MsgId, u64>>,
    next_conn_id: AtomicU64,
    stop: AtomicBool,
    max_frame: usize,
}

/// Listens on a local endpoint and bridges every accepted connection onto
/// the given bus.
pub struct TcpBusServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    seen: Arc<SeenFromTcp>,
    inbound: Arc<QueuedHandler>,
    outbound_sub: Mutex<Option<SubscriptionHandle>>,
    accept_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpBusServer {
    pub fn listen(addr: impl ToSocketAddrs, bus: MessageBus) -> Result<Self, TransportError> {
        Self::listen_with(addr, bus, DEFAULT_MAX_FRAME)
    }

    pub fn listen_with(
        addr: impl ToSocketAddrs,
        bus: MessageBus,
        max_frame: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::clone(bus.registry());
        let seen = Arc::new(SeenFromTcp::new());
        let shared = Arc::new(ServerShared {
            registry: Arc::clone(&registry),
            connections: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            max_frame,
        });

        let inbound = inbound_publisher(
            format!("tcp-server-inbound-{local_addr}"),
            bus.clone(),
            Arc::clone(&registry),
            Arc::clone(&seen),
        );

        // Outbound: only command responses leave the server, routed to the
        // connection that carried the source command.
        let outbound_shared = Arc::clone(&shared);
        let outbound_sub = bus.subscribe_any(Arc::new(OutboundHandler::new(
            Arc::clone(&seen),
            move |message| route_outbound(&outbound_shared, message),
        )));

        let accept_shared = Arc::clone(&shared);
        let accept_inbound = Arc::clone(&inbound);
        let accept_worker = thread::Builder::new()
            .name(format!("tcp-accept-{local_addr}"))
            .spawn(move || accept_loop(listener, accept_shared, accept_inbound))
            .map_err(|e| TransportError::Io(e))?;

        info!(addr = %local_addr, "tcp bus server listening");
        Ok(Self {
            local_addr,
            shared,
            seen,
            inbound,
            outbound_sub: Mutex::new(Some(outbound_sub)),
            accept_worker: Mutex::new(Some(accept_worker)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().expect("server lock poisoned").len()
    }

    pub fn seen(&self) -> &Arc<SeenFromTcp> {
        &self.seen
    }

    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(sub) = self.outbound_sub.lock().expect("server lock poisoned").take() {
            sub.cancel();
        }
        // Dropping the send queues stops the writers; readers exit on the
        // stop flag at their next read timeout.
        self.shared.connections.lock().expect("server lock poisoned").clear();
        if let Some(worker) = self.accept_worker.lock().expect("server lock poisoned").take() {
            let _ = worker.join();
        }
        self.inbound.stop();
    }
}

impl core::fmt::Debug for TcpBusServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpBusServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn route_outbound(shared: &Arc<ServerShared>, message: Arc<dyn Message>) {
    let Some(response) = message.as_any().downcast_ref::<CommandResponse>() else {
        debug!(
            message = message.type_name(),
            "server bridge forwards only command responses"
        );
        return;
    };

    let conn_id = shared
        .routes
        .lock()
        .expect("server lock poisoned")
        .remove(&response.command_id());
    let Some(conn_id) = conn_id else {
        debug!(command_id = %response.command_id(), "no connection recorded for response");
        return;
    };

    let payload = match encode_message(&shared.registry, message.as_ref()) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to encode command response");
            return;
        }
    };

    let connections = shared.connections.lock().expect("server lock poisoned");
    if let Some(conn) = connections.get(&conn_id) {
        if conn.send_tx.send(frame(&payload)).is_err() {
            debug!(conn = conn_id, peer = %conn.peer, "response dropped: connection closed");
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, inbound: Arc<QueuedHandler>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => spawn_connection(&shared, &inbound, stream, peer),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_TICK);
            }
            Err(err) => {
                warn!(error = %err, "tcp accept failed");
                thread::sleep(ACCEPT_TICK);
            }
        }
    }
}

fn spawn_connection(
    shared: &Arc<ServerShared>,
    inbound: &Arc<QueuedHandler>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let _ = stream.set_nodelay(true);

    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            warn!(error = %err, %peer, "failed to clone accepted socket");
            return;
        }
    };
    let (send_tx, send_rx) = mpsc::channel();
    spawn_writer(writer_stream, send_rx);
    shared
        .connections
        .lock()
        .expect("server lock poisoned")
        .insert(conn_id, ConnectionHandle { send_tx, peer });
    info!(conn = conn_id, %peer, "tcp connection accepted");

    let reader_shared = Arc::clone(shared);
    let reader_inbound = Arc::clone(inbound);
    let _ = thread::Builder::new()
        .name(format!("tcp-conn-{conn_id}"))
        .spawn(move || {
            let mut stream = stream;
            let result = pump_frames(
                &mut stream,
                reader_shared.max_frame,
                &reader_shared.stop,
                |payload| match decode_message(&reader_shared.registry, &payload) {
                    Ok(Some(message)) => {
                        reader_shared
                            .routes
                            .lock()
                            .expect("server lock poisoned")
                            .insert(message.msg_id(), conn_id);
                        reader_inbound.enqueue(message);
                    }
                    Ok(None) => {
                        debug!(conn = conn_id, "dropping frame with unknown message type");
                    }
                    Err(err) => {
                        // A single malformed payload is dropped, not fatal.
                        warn!(conn = conn_id, error = %err, "dropping malformed frame");
                    }
                },
            );

            match result {
                Ok(()) => debug!(conn = conn_id, "connection reader stopped"),
                Err(TransportError::Disconnected) => {
                    info!(conn = conn_id, %peer, "peer disconnected");
                }
                Err(err) => {
                    // Framing violations close the connection.
                    warn!(conn = conn_id, error = %err, "closing connection");
                }
            }
            reader_shared
                .connections
                .lock()
                .expect("server lock poisoned")
                .remove(&conn_id);
        });
}
