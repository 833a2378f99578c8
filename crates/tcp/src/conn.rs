//! Socket plumbing shared by the client and server ends.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::framing::{FrameAccumulator, TransportError};

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const READ_BUF: usize = 8 * 1024;

/// Drain the per-connection send queue into the socket. Exits when the queue
/// disconnects or a write fails.
pub(crate) fn spawn_writer(
    mut stream: TcpStream,
    rx: mpsc::Receiver<Bytes>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tcp-writer".to_string())
        .spawn(move || {
            while let Ok(frame) = rx.recv() {
                if let Err(err) = stream.write_all(&frame) {
                    debug!(error = %err, "tcp write failed, stopping writer");
                    break;
                }
            }
        })
        .expect("failed to spawn tcp writer thread")
}

/// Blocking receive loop: reads chunks, reassembles frames, hands each
/// payload to `on_payload`. Returns when the peer disconnects, the stop flag
/// is raised (Ok), or a framing error demands closing the connection.
pub(crate) fn pump_frames(
    stream: &mut TcpStream,
    max_frame: usize,
    stop: &AtomicBool,
    mut on_payload: impl FnMut(Bytes),
) -> Result<(), TransportError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut acc = FrameAccumulator::new(max_frame);
    let mut buf = [0u8; READ_BUF];

    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        match stream.read(&mut buf) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => {
                for payload in acc.feed(&buf[..n])? {
                    on_payload(payload);
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}
