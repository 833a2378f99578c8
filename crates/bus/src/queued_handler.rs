//! Single-threaded workers draining a FIFO queue into one handler.
//!
//! The non-discarding [`QueuedHandler`] is unbounded: back-pressure reaches
//! producers through memory growth, never through loss. The
//! [`DiscardingQueuedHandler`] keeps the last K items and drops the oldest on
//! overflow, for telemetry-like fire-and-forget streams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::warn;

use rill_core::Message;

use crate::bus::MessageSink;

const STOP_TICK: Duration = Duration::from_millis(250);

type BoxedHandler = Box<dyn FnMut(Arc<dyn Message>) + Send>;

/// Wrap a fallible handler so failures are logged and the worker continues.
fn logging_handler<E, H>(name: String, mut handler: H) -> BoxedHandler
where
    E: core::fmt::Debug,
    H: FnMut(Arc<dyn Message>) -> Result<(), E> + Send + 'static,
{
    Box::new(move |message| {
        if let Err(err) = handler(message) {
            warn!(queue = %name, error = ?err, "queued handler failed");
        }
    })
}

struct QueueShared {
    // Enqueued but not yet fully handled; idle iff zero.
    pending: AtomicUsize,
    stop: AtomicBool,
}

/// Unbounded FIFO queue drained by one worker thread.
pub struct QueuedHandler {
    name: String,
    // Mutex-wrapped so the handler can be shared as a sink across threads.
    tx: Mutex<mpsc::Sender<Arc<dyn Message>>>,
    shared: Arc<QueueShared>,
    rx: Mutex<Option<mpsc::Receiver<Arc<dyn Message>>>>,
    handler: Mutex<Option<BoxedHandler>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl QueuedHandler {
    pub fn new<E, H>(name: impl Into<String>, handler: H) -> Self
    where
        E: core::fmt::Debug,
        H: FnMut(Arc<dyn Message>) -> Result<(), E> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        Self {
            handler: Mutex::new(Some(logging_handler(name.clone(), handler))),
            name,
            tx: Mutex::new(tx),
            shared: Arc::new(QueueShared {
                pending: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
            }),
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the worker. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("queue lock poisoned");
        if worker.is_some() {
            return;
        }
        let rx = match self.rx.lock().expect("queue lock poisoned").take() {
            Some(rx) => rx,
            None => return,
        };
        let mut handler = match self.handler.lock().expect("queue lock poisoned").take() {
            Some(h) => h,
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                loop {
                    if shared.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match rx.recv_timeout(STOP_TICK) {
                        Ok(message) => {
                            handler(message);
                            shared.pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn queued handler thread");
        *worker = Some(join);
    }

    /// Let the in-flight item finish, then stop and join the worker. Items
    /// still queued are not drained.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.worker.lock().expect("queue lock poisoned").take() {
            let _ = join.join();
        }
    }

    /// True iff the queue is empty and no item is in flight.
    pub fn idle(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) == 0
    }

    pub fn enqueue(&self, message: Arc<dyn Message>) {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .tx
            .lock()
            .expect("queue lock poisoned")
            .send(message)
            .is_ok();
        if !sent {
            // Worker gone; the item will never be handled.
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MessageSink for QueuedHandler {
    fn deliver(&self, message: Arc<dyn Message>) {
        self.enqueue(message);
    }
}

impl core::fmt::Debug for QueuedHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueuedHandler")
            .field("name", &self.name)
            .field("pending", &self.shared.pending.load(Ordering::SeqCst))
            .finish()
    }
}

type OverflowCallback = Box<dyn Fn(u64) + Send + Sync>;

struct DiscardShared {
    queue: Mutex<VecDeque<Arc<dyn Message>>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    in_flight: AtomicBool,
    stop: AtomicBool,
    on_overflow: Option<OverflowCallback>,
}

/// Bounded FIFO keeping the last `capacity` items; the oldest undelivered
/// item is dropped on overflow.
pub struct DiscardingQueuedHandler {
    name: String,
    shared: Arc<DiscardShared>,
    handler: Mutex<Option<BoxedHandler>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DiscardingQueuedHandler {
    pub fn new<E, H>(name: impl Into<String>, capacity: usize, handler: H) -> Self
    where
        E: core::fmt::Debug,
        H: FnMut(Arc<dyn Message>) -> Result<(), E> + Send + 'static,
    {
        Self::with_overflow_callback(name, capacity, handler, None)
    }

    pub fn with_overflow_callback<E, H>(
        name: impl Into<String>,
        capacity: usize,
        handler: H,
        on_overflow: Option<OverflowCallback>,
    ) -> Self
    where
        E: core::fmt::Debug,
        H: FnMut(Arc<dyn Message>) -> Result<(), E> + Send + 'static,
    {
        assert!(capacity >= 1, "capacity must be at least 1");
        let name = name.into();
        Self {
            handler: Mutex::new(Some(logging_handler(name.clone(), handler))),
            name,
            shared: Arc::new(DiscardShared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                capacity,
                dropped: AtomicU64::new(0),
                in_flight: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                on_overflow,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("queue lock poisoned");
        if worker.is_some() {
            return;
        }
        let mut handler = match self.handler.lock().expect("queue lock poisoned").take() {
            Some(h) => h,
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                loop {
                    let next = {
                        let mut queue = shared.queue.lock().expect("queue lock poisoned");
                        loop {
                            if shared.stop.load(Ordering::SeqCst) {
                                return;
                            }
                            if let Some(item) = queue.pop_front() {
                                shared.in_flight.store(true, Ordering::SeqCst);
                                break item;
                            }
                            let (guard, _) = shared
                                .available
                                .wait_timeout(queue, STOP_TICK)
                                .expect("queue lock poisoned");
                            queue = guard;
                        }
                    };
                    handler(next);
                    shared.in_flight.store(false, Ordering::SeqCst);
                }
            })
            .expect("failed to spawn discarding handler thread");
        *worker = Some(join);
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(join) = self.worker.lock().expect("queue lock poisoned").take() {
            let _ = join.join();
        }
    }

    pub fn idle(&self) -> bool {
        let queue = self.shared.queue.lock().expect("queue lock poisoned");
        queue.is_empty() && !self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Total items dropped to overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, message: Arc<dyn Message>) {
        let dropped = {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let mut dropped = None;
            if queue.len() == self.shared.capacity {
                queue.pop_front();
                dropped = Some(self.shared.dropped.fetch_add(1, Ordering::SeqCst) + 1);
            }
            queue.push_back(message);
            self.shared.available.notify_one();
            dropped
        };
        if let (Some(total), Some(callback)) = (dropped, self.shared.on_overflow.as_ref()) {
            callback(total);
        }
    }
}

impl MessageSink for DiscardingQueuedHandler {
    fn deliver(&self, message: Arc<dyn Message>) {
        self.enqueue(message);
    }
}

impl core::fmt::Debug for DiscardingQueuedHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiscardingQueuedHandler")
            .field("name", &self.name)
            .field("capacity", &self.shared.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}
