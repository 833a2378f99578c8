//! Loop suppression and the inbound/outbound handler pair shared by the
//! client and server ends of a bridge.
//!
//! Every bridge owns a `SeenFromTcp` set keyed by message id. The inbound
//! side inserts an id before publishing a network message locally; the
//! outbound side drops any bus message whose id is in the set. A message that
//! crossed the wire therefore never crosses back.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use rill_bus::{MessageBus, MessageSink, QueuedHandler};
use rill_core::{Message, MessageTypeRegistry, MsgId};

/// Ids of messages that arrived over this bridge's connection(s).
#[derive(Debug, Default)]
pub struct SeenFromTcp {
    ids: Mutex<HashSet<MsgId>>,
}

impl SeenFromTcp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: MsgId) {
        self.ids.lock().expect("seen-set lock poisoned").insert(id);
    }

    /// Remove and report whether the id was present.
    pub fn take(&self, id: MsgId) -> bool {
        self.ids.lock().expect("seen-set lock poisoned").remove(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("seen-set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().expect("seen-set lock poisoned").is_empty()
    }
}

/// Queued handler that lands network messages on the local bus.
///
/// Commands decoded off the wire are re-dispatched as commands (fire and
/// forget; their response is routed back separately); everything else is
/// published. The seen-set insert happens before either, closing the loop
/// window.
pub fn inbound_publisher(
    name: impl Into<String>,
    bus: MessageBus,
    registry: Arc<MessageTypeRegistry>,
    seen: Arc<SeenFromTcp>,
) -> Arc<QueuedHandler> {
    let queue = Arc::new(QueuedHandler::new(name, move |message: Arc<dyn Message>| {
        seen.insert(message.msg_id());
        match registry.try_as_command(message.as_ref()) {
            Some(command) => {
                if !bus.dispatch_async(command) {
                    debug!(
                        command = message.type_name(),
                        "bridged command has no local handler"
                    );
                }
            }
            None => bus.publish(message),
        }
        Ok::<(), std::convert::Infallible>(())
    }));
    queue.start();
    queue
}

/// Bus-side filter in front of a transport's send path.
pub struct OutboundHandler {
    seen: Arc<SeenFromTcp>,
    forward: Box<dyn Fn(Arc<dyn Message>) + Send + Sync>,
}

impl OutboundHandler {
    pub fn new(
        seen: Arc<SeenFromTcp>,
        forward: impl Fn(Arc<dyn Message>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            seen,
            forward: Box::new(forward),
        }
    }
}

impl MessageSink for OutboundHandler {
    fn deliver(&self, message: Arc<dyn Message>) {
        if self.seen.take(message.msg_id()) {
            debug!(message = message.type_name(), "suppressing tcp echo");
            return;
        }
        (self.forward)(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Blip {
        id: MsgId,
    }
    rill_core::impl_message!(Blip);

    #[test]
    fn outbound_drops_exactly_the_seen_ids() {
        let seen = Arc::new(SeenFromTcp::new());
        let forwarded = Arc::new(AtomicU32::new(0));

        let count = Arc::clone(&forwarded);
        let handler = OutboundHandler::new(Arc::clone(&seen), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let from_network = Blip { id: MsgId::new() };
        seen.insert(from_network.id);

        handler.deliver(Arc::new(from_network.clone()));
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
        assert!(seen.is_empty(), "suppression consumes the id");

        // Same id again (now unseen) forwards: suppression is one-shot.
        handler.deliver(Arc::new(from_network));
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);

        handler.deliver(Arc::new(Blip { id: MsgId::new() }));
        assert_eq!(forwarded.load(Ordering::SeqCst), 2);
    }
}
