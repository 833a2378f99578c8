//! In-memory stream store for tests and development.
//!
//! Keeps every stream in a locked map and mirrors each append into the
//! stream's `$ce-` category stream, so listeners can tail a whole aggregate
//! kind. Live subscriptions register their sink before the historical read
//! begins and deduplicate by event number, which is what makes the
//! catch-up-to-live handoff gap-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use rill_core::CancelToken;

use crate::store::{
    EventData, ExpectedVersion, OnEvent, OnLive, ReadState, RecordedEvent, StoreError,
    StoreSubscription, StreamName, StreamSlice, StreamStore, SubscriptionDropReason, WriteResult,
};

const LIVE_TICK: Duration = Duration::from_millis(250);
const HISTORY_SLICE: usize = 256;

#[derive(Default)]
struct StreamEntry {
    events: Vec<RecordedEvent>,
    deleted: bool,
}

struct LiveSink {
    id: u64,
    tx: mpsc::Sender<RecordedEvent>,
}

#[derive(Default)]
struct StoreShared {
    streams: Mutex<HashMap<String, StreamEntry>>,
    live: Mutex<HashMap<String, Vec<LiveSink>>>,
    next_sink_id: AtomicU64,
}

/// In-memory append-only stream store. Not optimized for throughput.
#[derive(Clone, Default)]
pub struct InMemoryStreamStore {
    inner: Arc<StoreShared>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_subscription(
        &self,
        stream: &StreamName,
        from_exclusive: Option<i64>,
        on_event: Box<OnEvent>,
        on_live: Option<Box<OnLive>>,
    ) -> Result<StoreSubscription, StoreError> {
        let shared = Arc::clone(&self.inner);
        let stream_key = stream.as_str().to_string();
        let sink_id = shared.next_sink_id.fetch_add(1, Ordering::SeqCst);

        // Register the live sink before reading history; anything appended
        // from here on is buffered in the channel and deduplicated below.
        let (tx, rx) = mpsc::channel::<RecordedEvent>();
        shared
            .live
            .lock()
            .expect("store lock poisoned")
            .entry(stream_key.clone())
            .or_default()
            .push(LiveSink { id: sink_id, tx });

        let stop = Arc::new(AtomicBool::new(false));
        let drop_reason: Arc<Mutex<Option<SubscriptionDropReason>>> = Arc::new(Mutex::new(None));

        let worker_stop = Arc::clone(&stop);
        let worker_reason = Arc::clone(&drop_reason);
        let worker_shared = Arc::clone(&shared);
        let worker_stream = stream_key.clone();
        thread::Builder::new()
            .name(format!("sub-{stream_key}"))
            .spawn(move || {
                let mut on_live = on_live;
                let mut last = from_exclusive.unwrap_or(-1);
                let mut reason = SubscriptionDropReason::Unsubscribed;

                // Historical phase: sequential slices from the checkpoint.
                'history: loop {
                    if worker_stop.load(Ordering::SeqCst) {
                        break 'history;
                    }
                    let slice =
                        read_slice(&worker_shared, &worker_stream, last + 1, HISTORY_SLICE);
                    match slice.state {
                        ReadState::Deleted => {
                            reason = SubscriptionDropReason::StoreShutdown;
                            break 'history;
                        }
                        ReadState::NotFound | ReadState::Found => {}
                    }
                    for event in slice.events {
                        if worker_stop.load(Ordering::SeqCst) {
                            break 'history;
                        }
                        last = event.event_number;
                        on_event(event);
                    }
                    if slice.is_end {
                        // Switch to live delivery.
                        if let Some(on_live) = on_live.take() {
                            on_live();
                        }
                        if !worker_stop.load(Ordering::SeqCst) {
                            loop {
                                if worker_stop.load(Ordering::SeqCst) {
                                    break;
                                }
                                match rx.recv_timeout(LIVE_TICK) {
                                    Ok(event) if event.event_number > last => {
                                        last = event.event_number;
                                        on_event(event);
                                    }
                                    // Already seen during the historical read.
                                    Ok(_) => {}
                                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                                        reason = SubscriptionDropReason::StoreShutdown;
                                        break;
                                    }
                                }
                            }
                        }
                        break 'history;
                    }
                }

                *worker_reason.lock().expect("subscription lock poisoned") = Some(reason);
                if let Some(sinks) = worker_shared
                    .live
                    .lock()
                    .expect("store lock poisoned")
                    .get_mut(&worker_stream)
                {
                    sinks.retain(|s| s.id != sink_id);
                }
            })
            .map_err(|e| StoreError::Internal(format!("failed to spawn subscription: {e}")))?;

        let stop_handle = Arc::clone(&stop);
        Ok(StoreSubscription::new(
            Box::new(move || stop_handle.store(true, Ordering::SeqCst)),
            drop_reason,
        ))
    }
}

impl StreamStore for InMemoryStreamStore {
    fn append(
        &self,
        stream: &StreamName,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError> {
        let mut notifications: Vec<(String, RecordedEvent)> = Vec::new();
        let result = {
            let mut streams = self.inner.streams.lock().expect("store lock poisoned");
            let entry = streams.entry(stream.as_str().to_string()).or_default();
            if entry.deleted {
                return Err(StoreError::StreamDeleted(stream.as_str().to_string()));
            }

            let current = entry.events.last().map(|e| e.event_number);
            if !expected.matches(current) {
                return Err(StoreError::WrongExpectedVersion {
                    stream: stream.as_str().to_string(),
                    expected,
                    actual: current.unwrap_or(rill_core::NO_STREAM),
                });
            }
            if events.is_empty() {
                return Ok(WriteResult {
                    next_expected_version: current.unwrap_or(rill_core::NO_STREAM),
                });
            }

            let created = Utc::now();
            let mut next = current.map(|n| n + 1).unwrap_or(0);
            for event in events {
                let record = RecordedEvent {
                    stream: stream.clone(),
                    event_number: next,
                    event_id: event.event_id,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                    created,
                };
                next += 1;
                notifications.push((stream.as_str().to_string(), record.clone()));
                entry.events.push(record);
            }
            let last = next - 1;

            // Mirror into the category stream, in insertion order.
            if let Some(category) = category_of(stream.as_str()) {
                let records: Vec<RecordedEvent> = notifications
                    .iter()
                    .map(|(_, r)| r.clone())
                    .collect();
                let category_entry = streams.entry(category.clone()).or_default();
                for record in records {
                    let link = RecordedEvent {
                        stream: StreamName::new(category.clone()),
                        event_number: category_entry.events.len() as i64,
                        ..record
                    };
                    notifications.push((category.clone(), link.clone()));
                    category_entry.events.push(link);
                }
            }

            WriteResult { next_expected_version: last }
        };

        // Fan out to live sinks after releasing the stream lock.
        let mut live = self.inner.live.lock().expect("store lock poisoned");
        for (key, record) in notifications {
            if let Some(sinks) = live.get_mut(&key) {
                sinks.retain(|sink| sink.tx.send(record.clone()).is_ok());
            }
        }

        Ok(result)
    }

    fn read_forward(
        &self,
        stream: &StreamName,
        from: i64,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<StreamSlice, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(read_slice(&self.inner, stream.as_str(), from, count))
    }

    fn subscribe(
        &self,
        stream: &StreamName,
        from_exclusive: Option<i64>,
        on_event: Box<OnEvent>,
    ) -> Result<StoreSubscription, StoreError> {
        self.spawn_subscription(stream, from_exclusive, on_event, None)
    }

    fn catch_up_subscribe(
        &self,
        stream: &StreamName,
        last_checkpoint: Option<i64>,
        on_event: Box<OnEvent>,
        on_live: Box<OnLive>,
    ) -> Result<StoreSubscription, StoreError> {
        self.spawn_subscription(stream, last_checkpoint, on_event, Some(on_live))
    }

    fn delete_stream(&self, stream: &StreamName) -> Result<(), StoreError> {
        let mut streams = self.inner.streams.lock().expect("store lock poisoned");
        let entry = streams.entry(stream.as_str().to_string()).or_default();
        entry.deleted = true;
        entry.events.clear();
        Ok(())
    }
}

fn read_slice(shared: &StoreShared, stream: &str, from: i64, count: usize) -> StreamSlice {
    let streams = shared.streams.lock().expect("store lock poisoned");
    match streams.get(stream) {
        None => StreamSlice {
            state: ReadState::NotFound,
            events: Vec::new(),
            next_event_number: 0,
            is_end: true,
        },
        Some(entry) if entry.deleted => StreamSlice {
            state: ReadState::Deleted,
            events: Vec::new(),
            next_event_number: 0,
            is_end: true,
        },
        Some(entry) => {
            let total = entry.events.len() as i64;
            let start = from.max(0).min(total) as usize;
            let end = (start + count).min(entry.events.len());
            let events = entry.events[start..end].to_vec();
            let next = end as i64;
            StreamSlice {
                state: ReadState::Found,
                events,
                next_event_number: next,
                is_end: next >= total,
            }
        }
    }
}

/// Category of a stream: everything before the first `-`. System streams
/// have no category.
fn category_of(stream: &str) -> Option<String> {
    if stream.starts_with('$') {
        return None;
    }
    stream
        .split_once('-')
        .map(|(prefix, _)| format!("$ce-{prefix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rill_core::MsgId;
    use std::time::Instant;

    fn payload(n: i64) -> EventData {
        EventData {
            event_id: MsgId::new(),
            event_type: "TestEvent".to_string(),
            data: serde_json::json!({ "n": n }),
            metadata: serde_json::Value::Null,
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn append_assigns_zero_based_event_numbers() {
        let store = InMemoryStreamStore::new();
        let stream = StreamName::new("group-abc");

        let result = store
            .append(&stream, ExpectedVersion::NoStream, vec![payload(0), payload(1)])
            .unwrap();
        assert_eq!(result.next_expected_version, 1);

        let slice = store
            .read_forward(&stream, 0, 100, &CancelToken::new())
            .unwrap();
        assert_eq!(slice.state, ReadState::Found);
        let numbers: Vec<i64> = slice.events.iter().map(|e| e.event_number).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert!(slice.is_end);
    }

    #[test]
    fn version_mismatch_reports_the_actual_version() {
        let store = InMemoryStreamStore::new();
        let stream = StreamName::new("group-abc");
        store
            .append(&stream, ExpectedVersion::NoStream, vec![payload(0), payload(1)])
            .unwrap();

        let err = store
            .append(&stream, ExpectedVersion::Exact(0), vec![payload(2)])
            .unwrap_err();
        match err {
            StoreError::WrongExpectedVersion { expected, actual, .. } => {
                assert_eq!(expected, ExpectedVersion::Exact(0));
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = store
            .append(&stream, ExpectedVersion::NoStream, vec![payload(2)])
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongExpectedVersion { .. }));
    }

    #[test]
    fn missing_stream_reads_as_not_found() {
        let store = InMemoryStreamStore::new();
        let slice = store
            .read_forward(&StreamName::new("group-missing"), 0, 10, &CancelToken::new())
            .unwrap();
        assert_eq!(slice.state, ReadState::NotFound);
    }

    #[test]
    fn deleted_stream_reads_as_deleted_and_rejects_appends() {
        let store = InMemoryStreamStore::new();
        let stream = StreamName::new("group-abc");
        store
            .append(&stream, ExpectedVersion::NoStream, vec![payload(0)])
            .unwrap();
        store.delete_stream(&stream).unwrap();

        let slice = store
            .read_forward(&stream, 0, 10, &CancelToken::new())
            .unwrap();
        assert_eq!(slice.state, ReadState::Deleted);

        let err = store
            .append(&stream, ExpectedVersion::Any, vec![payload(1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::StreamDeleted(_)));
    }

    #[test]
    fn cancelled_reads_abort() {
        let store = InMemoryStreamStore::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = store
            .read_forward(&StreamName::new("group-abc"), 0, 10, &cancel)
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn category_stream_links_every_member_stream_in_insertion_order() {
        let store = InMemoryStreamStore::new();
        store
            .append(&StreamName::new("group-a"), ExpectedVersion::NoStream, vec![payload(0)])
            .unwrap();
        store
            .append(&StreamName::new("group-b"), ExpectedVersion::NoStream, vec![payload(1)])
            .unwrap();
        store
            .append(&StreamName::new("group-a"), ExpectedVersion::Exact(0), vec![payload(2)])
            .unwrap();

        let slice = store
            .read_forward(&StreamName::new("$ce-group"), 0, 100, &CancelToken::new())
            .unwrap();
        assert_eq!(slice.events.len(), 3);
        let numbers: Vec<i64> = slice.events.iter().map(|e| e.event_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        let payloads: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[test]
    fn subscribe_replays_after_checkpoint_then_delivers_live() {
        let store = InMemoryStreamStore::new();
        let stream = StreamName::new("group-abc");
        store
            .append(
                &stream,
                ExpectedVersion::NoStream,
                vec![payload(0), payload(1), payload(2)],
            )
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = store
            .subscribe(
                &stream,
                Some(0),
                Box::new(move |e| sink.lock().unwrap().push(e.event_number)),
            )
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() == 2
        }));

        store
            .append(&stream, ExpectedVersion::Exact(2), vec![payload(3)])
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().len() == 3
        }));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        sub.unsubscribe();
    }

    #[test]
    fn catch_up_delivers_every_event_exactly_once_despite_racing_appends() {
        let store = InMemoryStreamStore::new();
        let stream = StreamName::new("group-race");
        for n in 0..50 {
            store
                .append(
                    &stream,
                    if n == 0 { ExpectedVersion::NoStream } else { ExpectedVersion::Exact(n - 1) },
                    vec![payload(n)],
                )
                .unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let live = Arc::new(AtomicBool::new(false));

        let sink = Arc::clone(&seen);
        let live_flag = Arc::clone(&live);
        let sub = store
            .catch_up_subscribe(
                &stream,
                None,
                Box::new(move |e| {
                    // Widen the race window between read and switch.
                    thread::sleep(Duration::from_micros(200));
                    sink.lock().unwrap().push(e.event_number);
                }),
                Box::new(move || live_flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();

        // Keep appending while the subscription catches up.
        for n in 50..100 {
            store
                .append(&stream, ExpectedVersion::Exact(n - 1), vec![payload(n)])
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().unwrap().len() == 100
        }));
        assert!(live.load(Ordering::SeqCst));
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<i64>>());
        sub.unsubscribe();
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: however appends are batched, event numbers are dense and
        /// zero-based, and the category stream mirrors them in order.
        #[test]
        fn event_numbering_is_dense_for_any_batching(
            batch_sizes in prop::collection::vec(1usize..5, 1..8)
        ) {
            let store = InMemoryStreamStore::new();
            let stream = StreamName::new("group-prop");

            let mut expected = ExpectedVersion::NoStream;
            let mut total = 0i64;
            for size in batch_sizes {
                let batch: Vec<EventData> = (0..size).map(|i| payload(total + i as i64)).collect();
                let result = store.append(&stream, expected, batch).unwrap();
                total += size as i64;
                prop_assert_eq!(result.next_expected_version, total - 1);
                expected = ExpectedVersion::Exact(total - 1);
            }

            let slice = store.read_forward(&stream, 0, 1000, &CancelToken::new()).unwrap();
            let numbers: Vec<i64> = slice.events.iter().map(|e| e.event_number).collect();
            prop_assert_eq!(numbers, (0..total).collect::<Vec<i64>>());

            let category = store
                .read_forward(&StreamName::new("$ce-group"), 0, 1000, &CancelToken::new())
                .unwrap();
            let mirrored: Vec<i64> = category
                .events
                .iter()
                .map(|e| e.data["n"].as_i64().unwrap())
                .collect();
            prop_assert_eq!(mirrored, (0..total).collect::<Vec<i64>>());
        }
    }
}
