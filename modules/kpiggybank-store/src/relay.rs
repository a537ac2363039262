//! Change relay: one long-lived CouchDB `_changes` subscription fanned out to
//! local subscribers.
//!
//! Subscribers only ever see changes committed after the feed opened.
//! Transport faults and panicking subscribers are logged and handed to the
//! separate feed-error listeners; they never reach change subscribers and
//! never stop the relay.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use reqwest::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::CouchClient;
use crate::error::{Result, StoreError};
use crate::types::{ChangeEvent, Seq};

const HEARTBEAT: Duration = Duration::from_secs(30);
const RESUME_DELAY: Duration = Duration::from_secs(1);

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type FeedErrorHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Token returned by `subscribe` / `on_feed_error`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Closed,
    Subscribing,
    Active,
}

/// Handlers in registration order.
struct Registry<H> {
    entries: Mutex<Vec<(SubscriptionId, H)>>,
}

impl<H: Clone> Registry<H> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, id: SubscriptionId, handler: H) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<H> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct Shared {
    state: Mutex<RelayState>,
    next_id: AtomicU64,
    changes: Registry<ChangeHandler>,
    feed_errors: Registry<FeedErrorHandler>,
    last_seq: Mutex<Option<Seq>>,
}

impl Shared {
    fn set_state(&self, state: RelayState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn last_seq(&self) -> Option<Seq> {
        self.last_seq.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_seq(&self, seq: Seq) {
        *self.last_seq.lock().unwrap_or_else(|e| e.into_inner()) = Some(seq);
    }

    fn dispatch(&self, change: ChangeEvent) {
        self.record_seq(change.sequence.clone());

        debug!(seq = %change.sequence, id = %change.id, deleted = change.deleted, "Relaying change");
        for handler in self.changes.snapshot() {
            // A panicking subscriber must not take the feed task down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&change))).is_err() {
                self.report(StoreError::Subscriber(format!(
                    "handler panicked on change {} (seq {})",
                    change.id, change.sequence
                )));
            }
        }
    }

    fn report(&self, err: StoreError) {
        warn!(error = %err, "Change relay fault");
        for handler in self.feed_errors.snapshot() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&err))).is_err() {
                warn!(error = %err, "Feed error listener panicked");
            }
        }
    }

    fn handle_line(&self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return; // heartbeat
        }

        match serde_json::from_slice::<FeedLine>(line) {
            Ok(FeedLine::Change(change)) => self.dispatch(change),
            Ok(FeedLine::End { last_seq }) => {
                debug!(last_seq = %last_seq, "Change feed reported its last sequence");
                self.record_seq(last_seq);
            }
            Err(e) => self.report(StoreError::FeedTransport(format!(
                "malformed change line ({e}): {}",
                String::from_utf8_lossy(line)
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedLine {
    Change(ChangeEvent),
    End { last_seq: Seq },
}

/// The relay and its subscriber registry. The feed task stops when the relay is dropped.
pub struct ChangeRelay {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeRelay {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RelayState::Closed),
                next_id: AtomicU64::new(1),
                changes: Registry::new(),
                feed_errors: Registry::new(),
                last_seq: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the feed at `since=now` and start relaying.
    ///
    /// Returns once the subscription is live. Calling it on a relay that is
    /// not `Closed` does nothing.
    pub async fn start(&self, client: CouchClient) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != RelayState::Closed {
                return Ok(());
            }
            *state = RelayState::Subscribing;
        }
        info!(database = client.database(), "Change relay subscribing");

        let resp = match client.open_changes("now", HEARTBEAT).await {
            Ok(resp) => resp,
            Err(e) => {
                self.shared.set_state(RelayState::Closed);
                return Err(StoreError::Connection(format!(
                    "opening change feed for {}: {e}",
                    client.database()
                )));
            }
        };

        self.shared.set_state(RelayState::Active);
        info!(database = client.database(), "Change relay active");

        let handle = tokio::spawn(run_feed(client, resp, self.shared.clone()));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn subscribe(&self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.shared.next_id();
        self.shared.changes.insert(id, Arc::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.changes.remove(id) || self.shared.feed_errors.remove(id)
    }

    /// Opt in to feed transport faults. Change subscribers never receive these.
    pub fn on_feed_error(&self, handler: impl Fn(&StoreError) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.shared.next_id();
        self.shared.feed_errors.insert(id, Arc::new(handler));
        id
    }

    /// Subscribe through an unbounded channel. Dropping the stream unsubscribes.
    pub fn changes(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |change| {
            let _ = tx.send(change.clone());
        });
        ChangeStream {
            id,
            rx,
            shared: self.shared.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.changes.len()
    }
}

impl Default for ChangeRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChangeRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Channel-backed change subscription returned by [`ChangeRelay::changes`].
pub struct ChangeStream {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    shared: Arc<Shared>,
}

impl ChangeStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.shared.changes.remove(self.id);
    }
}

async fn run_feed(client: CouchClient, mut resp: Response, shared: Arc<Shared>) {
    loop {
        match pump(resp, &shared).await {
            Ok(()) => debug!("Change feed closed by server"),
            Err(e) => shared.report(e),
        }

        resp = loop {
            tokio::time::sleep(RESUME_DELAY).await;

            let since = shared
                .last_seq()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "now".to_string());

            match client.open_changes(&since, HEARTBEAT).await {
                Ok(resp) => {
                    info!(since = %since, "Change feed resumed");
                    break resp;
                }
                Err(e) => shared.report(StoreError::FeedTransport(format!(
                    "resuming change feed: {e}"
                ))),
            }
        };
    }
}

/// Read one feed response to its end, relaying every complete line.
async fn pump(resp: Response, shared: &Shared) -> Result<()> {
    let mut stream = resp.bytes_stream();
    let mut buffer = BytesMut::with_capacity(8192);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| StoreError::FeedTransport(e.to_string()))?;
        buffer.extend_from_slice(&chunk);
        while let Some(line) = next_line(&mut buffer) {
            shared.handle_line(&line);
        }
    }

    if !buffer.is_empty() {
        shared.handle_line(&buffer);
    }
    Ok(())
}

/// Split the first `\n`-terminated line off the buffer, without the terminator.
fn next_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(seq: u64, id: &str) -> ChangeEvent {
        serde_json::from_value(json!({ "seq": seq, "id": id, "doc": { "timestamp": seq } })).unwrap()
    }

    #[test]
    fn next_line_splits_on_newlines() {
        let mut buffer = BytesMut::from(&b"{\"a\":1}\r\n\n{\"b\""[..]);
        assert_eq!(&next_line(&mut buffer).unwrap()[..], b"{\"a\":1}");
        assert_eq!(&next_line(&mut buffer).unwrap()[..], b"");
        assert!(next_line(&mut buffer).is_none());
        assert_eq!(&buffer[..], b"{\"b\"");
    }

    #[test]
    fn fans_out_in_registration_order() {
        let relay = ChangeRelay::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = seen.clone();
            relay.subscribe(move |c| seen.lock().unwrap().push(format!("{name}:{}", c.id)));
        }

        relay.shared.dispatch(change(1, "a"));
        relay.shared.dispatch(change(2, "b"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
        assert_eq!(relay.shared.last_seq(), Some(Seq::Number(2)));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let relay = ChangeRelay::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = relay.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        relay.shared.dispatch(change(1, "a"));
        assert!(relay.unsubscribe(id));
        assert!(!relay.unsubscribe(id));
        relay.shared.dispatch(change(2, "b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[test]
    fn malformed_lines_go_to_error_listeners_only() {
        let relay = ChangeRelay::new();
        let changes = Arc::new(AtomicU64::new(0));
        let faults = Arc::new(Mutex::new(Vec::new()));

        let c = changes.clone();
        relay.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let f = faults.clone();
        relay.on_feed_error(move |e| f.lock().unwrap().push(e.to_string()));

        relay.shared.handle_line(b"not json");
        relay.shared.handle_line(b"   ");
        relay.shared.handle_line(br#"{"last_seq": 9}"#);

        assert_eq!(changes.load(Ordering::SeqCst), 0);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("malformed change line"));
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_others() {
        let relay = ChangeRelay::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let faults = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        relay.subscribe(move |c| s.lock().unwrap().push(c.id.clone()));
        relay.subscribe(|c| {
            if c.id == "a" {
                panic!("subscriber rejects {}", c.id);
            }
        });
        let f = faults.clone();
        relay.on_feed_error(move |e| f.lock().unwrap().push(e.to_string()));

        relay.shared.dispatch(change(6, "a"));
        relay.shared.dispatch(change(7, "b"));

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("panicked on change a"));
        assert_eq!(relay.shared.last_seq(), Some(Seq::Number(7)));
    }

    #[test]
    fn panicking_error_listener_is_contained() {
        let relay = ChangeRelay::new();
        let reached = Arc::new(AtomicU64::new(0));

        relay.on_feed_error(|_| panic!("listener blew up"));
        let r = reached.clone();
        relay.on_feed_error(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        relay.shared.handle_line(b"not json");
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn end_of_feed_line_sets_resume_point() {
        let relay = ChangeRelay::new();
        assert_eq!(relay.shared.last_seq(), None);

        relay.shared.handle_line(br#"{"last_seq": "9-g1AAAA", "pending": 0}"#);
        assert_eq!(relay.shared.last_seq(), Some(Seq::Token("9-g1AAAA".into())));
    }

    #[tokio::test]
    async fn change_stream_receives_and_unsubscribes_on_drop() {
        let relay = ChangeRelay::new();
        let mut stream = relay.changes();
        assert_eq!(relay.subscriber_count(), 1);

        relay.shared.handle_line(br#"{"seq": 3, "id": "x", "doc": {"timestamp": 3}}"#);
        let received = stream.recv().await.unwrap();
        assert_eq!(received.id, "x");
        assert_eq!(received.sequence, Seq::Number(3));

        drop(stream);
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[test]
    fn new_relay_is_closed() {
        assert_eq!(ChangeRelay::new().state(), RelayState::Closed);
    }
}
