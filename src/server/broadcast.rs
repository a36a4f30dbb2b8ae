use crate::domain::StreamEvent;
use crate::util::{log_event, now_iso};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Publish-time wildcard: events published here fan out to every attached
/// sink, regardless of the id it registered under.
pub const GLOBAL_STREAMING_ID: &str = "global";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What flows through a client sink. Heartbeats are protocol-level liveness
/// pings, rendered as SSE comments, never as data events.
#[derive(Clone, Debug)]
pub enum StreamFrame {
    Event(StreamEvent),
    Heartbeat,
}

struct ClientSink {
    conn_id: Uuid,
    tx: UnboundedSender<StreamFrame>,
}

#[derive(Default)]
struct HubState {
    sinks: HashMap<String, Vec<ClientSink>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl HubState {
    fn total_sinks(&self) -> usize {
        self.sinks.values().map(Vec::len).sum()
    }

    fn stop_heartbeat_if_idle(&mut self) {
        if self.total_sinks() == 0
            && let Some(handle) = self.heartbeat.take()
        {
            handle.abort();
        }
    }
}

/// A client attached to the hub. Dropping the receiver is how a client
/// disconnects; the hub notices on the next send and evicts the sink.
pub struct StreamClient {
    pub conn_id: Uuid,
    pub rx: UnboundedReceiver<StreamFrame>,
}

/// Fan-out hub for the event stream, keyed by `streamingId`. A sink whose
/// send fails is dead and is removed on the spot; there is no buffering for
/// slow or absent subscribers.
pub struct Broadcaster {
    state: Arc<Mutex<HubState>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    /// Register a sink under `streaming_id`. The client immediately receives
    /// a `connected` handshake. The first client overall starts the
    /// heartbeat timer. Must be called from within a tokio runtime.
    pub fn add_client(&self, streaming_id: &str) -> StreamClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();

        let connected = StreamEvent::Connected {
            streaming_id: streaming_id.to_string(),
            timestamp: now_iso(),
        };
        // A channel cannot be closed before its receiver is handed out, but
        // the contract stands: a failed handshake never registers the sink.
        let handshake_ok = tx.send(StreamFrame::Event(connected)).is_ok();

        let mut state = self.state.lock();
        if handshake_ok {
            state
                .sinks
                .entry(streaming_id.to_string())
                .or_default()
                .push(ClientSink { conn_id, tx });
            if state.heartbeat.is_none() {
                state.heartbeat = Some(spawn_heartbeat(self.state.clone()));
            }
        }
        log_event(
            "stream.open",
            serde_json::json!({
                "streaming_id": streaming_id,
                "conn_id": conn_id.to_string(),
                "clients": state.total_sinks(),
            }),
        );

        StreamClient { conn_id, rx }
    }

    /// Detach one sink, typically from the SSE stream's drop hook. Stops the
    /// heartbeat when the hub empties.
    pub fn remove_client(&self, streaming_id: &str, conn_id: Uuid) {
        let mut state = self.state.lock();
        if let Some(sinks) = state.sinks.get_mut(streaming_id) {
            sinks.retain(|sink| sink.conn_id != conn_id);
            if sinks.is_empty() {
                state.sinks.remove(streaming_id);
            }
        }
        state.stop_heartbeat_if_idle();
        log_event(
            "stream.closed",
            serde_json::json!({
                "streaming_id": streaming_id,
                "conn_id": conn_id.to_string(),
                "clients": state.total_sinks(),
            }),
        );
    }

    /// Deliver `event` to the sinks registered under `streaming_id`. With no
    /// subscribers this is a no-op; the event is not buffered. Returns how
    /// many sinks received it.
    pub fn broadcast(&self, streaming_id: &str, event: StreamEvent) -> usize {
        if streaming_id == GLOBAL_STREAMING_ID {
            return self.publish_global(event);
        }

        let mut state = self.state.lock();
        let Some(sinks) = state.sinks.get_mut(streaming_id) else {
            return 0;
        };
        let delivered = send_to_sinks(sinks, &StreamFrame::Event(event));
        if sinks.is_empty() {
            state.sinks.remove(streaming_id);
        }
        state.stop_heartbeat_if_idle();
        delivered
    }

    /// Deliver `event` to every attached sink across all ids.
    pub fn publish_global(&self, event: StreamEvent) -> usize {
        let mut state = self.state.lock();
        let frame = StreamFrame::Event(event);
        let mut delivered = 0;
        for sinks in state.sinks.values_mut() {
            delivered += send_to_sinks(sinks, &frame);
        }
        state.sinks.retain(|_, sinks| !sinks.is_empty());
        state.stop_heartbeat_if_idle();
        delivered
    }

    /// Tear down a streaming id: a final `closed` event, then every sink
    /// under the id is terminated and forgotten.
    pub fn close_session(&self, streaming_id: &str) {
        let mut state = self.state.lock();
        if let Some(mut sinks) = state.sinks.remove(streaming_id) {
            let closed = StreamEvent::Closed {
                streaming_id: streaming_id.to_string(),
                timestamp: now_iso(),
            };
            send_to_sinks(&mut sinks, &StreamFrame::Event(closed));
            // Dropping the senders ends each client's stream.
        }
        state.stop_heartbeat_if_idle();
        log_event(
            "stream.session_closed",
            serde_json::json!({"streaming_id": streaming_id}),
        );
    }

    pub fn has_clients(&self, streaming_id: &str) -> bool {
        self.state
            .lock()
            .sinks
            .get(streaming_id)
            .is_some_and(|sinks| !sinks.is_empty())
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().total_sinks()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn send_to_sinks(sinks: &mut Vec<ClientSink>, frame: &StreamFrame) -> usize {
    let mut delivered = 0;
    sinks.retain(|sink| {
        let ok = sink.tx.send(frame.clone()).is_ok();
        if ok {
            delivered += 1;
        }
        ok
    });
    delivered
}

fn spawn_heartbeat(state: Arc<Mutex<HubState>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            let mut state = state.lock();
            let mut delivered = 0;
            for sinks in state.sinks.values_mut() {
                delivered += send_to_sinks(sinks, &StreamFrame::Heartbeat);
            }
            state.sinks.retain(|_, sinks| !sinks.is_empty());
            if delivered == 0 && state.total_sinks() == 0 {
                state.heartbeat = None;
                return;
            }
        }
    })
}
