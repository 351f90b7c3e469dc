//! WebSocket connection lifecycle: hello, read/write loops, turn cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tutorflow_core::protocol::{GatewayFrame, METHODS, PROTOCOL_VERSION, TURN_EVENT};

use crate::methods::{dispatch_method, error_response};
use crate::state::{ConnectionState, GatewayState};

/// How long a closing connection waits for its cancelled turns to unwind.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct InFlight {
    entry: u64,
    cancel: CancellationToken,
    turns: usize,
}

/// A running turn's cancellation token and the in-flight entry it belongs to.
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub cancel: CancellationToken,
    entry: u64,
}

/// Handle to one client connection, shared with the turns it started.
#[derive(Clone)]
pub struct Connection {
    pub conn_id: String,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_entry: Arc<AtomicU64>,
    tasks: TaskTracker,
}

impl Connection {
    pub fn new(conn_id: impl Into<String>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            outbound,
            closed: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_entry: Arc::new(AtomicU64::new(0)),
            tasks: TaskTracker::new(),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for the client. Frames for a closed socket are dropped.
    pub fn send(&self, frame: &GatewayFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.outbound.send(text);
            }
            Err(e) => error!(conn_id = %self.conn_id, %e, "Failed to serialize frame"),
        }
    }

    /// Register a turn for `session_id`; the token fires on `turn.cancel` or disconnect.
    pub fn begin_turn(&self, session_id: &str) -> TurnTicket {
        let mut in_flight = self.in_flight();
        let entry = in_flight
            .entry(session_id.to_string())
            .or_insert_with(|| InFlight {
                entry: self.next_entry.fetch_add(1, Ordering::Relaxed),
                cancel: self.closed.child_token(),
                turns: 0,
            });
        entry.turns += 1;
        TurnTicket {
            cancel: entry.cancel.clone(),
            entry: entry.entry,
        }
    }

    /// Release a turn. A ticket from a cancelled entry leaves newer turns alone.
    pub fn end_turn(&self, session_id: &str, ticket: &TurnTicket) {
        let mut in_flight = self.in_flight();
        if let Some(entry) = in_flight
            .get_mut(session_id)
            .filter(|e| e.entry == ticket.entry)
        {
            entry.turns = entry.turns.saturating_sub(1);
            if entry.turns == 0 {
                in_flight.remove(session_id);
            }
        }
    }

    /// Cancel every turn this connection runs for `session_id`.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        match self.in_flight().remove(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn turns_in_flight(&self) -> usize {
        self.in_flight().values().map(|e| e.turns).sum()
    }

    /// Run a turn task tied to this connection's lifetime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Cancel all in-flight turns and wait for them to unwind.
    pub async fn close(&self) {
        self.closed.cancel();
        self.tasks.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(conn_id = %self.conn_id, "Turns still running after disconnect");
        }
    }
}

fn hello_frame(conn_id: &str) -> GatewayFrame {
    GatewayFrame::Event {
        event: "hello".into(),
        payload: Some(json!({
            "protocol": PROTOCOL_VERSION,
            "server": {
                "version": env!("CARGO_PKG_VERSION"),
                "conn_id": conn_id,
            },
            "methods": METHODS,
            "events": [TURN_EVENT],
        })),
        seq: Some(0),
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let conn = Connection::new(conn_id.clone(), outbound_tx.clone());

    state.connections.write().await.insert(
        conn_id.clone(),
        ConnectionState {
            conn_id: conn_id.clone(),
            outbound: outbound_tx,
            connected_at: Instant::now(),
        },
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    if let Ok(msg) = serde_json::to_string(&hello_frame(&conn_id)) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            cleanup_connection(&state, &conn).await;
            return;
        }
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                Ok(GatewayFrame::Request { id, method, params }) => {
                    if let Some(response) = dispatch_method(&state, &conn, &id, &method, params).await
                    {
                        conn.send(&response);
                    }
                }
                Ok(_) => {
                    debug!("Received non-request frame, ignoring");
                }
                Err(e) => {
                    warn!(%e, "Invalid frame received");
                    conn.send(&error_response(
                        "unknown",
                        "parse_error",
                        &format!("Invalid frame: {e}"),
                    ));
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    let abandoned = conn.turns_in_flight();
    if abandoned > 0 {
        info!(conn_id = %conn_id, turns = abandoned, "Client disconnected, cancelling turns");
    }
    cleanup_connection(&state, &conn).await;
    send_task.abort();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

async fn cleanup_connection(state: &Arc<GatewayState>, conn: &Connection) {
    conn.close().await;
    state.connections.write().await.remove(&conn.conn_id);
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("c1", tx), rx)
    }

    #[test]
    fn test_turns_share_session_token() {
        let (conn, _rx) = connection();
        let first = conn.begin_turn("s1");
        let second = conn.begin_turn("s1");
        let other = conn.begin_turn("s2");
        assert_eq!(conn.turns_in_flight(), 3);

        assert!(conn.cancel_session("s1"));
        assert!(first.cancel.is_cancelled());
        assert!(second.cancel.is_cancelled());
        assert!(!other.cancel.is_cancelled());
        assert!(!conn.cancel_session("s1"));
    }

    #[test]
    fn test_end_turn_releases_entry() {
        let (conn, _rx) = connection();
        let first = conn.begin_turn("s1");
        let second = conn.begin_turn("s1");
        conn.end_turn("s1", &first);
        assert_eq!(conn.turns_in_flight(), 1);
        conn.end_turn("s1", &second);
        assert_eq!(conn.turns_in_flight(), 0);
        assert!(!conn.cancel_session("s1"));
    }

    #[test]
    fn test_late_end_of_cancelled_turn_keeps_new_turn() {
        let (conn, _rx) = connection();
        let cancelled = conn.begin_turn("s1");
        assert!(conn.cancel_session("s1"));

        let fresh = conn.begin_turn("s1");
        assert!(!fresh.cancel.is_cancelled());
        conn.end_turn("s1", &cancelled);

        assert_eq!(conn.turns_in_flight(), 1);
        assert!(conn.cancel_session("s1"));
        assert!(fresh.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_cancels_and_waits() {
        let (conn, _rx) = connection();
        let ticket = conn.begin_turn("s1");
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        conn.spawn(async move {
            ticket.cancel.cancelled().await;
            let _ = done_tx.send(());
        });

        conn.close().await;
        assert!(done_rx.await.is_ok());
    }

    #[test]
    fn test_send_serializes_frame() {
        let (conn, mut rx) = connection();
        conn.send(&GatewayFrame::ok("1", json!({"pong": true})));
        let raw = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "res");
        assert_eq!(value["payload"]["pong"], true);
    }

    #[test]
    fn test_hello_lists_methods() {
        let value = serde_json::to_value(hello_frame("c1")).unwrap();
        assert_eq!(value["event"], "hello");
        assert_eq!(value["payload"]["protocol"], PROTOCOL_VERSION);
        assert_eq!(value["payload"]["methods"][0], "turn.send");
    }
}
