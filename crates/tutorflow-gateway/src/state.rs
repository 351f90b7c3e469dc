//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};

use tutorflow_core::config::Config;
use tutorflow_pipeline::TurnPipeline;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pipeline: Arc<TurnPipeline>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    turns_in_flight: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub outbound: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Arc<TurnPipeline>) -> Self {
        Self {
            config,
            pipeline,
            connections: RwLock::new(HashMap::new()),
            turns_in_flight: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// Attach the Prometheus handle served at `/metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn turns_in_flight(&self) -> usize {
        self.turns_in_flight.load(Ordering::SeqCst)
    }

    /// Count a turn as running until the returned guard drops.
    pub fn begin_turn(self: &Arc<Self>) -> TurnGuard {
        self.turns_in_flight.fetch_add(1, Ordering::SeqCst);
        TurnGuard {
            state: self.clone(),
        }
    }
}

/// Decrements the in-flight turn count on drop.
pub struct TurnGuard {
    state: Arc<GatewayState>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.state.turns_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
