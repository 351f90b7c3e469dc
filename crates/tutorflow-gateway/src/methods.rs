//! Gateway method handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tutorflow_core::protocol::{DeliveryEvent, ErrorShape, GatewayFrame, SessionParams, TurnSendParams};
use tutorflow_core::registry::ResponderRegistry;
use tutorflow_core::session::SessionStore;
use tutorflow_pipeline::TurnError;

use crate::connection::Connection;
use crate::state::GatewayState;

/// Dispatch a method request.
///
/// Returns the response frame, or `None` when the response is sent later
/// (`turn.send` answers after its last event).
pub async fn dispatch_method(
    state: &Arc<GatewayState>,
    conn: &Connection,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> Option<GatewayFrame> {
    debug!(method, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = match method {
        "turn.send" => return handle_turn_send(state, conn, request_id, params),
        "turn.cancel" => handle_turn_cancel(conn, request_id, params),
        "responders.list" => handle_responders_list(state, request_id),
        "session.get" => handle_session_get(state, request_id, params).await,
        _ => error_response(
            request_id,
            "unknown_method",
            &format!("Unknown method: {method}"),
        ),
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    Some(response)
}

pub fn ok_response(id: &str, payload: serde_json::Value) -> GatewayFrame {
    GatewayFrame::ok(id, payload)
}

pub fn error_response(id: &str, code: &str, message: &str) -> GatewayFrame {
    GatewayFrame::Response {
        id: id.to_string(),
        ok: false,
        payload: None,
        error: Some(ErrorShape {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        }),
    }
}

fn parse_params<T: DeserializeOwned>(
    request_id: &str,
    params: Option<serde_json::Value>,
) -> Result<T, GatewayFrame> {
    let params = params.unwrap_or_default();
    serde_json::from_value(params)
        .map_err(|e| error_response(request_id, "invalid_params", &e.to_string()))
}

/// Public view of the registry: everything but the system prompt.
pub fn responder_summaries(registry: &ResponderRegistry) -> Vec<serde_json::Value> {
    registry
        .all()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.display_name(),
                "description": r.description,
                "capability": r.capability,
                "tier": r.tier,
            })
        })
        .collect()
}

// ============================================================
// Turn methods
// ============================================================

fn handle_turn_send(
    state: &Arc<GatewayState>,
    conn: &Connection,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> Option<GatewayFrame> {
    let params: TurnSendParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return Some(frame),
    };
    if params.session_id.trim().is_empty() || params.text.trim().is_empty() {
        return Some(error_response(
            request_id,
            "invalid_params",
            "session_id and text must not be empty",
        ));
    }

    let ticket = conn.begin_turn(&params.session_id);
    let state = state.clone();
    let task_conn = conn.clone();
    let request_id = request_id.to_string();
    conn.spawn(async move {
        let _running = state.begin_turn();
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let response = run_turn(&state, &task_conn, &request_id, &params, &ticket.cancel).await;
        task_conn.end_turn(&params.session_id, &ticket);

        #[cfg(feature = "metrics")]
        crate::metrics::record_request("turn.send", start.elapsed().as_secs_f64());
        task_conn.send(&response);
    });
    None
}

/// Run one turn, forwarding its events as they are produced.
async fn run_turn(
    state: &GatewayState,
    conn: &Connection,
    request_id: &str,
    params: &TurnSendParams,
    cancel: &CancellationToken,
) -> GatewayFrame {
    info!(session_id = %params.session_id, conn_id = %conn.conn_id, "Starting turn via gateway");
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<DeliveryEvent>();

    let run = async move {
        let result = state
            .pipeline
            .run_turn(&params.session_id, &params.text, &events_tx, cancel)
            .await;
        drop(events_tx);
        result
    };
    let forward = async {
        let mut seq = 0;
        while let Some(event) = events_rx.recv().await {
            conn.send(&GatewayFrame::turn_event(&event, seq));
            seq += 1;
        }
    };
    let (result, ()) = tokio::join!(run, forward);

    match result {
        Ok(summary) => ok_response(
            request_id,
            serde_json::to_value(&summary).unwrap_or_default(),
        ),
        Err(TurnError::Abandoned) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_turn_cancelled();
            error_response(request_id, "cancelled", "Turn was cancelled")
        }
        Err(TurnError::Generation(message)) => {
            error_response(request_id, "generation_error", &message)
        }
    }
}

fn handle_turn_cancel(
    conn: &Connection,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: SessionParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    if conn.cancel_session(&params.session_id) {
        info!(session_id = %params.session_id, "Turn cancelled by client");
        ok_response(
            request_id,
            json!({"cancelled": true, "session_id": params.session_id}),
        )
    } else {
        error_response(
            request_id,
            "not_found",
            &format!("No turn in flight for session: {}", params.session_id),
        )
    }
}

// ============================================================
// Read-only methods
// ============================================================

fn handle_responders_list(state: &Arc<GatewayState>, request_id: &str) -> GatewayFrame {
    let registry = state.pipeline.catalog().current();
    ok_response(
        request_id,
        json!({"responders": responder_summaries(&registry)}),
    )
}

async fn handle_session_get(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: SessionParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    match state.pipeline.store().load(&params.session_id).await {
        Ok(session) => ok_response(request_id, json!({ "session": session })),
        Err(e) => error_response(request_id, "session_error", &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorflow_core::types::{QualityTier, Responder};

    #[test]
    fn test_parse_params_missing_field() {
        let result: Result<TurnSendParams, _> =
            parse_params("r1", Some(json!({"session_id": "s1"})));
        let frame = serde_json::to_value(result.err().unwrap()).unwrap();
        assert_eq!(frame["ok"], false);
        assert_eq!(frame["error"]["code"], "invalid_params");
        assert_eq!(frame["id"], "r1");
    }

    #[test]
    fn test_parse_params_absent() {
        let result: Result<SessionParams, _> = parse_params("r2", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_responder_summaries_hide_prompt() {
        let registry = ResponderRegistry::from_responders([Responder {
            id: "fractions".into(),
            name: String::new(),
            description: "Halves and quarters".into(),
            capability: "fractions".into(),
            tier: QualityTier::Fast,
            system_prompt: "secret instructions".into(),
            keywords: vec!["half".into()],
            file_path: Default::default(),
        }]);
        let summaries = responder_summaries(&registry);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["name"], "fractions");
        assert_eq!(summaries[0]["tier"], "fast");
        assert!(summaries[0].get("system_prompt").is_none());
    }
}
