//! Delivery assembler: turns the chosen draft into the outbound event
//! sequence, then persists the routing outcome.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use tutorflow_core::protocol::{AudioMode, DeliveryEvent, TurnSummary, ValidationOutcome};
use tutorflow_core::session::{ReviewRecord, RouterState, SessionState, SessionStore, TurnRecord};
use tutorflow_core::types::{GenerationOutcome, RoutingDecision, TurnSignal};
use tutorflow_media::dispatcher::AudioSegment;
use tutorflow_media::sentence::Extracted;

use crate::background::BackgroundTasks;

/// Audio produced for one draft.
#[derive(Debug, Clone)]
pub struct DraftAudio {
    pub mode: AudioMode,
    pub format: String,
    /// Ordered by sequence index.
    pub segments: Vec<AudioSegment>,
    pub failed: Vec<usize>,
}

impl DraftAudio {
    pub fn text_only() -> Self {
        Self {
            mode: AudioMode::TextOnly,
            format: String::new(),
            segments: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// One complete answer attempt.
#[derive(Debug, Clone)]
pub struct Draft {
    pub outcome: GenerationOutcome,
    /// Display text as extracted, in order; concatenates to `outcome.display_text`.
    pub pieces: Vec<Extracted>,
    pub audio: DraftAudio,
}

/// Everything the client receives for one turn.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// `text` events, then `audio` events in sequence order, then `complete`.
    pub events: Vec<DeliveryEvent>,
    pub summary: TurnSummary,
}

/// Build the outbound result for a turn.
pub fn assemble(
    turn_id: &str,
    draft: Draft,
    validation: ValidationOutcome,
    decision: &RoutingDecision,
) -> DeliveryResult {
    let Draft {
        outcome,
        pieces,
        audio,
    } = draft;

    let mut events = Vec::with_capacity(pieces.len() + audio.segments.len() + 1);
    if pieces.is_empty() && !outcome.display_text.is_empty() {
        events.push(DeliveryEvent::Text {
            turn_id: turn_id.to_string(),
            seq: 0,
            text: outcome.display_text.clone(),
        });
    }
    for (seq, piece) in pieces.iter().enumerate() {
        events.push(DeliveryEvent::Text {
            turn_id: turn_id.to_string(),
            seq,
            text: piece.text().to_string(),
        });
    }
    for segment in &audio.segments {
        events.push(DeliveryEvent::audio(
            turn_id,
            segment.sequence_index,
            &audio.format,
            &segment.bytes,
        ));
    }

    let summary = TurnSummary {
        turn_id: turn_id.to_string(),
        responder: decision.responder_id().map(str::to_string),
        routing_reason: decision.reason,
        handoff_message: decision.handoff_message.clone(),
        display_text: outcome.display_text,
        visual_payload: outcome.visual_payload,
        completion: outcome.signal == TurnSignal::Complete,
        handoff_to: match outcome.signal {
            TurnSignal::HandoffTo(target) => Some(target),
            _ => None,
        },
        disclaimer: validation.disclaimer(),
        validation,
        audio_mode: audio.mode,
        audio_segments: audio.segments.len(),
        audio_failed: audio.failed,
    };
    events.push(DeliveryEvent::Complete(summary.clone()));

    DeliveryResult { events, summary }
}

/// Emits delivery results and records their outcome.
pub struct DeliveryAssembler {
    store: Arc<dyn SessionStore>,
    background: BackgroundTasks,
    history_limit: usize,
}

impl DeliveryAssembler {
    pub fn new(store: Arc<dyn SessionStore>, background: BackgroundTasks, history_limit: usize) -> Self {
        Self {
            store,
            background,
            history_limit,
        }
    }

    /// Send every event, then move the session to `next` and save it.
    ///
    /// Session state changes only after all content is out, so a failure
    /// earlier in the turn leaves the stored state untouched.
    pub async fn deliver(
        &self,
        result: DeliveryResult,
        events: &mpsc::UnboundedSender<DeliveryEvent>,
        mut state: SessionState,
        next: RouterState,
        user_text: &str,
        review: Option<ReviewRecord>,
    ) -> TurnSummary {
        let DeliveryResult {
            events: outbound,
            summary,
        } = result;
        let count = outbound.len();
        for event in outbound {
            let _ = events.send(event);
        }

        let responder = summary.responder.clone();
        let reason = summary.routing_reason;
        state.router = next;
        state.push_turn(
            TurnRecord {
                turn_id: summary.turn_id.clone(),
                user_text: user_text.to_string(),
                responder: responder.clone(),
                reply_text: summary.display_text.clone(),
                reason,
                timestamp: Utc::now(),
            },
            self.history_limit,
        );
        state.updated_at = Utc::now();

        if let Err(e) = self.store.save(&state).await {
            error!(
                session_id = %state.session_id,
                store_failure = "save",
                error = %e,
                "Failed to save session state"
            );
            crate::metrics::record_store_failure("save");
        }
        debug!(
            session_id = %state.session_id,
            turn_id = %summary.turn_id,
            events = count,
            state = state.router.name(),
            "Turn delivered"
        );

        let store = self.store.clone();
        let session_id = state.session_id.clone();
        self.background.spawn("record_turn", &state.session_id, async move {
            store
                .record_turn(&session_id, responder.as_deref(), reason)
                .await?;
            Ok(())
        });

        if let Some(review) = review {
            let store = self.store.clone();
            self.background.spawn("record_review", &state.session_id, async move {
                store.record_review(&review).await?;
                Ok(())
            });
        }

        summary
    }
}
