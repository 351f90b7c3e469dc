//! Per-turn orchestration.
//!
//! A turn holds its session's lock from routing to delivery. Generation is
//! read on the turn's own task; every extracted sentence is handed to the
//! synthesis dispatcher through a channel so generation never waits for a
//! synthesis slot. Once the full text is known, validation and the
//! remaining synthesis run side by side.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tutorflow_core::config::{Config, ExtractorConfig, SynthesisConfig};
use tutorflow_core::protocol::{AudioMode, DeliveryEvent, TurnSummary, ValidationOutcome};
use tutorflow_core::registry::ResponderCatalog;
use tutorflow_core::session::{ReviewRecord, RouterState, SessionState, SessionStore};
use tutorflow_core::types::{
    GenerationOutcome, RouteTarget, RoutingDecision, RoutingReason, SentenceUnit, TurnSignal,
};
use tutorflow_media::dispatcher::{AudioSegment, SynthesisDispatcher, synthesize_single_pass};
use tutorflow_media::sentence::{Extracted, SentenceExtractor, reassemble, split_sentences};
use tutorflow_providers::signal::speakable;
use tutorflow_providers::{
    GenerationEvent, GenerationProvider, GenerationRequest, GenerationStream, SynthesisProvider,
    ValidationProvider, ValidationRequest,
};

use crate::background::BackgroundTasks;
use crate::delivery::{DeliveryAssembler, Draft, DraftAudio, assemble};
use crate::policy::SelectionPolicy;
use crate::router::SessionRouter;
use crate::session_lock::SessionLocks;
use crate::validation::{LoopStep, RegenerationLoop, ValidationGate};

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The responder could not produce an answer. The only client-visible failure.
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("turn abandoned")]
    Abandoned,
}

/// External collaborators of the pipeline.
pub struct PipelineComponents {
    pub catalog: Arc<ResponderCatalog>,
    pub policy: Arc<dyn SelectionPolicy>,
    pub generator: Arc<dyn GenerationProvider>,
    /// `None` delivers text only.
    pub synthesizer: Option<Arc<dyn SynthesisProvider>>,
    /// `None` skips validation.
    pub validator: Option<Arc<dyn ValidationProvider>>,
    pub store: Arc<dyn SessionStore>,
}

pub struct TurnPipeline {
    catalog: Arc<ResponderCatalog>,
    router: SessionRouter,
    generator: Arc<dyn GenerationProvider>,
    synthesizer: Option<Arc<dyn SynthesisProvider>>,
    gate: ValidationGate,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    background: BackgroundTasks,
    assembler: DeliveryAssembler,
    extractor: ExtractorConfig,
    synthesis: SynthesisConfig,
}

/// A generated draft whose audio may still be synthesizing.
struct PendingDraft {
    outcome: GenerationOutcome,
    pieces: Vec<Extracted>,
    dispatcher: Option<SynthesisDispatcher>,
}

impl TurnPipeline {
    pub fn new(config: &Config, components: PipelineComponents) -> Self {
        Self::with_background(config, components, BackgroundTasks::new())
    }

    pub fn with_background(
        config: &Config,
        components: PipelineComponents,
        background: BackgroundTasks,
    ) -> Self {
        let PipelineComponents {
            catalog,
            policy,
            generator,
            synthesizer,
            validator,
            store,
        } = components;

        let mut extractor = config.extractor();
        if let Some(synth) = &synthesizer {
            extractor.max_chars = extractor.max_chars.min(synth.max_chars());
        }

        Self {
            router: SessionRouter::new(
                catalog.clone(),
                policy,
                config.default_responder(),
                config.assessment_responder(),
                config.policy_timeout(),
            ),
            catalog,
            generator,
            synthesizer,
            gate: ValidationGate::new(validator, &config.validation()),
            assembler: DeliveryAssembler::new(store.clone(), background.clone(), config.history_limit()),
            store,
            locks: SessionLocks::new(),
            background,
            extractor,
            synthesis: config.synthesis(),
        }
    }

    pub fn catalog(&self) -> &Arc<ResponderCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Run one turn and send its events to `events`.
    ///
    /// Exactly one `complete` event is sent for a delivered turn; a
    /// generation failure sends one `error` event instead. An abandoned turn
    /// sends nothing and leaves the session untouched.
    pub async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        events: &mpsc::UnboundedSender<DeliveryEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnSummary, TurnError> {
        let started = Instant::now();
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Abandoned),
            guard = self.locks.acquire(session_id) => guard,
        };

        let state = match self.store.load(session_id).await {
            Ok(state) => state.unwrap_or_else(|| SessionState::new(session_id)),
            Err(e) => {
                error!(
                    session_id,
                    store_failure = "load",
                    error = %e,
                    "Failed to load session state, starting from a fresh session"
                );
                crate::metrics::record_store_failure("load");
                SessionState::new(session_id)
            }
        };
        let turn_id = Uuid::new_v4().to_string();
        info!(
            session_id,
            turn_id = %turn_id,
            state = state.router.name(),
            "Turn started"
        );

        let decision = self.router.route(text, &state).await;

        match self.answer(&turn_id, text, &state, &decision, cancel).await {
            Ok(_) if cancel.is_cancelled() => {
                info!(session_id, turn_id = %turn_id, "Turn abandoned before delivery");
                crate::metrics::record_turn("abandoned", started.elapsed().as_secs_f64());
                Err(TurnError::Abandoned)
            }
            Ok((draft, validation, review)) => {
                let next = self.router.advance(&decision, &draft.outcome.signal);
                let delivery = assemble(&turn_id, draft, validation, &decision);
                let summary = self
                    .assembler
                    .deliver(delivery, events, state, next, text, review)
                    .await;
                info!(
                    session_id,
                    turn_id = %turn_id,
                    responder = summary.responder.as_deref().unwrap_or("-"),
                    validation = summary.validation.label(),
                    audio = ?summary.audio_mode,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn delivered"
                );
                crate::metrics::record_turn("delivered", started.elapsed().as_secs_f64());
                Ok(summary)
            }
            Err(TurnError::Generation(message)) => {
                warn!(session_id, turn_id = %turn_id, error = %message, "Generation failed");
                let _ = events.send(DeliveryEvent::Error {
                    turn_id: turn_id.clone(),
                    kind: "generation".into(),
                    message: message.clone(),
                });
                crate::metrics::record_turn("generation_failed", started.elapsed().as_secs_f64());
                Err(TurnError::Generation(message))
            }
            Err(e) => {
                crate::metrics::record_turn("abandoned", started.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        turn_id: &str,
        text: &str,
        state: &SessionState,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
    ) -> Result<(Draft, ValidationOutcome, Option<ReviewRecord>), TurnError> {
        let id = match &decision.target {
            RouteTarget::Direct { reply } => {
                let draft = self.direct_draft(reply).await;
                return Ok((draft, ValidationOutcome::Skipped, None));
            }
            RouteTarget::Responder { id } => id,
        };

        let responder = self
            .catalog
            .current()
            .get(id)
            .ok_or_else(|| TurnError::Generation(format!("responder '{id}' is not registered")))?;
        let mut request = GenerationRequest {
            responder: responder.clone(),
            user_text: text.to_string(),
            history: state.history.iter().cloned().collect(),
            required_fixes: Vec::new(),
            handoff_context: handoff_context(state, decision),
        };

        if !self.gate.is_enabled() {
            let pending = self.produce_draft(&request, turn_id, 1, cancel).await?;
            return Ok((self.finish_audio(pending).await, ValidationOutcome::Skipped, None));
        }

        let mut regeneration = RegenerationLoop::new(self.gate.max_attempts());
        loop {
            let attempt = regeneration.attempts() + 1;
            let pending = match self.produce_draft(&request, turn_id, attempt, cancel).await {
                Ok(pending) => pending,
                Err(TurnError::Generation(message)) if attempt > 1 => {
                    warn!(
                        turn_id,
                        attempt,
                        error = %message,
                        "Regeneration failed, falling back to the rejected draft"
                    );
                    return match regeneration.give_up() {
                        Some(LoopStep::Deliver { draft, outcome }) => {
                            let review = review_record(state, turn_id, &responder.id, &draft, &regeneration);
                            Ok((draft, outcome, Some(review)))
                        }
                        _ => Err(TurnError::Generation(message)),
                    };
                }
                Err(e) => return Err(e),
            };

            let validation_request = ValidationRequest {
                responder_id: responder.id.clone(),
                capability: responder.capability.clone(),
                user_text: text.to_string(),
                display_text: pending.outcome.display_text.clone(),
                audio_text: pending.outcome.audio_text.clone(),
                visual_payload: pending.outcome.visual_payload.clone(),
                attempt,
            };
            let (result, draft) = tokio::join!(
                self.gate.evaluate(&validation_request),
                self.finish_audio(pending)
            );

            match regeneration.record(result, draft) {
                LoopStep::Deliver { draft, outcome } => {
                    let review = outcome
                        .disclaimer()
                        .then(|| review_record(state, turn_id, &responder.id, &draft, &regeneration));
                    return Ok((draft, outcome, review));
                }
                LoopStep::Regenerate { required_fixes } => {
                    if cancel.is_cancelled() {
                        return Err(TurnError::Abandoned);
                    }
                    debug!(turn_id, attempt, fixes = required_fixes.len(), "Regenerating");
                    request.required_fixes = required_fixes;
                }
            }
        }
    }

    /// Stream one generation attempt through extraction and progressive synthesis.
    async fn produce_draft(
        &self,
        request: &GenerationRequest,
        turn_id: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<PendingDraft, TurnError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Abandoned),
            stream = self.generator.generate(request) => {
                stream.map_err(|e| TurnError::Generation(format!("{e:#}")))?
            }
        };
        debug!(turn_id, attempt, responder = %request.responder.id, "Generation stream open");

        let draft_cancel = cancel.child_token();
        let dispatcher = self
            .synthesizer
            .clone()
            .map(|synth| SynthesisDispatcher::new(synth, self.synthesis.clone(), &draft_cancel));
        let (piece_tx, mut piece_rx) = mpsc::unbounded_channel::<Extracted>();

        let reader = read_generation(stream, &self.extractor, piece_tx, cancel, &draft_cancel);
        let feeder = async move {
            let mut dispatcher = dispatcher?;
            while let Some(piece) = piece_rx.recv().await {
                match piece {
                    Extracted::Unit(unit) => {
                        dispatcher
                            .dispatch(SentenceUnit {
                                sequence_index: unit.sequence_index,
                                text: speakable(&unit.text),
                            })
                            .await;
                    }
                    Extracted::Tail {
                        sequence_index,
                        text,
                    } => {
                        dispatcher.append_tail(sequence_index, speakable(&text)).await;
                    }
                }
            }
            Some(dispatcher)
        };

        let (read, dispatcher) = tokio::join!(reader, feeder);
        let (outcome, pieces) = read?;
        Ok(PendingDraft {
            outcome,
            pieces,
            dispatcher,
        })
    }

    /// Wait for a draft's audio, falling back to a single pass if progressive mode aborted.
    async fn finish_audio(&self, pending: PendingDraft) -> Draft {
        let PendingDraft {
            outcome,
            pieces,
            dispatcher,
        } = pending;

        let audio = match dispatcher {
            None => DraftAudio::text_only(),
            Some(dispatcher) => {
                let format = dispatcher.format().to_string();
                match dispatcher.collect().await {
                    Ok(ordered) => DraftAudio {
                        mode: AudioMode::Progressive,
                        format,
                        segments: ordered.segments,
                        failed: ordered.failed,
                    },
                    Err(aborted) => {
                        warn!(
                            failed = aborted.failed,
                            "Progressive synthesis aborted, synthesizing the final text in one pass"
                        );
                        self.single_pass_audio(&outcome.audio_text).await
                    }
                }
            }
        };

        Draft {
            outcome,
            pieces,
            audio,
        }
    }

    async fn single_pass_audio(&self, text: &str) -> DraftAudio {
        let Some(synth) = &self.synthesizer else {
            return DraftAudio::text_only();
        };
        if text.trim().is_empty() {
            return DraftAudio::text_only();
        }
        match synthesize_single_pass(synth.as_ref(), text, &self.extractor).await {
            Ok(bytes) if !bytes.is_empty() => DraftAudio {
                mode: AudioMode::SinglePass,
                format: synth.format().to_string(),
                segments: vec![AudioSegment {
                    sequence_index: 0,
                    bytes,
                }],
                failed: Vec::new(),
            },
            Ok(_) => DraftAudio::text_only(),
            Err(e) => {
                warn!(error = %e, "Single-pass synthesis failed, delivering text only");
                DraftAudio::text_only()
            }
        }
    }

    /// The selection policy's own reply, delivered without a responder.
    async fn direct_draft(&self, reply: &str) -> Draft {
        let outcome = GenerationOutcome {
            display_text: reply.to_string(),
            audio_text: speakable(reply),
            visual_payload: None,
            signal: TurnSignal::Continue,
        };
        let audio = self.single_pass_audio(&outcome.audio_text).await;
        Draft {
            pieces: split_sentences(reply, &self.extractor),
            outcome,
            audio,
        }
    }
}

/// Read a generation stream to its end, extracting sentences as they complete.
async fn read_generation(
    mut stream: GenerationStream,
    config: &ExtractorConfig,
    pieces_tx: mpsc::UnboundedSender<Extracted>,
    cancel: &CancellationToken,
    draft_cancel: &CancellationToken,
) -> Result<(GenerationOutcome, Vec<Extracted>), TurnError> {
    let mut extractor = SentenceExtractor::new(config);
    let mut pieces = Vec::new();
    let mut finished = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Abandoned),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(GenerationEvent::Delta(fragment))) => {
                for unit in extractor.push(&fragment) {
                    let piece = Extracted::Unit(unit);
                    let _ = pieces_tx.send(piece.clone());
                    pieces.push(piece);
                }
            }
            Some(Ok(GenerationEvent::Finished(outcome))) => finished = Some(outcome),
            Some(Err(e)) => {
                draft_cancel.cancel();
                return Err(TurnError::Generation(format!("{e:#}")));
            }
            None => break,
        }
    }

    for piece in extractor.finish() {
        let _ = pieces_tx.send(piece.clone());
        pieces.push(piece);
    }

    let Some(outcome) = finished else {
        draft_cancel.cancel();
        return Err(TurnError::Generation("stream ended without a final outcome".into()));
    };
    if outcome.display_text.trim().is_empty() {
        draft_cancel.cancel();
        return Err(TurnError::Generation("empty response".into()));
    }
    if reassemble(&pieces) != outcome.display_text {
        debug!("Streamed text differs from final text, re-splitting");
        pieces = split_sentences(&outcome.display_text, config);
    }
    Ok((outcome, pieces))
}

/// What the new responder hears about the previous one.
fn handoff_context(state: &SessionState, decision: &RoutingDecision) -> Option<String> {
    let handed_over = matches!(
        (&state.router, decision.reason),
        (
            RouterState::ResponderActive {
                handed_off_from: Some(_),
                ..
            },
            RoutingReason::Handoff
        ) | (RouterState::AwaitingAssessment { .. }, RoutingReason::Assessment)
    );
    if !handed_over {
        return None;
    }
    state
        .history
        .back()
        .map(|last| last.reply_text.clone())
        .filter(|reply| !reply.is_empty())
}

fn review_record(
    state: &SessionState,
    turn_id: &str,
    responder: &str,
    draft: &Draft,
    regeneration: &RegenerationLoop<Draft>,
) -> ReviewRecord {
    ReviewRecord {
        session_id: state.session_id.clone(),
        turn_id: turn_id.to_string(),
        responder: responder.to_string(),
        delivered_text: draft.outcome.display_text.clone(),
        verdicts: regeneration.verdicts().to_vec(),
        timestamp: Utc::now(),
    }
}
