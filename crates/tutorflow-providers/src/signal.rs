//! Control tools offered to responders and their conversion into a typed
//! [`TurnSignal`] at the provider edge.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use tutorflow_core::types::{GenerationOutcome, TurnSignal};

use crate::{ToolDefinition, ToolUseChunk};

pub const COMPLETE_LESSON: &str = "complete_lesson";
pub const HANDOFF_TO: &str = "handoff_to";
pub const SHOW_VISUAL: &str = "show_visual";

/// Tools every responder may call alongside its text answer.
pub fn control_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: COMPLETE_LESSON.into(),
            description: "Call when the learner has worked through the lesson and is ready \
                          to be assessed."
                .into(),
            parameters_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: HANDOFF_TO.into(),
            description: "Transfer the conversation to another responder.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "responder": { "type": "string", "description": "Target responder id" },
                },
                "required": ["responder"],
            }),
        },
        ToolDefinition {
            name: SHOW_VISUAL.into(),
            description: "Attach a visual (diagram, number line, shapes) to this answer.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string" },
                    "data": { "type": "object" },
                },
                "required": ["kind"],
            }),
        },
    ]
}

#[derive(Deserialize)]
struct HandoffArgs {
    responder: String,
}

/// Build the structured outcome of a finished generation.
///
/// A handoff takes precedence over lesson completion when both are called.
pub fn outcome_from_parts(display_text: String, tool_calls: &[ToolUseChunk]) -> GenerationOutcome {
    let mut complete = false;
    let mut handoff: Option<String> = None;
    let mut visual: Option<serde_json::Value> = None;

    for call in tool_calls {
        match call.name.as_str() {
            COMPLETE_LESSON => complete = true,
            HANDOFF_TO => match serde_json::from_str::<HandoffArgs>(&call.input_json) {
                Ok(args) if !args.responder.trim().is_empty() => {
                    handoff = Some(args.responder.trim().to_string());
                }
                Ok(_) | Err(_) => {
                    warn!(input = %call.input_json, "Ignoring malformed handoff_to call");
                }
            },
            SHOW_VISUAL => match serde_json::from_str::<serde_json::Value>(&call.input_json) {
                Ok(payload) => visual = Some(payload),
                Err(e) => warn!(%e, "Ignoring malformed show_visual call"),
            },
            other => debug!(tool = other, "Ignoring unknown tool call"),
        }
    }

    let signal = match (handoff, complete) {
        (Some(target), _) => TurnSignal::HandoffTo(target),
        (None, true) => TurnSignal::Complete,
        (None, false) => TurnSignal::Continue,
    };

    GenerationOutcome {
        audio_text: speakable(&display_text),
        display_text,
        visual_payload: visual,
        signal,
    }
}

/// Strip markdown markup that should not be read aloud.
pub fn speakable(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim_start();
        let content = trimmed
            .trim_start_matches('#')
            .trim_start_matches("- ")
            .trim_start_matches("* ");
        let cleaned: String = content
            .chars()
            .filter(|c| !matches!(c, '*' | '_' | '`' | '#'))
            .collect();
        if !out.is_empty() && !cleaned.trim().is_empty() {
            out.push(' ');
        }
        out.push_str(cleaned.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, input: &str) -> ToolUseChunk {
        ToolUseChunk {
            id: format!("call_{name}"),
            name: name.into(),
            input_json: input.into(),
        }
    }

    #[test]
    fn test_no_tools_is_continue() {
        let outcome = outcome_from_parts("Hi.".into(), &[]);
        assert_eq!(outcome.signal, TurnSignal::Continue);
        assert!(outcome.visual_payload.is_none());
    }

    #[test]
    fn test_complete_lesson() {
        let outcome = outcome_from_parts("Well done.".into(), &[call(COMPLETE_LESSON, "{}")]);
        assert_eq!(outcome.signal, TurnSignal::Complete);
    }

    #[test]
    fn test_handoff_wins_over_complete() {
        let outcome = outcome_from_parts(
            "Let's switch.".into(),
            &[
                call(COMPLETE_LESSON, "{}"),
                call(HANDOFF_TO, r#"{"responder":" geometry "}"#),
            ],
        );
        assert_eq!(outcome.signal, TurnSignal::HandoffTo("geometry".into()));
    }

    #[test]
    fn test_malformed_handoff_ignored() {
        let outcome = outcome_from_parts("x".into(), &[call(HANDOFF_TO, "{not json")]);
        assert_eq!(outcome.signal, TurnSignal::Continue);
    }

    #[test]
    fn test_visual_payload_captured() {
        let outcome = outcome_from_parts(
            "Look.".into(),
            &[call(SHOW_VISUAL, r#"{"kind":"number_line","data":{"max":10}}"#)],
        );
        assert_eq!(outcome.visual_payload.unwrap()["kind"], "number_line");
    }

    #[test]
    fn test_speakable_strips_markdown() {
        assert_eq!(
            speakable("## Halves\n- **One** half is `1/2`.\n"),
            "Halves One half is 1/2."
        );
    }
}
