//! Pipeline metrics. Without an installed recorder these are no-ops.

use tutorflow_core::protocol::FailSafeReason;
use tutorflow_core::types::RoutingReason;

/// Record one routing decision.
pub fn record_routing(reason: RoutingReason) {
    let labels = [("reason", reason.as_str().to_string())];
    metrics::counter!("tutorflow_routing_decisions_total", &labels).increment(1);
}

/// Record a selection-policy invocation.
pub fn record_policy_call(policy: &str) {
    let labels = [("policy", policy.to_string())];
    metrics::counter!("tutorflow_policy_calls_total", &labels).increment(1);
}

/// Record a validation verdict that was approved on its merits.
pub fn record_approval() {
    metrics::counter!("tutorflow_validation_approved_total").increment(1);
}

/// Record an approval forced by a fail-safe.
pub fn record_fail_safe(reason: FailSafeReason) {
    let labels = [("reason", reason.as_str().to_string())];
    metrics::counter!("tutorflow_validation_fail_safe_total", &labels).increment(1);
}

pub fn record_regeneration() {
    metrics::counter!("tutorflow_regenerations_total").increment(1);
}

pub fn record_disclaimer() {
    metrics::counter!("tutorflow_disclaimers_total").increment(1);
}

/// Record a finished turn and its wall-clock duration.
pub fn record_turn(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("tutorflow_turns_total", &labels).increment(1);
    metrics::histogram!("tutorflow_turn_duration_seconds", &labels).record(duration_secs);
}

/// Record a session store operation that failed and was degraded around.
pub fn record_store_failure(operation: &str) {
    let labels = [("operation", operation.to_string())];
    metrics::counter!("tutorflow_session_store_failures_total", &labels).increment(1);
}

/// Record a background task failure.
pub fn record_background_failure(task: &str) {
    let labels = [("task", task.to_string())];
    metrics::counter!("tutorflow_background_failures_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_routing(RoutingReason::FastPath);
        record_policy_call("keyword");
        record_fail_safe(FailSafeReason::Timeout);
        record_turn("delivered", 0.25);
        record_store_failure("load");
    }
}
