use crate::models::GenerationUsage;
use tracing::trace;

// Trace-level counters. A subscriber that cares can aggregate them; nothing
// here pulls in a metrics backend.

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "vitrine.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn generation_tokens(call: &'static str, usage: &GenerationUsage) {
    trace!(
        target = "vitrine.metrics",
        call = call,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        image_output_tokens = usage.image_output_tokens.unwrap_or(0),
        "generation_tokens"
    );
}

pub fn item_finished(kind: &'static str, success: bool) {
    trace!(
        target = "vitrine.metrics",
        kind = kind,
        success = success,
        "batch_item_total_inc"
    );
}
