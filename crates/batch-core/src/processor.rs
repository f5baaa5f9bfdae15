//! The `ActivityProcessor` boundary: the one piece of per-activity business
//! logic (emission-factor calculation, scope attribution) the core does not
//! own. Spec §6: "pure per-activity function... must be idempotent keyed by
//! `ActivityID`".

use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::model::ActivityRef;

/// Outcome of successfully processing one activity: the non-negative
/// emissions delta to accumulate onto the batch total.
pub type EmissionsDelta = f64;

/// Invoked once per activity by the [`crate::worker::Worker`]. At-least-once
/// delivery: implementations must be idempotent keyed by `activity_id`, since
/// the core does not deduplicate (spec Non-goals).
#[async_trait]
pub trait ActivityProcessor: Send + Sync {
    async fn process(
        &self,
        activity: &ActivityRef,
    ) -> Result<EmissionsDelta, ProcessorError>;
}
