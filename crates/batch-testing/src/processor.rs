//! Scripted [`ActivityProcessor`] implementations for exercising the worker
//! lifecycle deterministically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use batch_core::error::ProcessorError;
use batch_core::model::{ActivityId, ActivityRef};
use batch_core::processor::{ActivityProcessor, EmissionsDelta};

/// What a [`ScriptedProcessor`] does for one activity, keyed by its
/// zero-based sequence position within the batch.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success(EmissionsDelta),
    Retryable,
    Terminal,
}

/// An [`ActivityProcessor`] whose outcome per activity is fixed in advance
/// by sequence position, with any position not explicitly scripted
/// defaulting to `Success(1.0)`. Idempotent: processing the same activity id
/// twice returns the same scripted outcome both times, and call counts are
/// tracked for the at-least-once delivery test (spec §8).
pub struct ScriptedProcessor {
    by_sequence: HashMap<i64, ScriptedOutcome>,
    default_emissions: EmissionsDelta,
    call_counts: Mutex<HashMap<ActivityId, u32>>,
}

impl ScriptedProcessor {
    pub fn new(default_emissions: EmissionsDelta) -> Self {
        Self {
            by_sequence: HashMap::new(),
            default_emissions,
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn always_succeeds(emissions: EmissionsDelta) -> Self {
        Self::new(emissions)
    }

    pub fn with_outcome(mut self, sequence: i64, outcome: ScriptedOutcome) -> Self {
        self.by_sequence.insert(sequence, outcome);
        self
    }

    pub fn call_count(&self, activity_id: ActivityId) -> u32 {
        *self.call_counts.lock().unwrap().get(&activity_id).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> u32 {
        self.call_counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ActivityProcessor for ScriptedProcessor {
    async fn process(&self, activity: &ActivityRef) -> Result<EmissionsDelta, ProcessorError> {
        {
            let mut counts = self.call_counts.lock().unwrap();
            *counts.entry(activity.activity_id).or_insert(0) += 1;
        }

        match self.by_sequence.get(&activity.sequence) {
            Some(ScriptedOutcome::Success(emissions)) => Ok(*emissions),
            Some(ScriptedOutcome::Retryable) => Err(ProcessorError::Retryable(anyhow::anyhow!(
                "scripted retryable failure at sequence {}",
                activity.sequence
            ))),
            Some(ScriptedOutcome::Terminal) => Err(ProcessorError::Terminal(anyhow::anyhow!(
                "scripted terminal failure at sequence {}",
                activity.sequence
            ))),
            None => Ok(self.default_emissions),
        }
    }
}

/// Succeeds on every activity but notifies an observer after `limit`
/// activities have been processed, so a test can abort the worker task at
/// that point to simulate a process crash mid-batch (spec §8 scenario 4) —
/// the lease is never released, and recovery happens purely through lease
/// expiry plus resume-from-first-unacknowledged-activity.
pub struct CrashingProcessor {
    limit: u32,
    processed: Mutex<u32>,
    crashed: tokio::sync::Notify,
}

impl CrashingProcessor {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            processed: Mutex::new(0),
            crashed: tokio::sync::Notify::new(),
        }
    }

    /// Resolves once `limit` activities have been processed.
    pub async fn wait_for_crash_point(&self) {
        self.crashed.notified().await;
    }
}

#[async_trait]
impl ActivityProcessor for CrashingProcessor {
    async fn process(&self, activity: &ActivityRef) -> Result<EmissionsDelta, ProcessorError> {
        let _ = activity;
        let mut processed = self.processed.lock().unwrap();
        *processed += 1;
        if *processed == self.limit {
            self.crashed.notify_one();
        }
        Ok(1.0)
    }
}
