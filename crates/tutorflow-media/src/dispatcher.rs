//! Bounded progressive speech synthesis.
//!
//! One [`SynthesisDispatcher`] serves one turn. Each dispatched unit becomes a
//! job running on its own task; at most `max_concurrency` jobs run at once and
//! further dispatches wait for a free slot. [`SynthesisDispatcher::collect`]
//! waits for every job and returns audio ordered by sequence index, whatever
//! order the jobs finished in.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tutorflow_core::config::SynthesisConfig;
use tutorflow_core::types::{SentenceUnit, SynthesisJob, SynthesisState};
use tutorflow_providers::SynthesisProvider;

/// Audio for one sequence index (the unit plus any continuation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub sequence_index: usize,
    pub bytes: Vec<u8>,
}

/// Reassembled audio of a turn.
#[derive(Debug, Clone, Default)]
pub struct OrderedAudio {
    /// Segments in ascending `sequence_index` order.
    pub segments: Vec<AudioSegment>,
    /// Indices whose synthesis failed and were skipped.
    pub failed: Vec<usize>,
}

impl OrderedAudio {
    /// The whole turn's audio as one byte sequence.
    pub fn concat(&self) -> Vec<u8> {
        self.segments
            .iter()
            .flat_map(|s| s.bytes.iter().copied())
            .collect()
    }
}

/// Too many jobs failed; the caller should fall back to a single pass.
#[derive(Debug, thiserror::Error)]
#[error("progressive synthesis aborted after {failed} failed jobs")]
pub struct ProgressiveAborted {
    pub failed: usize,
}

/// Job key: sequence index, then part (0 = unit, 1.. = continuations).
type JobKey = (usize, usize);

#[derive(Default)]
struct Shared {
    jobs: Mutex<BTreeMap<JobKey, SynthesisJob>>,
    failed: AtomicUsize,
    aborted: AtomicBool,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<JobKey, SynthesisJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, key: JobKey, next: SynthesisState) -> Option<SynthesisJob> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(&key)?;
        job.advance(next);
        Some(job.clone())
    }
}

pub struct SynthesisDispatcher {
    provider: Arc<dyn SynthesisProvider>,
    config: SynthesisConfig,
    permits: Arc<Semaphore>,
    shared: Arc<Shared>,
    /// Cancelled on turn abandonment or progressive abort.
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SynthesisDispatcher {
    /// `turn_cancel` abandons the turn; its cancellation stops jobs that have
    /// not started yet.
    pub fn new(
        provider: Arc<dyn SynthesisProvider>,
        config: SynthesisConfig,
        turn_cancel: &CancellationToken,
    ) -> Self {
        let slots = config.max_concurrency.max(1);
        Self {
            provider,
            config,
            permits: Arc::new(Semaphore::new(slots)),
            shared: Arc::new(Shared::default()),
            stop: turn_cancel.child_token(),
            handles: Vec::new(),
        }
    }

    pub fn format(&self) -> &str {
        self.provider.format()
    }

    /// Jobs currently running.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs seen so far.
    pub fn peak_running(&self) -> usize {
        self.shared.peak_running.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Snapshot of every job, ordered by key.
    pub fn jobs(&self) -> Vec<SynthesisJob> {
        self.shared.jobs().values().cloned().collect()
    }

    /// Start synthesis for a fully extracted unit.
    ///
    /// Waits while all slots are busy. Returns the job as it stands once it
    /// started (or was skipped because the turn stopped).
    pub async fn dispatch(&mut self, unit: SentenceUnit) -> SynthesisJob {
        let key = (unit.sequence_index, 0);
        self.dispatch_part(key, SynthesisJob::pending(&unit)).await
    }

    /// Synthesize a short leftover as a continuation of unit `sequence_index`.
    pub async fn append_tail(&mut self, sequence_index: usize, text: String) -> SynthesisJob {
        let part = self
            .shared
            .jobs()
            .range((sequence_index, 1)..(sequence_index + 1, 0))
            .count()
            + 1;
        let unit = SentenceUnit {
            sequence_index,
            text,
        };
        self.dispatch_part((sequence_index, part), SynthesisJob::pending(&unit))
            .await
    }

    async fn dispatch_part(&mut self, key: JobKey, job: SynthesisJob) -> SynthesisJob {
        let speakable = job.source_text.trim().to_string();
        self.shared.jobs().insert(key, job.clone());

        if speakable.is_empty() {
            // Nothing to say: complete without touching the provider.
            self.shared.advance(key, SynthesisState::Running);
            return self
                .shared
                .advance(key, SynthesisState::Succeeded)
                .unwrap_or(job);
        }

        let permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            debug!(sequence_index = key.0, "Synthesis skipped, turn stopped");
            return self
                .shared
                .advance(key, SynthesisState::Failed)
                .unwrap_or(job);
        };

        let running = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_running.fetch_max(running, Ordering::SeqCst);
        let started = self
            .shared
            .advance(key, SynthesisState::Running)
            .unwrap_or(job);

        let provider = self.provider.clone();
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let attempts_allowed = 1 + self.config.retries;
        let threshold = self.config.failure_threshold.max(1);

        self.handles.push(tokio::spawn(async move {
            let mut result = Err(anyhow::anyhow!("synthesis not attempted"));
            for attempt in 1..=attempts_allowed {
                if let Some(job) = shared.jobs().get_mut(&key) {
                    job.attempts = attempt;
                }
                result = provider.synthesize(&speakable).await;
                match &result {
                    Ok(_) => break,
                    Err(e) => warn!(
                        sequence_index = key.0,
                        part = key.1,
                        attempt,
                        error = %e,
                        "Synthesis attempt failed"
                    ),
                }
            }

            match result {
                Ok(audio) => {
                    let mut jobs = shared.jobs();
                    if let Some(job) = jobs.get_mut(&key) {
                        job.audio = Some(audio);
                        job.advance(SynthesisState::Succeeded);
                    }
                }
                Err(_) => {
                    shared.advance(key, SynthesisState::Failed);
                    metrics::counter!("tutorflow_synthesis_failures_total").increment(1);
                    let failed = shared.failed.fetch_add(1, Ordering::SeqCst) + 1;
                    if failed >= threshold && !shared.aborted.swap(true, Ordering::SeqCst) {
                        warn!(failed, threshold, "Aborting progressive synthesis");
                        metrics::counter!("tutorflow_progressive_aborts_total").increment(1);
                        stop.cancel();
                    }
                }
            }

            shared.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }));

        started
    }

    /// Wait for every job and reassemble audio by sequence index.
    pub async fn collect(self) -> Result<OrderedAudio, ProgressiveAborted> {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(%e, "Synthesis task panicked");
            }
        }

        if self.shared.aborted.load(Ordering::SeqCst) {
            return Err(ProgressiveAborted {
                failed: self.shared.failed.load(Ordering::SeqCst),
            });
        }

        let mut jobs = self.shared.jobs();
        let mut audio = OrderedAudio::default();
        // A continuation is meaningless without its unit.
        let mut dropped = None;
        for ((index, part), job) in jobs.iter_mut() {
            if dropped == Some(*index) {
                continue;
            }
            match (job.state, job.audio.take()) {
                (SynthesisState::Succeeded, Some(bytes)) => match audio.segments.last_mut() {
                    Some(last) if last.sequence_index == *index => last.bytes.extend(bytes),
                    _ => audio.segments.push(AudioSegment {
                        sequence_index: *index,
                        bytes,
                    }),
                },
                (SynthesisState::Succeeded, None) => {}
                _ => {
                    if *part == 0 {
                        dropped = Some(*index);
                    }
                    if audio.failed.last() != Some(index) {
                        audio.failed.push(*index);
                    }
                }
            }
        }
        audio.segments.retain(|s| !s.bytes.is_empty());
        Ok(audio)
    }
}

/// Synthesize a complete text sequentially, split at the provider ceiling.
///
/// Used after progressive synthesis was abandoned.
pub async fn synthesize_single_pass(
    provider: &dyn SynthesisProvider,
    text: &str,
    extractor: &tutorflow_core::config::ExtractorConfig,
) -> anyhow::Result<Vec<u8>> {
    let config = tutorflow_core::config::ExtractorConfig {
        max_chars: extractor.max_chars.min(provider.max_chars()),
        // Every leftover becomes its own piece.
        min_significant_chars: 0,
        ..extractor.clone()
    };
    let mut audio = Vec::new();
    for piece in crate::sentence::split_sentences(text, &config) {
        let speakable = piece.text().trim();
        if speakable.is_empty() {
            continue;
        }
        audio.extend(provider.synthesize(speakable).await?);
    }
    Ok(audio)
}
