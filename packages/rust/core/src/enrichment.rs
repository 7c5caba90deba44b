//! Batch enrichment orchestrator.
//!
//! Drives a phrase list through one shared [`RateLimiter`] and a
//! [`StatsProvider`], producing one [`EnrichmentResult`] per phrase. A failed
//! phrase is recorded in `errors` and never stops the batch; only an auth
//! failure does.

use std::future::Future;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kwengine_limiter::RateLimiter;
use kwengine_shared::{
    Device, DynamicsPeriod, EnrichmentDefaults, EnrichmentResult, HotnessTier, KwEngineError,
    Result, normalize_phrase,
};
use kwengine_stats::{DateRange, StatsProvider};
use kwengine_storage::Storage;

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Per-batch knobs. Start from [`BatchOptions::from`] the configured defaults
/// and override what the caller asked for.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub regions: Vec<u32>,
    pub devices: Vec<Device>,
    pub include_regions: bool,
    pub include_dynamics: bool,
    pub dynamics_period: DynamicsPeriod,
    /// Explicit dynamics window; `None` means `lookback_days` ending today.
    pub dynamics_range: Option<DateRange>,
    pub lookback_days: u32,
    /// Applied to every external call separately.
    pub call_timeout: Duration,
    /// Extra attempts for quota and upstream failures.
    pub retries: u32,
}

impl From<&EnrichmentDefaults> for BatchOptions {
    fn from(defaults: &EnrichmentDefaults) -> Self {
        Self {
            regions: defaults.regions.clone(),
            devices: defaults.devices.clone(),
            include_regions: false,
            include_dynamics: false,
            dynamics_period: defaults.dynamics_period,
            dynamics_range: None,
            lookback_days: defaults.lookback_days,
            call_timeout: Duration::from_secs(defaults.call_timeout_secs),
            retries: defaults.retries,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&EnrichmentDefaults::default())
    }
}

impl BatchOptions {
    fn resolved_dynamics_range(&self, today: NaiveDate) -> DateRange {
        self.dynamics_range
            .unwrap_or_else(|| DateRange::lookback(today, self.lookback_days))
    }
}

/// A phrase whose volume lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhraseError {
    pub phrase: String,
    pub kind: String,
    pub error: String,
}

/// Everything a batch produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// In input order.
    pub results: Vec<EnrichmentResult>,
    /// In the order failures happened.
    pub errors: Vec<PhraseError>,
    pub processed: usize,
    pub total: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for batch enrichment.
pub trait EnrichmentProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// A phrase finished (successfully or not).
    fn task_progress(&self, current: usize, total: usize, detail: &str);
}

/// No-op enrichment progress.
pub struct SilentEnrichmentProgress;

impl EnrichmentProgress for SilentEnrichmentProgress {
    fn phase(&self, _name: &str) {}
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

enum PhraseOutcome {
    Enriched(usize, EnrichmentResult),
    Failed(PhraseError),
    /// Never admitted because the batch was cancelled.
    Skipped,
    Fatal(KwEngineError),
}

struct Batch<'a, P> {
    provider: &'a P,
    limiter: &'a RateLimiter,
    options: &'a BatchOptions,
    dynamics_range: DateRange,
    /// Child of the caller's token; also cancelled on an auth failure.
    admission: CancellationToken,
}

/// Enrich `phrases` and collect per-phrase results and failures.
///
/// Returns `Err(Auth)` if the provider has no credential, or if any call is
/// rejected for auth reasons; in the latter case in-flight calls are allowed
/// to finish first. Every other failure kind ends up in
/// [`BatchOutcome::errors`] (volume) or leaves an optional field unset
/// (regions, dynamics).
#[instrument(skip_all, fields(phrases = phrases.len()))]
pub async fn run_batch<P: StatsProvider>(
    provider: &P,
    limiter: &RateLimiter,
    phrases: &[String],
    options: &BatchOptions,
    cancel: &CancellationToken,
    progress: &dyn EnrichmentProgress,
) -> Result<BatchOutcome> {
    if !provider.has_credentials() {
        return Err(KwEngineError::Auth(
            "no credential configured for the statistics service".into(),
        ));
    }

    let batch = Batch {
        provider,
        limiter,
        options,
        dynamics_range: options.resolved_dynamics_range(Utc::now().date_naive()),
        admission: cancel.child_token(),
    };

    let work: Vec<(usize, String)> = phrases
        .iter()
        .map(|p| normalize_phrase(p))
        .enumerate()
        .filter(|(_, p)| !p.is_empty())
        .collect();
    let runnable = work.len();
    if runnable < phrases.len() {
        debug!(skipped = phrases.len() - runnable, "skipping blank phrases");
    }

    progress.phase("Fetching search volumes");

    // Bounded so the limiter queue never grows with the batch size.
    let window = limiter.config().max_concurrent.saturating_mul(2).max(1);
    let mut pipelines = futures::stream::iter(work)
        .map(|(idx, phrase)| batch.enrich_phrase(idx, phrase))
        .buffer_unordered(window);

    let mut enriched = Vec::new();
    let mut errors = Vec::new();
    let mut fatal = None;
    let mut done = 0;

    while let Some(outcome) = pipelines.next().await {
        done += 1;
        match outcome {
            PhraseOutcome::Enriched(idx, result) => {
                progress.task_progress(done, runnable, &result.phrase);
                enriched.push((idx, result));
            }
            PhraseOutcome::Failed(err) => {
                progress.task_progress(done, runnable, &err.phrase);
                errors.push(err);
            }
            PhraseOutcome::Skipped => {}
            PhraseOutcome::Fatal(e) => {
                if fatal.is_none() {
                    warn!(error = %e, "auth failure, draining batch");
                    fatal = Some(e);
                }
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }

    enriched.sort_by_key(|(idx, _)| *idx);
    let results: Vec<EnrichmentResult> = enriched.into_iter().map(|(_, r)| r).collect();
    let cancelled = cancel.is_cancelled();

    info!(
        total = phrases.len(),
        processed = results.len(),
        errors = errors.len(),
        cancelled,
        "enrichment batch complete"
    );

    Ok(BatchOutcome {
        processed: results.len(),
        total: phrases.len(),
        results,
        errors,
        cancelled,
    })
}

/// [`run_batch`] recorded as one entry of the enrichment job history.
pub async fn run_recorded_batch<P: StatsProvider>(
    storage: &Storage,
    provider: &P,
    limiter: &RateLimiter,
    phrases: &[String],
    options: &BatchOptions,
    cancel: &CancellationToken,
    progress: &dyn EnrichmentProgress,
) -> Result<BatchOutcome> {
    let job_id = storage.insert_enrichment_job().await?;
    let outcome = run_batch(provider, limiter, phrases, options, cancel, progress).await;

    let stats = match &outcome {
        Ok(o) => serde_json::json!({
            "total": o.total,
            "processed": o.processed,
            "errors": o.errors.len(),
            "cancelled": o.cancelled,
        }),
        Err(e) => serde_json::json!({
            "total": phrases.len(),
            "failed": e.kind(),
            "error": e.to_string(),
        }),
    };
    if let Err(e) = storage
        .finish_enrichment_job(&job_id, &stats.to_string())
        .await
    {
        warn!(job_id = %job_id, error = %e, "failed to record enrichment job");
    }

    outcome
}

impl<P: StatsProvider> Batch<'_, P> {
    async fn enrich_phrase(&self, idx: usize, phrase: String) -> PhraseOutcome {
        let options = self.options;

        let volume = match self
            .call("volume", || {
                self.provider
                    .fetch_volume(&phrase, &options.regions, &options.devices)
            })
            .await
        {
            None => return PhraseOutcome::Skipped,
            Some(Ok(volume)) => volume,
            Some(Err(e)) if e.is_fatal() => return PhraseOutcome::Fatal(e),
            Some(Err(e)) => {
                warn!(phrase = %phrase, error = %e, "volume lookup failed");
                return PhraseOutcome::Failed(PhraseError {
                    phrase,
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                });
            }
        };

        let regions = async {
            if !options.include_regions {
                return Ok(None);
            }
            let fetched = self
                .call("regions", || {
                    self.provider
                        .fetch_regional_breakdown(&phrase, &options.devices)
                })
                .await;
            self.secondary(&phrase, "regions", fetched)
        };
        let dynamics = async {
            if !options.include_dynamics {
                return Ok(None);
            }
            let fetched = self
                .call("dynamics", || {
                    self.provider.fetch_dynamics(
                        &phrase,
                        options.dynamics_period,
                        self.dynamics_range,
                        &options.devices,
                    )
                })
                .await;
            self.secondary(&phrase, "dynamics", fetched)
        };

        let (regions, dynamics) = match tokio::join!(regions, dynamics) {
            (Err(e), _) | (_, Err(e)) => return PhraseOutcome::Fatal(e),
            (Ok(r), Ok(d)) => (r, d),
        };

        PhraseOutcome::Enriched(
            idx,
            EnrichmentResult {
                hotness_tier: HotnessTier::classify(volume.total_count),
                count: volume.total_count,
                top_phrases: volume.top_phrases,
                regions,
                dynamics,
                phrase,
            },
        )
    }

    /// Fold a secondary call into an optional field. Only a fatal error
    /// escapes.
    fn secondary<T>(
        &self,
        phrase: &str,
        what: &str,
        fetched: Option<Result<T>>,
    ) -> Result<Option<T>> {
        match fetched {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) if e.is_fatal() => Err(e),
            Some(Err(e)) => {
                warn!(phrase = %phrase, error = %e, "{what} lookup failed");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// One external call through the limiter, with timeout and retries.
    ///
    /// `None` means the call was never admitted because admission was
    /// cancelled. A fatal error cancels admission for the rest of the batch.
    async fn call<T, F, Fut>(&self, what: &'static str, make: F) -> Option<Result<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.options.call_timeout;
        let mut attempt = 0;

        loop {
            let outcome = self
                .limiter
                .schedule_until(&self.admission, || async {
                    match tokio::time::timeout(timeout, make()).await {
                        Ok(result) => result,
                        Err(_) => Err(KwEngineError::Upstream(format!(
                            "{what} call timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                })
                .await?;

            match outcome {
                Err(e) if e.is_fatal() => {
                    self.admission.cancel();
                    return Some(Err(e));
                }
                Err(e) if e.is_retryable() && attempt < self.options.retries => {
                    attempt += 1;
                    debug!(what, attempt, error = %e, "retrying call");
                }
                other => return Some(other),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
