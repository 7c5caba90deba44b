//! Batch enrichment endpoint.

use axum::{Json, extract::State};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use kwengine_core::enrichment::{
    BatchOptions, BatchOutcome, SilentEnrichmentProgress, run_recorded_batch,
};
use kwengine_shared::{Device, DynamicsPeriod, EnrichmentDefaults};
use kwengine_stats::DateRange;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Body of `POST /enrich`. Omitted fields fall back to the configured
/// `[enrichment]` defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichRequest {
    pub phrases: Vec<String>,
    #[serde(default)]
    pub regions: Option<Vec<u32>>,
    #[serde(default)]
    pub devices: Option<Vec<Device>>,
    #[serde(default)]
    pub include_regions: bool,
    #[serde(default)]
    pub include_dynamics: bool,
    #[serde(default)]
    pub dynamics_period: Option<DynamicsPeriod>,
    #[serde(default)]
    pub dynamics_from: Option<NaiveDate>,
    #[serde(default)]
    pub dynamics_to: Option<NaiveDate>,
}

impl EnrichRequest {
    fn options(&self, defaults: &EnrichmentDefaults) -> ApiResult<BatchOptions> {
        let mut options = BatchOptions::from(defaults);
        if let Some(regions) = &self.regions {
            options.regions = regions.clone();
        }
        if let Some(devices) = &self.devices {
            options.devices = devices.clone();
        }
        if let Some(period) = self.dynamics_period {
            options.dynamics_period = period;
        }
        options.include_regions = self.include_regions;
        options.include_dynamics = self.include_dynamics;

        options.dynamics_range = match (self.dynamics_from, self.dynamics_to) {
            (None, None) => None,
            (Some(from), to) => {
                let to = to.unwrap_or_else(|| Utc::now().date_naive());
                if from > to {
                    return Err(ApiError::BadRequest(format!(
                        "dynamicsFrom {from} is after dynamicsTo {to}"
                    )));
                }
                Some(DateRange { from, to })
            }
            (None, Some(_)) => {
                return Err(ApiError::BadRequest(
                    "dynamicsTo requires dynamicsFrom".into(),
                ));
            }
        };

        Ok(options)
    }
}

/// POST /enrich
///
/// The batch runs in its own task bound to a token that is cancelled when
/// this request is dropped or the server shuts down. Cancellation stops
/// admission and lets in-flight calls finish.
pub async fn enrich(
    State(state): State<AppState>,
    Json(request): Json<EnrichRequest>,
) -> ApiResult<Json<BatchOutcome>> {
    let options = request.options(&state.defaults)?;
    let phrases = request.phrases;
    info!(phrases = phrases.len(), "enrichment requested");

    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    let task = tokio::spawn(async move {
        run_recorded_batch(
            &state.storage,
            state.provider.as_ref(),
            &state.limiter,
            &phrases,
            &options,
            &cancel,
            &SilentEnrichmentProgress,
        )
        .await
    });

    let outcome = task
        .await
        .map_err(|e| ApiError::Internal(format!("enrichment task failed: {e}")))??;
    guard.disarm();

    Ok(Json(outcome))
}
