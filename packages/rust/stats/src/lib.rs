//! Client for the external search-volume statistics service.
//!
//! The service exposes three independent operations: top-phrase volumes,
//! regional breakdown, and time-series dynamics. [`StatsProvider`] is the
//! seam the batch orchestrator programs against; [`StatsClient`] is the
//! HTTP implementation.
//!
//! None of the operations retries. Every failure is reported as one of the
//! typed variants of [`KwEngineError`](kwengine_shared::KwEngineError):
//! `Auth`, `Quota`, `Upstream` or `MalformedResponse`.

mod client;
mod wire;

use std::future::Future;

use chrono::{Days, NaiveDate};

use kwengine_shared::{Device, DynamicsPeriod, DynamicsPoint, FrequencyRecord, RegionShare, Result};

pub use client::StatsClient;

/// Result of a volume lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    /// Total search volume of the phrase.
    pub total_count: u64,
    /// Most frequent queries containing the phrase.
    pub top_phrases: Vec<FrequencyRecord>,
}

/// Inclusive date window for dynamics requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Window of `days` days ending on `today`.
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        let from = today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { from, to: today }
    }
}

/// The three statistics operations, each a stateless request/response call.
pub trait StatsProvider: Send + Sync {
    /// Whether a credential is configured at all. Checked once per batch.
    fn has_credentials(&self) -> bool;

    fn fetch_volume(
        &self,
        phrase: &str,
        regions: &[u32],
        devices: &[Device],
    ) -> impl Future<Output = Result<VolumeReport>> + Send;

    fn fetch_regional_breakdown(
        &self,
        phrase: &str,
        devices: &[Device],
    ) -> impl Future<Output = Result<Vec<RegionShare>>> + Send;

    fn fetch_dynamics(
        &self,
        phrase: &str,
        period: DynamicsPeriod,
        range: DateRange,
        devices: &[Device],
    ) -> impl Future<Output = Result<Vec<DynamicsPoint>>> + Send;
}
