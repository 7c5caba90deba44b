//! Core domain types for keyword enrichment and cluster reconciliation.
//!
//! Everything here serializes with camelCase field names; these documents are
//! exchanged verbatim with the curation workflow and persisted as-is.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KwEngineError, Result};

// ---------------------------------------------------------------------------
// Phrases
// ---------------------------------------------------------------------------

/// Trim a phrase and collapse internal whitespace runs to a single space.
pub fn normalize_phrase(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reconciliation key: normalized and lowercased. Two phrases are the same
/// keyword iff their keys are byte-equal.
pub fn phrase_key(raw: &str) -> String {
    normalize_phrase(raw).to_lowercase()
}

/// A phrase with its raw search-volume figure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyRecord {
    pub phrase: String,
    pub count: u64,
}

impl FrequencyRecord {
    pub fn new(phrase: impl Into<String>, count: u64) -> Self {
        Self {
            phrase: phrase.into(),
            count,
        }
    }
}

// ---------------------------------------------------------------------------
// Request filters
// ---------------------------------------------------------------------------

/// Device filter understood by the statistics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    All,
    Desktop,
    Phone,
    Tablet,
}

impl Device {
    /// Wire value sent to the statistics service.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::All => "DEVICE_ALL",
            Self::Desktop => "DEVICE_DESKTOP",
            Self::Phone => "DEVICE_PHONE",
            Self::Tablet => "DEVICE_TABLET",
        }
    }
}

impl FromStr for Device {
    type Err = KwEngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "desktop" => Ok(Self::Desktop),
            "phone" | "mobile" => Ok(Self::Phone),
            "tablet" => Ok(Self::Tablet),
            other => Err(KwEngineError::validation(format!(
                "unknown device '{other}': expected all, desktop, phone or tablet"
            ))),
        }
    }
}

/// Aggregation period for time-series dynamics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamicsPeriod {
    Daily,
    #[default]
    Weekly,
    Monthly,
}

impl DynamicsPeriod {
    /// Wire value sent to the statistics service.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Daily => "PERIOD_DAILY",
            Self::Weekly => "PERIOD_WEEKLY",
            Self::Monthly => "PERIOD_MONTHLY",
        }
    }
}

impl FromStr for DynamicsPeriod {
    type Err = KwEngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(KwEngineError::validation(format!(
                "unknown dynamics period '{other}': expected daily, weekly or monthly"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Coarse popularity bucket derived from the total search volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotnessTier {
    Cold,
    Warm,
    Hot,
    VeryHot,
}

impl HotnessTier {
    pub fn classify(count: u64) -> Self {
        match count {
            100_000.. => Self::VeryHot,
            10_000..=99_999 => Self::Hot,
            1_000..=9_999 => Self::Warm,
            _ => Self::Cold,
        }
    }
}

/// Share of a phrase's volume that comes from one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionShare {
    pub region_id: u32,
    pub count: u64,
    pub share: f64,
    #[serde(default)]
    pub affinity_index: f64,
}

/// One point of the volume time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicsPoint {
    pub date: NaiveDate,
    pub count: u64,
    #[serde(default)]
    pub share: f64,
}

/// Enrichment record produced for one input phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    pub phrase: String,
    pub count: u64,
    pub hotness_tier: HotnessTier,
    /// Related phrases reported alongside the volume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_phrases: Vec<FrequencyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<RegionShare>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamics: Option<Vec<DynamicsPoint>>,
}

// ---------------------------------------------------------------------------
// Subclusters
// ---------------------------------------------------------------------------

/// Last computed phrase set of one curated subcluster. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterSnapshot {
    pub subcluster_id: String,
    pub subcluster_name: String,
    #[serde(default)]
    pub cluster_name: String,
    pub filtered_queries: Vec<FrequencyRecord>,
}

impl SubclusterSnapshot {
    /// Decode a snapshot from an untyped JSON document.
    ///
    /// Callers that ingest many snapshots skip the ones that fail here
    /// instead of rejecting the whole set.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let id = value
            .get("subclusterId")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        serde_json::from_value(value)
            .map_err(|e| KwEngineError::validation(format!("malformed snapshot {id}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Which side of a pair keeps a duplicated phrase. Serialized as `1` / `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaysIn {
    First,
    Second,
}

impl StaysIn {
    pub fn as_number(&self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

impl Serialize for StaysIn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_number())
    }
}

impl<'de> Deserialize<'de> for StaysIn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Self::First),
            2 => Ok(Self::Second),
            other => Err(serde::de::Error::custom(format!(
                "staysIn must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl fmt::Display for StaysIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_number())
    }
}

/// One phrase present in both subclusters of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectionEntry {
    pub query: String,
    pub count1: u64,
    pub count2: u64,
    pub stays_in: StaysIn,
}

/// Overlap between two subclusters and who keeps each shared phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectionPair {
    pub id1: String,
    pub id2: String,
    pub name1: String,
    pub name2: String,
    pub cluster1: String,
    pub cluster2: String,
    /// Size of subcluster 1's phrase set.
    pub count1: usize,
    /// Size of subcluster 2's phrase set.
    pub count2: usize,
    pub intersection: Vec<IntersectionEntry>,
    pub intersection_count: usize,
    pub remove_from1: usize,
    pub remove_from2: usize,
}

/// The persisted reconciliation result. Never patched, only replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationDocument {
    pub last_updated: Option<DateTime<Utc>>,
    pub pairs: Vec<IntersectionPair>,
}

impl ReconciliationDocument {
    /// Sentinel returned when nothing has been computed yet.
    pub fn empty() -> Self {
        Self::default()
    }
}
