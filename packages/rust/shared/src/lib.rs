//! Shared types, error model, and configuration for kwengine.
//!
//! This crate is the foundation depended on by all other kwengine crates.
//! It provides:
//! - [`KwEngineError`]: the unified error type
//! - Domain types ([`FrequencyRecord`], [`EnrichmentResult`], [`SubclusterSnapshot`],
//!   [`IntersectionPair`], [`ReconciliationDocument`])
//! - Configuration ([`AppConfig`], [`LimiterConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EnrichmentDefaults, LimiterConfig, RateLimitConfig, ServerConfig, StatsConfig,
    StorageConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_api_token,
};
pub use error::{KwEngineError, Result};
pub use types::{
    Device, DynamicsPeriod, DynamicsPoint, EnrichmentResult, FrequencyRecord, HotnessTier,
    IntersectionEntry, IntersectionPair, ReconciliationDocument, RegionShare, StaysIn,
    SubclusterSnapshot, normalize_phrase, phrase_key,
};
