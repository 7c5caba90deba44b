//! Domain workflows for kwengine.
//!
//! This crate ties the rate limiter, the statistics client and storage
//! together into the two end-to-end operations: batch enrichment
//! ([`enrichment::run_batch`]) and cluster reconciliation
//! ([`reconcile::reconcile`]).

pub mod enrichment;
pub mod reconcile;
